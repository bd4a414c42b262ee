//! HTTP client for the Pawkit entity sync API.
//!
//! Implements [`RemoteApi`] over the REST endpoints:
//! `POST /entities/{type}`, `PATCH /entities/{type}/{id}`,
//! `DELETE /entities/{type}/{id}[?permanent=true]` and
//! `GET /entities/{type}?workspaceId&since`.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::time::Duration;

use pawkit_core::config::SyncConfig;
use pawkit_core::entities::EntityType;
use pawkit_core::sync::{
    PullRequest, PullResponse, PushOutcome, PushRequest, RemoteApi, SyncOperation, SyncRetryClass,
};

use crate::error::{DeviceSyncError, Result};
use crate::types::*;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const EXPECTED_VERSION_FIELD: &str = "expectedVersion";

/// Client for the entity sync API.
#[derive(Debug, Clone)]
pub struct RemoteSyncClient {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl RemoteSyncClient {
    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("[SyncClient] API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[SyncClient] API response error ({}): {}", status, preview);
    }

    /// Create a new sync client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the sync API (e.g., "https://api.pawkit.app/v1")
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(DeviceSyncError::invalid_request("Sync API base URL is empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            access_token: None,
        })
    }

    /// Builds a client for the configured API, or `None` when sync is disabled.
    pub fn from_config(config: &SyncConfig) -> Result<Option<Self>> {
        config.api_base_url.as_deref().map(Self::new).transpose()
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.access_token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| DeviceSyncError::auth("Invalid access token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }

    fn entity_url(&self, entity_type: EntityType, id: Option<&str>) -> String {
        match id {
            Some(id) => format!(
                "{}/entities/{}/{}",
                self.base_url,
                resource_name(entity_type),
                urlencoding::encode(id)
            ),
            None => format!("{}/entities/{}", self.base_url, resource_name(entity_type)),
        }
    }

    fn api_error(status: StatusCode, body: &str) -> DeviceSyncError {
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
            return DeviceSyncError::api(
                status.as_u16(),
                format!("{}: {}", error.code, error.message),
            );
        }
        DeviceSyncError::api(status.as_u16(), format!("Request failed: {}", body))
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "[SyncClient] Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            DeviceSyncError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    /// Maps a write response onto a push outcome.
    ///
    /// `409` with a server copy is a conflict; other permanent API errors are
    /// rejections. Retryable failures stay errors so the entry is kept.
    async fn parse_write_response(
        response: reqwest::Response,
        missing_is_success: bool,
    ) -> Result<PushOutcome> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(PushOutcome::Accepted { version: None });
            }
            let version = match serde_json::from_str::<WriteAck>(&body) {
                Ok(ack) => ack.version,
                Err(e) => {
                    warn!("[SyncClient] Unreadable write acknowledgement: {}", e);
                    None
                }
            };
            return Ok(PushOutcome::Accepted { version });
        }

        if status == StatusCode::CONFLICT {
            if let Ok(conflict) = serde_json::from_str::<ConflictResponse>(&body) {
                return Ok(PushOutcome::Conflict {
                    server: Box::new(conflict.server_entity),
                });
            }
        }

        if status == StatusCode::NOT_FOUND && missing_is_success {
            return Ok(PushOutcome::Accepted { version: None });
        }

        let err = Self::api_error(status, &body);
        match err.retry_class() {
            SyncRetryClass::Permanent => Ok(PushOutcome::Rejected {
                reason: err.to_string(),
            }),
            SyncRetryClass::Retryable | SyncRetryClass::ReauthRequired => Err(err),
        }
    }

    /// Create an entity.
    ///
    /// POST /entities/{type}
    pub async fn create_entity(
        &self,
        entity_type: EntityType,
        body: &Map<String, Value>,
    ) -> Result<PushOutcome> {
        let url = self.entity_url(entity_type, None);
        debug!("[SyncClient] POST {}", url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;

        Self::parse_write_response(response, false).await
    }

    /// Update an entity. The version check is skipped when `expected_version` is `None`.
    ///
    /// PATCH /entities/{type}/{id}
    pub async fn update_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        changes: &Map<String, Value>,
        expected_version: Option<i64>,
    ) -> Result<PushOutcome> {
        let url = self.entity_url(entity_type, Some(id));
        let mut body = changes.clone();
        if let Some(version) = expected_version {
            body.insert(EXPECTED_VERSION_FIELD.to_string(), Value::from(version));
        }
        debug!(
            "[SyncClient] PATCH {} (expected version {:?})",
            url, expected_version
        );

        let response = self
            .client
            .patch(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        Self::parse_write_response(response, false).await
    }

    /// Soft or permanent delete. Both are idempotent: a missing entity counts as deleted.
    ///
    /// DELETE /entities/{type}/{id}[?permanent=true]
    pub async fn delete_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        permanent: bool,
    ) -> Result<PushOutcome> {
        let mut url = self.entity_url(entity_type, Some(id));
        if permanent {
            url.push_str("?permanent=true");
        }
        debug!("[SyncClient] DELETE {}", url);

        let response = self
            .client
            .delete(&url)
            .headers(self.headers()?)
            .send()
            .await?;

        Self::parse_write_response(response, true).await
    }

    /// Pull entities changed since a cursor.
    ///
    /// GET /entities/{type}?workspaceId={workspaceId}&since={cursor}
    pub async fn pull_entities(&self, request: &PullRequest) -> Result<PullResponse> {
        let mut url = format!(
            "{}?workspaceId={}",
            self.entity_url(request.entity_type, None),
            urlencoding::encode(&request.workspace_id)
        );
        if let Some(since) = &request.since {
            url.push_str(&format!("&since={}", urlencoding::encode(since)));
        }
        debug!("[SyncClient] GET {}", url);

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

#[async_trait]
impl RemoteApi for RemoteSyncClient {
    async fn push(&self, request: PushRequest) -> pawkit_core::Result<PushOutcome> {
        let outcome = match request.operation {
            SyncOperation::Create => self.create_entity(request.entity_type, &request.body).await,
            SyncOperation::Update => {
                self.update_entity(
                    request.entity_type,
                    &request.entity_id,
                    &request.body,
                    request.expected_version,
                )
                .await
            }
            SyncOperation::Delete => {
                self.delete_entity(request.entity_type, &request.entity_id, false)
                    .await
            }
            SyncOperation::PermanentDelete => {
                self.delete_entity(request.entity_type, &request.entity_id, true)
                    .await
            }
        };

        outcome.map_err(|err| {
            warn!(
                "[SyncClient] {} {} {} failed: {}",
                request.operation.as_str(),
                request.entity_type,
                request.entity_id,
                err
            );
            err.into()
        })
    }

    async fn pull(&self, request: PullRequest) -> pawkit_core::Result<PullResponse> {
        self.pull_entities(&request).await.map_err(|err| {
            warn!(
                "[SyncClient] pull {} for workspace {} failed: {}",
                request.entity_type, request.workspace_id, err
            );
            err.into()
        })
    }
}
