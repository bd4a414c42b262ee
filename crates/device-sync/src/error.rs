//! Error types for the sync client.

use pawkit_core::sync::{classify_http_status, SyncRetryClass};
use thiserror::Error;

/// Result type alias for sync client operations.
pub type Result<T> = std::result::Result<T, DeviceSyncError>;

/// Errors that can occur while talking to the sync API.
#[derive(Debug, Error)]
pub enum DeviceSyncError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the sync service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (bad base URL, missing data, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or invalid token)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl DeviceSyncError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(_) => SyncRetryClass::Retryable,
            Self::Json(_) => SyncRetryClass::Permanent,
            Self::InvalidRequest(_) => SyncRetryClass::Permanent,
            Self::Auth(_) => SyncRetryClass::ReauthRequired,
        }
    }
}

/// Retryable and re-auth failures keep the queue entry; everything else is a
/// permanent rejection.
impl From<DeviceSyncError> for pawkit_core::Error {
    fn from(err: DeviceSyncError) -> Self {
        match err.retry_class() {
            SyncRetryClass::Retryable | SyncRetryClass::ReauthRequired => {
                pawkit_core::Error::transient(err.to_string())
            }
            SyncRetryClass::Permanent => pawkit_core::Error::rejected(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_auth_error_is_reauth() {
        let err = DeviceSyncError::api(401, "unauthorized");
        assert_eq!(err.retry_class(), SyncRetryClass::ReauthRequired);
    }

    #[test]
    fn server_errors_are_retryable_and_validation_errors_are_not() {
        assert_eq!(
            DeviceSyncError::api(503, "unavailable").retry_class(),
            SyncRetryClass::Retryable
        );
        assert_eq!(
            DeviceSyncError::api(429, "slow down").retry_class(),
            SyncRetryClass::Retryable
        );
        assert_eq!(
            DeviceSyncError::api(422, "title is required").retry_class(),
            SyncRetryClass::Permanent
        );
        assert_eq!(DeviceSyncError::api(422, "x").status_code(), Some(422));
        assert_eq!(DeviceSyncError::auth("no token").status_code(), None);
    }

    #[test]
    fn converts_into_core_taxonomy() {
        let transient: pawkit_core::Error = DeviceSyncError::api(500, "boom").into();
        assert!(transient.is_transient());

        let reauth: pawkit_core::Error = DeviceSyncError::auth("expired").into();
        assert!(reauth.is_transient());

        let rejected: pawkit_core::Error = DeviceSyncError::api(400, "schema").into();
        assert!(matches!(rejected, pawkit_core::Error::PermanentRejection(_)));
    }
}
