//! Runtime configuration for the sync engine and the library service.

use serde::{Deserialize, Serialize};

use crate::sync::{
    LocalOnlyFields, SYNC_DEFAULT_BATCH_SIZE, SYNC_DEFAULT_MAX_ATTEMPTS,
    SYNC_FOREGROUND_INTERVAL_SECS, TRASH_RETENTION_DAYS,
};

pub const ENV_API_URL: &str = "PAWKIT_API_URL";
pub const ENV_SYNC_INTERVAL_SECS: &str = "PAWKIT_SYNC_INTERVAL_SECS";
pub const ENV_SYNC_BATCH_SIZE: &str = "PAWKIT_SYNC_BATCH_SIZE";
pub const ENV_SYNC_MAX_ATTEMPTS: &str = "PAWKIT_SYNC_MAX_ATTEMPTS";
pub const ENV_TRASH_RETENTION_DAYS: &str = "PAWKIT_TRASH_RETENTION_DAYS";
pub const ENV_LOCAL_ONLY_FIELDS: &str = "PAWKIT_LOCAL_ONLY_FIELDS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Remote base URL. Sync is disabled when unset.
    pub api_base_url: Option<String>,
    pub sync_interval_secs: u64,
    pub batch_size: usize,
    pub max_push_attempts: u32,
    pub trash_retention_days: i64,
    pub local_only_fields: LocalOnlyFields,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            sync_interval_secs: SYNC_FOREGROUND_INTERVAL_SECS,
            batch_size: SYNC_DEFAULT_BATCH_SIZE,
            max_push_attempts: SYNC_DEFAULT_MAX_ATTEMPTS,
            trash_retention_days: TRASH_RETENTION_DAYS,
            local_only_fields: LocalOnlyFields::default(),
        }
    }
}

impl SyncConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let parse_or = |key: &str, fallback: u64| {
            read(key)
                .and_then(|value| {
                    value
                        .parse::<u64>()
                        .map_err(|_| log::warn!("[Config] Ignoring invalid {}='{}'", key, value))
                        .ok()
                })
                .unwrap_or(fallback)
        };

        Self {
            api_base_url: read(ENV_API_URL).map(|url| url.trim_end_matches('/').to_string()),
            sync_interval_secs: parse_or(ENV_SYNC_INTERVAL_SECS, defaults.sync_interval_secs)
                .max(1),
            batch_size: parse_or(ENV_SYNC_BATCH_SIZE, defaults.batch_size as u64).max(1) as usize,
            max_push_attempts: parse_or(ENV_SYNC_MAX_ATTEMPTS, defaults.max_push_attempts as u64)
                .clamp(1, u32::MAX as u64) as u32,
            trash_retention_days: parse_or(
                ENV_TRASH_RETENTION_DAYS,
                defaults.trash_retention_days as u64,
            ) as i64,
            local_only_fields: read(ENV_LOCAL_ONLY_FIELDS)
                .map(|list| {
                    LocalOnlyFields::new(
                        list.split(',')
                            .map(str::trim)
                            .filter(|field| !field.is_empty()),
                    )
                })
                .unwrap_or(defaults.local_only_fields),
        }
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.api_base_url.is_some()
    }
}
