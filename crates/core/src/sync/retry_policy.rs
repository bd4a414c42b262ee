//! Retry classification and backoff for remote failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::scheduler::{SYNC_BACKOFF_BASE_SECS, SYNC_BACKOFF_MAX_EXPONENT};

/// Retry policy classification for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify HTTP status into retry behavior. `409` is not listed: version
/// conflicts are answered with a server entity and never reach this function.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 423 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Exponential backoff in seconds with cap.
pub fn backoff_seconds(consecutive_failures: u32) -> u64 {
    let capped = consecutive_failures.min(SYNC_BACKOFF_MAX_EXPONENT);
    2_u64.pow(capped) * SYNC_BACKOFF_BASE_SECS
}

/// Backoff delay with up to 20% random jitter so devices do not retry in lockstep.
pub fn backoff_with_jitter(consecutive_failures: u32) -> Duration {
    let base_ms = backoff_seconds(consecutive_failures).saturating_mul(1_000);
    let jitter = rand::thread_rng().gen_range(0..=(base_ms / 5).max(1));
    Duration::from_millis(base_ms.saturating_add(jitter))
}
