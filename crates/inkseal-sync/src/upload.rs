//! Blob upload with bounded exponential backoff.

use std::time::Duration;

use inkseal_core::config::PipelineConfig;
use inkseal_core::store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.upload_max_attempts.max(1),
            base_backoff: Duration::from_millis(config.upload_base_backoff_ms),
        }
    }

    /// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Upload `bytes` to `path`, retrying transient failures.
///
/// Terminal failures (payload too large, authorization) fail immediately.
/// Cancellation is checked before every attempt and during backoff.
/// Returns the number of attempts used.
pub async fn put_with_retry(
    store: &dyn ObjectStore,
    path: &str,
    mut bytes: Vec<u8>,
    content_type: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> SyncResult<u32> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let last = attempt + 1 >= max_attempts;
        let body = if last {
            std::mem::take(&mut bytes)
        } else {
            bytes.clone()
        };

        match store.put(path, body, content_type).await {
            Ok(()) => {
                debug!(path, attempts = attempt + 1, "upload complete");
                return Ok(attempt + 1);
            }
            Err(e) if e.is_retryable() && !last => {
                let backoff = policy.backoff(attempt);
                warn!(path, attempt = attempt + 1, error = %e, "upload failed, retrying in {backoff:?}");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => {
                return Err(SyncError::UploadFailed {
                    attempts: attempt + 1,
                    source: e,
                })
            }
        }
    }
}
