//! Retry with exponential backoff for request-response calls (invite status
//! changes and fetches). The sync push path does not use this: failed pushes
//! wait in the pending queue for the next replay.

use crate::config::SyncConfig;
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tasksync_core::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_times: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_times: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_times: config.retry_max_times,
            min_delay: Duration::from_millis(config.retry_min_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_times)
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// the policy gives up.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    name: &str,
    operation: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    operation
        .retry(policy.backoff())
        .when(|e: &SyncError| e.is_transient())
        .notify(|e: &SyncError, delay: Duration| {
            tracing::warn!("SYNC: {} failed ({}), retrying in {:?}", name, e, delay);
        })
        .await
}
