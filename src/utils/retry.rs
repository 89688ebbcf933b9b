//! Timeouts and retries for remote calls
//!
//! Remote calls are bounded by a timeout and transport failures are retried
//! with jittered exponential backoff (`tokio-retry`). Anything that is not a
//! transport failure is returned immediately.

use crate::error::{RemoteError, Result, WorkspaceError};
use crate::infrastructure::config::SyncConfig;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Backoff parameters of one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delays: initial, 2x initial, 4x initial... capped at `max_backoff`.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.initial_backoff.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_backoff)
            .map(jitter)
            .take(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Run a remote call, failing with [`RemoteError::Timeout`] after `limit`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> std::result::Result<T, RemoteError>
where
    F: Future<Output = std::result::Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit.as_millis() as u64)),
    }
}

/// Retry `operation` while it fails with a transient error.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    RetryIf::spawn(
        policy.strategy(),
        || {
            attempt += 1;
            let fut = operation();
            let current = attempt;
            async move {
                let res = fut.await;
                match &res {
                    Err(e) if e.is_transient() => {
                        warn!(
                            operation = %operation_name,
                            attempt = current,
                            error = %e,
                            "Transient failure, retrying"
                        );
                    }
                    Ok(_) if current > 1 => {
                        debug!(
                            operation = %operation_name,
                            attempts = current,
                            "Operation succeeded after retries"
                        );
                    }
                    _ => {}
                }
                res
            }
        },
        |e: &WorkspaceError| e.is_transient(),
    )
    .await
}
