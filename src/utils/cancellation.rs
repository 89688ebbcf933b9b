//! Cancellation support built on tokio-util's CancellationToken
//!
//! A session owns a root token; every monitor and every sync attempt runs
//! under a child token so stopping the session cancels everything in flight.

use crate::error::{Result, WorkspaceError};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `fut` unless `token` is cancelled first.
///
/// On cancellation the future is dropped at its current suspension point
/// and [`WorkspaceError::Cancelled`] is returned.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(WorkspaceError::Cancelled),
        res = fut => res,
    }
}
