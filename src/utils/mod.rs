//! Shared utilities: cancellation and remote call retries.

pub mod cancellation;
pub mod retry;

pub use cancellation::cancellable;
pub use retry::{retry_transient, with_timeout, RetryPolicy};
