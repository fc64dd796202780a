//! Exponential backoff around transient store failures.

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::types::{BackoffConfig, Error, Result};

/// Run `operation`, retrying transient errors with exponential backoff.
///
/// Non-transient errors and the error of the last allowed attempt are
/// returned as-is. Cancellation during a backoff wait returns
/// `Error::Cancelled`.
pub async fn run_with_backoff<F, Fut, T>(
    config: &BackoffConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < config.max_retries => {
                retry += 1;
                let delay = config.delay_for(retry);
                tracing::warn!(
                    "durability_retry: operation={}, retry={}, delay={:?}, error={}",
                    operation_name,
                    retry,
                    delay,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::cancelled(format!("{} cancelled during backoff", operation_name)));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
