//! Panic recovery utilities.
//!
//! Handlers, continuations and background jobs run behind these wrappers so
//! a panic in application code is logged and turned into an error instead
//! of taking a worker down.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::types::{Error, Result};

/// Execute a function with panic recovery.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => Err(panic_error(payload.as_ref(), operation_name)),
    }
}

/// Poll a future to completion with panic recovery.
///
/// Panics raised while the future is polled are captured, not only those
/// raised while it is constructed.
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_error(payload.as_ref(), operation_name)),
    }
}

/// Log a captured panic and convert it to an internal error.
pub fn panic_error(payload: &(dyn Any + Send), operation_name: &str) -> Error {
    let panic_msg = extract_panic_message(payload);
    tracing::error!(
        "panic_recovered: operation={}, panic={}",
        operation_name,
        panic_msg
    );
    Error::internal(format!("Panic in {}: {}", operation_name, panic_msg))
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
