//! Executable continuations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{Continuation, ContinuationRuntime, EnvelopeLifecycle};
use crate::runtime::recovery::with_recovery_async;
use crate::types::{saturating_add, Result};

/// Put the envelope back on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequeueContinuation {
    delay: Option<Duration>,
}

impl RequeueContinuation {
    pub fn new(delay: Option<Duration>) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Continuation for RequeueContinuation {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        _runtime: &dyn ContinuationRuntime,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        lifecycle.defer(self.delay).await
    }
}

/// Execute the envelope again, in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryNowContinuation;

#[async_trait]
impl Continuation for RetryNowContinuation {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        _runtime: &dyn ContinuationRuntime,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        lifecycle.retry_execution_now();
        Ok(())
    }
}

/// Reschedule the envelope at `now + delay`.
///
/// Two instances are equal when their delays are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduledRetryContinuation {
    delay: Duration,
}

impl ScheduledRetryContinuation {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[async_trait]
impl Continuation for ScheduledRetryContinuation {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        _runtime: &dyn ContinuationRuntime,
        now: DateTime<Utc>,
    ) -> Result<()> {
        lifecycle
            .reschedule(saturating_add(now, self.delay))
            .await
    }
}

/// Dead-letter the envelope and send a failure acknowledgement.
///
/// Never fails: store or transport problems are logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveToErrorQueueContinuation {
    error: String,
}

impl MoveToErrorQueueContinuation {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[async_trait]
impl Continuation for MoveToErrorQueueContinuation {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        runtime: &dyn ContinuationRuntime,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        let envelope = lifecycle.envelope().clone();
        let logger = runtime.message_logger();
        logger.message_failed(&envelope, &self.error);
        logger.moved_to_error_queue(&envelope, &self.error);

        if let Err(e) = lifecycle.move_to_dead_letter(&self.error).await {
            tracing::error!("dead_letter_failed: id={}, error={}", envelope.id, e);
        }

        let message = format!(
            "Moved message {} to the Error Queue.\n{}",
            envelope.id, self.error
        );
        if let Err(e) = lifecycle.send_failure_acknowledgement(&message).await {
            tracing::warn!("failure_ack_failed: id={}, error={}", envelope.id, e);
        }
        Ok(())
    }
}

/// Drop the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscardContinuation;

#[async_trait]
impl Continuation for DiscardContinuation {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        runtime: &dyn ContinuationRuntime,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        runtime.message_logger().discarded(lifecycle.envelope());
        lifecycle.complete().await
    }
}

/// Pause the listener the envelope arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseListenerContinuation {
    pause: Duration,
}

impl PauseListenerContinuation {
    pub fn new(pause: Duration) -> Self {
        Self { pause }
    }
}

#[async_trait]
impl Continuation for PauseListenerContinuation {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        runtime: &dyn ContinuationRuntime,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        match lifecycle.envelope().destination.clone() {
            Some(endpoint) => runtime.pause_listener(&endpoint, self.pause).await,
            None => {
                tracing::warn!(
                    "pause_listener_skipped: id={}, reason=no destination",
                    lifecycle.envelope().id
                );
                Ok(())
            }
        }
    }
}

/// Runs every inner continuation in order.
///
/// A failing or panicking inner continuation is logged and the remaining ones
/// still run.
#[derive(Debug)]
pub struct CompositeContinuation {
    inner: Vec<Box<dyn Continuation>>,
}

impl CompositeContinuation {
    pub fn new(inner: Vec<Box<dyn Continuation>>) -> Self {
        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl Continuation for CompositeContinuation {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        runtime: &dyn ContinuationRuntime,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for continuation in &self.inner {
            let outcome = with_recovery_async(
                continuation.execute(&mut *lifecycle, runtime, now),
                "composite_continuation",
            )
            .await;
            if let Err(e) = outcome {
                tracing::error!(
                    "continuation_failed: id={}, continuation={:?}, error={}",
                    lifecycle.envelope().id,
                    continuation,
                    e
                );
            }
        }
        Ok(())
    }
}
