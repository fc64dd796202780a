//! Continuation engine.
//!
//! Failure handling is two separate stages:
//! 1. [`classify`] is a pure function from (error, envelope, rule chain) to a
//!    [`ContinuationKind`]. Nothing is executed.
//! 2. [`ContinuationKind::build`] turns the decision into an executable
//!    [`Continuation`] which acts on the envelope through an
//!    [`EnvelopeLifecycle`] and the runtime through a [`ContinuationRuntime`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::error::Error as StdError;
use std::time::Duration;
use url::Url;

use crate::envelope::Envelope;
use crate::runtime::MessageLogger;
use crate::types::Result;

mod actions;
mod rules;

pub use actions::{
    CompositeContinuation, DiscardContinuation, MoveToErrorQueueContinuation,
    PauseListenerContinuation, RequeueContinuation, RetryNowContinuation,
    ScheduledRetryContinuation,
};
pub use rules::{ErrorPredicate, FailureRule, FailureRuleBuilder, FailureRuleCollection};

// =============================================================================
// Decision
// =============================================================================

/// Recovery action decided for a failed delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationKind {
    /// Put the envelope back on its queue, optionally after a delay.
    Requeue { delay: Option<Duration> },
    /// Execute again immediately, in place.
    RetryNow,
    /// Persist as a scheduled job due `now + delay`.
    ScheduleRetry(Duration),
    /// Dead-letter the envelope and tell the sender.
    MoveToErrorQueue,
    /// Drop the envelope.
    Discard,
    /// Stop the listener of the envelope's endpoint for a while.
    PauseListener(Duration),
    /// Run every inner continuation.
    Composite(Vec<ContinuationKind>),
}

impl ContinuationKind {
    /// Build the executable continuation for this decision.
    pub fn build(&self, error_text: &str) -> Box<dyn Continuation> {
        match self {
            ContinuationKind::Requeue { delay } => Box::new(RequeueContinuation::new(*delay)),
            ContinuationKind::RetryNow => Box::new(RetryNowContinuation),
            ContinuationKind::ScheduleRetry(delay) => {
                Box::new(ScheduledRetryContinuation::new(*delay))
            }
            ContinuationKind::MoveToErrorQueue => {
                Box::new(MoveToErrorQueueContinuation::new(error_text))
            }
            ContinuationKind::Discard => Box::new(DiscardContinuation),
            ContinuationKind::PauseListener(pause) => {
                Box::new(PauseListenerContinuation::new(*pause))
            }
            ContinuationKind::Composite(kinds) => Box::new(CompositeContinuation::new(
                kinds.iter().map(|kind| kind.build(error_text)).collect(),
            )),
        }
    }
}

/// Decide what to do with a failed delivery attempt.
///
/// Rule collections are consulted in the given order (handler, endpoint,
/// global); the first collection with a matching rule decides. With no match
/// the envelope goes to the error queue.
pub fn classify(
    error: &(dyn StdError + 'static),
    envelope: &Envelope,
    chain: &[&FailureRuleCollection],
) -> ContinuationKind {
    chain
        .iter()
        .find_map(|rules| rules.determine(error, envelope))
        .unwrap_or(ContinuationKind::MoveToErrorQueue)
}

// =============================================================================
// Execution seams
// =============================================================================

/// Operations a continuation may perform on the envelope being handled.
#[async_trait]
pub trait EnvelopeLifecycle: Send {
    fn envelope(&self) -> &Envelope;

    /// Finish the envelope without further delivery.
    async fn complete(&mut self) -> Result<()>;

    /// Put the envelope back on its queue.
    async fn defer(&mut self, delay: Option<Duration>) -> Result<()>;

    /// Ask the pipeline to execute the envelope again right away.
    fn retry_execution_now(&mut self);

    /// Persist the envelope as a scheduled job due at `time`.
    async fn reschedule(&mut self, time: DateTime<Utc>) -> Result<()>;

    async fn move_to_dead_letter(&mut self, error: &str) -> Result<()>;

    /// Send a failure acknowledgement to the reply address, if any.
    async fn send_failure_acknowledgement(&mut self, message: &str) -> Result<()>;
}

/// Runtime services available to continuations.
#[async_trait]
pub trait ContinuationRuntime: Send + Sync {
    fn message_logger(&self) -> &dyn MessageLogger;

    /// Stop the listener at `endpoint` and restart it after `pause`.
    async fn pause_listener(&self, endpoint: &Url, pause: Duration) -> Result<()>;
}

/// Executable recovery action.
#[async_trait]
pub trait Continuation: Send + Sync + std::fmt::Debug {
    async fn execute(
        &self,
        lifecycle: &mut dyn EnvelopeLifecycle,
        runtime: &dyn ContinuationRuntime,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::runtime::RecordingMessageLogger;
    use std::sync::Mutex;

    /// Lifecycle that records every call.
    #[derive(Debug)]
    pub struct RecordingLifecycle {
        pub envelope: Envelope,
        pub calls: Vec<String>,
        pub fail_dead_letter: bool,
    }

    impl RecordingLifecycle {
        pub fn new(envelope: Envelope) -> Self {
            Self {
                envelope,
                calls: Vec::new(),
                fail_dead_letter: false,
            }
        }
    }

    #[async_trait]
    impl EnvelopeLifecycle for RecordingLifecycle {
        fn envelope(&self) -> &Envelope {
            &self.envelope
        }

        async fn complete(&mut self) -> Result<()> {
            self.calls.push("complete".to_string());
            Ok(())
        }

        async fn defer(&mut self, delay: Option<Duration>) -> Result<()> {
            self.calls.push(format!("defer:{:?}", delay));
            Ok(())
        }

        fn retry_execution_now(&mut self) {
            self.calls.push("retry_now".to_string());
        }

        async fn reschedule(&mut self, time: DateTime<Utc>) -> Result<()> {
            self.calls.push(format!("reschedule:{}", time.timestamp()));
            Ok(())
        }

        async fn move_to_dead_letter(&mut self, error: &str) -> Result<()> {
            self.calls.push(format!("dead_letter:{}", error));
            if self.fail_dead_letter {
                return Err(crate::types::Error::persistence("store down"));
            }
            Ok(())
        }

        async fn send_failure_acknowledgement(&mut self, message: &str) -> Result<()> {
            self.calls.push(format!("failure_ack:{}", message));
            Ok(())
        }
    }

    /// Runtime backed by a recording logger.
    #[derive(Debug, Default)]
    pub struct RecordingRuntime {
        pub logger: RecordingMessageLogger,
        pub paused: Mutex<Vec<(Url, Duration)>>,
    }

    #[async_trait]
    impl ContinuationRuntime for RecordingRuntime {
        fn message_logger(&self) -> &dyn MessageLogger {
            &self.logger
        }

        async fn pause_listener(&self, endpoint: &Url, pause: Duration) -> Result<()> {
            if let Ok(mut paused) = self.paused.lock() {
                paused.push((endpoint.clone(), pause));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;
    use pretty_assertions::assert_eq;

    #[derive(Debug, thiserror::Error)]
    #[error("divide by zero")]
    struct DivideByZero;

    #[test]
    fn test_classify_defaults_to_error_queue() {
        let envelope = Envelope::new("a", Vec::<u8>::new());
        let kind = classify(&DivideByZero, &envelope, &[]);
        assert_eq!(kind, ContinuationKind::MoveToErrorQueue);
    }

    #[test]
    fn test_classify_walks_chain_in_order() {
        let mut handler_rules = FailureRuleCollection::new();
        handler_rules.on::<Error>().retry_now(1);
        let mut global_rules = FailureRuleCollection::new();
        global_rules.on::<DivideByZero>().requeue(3);

        let mut envelope = Envelope::new("a", Vec::<u8>::new());
        envelope.attempts = 1;

        let chain = [&handler_rules, &global_rules];
        assert_eq!(
            classify(&DivideByZero, &envelope, &chain),
            ContinuationKind::Requeue { delay: None }
        );
        assert_eq!(
            classify(&Error::timeout("slow"), &envelope, &chain),
            ContinuationKind::RetryNow
        );
    }

    #[test]
    fn test_build_composite_keeps_all_parts() {
        let kind = ContinuationKind::Composite(vec![
            ContinuationKind::PauseListener(Duration::from_secs(1)),
            ContinuationKind::Requeue { delay: None },
        ]);
        let continuation = kind.build("boom");
        let rendered = format!("{:?}", continuation);
        assert!(rendered.contains("PauseListenerContinuation"));
        assert!(rendered.contains("RequeueContinuation"));
    }
}
