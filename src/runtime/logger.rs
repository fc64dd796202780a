//! Message-logger sink.
//!
//! Fire-and-forget observability hook for envelope lifecycle events. The
//! default sink emits structured tracing events; the recording sink keeps
//! events in memory for tests and inspection.

use serde::Serialize;
use std::sync::Mutex;

use crate::envelope::Envelope;
use crate::types::EnvelopeId;

/// Receives envelope lifecycle events.
#[cfg_attr(test, mockall::automock)]
pub trait MessageLogger: Send + Sync {
    fn sent(&self, envelope: &Envelope);
    fn received(&self, envelope: &Envelope);
    fn message_succeeded(&self, envelope: &Envelope);
    fn message_failed(&self, envelope: &Envelope, error: &str);
    fn moved_to_error_queue(&self, envelope: &Envelope, error: &str);
    fn no_routes(&self, envelope: &Envelope);
    fn no_handler(&self, envelope: &Envelope);
    fn discarded(&self, envelope: &Envelope);
}

fn destination(envelope: &Envelope) -> &str {
    envelope.destination.as_ref().map(|u| u.as_str()).unwrap_or("-")
}

/// Emits every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessageLogger;

impl MessageLogger for TracingMessageLogger {
    fn sent(&self, envelope: &Envelope) {
        tracing::debug!(
            "envelope_sent: id={}, type={}, destination={}",
            envelope.id,
            envelope.message_type,
            destination(envelope)
        );
    }

    fn received(&self, envelope: &Envelope) {
        tracing::debug!(
            "envelope_received: id={}, type={}, destination={}",
            envelope.id,
            envelope.message_type,
            destination(envelope)
        );
    }

    fn message_succeeded(&self, envelope: &Envelope) {
        tracing::debug!(
            "message_succeeded: id={}, type={}, attempts={}",
            envelope.id,
            envelope.message_type,
            envelope.attempts
        );
    }

    fn message_failed(&self, envelope: &Envelope, error: &str) {
        tracing::warn!(
            "message_failed: id={}, type={}, attempts={}, error={}",
            envelope.id,
            envelope.message_type,
            envelope.attempts,
            error
        );
    }

    fn moved_to_error_queue(&self, envelope: &Envelope, error: &str) {
        tracing::error!(
            "envelope_moved_to_error_queue: id={}, type={}, error={}",
            envelope.id,
            envelope.message_type,
            error
        );
    }

    fn no_routes(&self, envelope: &Envelope) {
        tracing::info!(
            "no_routes: id={}, type={}",
            envelope.id,
            envelope.message_type
        );
    }

    fn no_handler(&self, envelope: &Envelope) {
        tracing::warn!(
            "no_handler: id={}, type={}, destination={}",
            envelope.id,
            envelope.message_type,
            destination(envelope)
        );
    }

    fn discarded(&self, envelope: &Envelope) {
        tracing::info!(
            "envelope_discarded: id={}, type={}",
            envelope.id,
            envelope.message_type
        );
    }
}

// =============================================================================
// Recording sink
// =============================================================================

/// Kind of a recorded lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageEventKind {
    Sent,
    Received,
    Succeeded,
    Failed,
    MovedToErrorQueue,
    NoRoutes,
    NoHandler,
    Discarded,
}

/// One recorded lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEvent {
    pub kind: MessageEventKind,
    pub envelope_id: EnvelopeId,
    pub message_type: String,
    pub source: Option<String>,
    pub error: Option<String>,
}

/// Keeps every event in memory and forwards it to tracing.
#[derive(Debug, Default)]
pub struct RecordingMessageLogger {
    events: Mutex<Vec<MessageEvent>>,
}

impl RecordingMessageLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MessageEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: MessageEventKind) -> Vec<MessageEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind == kind)
            .collect()
    }

    pub fn count(&self, kind: MessageEventKind) -> usize {
        self.of_kind(kind).len()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn record(&self, kind: MessageEventKind, envelope: &Envelope, error: Option<&str>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(MessageEvent {
                kind,
                envelope_id: envelope.id,
                message_type: envelope.message_type.clone(),
                source: envelope.source.clone(),
                error: error.map(str::to_string),
            });
        }
    }
}

impl MessageLogger for RecordingMessageLogger {
    fn sent(&self, envelope: &Envelope) {
        TracingMessageLogger.sent(envelope);
        self.record(MessageEventKind::Sent, envelope, None);
    }

    fn received(&self, envelope: &Envelope) {
        TracingMessageLogger.received(envelope);
        self.record(MessageEventKind::Received, envelope, None);
    }

    fn message_succeeded(&self, envelope: &Envelope) {
        TracingMessageLogger.message_succeeded(envelope);
        self.record(MessageEventKind::Succeeded, envelope, None);
    }

    fn message_failed(&self, envelope: &Envelope, error: &str) {
        TracingMessageLogger.message_failed(envelope, error);
        self.record(MessageEventKind::Failed, envelope, Some(error));
    }

    fn moved_to_error_queue(&self, envelope: &Envelope, error: &str) {
        TracingMessageLogger.moved_to_error_queue(envelope, error);
        self.record(MessageEventKind::MovedToErrorQueue, envelope, Some(error));
    }

    fn no_routes(&self, envelope: &Envelope) {
        TracingMessageLogger.no_routes(envelope);
        self.record(MessageEventKind::NoRoutes, envelope, None);
    }

    fn no_handler(&self, envelope: &Envelope) {
        TracingMessageLogger.no_handler(envelope);
        self.record(MessageEventKind::NoHandler, envelope, None);
    }

    fn discarded(&self, envelope: &Envelope) {
        TracingMessageLogger.discarded(envelope);
        self.record(MessageEventKind::Discarded, envelope, None);
    }
}
