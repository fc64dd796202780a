//! Transport plugin contract and the bundled transports.
//!
//! A transport turns an [`Endpoint`] into a [`Sender`] (outbound) and/or a
//! [`Listener`] (inbound). Listeners hand mapped envelopes to the core
//! [`Receiver`]; the runtime wraps each side in an agent:
//! - [`SendingAgent`]: batching, ordering, send failure rules, latching
//! - [`ListeningAgent`]: Inline / Buffered / Durable receive semantics,
//!   back pressure and circuit breaking
//!
//! Bundled transports:
//! - `local://` in-process queues ([`WorkerQueue`], no transport object)
//! - `memory://` an in-process broker with header mapping ([`MemoryTransport`])
//! - `stub://` records outgoing envelopes ([`StubTransport`])

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::envelope::{EndpointMode, Envelope, ListeningStatus};
use crate::routing::{BufferingLimits, Endpoint};
use crate::types::{ConversationId, EnvelopeId, Error, Result};

mod backpressure;
mod circuit;
mod listening;
mod local;
mod memory;
mod sending;
mod stub;

pub use backpressure::BackPressureAgent;
pub use circuit::CircuitBreaker;
pub use listening::{ListeningAgent, ListeningServices};
pub use local::WorkerQueue;
pub use memory::{MemoryBroker, MemoryHeaderMapper, MemoryMessage, MemoryTransport, MEMORY_SCHEME};
pub use sending::SendingAgent;
pub use stub::{StubTransport, STUB_SCHEME};

// =============================================================================
// Transport contract
// =============================================================================

/// Factory of senders and listeners for one uri scheme.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn scheme(&self) -> &str;

    /// Whether endpoints of this transport may use `mode`.
    fn supports_mode(&self, _mode: EndpointMode) -> bool {
        true
    }

    async fn build_sender(&self, endpoint: &Endpoint) -> Result<Arc<dyn Sender>>;

    /// Build a listener that delivers to `receiver`. It starts stopped.
    async fn build_listener(
        &self,
        endpoint: &Endpoint,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Listener>>;
}

/// Outbound side of a transport endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sender: Send + Sync {
    fn destination(&self) -> Url;

    /// Whether the transport can hold an envelope until its scheduled time.
    fn supports_native_scheduled_send(&self) -> bool;

    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Whether the destination is reachable again.
    async fn ping(&self) -> bool;
}

/// Inbound side of a transport endpoint. Also the channel a handled
/// envelope is completed or deferred through.
#[async_trait]
pub trait Listener: Send + Sync {
    fn address(&self) -> &Url;

    /// Acknowledge the envelope to the transport.
    async fn complete(&self, envelope: &Envelope) -> Result<()>;

    /// Return the envelope to the transport for another delivery.
    async fn defer(&self, envelope: Envelope) -> Result<()>;

    /// Start (or resume) receiving.
    async fn start(&self) -> Result<()>;

    /// Stop receiving. Envelopes already received are not affected.
    async fn stop(&self) -> Result<()>;

    /// Stop for good and release transport resources.
    async fn dispose(&self) -> Result<()> {
        self.stop().await
    }
}

/// Core entry point for envelopes coming off a transport.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn received(&self, listener: Arc<dyn Listener>, envelopes: Vec<Envelope>) -> Result<()>;
}

/// Executes the handler for a received envelope.
#[async_trait]
pub trait HandlerPipeline: Send + Sync {
    async fn execute(
        &self,
        endpoint: &Arc<Endpoint>,
        envelope: Envelope,
        channel: Arc<dyn Listener>,
    ) -> ExecutionOutcome;
}

/// Result of one handler execution, fed to the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
}

/// Back-pressure surface of a listening endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListeningAgentControl: Send + Sync {
    fn uri(&self) -> Url;
    fn status(&self) -> ListeningStatus;
    fn queue_count(&self) -> usize;
    fn buffering_limits(&self) -> BufferingLimits;

    async fn mark_as_too_busy_and_stop_receiving(&self) -> Result<()>;

    /// Start receiving and set the status to `Accepting`.
    async fn start(&self) -> Result<()>;

    /// Stop receiving for `pause`, then start again.
    async fn pause(&self, pause: Duration) -> Result<()>;
}

// =============================================================================
// Header mapping
// =============================================================================

pub mod headers {
    //! Standard envelope header names.
    pub const ID: &str = "id";
    pub const MESSAGE_TYPE: &str = "message-type";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CONVERSATION_ID: &str = "conversation-id";
    pub const PARENT_ID: &str = "parent-id";
    pub const SOURCE: &str = "source";
    pub const DESTINATION: &str = "destination";
    pub const REPLY_URI: &str = "reply-uri";
    pub const REPLY_REQUESTED: &str = "reply-requested";
    pub const ACK_REQUESTED: &str = "ack-requested";
    pub const IS_RESPONSE: &str = "is-response";
    pub const ATTEMPTS: &str = "attempts";
    pub const DELIVER_BY: &str = "deliver-by";
    pub const SENT_AT: &str = "sent-at";
    /// Prefix of application headers.
    pub const CUSTOM_PREFIX: &str = "header-";
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::validation(format!("invalid timestamp header '{}': {}", raw, e)))
}

/// Maps envelope metadata onto a transport message type `T`.
///
/// Transports implement the two primitive hooks; the envelope mapping is
/// shared.
pub trait HeaderMapper<T>: Send + Sync {
    fn write_outgoing_header(&self, message: &mut T, key: &str, value: &str);

    fn try_read_incoming_header(&self, message: &T, key: &str) -> Option<String>;

    /// Application headers of an incoming message, without their prefix.
    fn read_custom_headers(&self, _message: &T) -> HashMap<String, String> {
        HashMap::new()
    }

    fn map_envelope_to_outgoing(&self, envelope: &Envelope, message: &mut T) {
        self.write_outgoing_header(message, headers::ID, &envelope.id.to_string());
        self.write_outgoing_header(message, headers::MESSAGE_TYPE, &envelope.message_type);
        self.write_outgoing_header(message, headers::CONTENT_TYPE, &envelope.content_type);
        self.write_outgoing_header(message, headers::ATTEMPTS, &envelope.attempts.to_string());
        if let Some(correlation_id) = &envelope.correlation_id {
            self.write_outgoing_header(message, headers::CORRELATION_ID, correlation_id);
        }
        if let Some(conversation_id) = &envelope.conversation_id {
            self.write_outgoing_header(message, headers::CONVERSATION_ID, &conversation_id.to_string());
        }
        if let Some(parent_id) = &envelope.parent_id {
            self.write_outgoing_header(message, headers::PARENT_ID, parent_id);
        }
        if let Some(source) = &envelope.source {
            self.write_outgoing_header(message, headers::SOURCE, source);
        }
        if let Some(destination) = &envelope.destination {
            self.write_outgoing_header(message, headers::DESTINATION, destination.as_str());
        }
        if let Some(reply_uri) = &envelope.reply_uri {
            self.write_outgoing_header(message, headers::REPLY_URI, reply_uri.as_str());
        }
        if let Some(reply_requested) = &envelope.reply_requested {
            self.write_outgoing_header(message, headers::REPLY_REQUESTED, reply_requested);
        }
        if envelope.ack_requested {
            self.write_outgoing_header(message, headers::ACK_REQUESTED, "true");
        }
        if envelope.is_response {
            self.write_outgoing_header(message, headers::IS_RESPONSE, "true");
        }
        if let Some(deliver_by) = &envelope.deliver_by {
            self.write_outgoing_header(message, headers::DELIVER_BY, &deliver_by.to_rfc3339());
        }
        if let Some(sent_at) = &envelope.sent_at {
            self.write_outgoing_header(message, headers::SENT_AT, &sent_at.to_rfc3339());
        }
        for (key, value) in &envelope.headers {
            let key = format!("{}{}", headers::CUSTOM_PREFIX, key);
            self.write_outgoing_header(message, &key, value);
        }
    }

    fn map_incoming_to_envelope(&self, message: &T, data: Bytes) -> Result<Envelope> {
        let read = |key: &str| self.try_read_incoming_header(message, key);

        let message_type = read(headers::MESSAGE_TYPE)
            .ok_or_else(|| Error::validation("incoming message has no message-type header"))?;
        let mut envelope = Envelope::new(message_type, data);

        if let Some(id) = read(headers::ID) {
            envelope.id = EnvelopeId::parse(&id).map_err(Error::validation)?;
        }
        if let Some(content_type) = read(headers::CONTENT_TYPE) {
            envelope.content_type = content_type;
        }
        envelope.correlation_id = read(headers::CORRELATION_ID);
        if let Some(conversation_id) = read(headers::CONVERSATION_ID) {
            envelope.conversation_id =
                Some(ConversationId::parse(&conversation_id).map_err(Error::validation)?);
        }
        envelope.parent_id = read(headers::PARENT_ID);
        envelope.source = read(headers::SOURCE);
        envelope.destination = read(headers::DESTINATION)
            .map(|raw| Url::parse(&raw))
            .transpose()?;
        envelope.reply_uri = read(headers::REPLY_URI)
            .map(|raw| Url::parse(&raw))
            .transpose()?;
        envelope.reply_requested = read(headers::REPLY_REQUESTED);
        envelope.ack_requested = read(headers::ACK_REQUESTED).as_deref() == Some("true");
        envelope.is_response = read(headers::IS_RESPONSE).as_deref() == Some("true");
        envelope.attempts = read(headers::ATTEMPTS)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        envelope.deliver_by = read(headers::DELIVER_BY)
            .map(|raw| parse_time(&raw))
            .transpose()?;
        envelope.sent_at = read(headers::SENT_AT)
            .map(|raw| parse_time(&raw))
            .transpose()?;
        envelope.headers = self.read_custom_headers(message);
        Ok(envelope)
    }
}
