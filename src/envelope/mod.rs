//! Envelope - the durable unit of a message in transit.
//!
//! An Envelope carries an opaque payload plus the delivery metadata the
//! runtime needs to route, persist, retry and correlate it:
//! - **Identity**: envelope id, correlation/conversation/parent ids
//! - **Addressing**: destination, reply address, source service
//! - **Lifecycle**: status, owner, attempts, scheduling and expiry times
//! - **Request/reply**: requested response type, acknowledgement flags
//!
//! Bodies are bytes tagged with a content type. The typed convenience layer
//! (`Message`) encodes them as JSON.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::types::{saturating_add, ConversationId, EnvelopeId, Error, Result};

pub mod enums;

pub use enums::*;

/// Content type used by the typed JSON layer.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Message type tag of a positive acknowledgement.
pub const ACKNOWLEDGEMENT_TYPE: &str = "courier.acknowledgement";

/// Message type tag of a failure acknowledgement.
pub const FAILURE_ACKNOWLEDGEMENT_TYPE: &str = "courier.failure-acknowledgement";

// =============================================================================
// Typed messages
// =============================================================================

/// A strongly-typed message that can travel inside an envelope.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag written to `Envelope::message_type`.
    fn message_type() -> String {
        std::any::type_name::<Self>().replace("::", ".")
    }

    /// Handler execution and request/reply timeout specific to this type.
    fn execution_timeout() -> Option<Duration> {
        None
    }
}

/// Body of a failure acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAcknowledgement {
    pub message: String,
}

// =============================================================================
// Envelope
// =============================================================================

/// Message payload plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub message_type: String,
    pub content_type: String,
    pub data: Bytes,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Url>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_uri: Option<Url>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Service name of the node that sent this envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub status: EnvelopeStatus,
    pub owner_id: OwnerId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,

    pub attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_by: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,

    /// Retention deadline once handled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_until: Option<DateTime<Utc>>,

    /// Message type of the response the sender is waiting for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_requested: Option<String>,

    #[serde(default)]
    pub ack_requested: bool,

    #[serde(default)]
    pub is_response: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl Envelope {
    /// Create an outgoing envelope around a raw payload.
    pub fn new(message_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let id = EnvelopeId::new();
        Self {
            id,
            message_type: message_type.into(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            data: data.into(),
            destination: None,
            reply_uri: None,
            correlation_id: Some(id.to_string()),
            conversation_id: None,
            parent_id: None,
            source: None,
            status: EnvelopeStatus::Outgoing,
            owner_id: OwnerId::AnyNode,
            scheduled_time: None,
            attempts: 0,
            deliver_by: None,
            sent_at: None,
            received_at: None,
            keep_until: None,
            reply_requested: None,
            ack_requested: false,
            is_response: false,
            headers: HashMap::new(),
        }
    }

    /// Encode a typed message as JSON.
    pub fn for_message<M: Message>(message: &M) -> Result<Self> {
        let data = serde_json::to_vec(message)?;
        Ok(Self::new(M::message_type(), data))
    }

    /// Decode the payload as a typed message.
    pub fn decode<M: Message>(&self) -> Result<M> {
        if self.message_type != M::message_type() {
            return Err(Error::validation(format!(
                "envelope {} carries '{}', not '{}'",
                self.id,
                self.message_type,
                M::message_type()
            )));
        }
        Ok(serde_json::from_slice(&self.data)?)
    }

    // =========================================================================
    // Builders
    // =========================================================================

    pub fn with_destination(mut self, destination: Url) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_reply_uri(mut self, reply_uri: Url) -> Self {
        self.reply_uri = Some(reply_uri);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_deliver_within(mut self, window: Duration, now: DateTime<Utc>) -> Self {
        self.deliver_by = Some(saturating_add(now, window));
        self
    }

    /// Mark this envelope for delayed delivery.
    ///
    /// Scheduled envelopes always start unowned.
    pub fn schedule_at(mut self, time: DateTime<Utc>) -> Self {
        self.status = EnvelopeStatus::Scheduled;
        self.scheduled_time = Some(time);
        self.owner_id = OwnerId::AnyNode;
        self
    }

    /// Copy of this envelope addressed to one resolved destination.
    ///
    /// Each destination gets its own envelope id; correlation data is shared.
    pub fn for_destination(&self, destination: Url) -> Self {
        let mut copy = self.clone();
        copy.id = EnvelopeId::new();
        copy.destination = Some(destination);
        copy
    }

    /// Envelope for a cascading message caused by this one.
    pub fn cascade(&self, mut child: Envelope) -> Envelope {
        child.conversation_id = self.conversation_id;
        child.correlation_id = self.correlation_id.clone();
        child.parent_id = Some(self.id.to_string());
        child
    }

    /// Response to this envelope, addressed to its reply uri.
    pub fn create_response<M: Message>(&self, response: &M, source: &str) -> Result<Envelope> {
        let reply_uri = self.reply_uri.clone().ok_or_else(|| {
            Error::validation(format!("envelope {} has no reply address", self.id))
        })?;
        let mut envelope = self.cascade(Envelope::for_message(response)?);
        envelope.destination = Some(reply_uri);
        envelope.is_response = true;
        envelope.source = Some(source.to_string());
        Ok(envelope)
    }

    /// Positive acknowledgement addressed to the reply uri.
    pub fn acknowledgement(&self, source: &str) -> Option<Envelope> {
        let reply_uri = self.reply_uri.clone()?;
        let mut ack = self.cascade(Envelope::new(ACKNOWLEDGEMENT_TYPE, Bytes::new()));
        ack.destination = Some(reply_uri);
        ack.is_response = true;
        ack.source = Some(source.to_string());
        Some(ack)
    }

    /// Failure acknowledgement carrying `message`, addressed to the reply uri.
    pub fn failure_acknowledgement(&self, message: &str, source: &str) -> Result<Option<Envelope>> {
        let Some(reply_uri) = self.reply_uri.clone() else {
            return Ok(None);
        };
        let body = serde_json::to_vec(&FailureAcknowledgement {
            message: message.to_string(),
        })?;
        let mut ack = self.cascade(Envelope::new(FAILURE_ACKNOWLEDGEMENT_TYPE, body));
        ack.destination = Some(reply_uri);
        ack.is_response = true;
        ack.source = Some(source.to_string());
        Ok(Some(ack))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether `deliver_by` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deliver_by, Some(deadline) if deadline <= now)
    }

    pub fn is_scheduled_for_later(&self, now: DateTime<Utc>) -> bool {
        matches!(self.scheduled_time, Some(time) if time > now)
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.message_type == ACKNOWLEDGEMENT_TYPE
    }

    pub fn is_failure_acknowledgement(&self) -> bool {
        self.message_type == FAILURE_ACKNOWLEDGEMENT_TYPE
    }

    /// Whether some sender is waiting on a reply to this envelope.
    pub fn expects_reply(&self) -> bool {
        self.reply_uri.is_some() && (self.ack_requested || self.reply_requested.is_some())
    }

    /// Remote error text of a failure acknowledgement.
    pub fn failure_message(&self) -> Option<String> {
        if !self.is_failure_acknowledgement() {
            return None;
        }
        serde_json::from_slice::<FailureAcknowledgement>(&self.data)
            .map(|ack| ack.message)
            .ok()
    }

    /// Check structural invariants before the envelope is persisted or sent.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.message_type.trim().is_empty() {
            return Err(Error::validation(format!(
                "envelope {} has an empty message type",
                self.id
            )));
        }
        if self.status == EnvelopeStatus::Scheduled {
            match self.scheduled_time {
                None => {
                    return Err(Error::validation(format!(
                        "scheduled envelope {} has no scheduled time",
                        self.id
                    )))
                }
                Some(time) if time <= now => {
                    return Err(Error::validation(format!(
                        "scheduled envelope {} is not scheduled in the future",
                        self.id
                    )))
                }
                Some(_) => {}
            }
            if !self.owner_id.is_any_node() {
                return Err(Error::validation(format!(
                    "scheduled envelope {} must not be owned before it is claimed",
                    self.id
                )));
            }
        }
        Ok(())
    }
}
