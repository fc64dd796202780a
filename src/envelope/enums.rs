//! Core enumerations for envelopes and endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::NodeId;

/// Where an envelope sits in its durable lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Incoming,
    Outgoing,
    Scheduled,
    Handled,
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeStatus::Incoming => "incoming",
            EnvelopeStatus::Outgoing => "outgoing",
            EnvelopeStatus::Scheduled => "scheduled",
            EnvelopeStatus::Handled => "handled",
        };
        f.write_str(name)
    }
}

/// Advisory ownership tag on a persisted envelope.
///
/// `AnyNode` marks an envelope that is free to be claimed by whichever node
/// gets there first. The only place the two variants are compared is the
/// store's conditional claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OwnerId {
    #[default]
    AnyNode,
    Node(NodeId),
}

impl OwnerId {
    pub fn is_any_node(&self) -> bool {
        matches!(self, OwnerId::AnyNode)
    }

    pub fn is_node(&self, node: &NodeId) -> bool {
        matches!(self, OwnerId::Node(owner) if owner == node)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerId::AnyNode => f.write_str("any-node"),
            OwnerId::Node(node) => write!(f, "{}", node),
        }
    }
}

/// Delivery mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointMode {
    /// Execute or send synchronously in the caller's context.
    Inline,
    /// Queue through an in-process channel, nothing persisted.
    #[default]
    BufferedInMemory,
    /// Persist through the envelope store before queueing.
    Durable,
}

/// Whether an endpoint belongs to the application or to the runtime itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    #[default]
    Application,
    System,
}

/// Listening agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListeningStatus {
    #[default]
    Unknown,
    Accepting,
    TooBusy,
    Stopped,
}

impl ListeningStatus {
    pub fn is_accepting(self) -> bool {
        matches!(self, ListeningStatus::Accepting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_id_default_is_any_node() {
        assert!(OwnerId::default().is_any_node());
    }

    #[test]
    fn test_owner_id_node_match() {
        let node = NodeId::generate("receiver");
        let other = NodeId::generate("receiver");
        let owner = OwnerId::Node(node.clone());
        assert!(owner.is_node(&node));
        assert!(!owner.is_node(&other));
        assert!(!owner.is_any_node());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&EnvelopeStatus::Scheduled).unwrap();
        assert_eq!(json, "\"scheduled\"");
        let mode: EndpointMode = serde_json::from_str("\"buffered_in_memory\"").unwrap();
        assert_eq!(mode, EndpointMode::BufferedInMemory);
    }
}
