//! Core types for the courier runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (EnvelopeId, ConversationId, NodeId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the node, durability and messaging
//! - **Time**: Saturating instant arithmetic

mod config;
mod errors;
mod ids;
mod time;

pub use config::{
    BackoffConfig, Config, DurabilityConfig, MessagingConfig, NodeConfig, ObservabilityConfig,
};
pub use errors::{BoxError, Error, Result};
pub use ids::{ConversationId, EnvelopeId, NodeId};
pub use time::{saturating_add, saturating_sub};
