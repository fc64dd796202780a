//! # Courier Core - message bus runtime
//!
//! Durable envelope lifecycle, routing, error continuations and
//! request/reply for services that exchange messages:
//! - Transactional inbox/outbox over a pluggable envelope store
//! - Routing by static rules, conventions or explicit address
//! - Inline, buffered and durable endpoints with back pressure and
//!   circuit breaking
//! - Failure rules mapping handler errors to retry, requeue, reschedule,
//!   dead-letter or discard
//! - A durability agent that recovers envelopes of dormant nodes
//!
//! ## Architecture
//!
//! ```text
//!   publish / send / request
//!            │
//!            ▼
//!   ┌──────────────┐  resolve   ┌────────────┐
//!   │   Runtime    │──────────▶ │   Router   │
//!   └──────┬───────┘            └────────────┘
//!          │ deliver
//!          ▼
//!   SendingAgent ──▶ Transport ──▶ Listener ──▶ ListeningAgent
//!                                                   │
//!                                   handler pipeline ▼ continuation
//!                                            EnvelopeStore ◀── DurabilityAgent
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod continuation;
pub mod durability;
pub mod envelope;
pub mod persistence;
pub mod routing;
pub mod runtime;
pub mod transports;
pub mod types;

// Internal utilities
pub mod observability;

pub use envelope::{Envelope, Message};
pub use runtime::{BusBuilder, MessageContext, Runtime};
pub use types::{Config, Error, Result};
