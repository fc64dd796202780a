//! Envelope store contract.
//!
//! The store is the durable inbox/outbox: incoming, scheduled and handled
//! envelopes live in one table, outgoing envelopes in another, terminal
//! failures in a dead-letter table and node liveness in a heartbeat table.
//!
//! Mutations that must commit together with application state go through a
//! [`StoreSession`]: stage the writes between `begin` and `commit`, enlist
//! application changes with `on_commit`, and either everything becomes
//! visible or nothing does.
//!
//! Every operation fails with [`Error::Persistence`](crate::types::Error) on
//! connectivity loss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, OwnerId};
use crate::types::{EnvelopeId, NodeId, Result};

mod inmemory;

pub use inmemory::InMemoryEnvelopeStore;

/// Application or runtime side effect enlisted in a session.
pub type SessionHook = Box<dyn FnOnce() + Send + 'static>;

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCounts {
    pub incoming: usize,
    pub outgoing: usize,
    pub scheduled: usize,
    pub handled: usize,
    pub dead_letter: usize,
}

/// What a committed session changed beyond its staged inserts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Handled rows removed by staged `delete_expired_handled` calls.
    pub expired_deleted: usize,
}

/// Terminally failed envelope kept for operator replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub envelope: Envelope,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

// =============================================================================
// Store
// =============================================================================

/// Durable envelope storage.
#[async_trait]
pub trait EnvelopeStore: Send + Sync + std::fmt::Debug {
    /// Persist an incoming envelope. Fails with `DuplicateEnvelope` when the id exists.
    async fn store_incoming(&self, envelope: &Envelope) -> Result<()>;

    /// Persist an outgoing envelope owned by `owner`.
    async fn store_outgoing(&self, envelope: &Envelope, owner: OwnerId) -> Result<()>;

    /// Persist (or re-persist) an envelope as a scheduled job owned by any node.
    async fn schedule_job(&self, envelope: &Envelope) -> Result<()>;

    /// Mark an incoming envelope as handled, retained until `keep_until`.
    async fn mark_handled(&self, id: EnvelopeId, keep_until: DateTime<Utc>) -> Result<()>;

    /// Record the attempt count of an incoming envelope.
    async fn increment_attempts(&self, id: EnvelopeId, attempts: u32) -> Result<()>;

    async fn delete_incoming(&self, id: EnvelopeId) -> Result<()>;

    async fn delete_outgoing(&self, ids: &[EnvelopeId]) -> Result<()>;

    /// Delete handled envelopes whose retention ended at or before `cutoff`.
    async fn delete_expired_handled(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Remove the envelope from the incoming/outgoing tables and dead-letter it.
    async fn move_to_dead_letter(&self, envelope: &Envelope, error: &str) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>>;

    /// Move a dead-lettered envelope back to the inbox, unowned, attempts reset.
    async fn replay_dead_letter(&self, id: EnvelopeId) -> Result<()>;

    async fn fetch_counts(&self) -> Result<PersistedCounts>;

    /// Every row of the incoming table (admin inspection).
    async fn all_incoming(&self) -> Result<Vec<Envelope>>;

    /// Every row of the outgoing table (admin inspection).
    async fn all_outgoing(&self) -> Result<Vec<Envelope>>;

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Claim an unowned incoming envelope. `false` when another node won.
    async fn claim_incoming(&self, id: EnvelopeId, node: &NodeId) -> Result<bool>;

    /// Claim an unowned outgoing envelope. `false` when another node won.
    async fn claim_outgoing(&self, id: EnvelopeId, node: &NodeId) -> Result<bool>;

    /// Claim a due scheduled envelope, turning it into an owned incoming one.
    async fn claim_scheduled(&self, id: EnvelopeId, node: &NodeId) -> Result<bool>;

    /// Reset ownership of the given envelopes to any node.
    async fn release_ownership(&self, ids: &[EnvelopeId]) -> Result<()>;

    async fn load_scheduled_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Envelope>>;

    async fn load_unowned_incoming(&self, limit: usize) -> Result<Vec<Envelope>>;

    async fn load_unowned_outgoing(&self, limit: usize) -> Result<Vec<Envelope>>;

    async fn record_heartbeat(&self, node: &NodeId, now: DateTime<Utc>) -> Result<()>;

    /// Nodes whose last heartbeat is older than `cutoff`.
    async fn dormant_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeId>>;

    /// Release every envelope owned by `node` and forget its heartbeat.
    async fn reassign_dormant_node(&self, node: &NodeId) -> Result<usize>;

    /// Drop and recreate all tables.
    async fn rebuild(&self) -> Result<()>;

    /// Open a unit-of-work session.
    fn session(&self) -> Box<dyn StoreSession>;
}

// =============================================================================
// Session
// =============================================================================

/// Transactional unit of work over the store.
///
/// Staging any operation before `begin` is an error. Sessions are never shared
/// between concurrent units of work.
#[async_trait]
pub trait StoreSession: Send {
    async fn begin(&mut self) -> Result<()>;

    /// Apply everything staged atomically, then run commit hooks.
    async fn commit(&mut self) -> Result<CommitSummary>;

    /// Discard everything staged, then run rollback hooks.
    async fn rollback(&mut self) -> Result<()>;

    fn is_active(&self) -> bool;

    fn on_commit(&mut self, hook: SessionHook) -> Result<()>;

    fn on_rollback(&mut self, hook: SessionHook) -> Result<()>;

    async fn store_incoming(&mut self, envelope: Envelope) -> Result<()>;

    async fn store_outgoing(&mut self, envelope: Envelope, owner: OwnerId) -> Result<()>;

    async fn schedule_job(&mut self, envelope: Envelope) -> Result<()>;

    async fn mark_handled(&mut self, id: EnvelopeId, keep_until: DateTime<Utc>) -> Result<()>;

    async fn delete_expired_handled(&mut self, cutoff: DateTime<Utc>) -> Result<()>;
}
