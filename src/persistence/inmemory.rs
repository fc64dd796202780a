//! In-memory envelope store.
//!
//! Same atomicity semantics as a relational backend: a session commit is
//! applied to a copy of the tables and swapped in only when every staged
//! operation succeeds. Cloning the store shares the tables, which is how a
//! restarted runtime sees what the previous one persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    CommitSummary, DeadLetterEntry, EnvelopeStore, PersistedCounts, SessionHook, StoreSession,
};
use crate::envelope::{Envelope, EnvelopeStatus, OwnerId};
use crate::types::{EnvelopeId, Error, NodeId, Result};

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone)]
struct Row {
    seq: u64,
    envelope: Envelope,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    sequence: u64,
    incoming: HashMap<EnvelopeId, Row>,
    outgoing: HashMap<EnvelopeId, Row>,
    dead_letters: Vec<DeadLetterEntry>,
    heartbeats: HashMap<NodeId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: Tables,
    failures_remaining: usize,
}

impl StoreState {
    /// Consume one injected failure, if any are pending.
    fn check_available(&mut self) -> Result<()> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(Error::persistence("envelope store unavailable"));
        }
        Ok(())
    }
}

/// Conditional ownership transfer. The single place `AnyNode` is compared.
fn claim(owner: &mut OwnerId, node: &NodeId) -> bool {
    if owner.is_any_node() {
        *owner = OwnerId::Node(node.clone());
        true
    } else {
        false
    }
}

fn ordered<'a>(rows: impl Iterator<Item = &'a Row>, limit: usize) -> Vec<Envelope> {
    let mut rows: Vec<&Row> = rows.collect();
    rows.sort_by_key(|row| row.seq);
    rows.into_iter()
        .take(limit)
        .map(|row| row.envelope.clone())
        .collect()
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn insert_incoming(&mut self, envelope: &Envelope) -> Result<()> {
        if envelope.message_type.trim().is_empty() {
            return Err(Error::validation("cannot persist an envelope without a message type"));
        }
        if self.incoming.contains_key(&envelope.id) {
            return Err(Error::duplicate_envelope(envelope.id));
        }
        let mut stored = envelope.clone();
        stored.status = EnvelopeStatus::Incoming;
        let seq = self.next_seq();
        self.incoming.insert(stored.id, Row { seq, envelope: stored });
        Ok(())
    }

    fn insert_outgoing(&mut self, envelope: &Envelope, owner: OwnerId) -> Result<()> {
        if envelope.destination.is_none() {
            return Err(Error::validation(format!(
                "outgoing envelope {} has no destination",
                envelope.id
            )));
        }
        let mut stored = envelope.clone();
        stored.status = EnvelopeStatus::Outgoing;
        stored.owner_id = owner;
        let seq = self.next_seq();
        self.outgoing.insert(stored.id, Row { seq, envelope: stored });
        Ok(())
    }

    fn upsert_scheduled(&mut self, envelope: &Envelope) -> Result<()> {
        if envelope.scheduled_time.is_none() {
            return Err(Error::validation(format!(
                "scheduled envelope {} has no scheduled time",
                envelope.id
            )));
        }
        let mut stored = envelope.clone();
        stored.status = EnvelopeStatus::Scheduled;
        stored.owner_id = OwnerId::AnyNode;
        self.outgoing.remove(&stored.id);
        let seq = match self.incoming.get(&stored.id) {
            Some(row) => row.seq,
            None => self.next_seq(),
        };
        self.incoming.insert(stored.id, Row { seq, envelope: stored });
        Ok(())
    }

    fn mark_handled(&mut self, id: EnvelopeId, keep_until: DateTime<Utc>) -> Result<()> {
        let row = self
            .incoming
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("incoming envelope {}", id)))?;
        row.envelope.status = EnvelopeStatus::Handled;
        row.envelope.keep_until = Some(keep_until);
        Ok(())
    }

    fn delete_expired_handled(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.incoming.len();
        self.incoming.retain(|_, row| {
            !(row.envelope.status == EnvelopeStatus::Handled
                && matches!(row.envelope.keep_until, Some(keep) if keep <= cutoff))
        });
        before - self.incoming.len()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Envelope store backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEnvelopeStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` store operations (including session commits)
    /// with a persistence error.
    pub async fn inject_failures(&self, count: usize) {
        self.state.lock().await.failures_remaining = count;
    }
}

#[async_trait]
impl EnvelopeStore for InMemoryEnvelopeStore {
    async fn store_incoming(&self, envelope: &Envelope) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables.insert_incoming(envelope)
    }

    async fn store_outgoing(&self, envelope: &Envelope, owner: OwnerId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables.insert_outgoing(envelope, owner)
    }

    async fn schedule_job(&self, envelope: &Envelope) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables.upsert_scheduled(envelope)
    }

    async fn mark_handled(&self, id: EnvelopeId, keep_until: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables.mark_handled(id, keep_until)
    }

    async fn increment_attempts(&self, id: EnvelopeId, attempts: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if let Some(row) = state.tables.incoming.get_mut(&id) {
            row.envelope.attempts = attempts;
        }
        Ok(())
    }

    async fn delete_incoming(&self, id: EnvelopeId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables.incoming.remove(&id);
        Ok(())
    }

    async fn delete_outgoing(&self, ids: &[EnvelopeId]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        for id in ids {
            state.tables.outgoing.remove(id);
        }
        Ok(())
    }

    async fn delete_expired_handled(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(state.tables.delete_expired_handled(cutoff))
    }

    async fn move_to_dead_letter(&self, envelope: &Envelope, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables.incoming.remove(&envelope.id);
        state.tables.outgoing.remove(&envelope.id);
        state.tables.dead_letters.push(DeadLetterEntry {
            envelope: envelope.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(state.tables.dead_letters.clone())
    }

    async fn replay_dead_letter(&self, id: EnvelopeId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let position = state
            .tables
            .dead_letters
            .iter()
            .position(|entry| entry.envelope.id == id)
            .ok_or_else(|| Error::not_found(format!("dead letter {}", id)))?;
        let entry = state.tables.dead_letters.remove(position);

        let mut envelope = entry.envelope;
        envelope.status = EnvelopeStatus::Incoming;
        envelope.owner_id = OwnerId::AnyNode;
        envelope.attempts = 0;
        let seq = state.tables.next_seq();
        state.tables.incoming.insert(envelope.id, Row { seq, envelope });

        tracing::info!("dead_letter_replayed: id={}", id);
        Ok(())
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let tables = &state.tables;
        let mut counts = PersistedCounts {
            outgoing: tables.outgoing.len(),
            dead_letter: tables.dead_letters.len(),
            ..Default::default()
        };
        for row in tables.incoming.values() {
            match row.envelope.status {
                EnvelopeStatus::Incoming => counts.incoming += 1,
                EnvelopeStatus::Scheduled => counts.scheduled += 1,
                EnvelopeStatus::Handled => counts.handled += 1,
                EnvelopeStatus::Outgoing => {}
            }
        }
        Ok(counts)
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(ordered(state.tables.incoming.values(), usize::MAX))
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(ordered(state.tables.outgoing.values(), usize::MAX))
    }

    async fn claim_incoming(&self, id: EnvelopeId, node: &NodeId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(match state.tables.incoming.get_mut(&id) {
            Some(row) if row.envelope.status == EnvelopeStatus::Incoming => {
                claim(&mut row.envelope.owner_id, node)
            }
            _ => false,
        })
    }

    async fn claim_outgoing(&self, id: EnvelopeId, node: &NodeId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(match state.tables.outgoing.get_mut(&id) {
            Some(row) => claim(&mut row.envelope.owner_id, node),
            None => false,
        })
    }

    async fn claim_scheduled(&self, id: EnvelopeId, node: &NodeId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(match state.tables.incoming.get_mut(&id) {
            Some(row) if row.envelope.status == EnvelopeStatus::Scheduled => {
                let claimed = claim(&mut row.envelope.owner_id, node);
                if claimed {
                    row.envelope.status = EnvelopeStatus::Incoming;
                }
                claimed
            }
            _ => false,
        })
    }

    async fn release_ownership(&self, ids: &[EnvelopeId]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        for id in ids {
            if let Some(row) = state.tables.incoming.get_mut(id) {
                row.envelope.owner_id = OwnerId::AnyNode;
            }
            if let Some(row) = state.tables.outgoing.get_mut(id) {
                row.envelope.owner_id = OwnerId::AnyNode;
            }
        }
        Ok(())
    }

    async fn load_scheduled_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Envelope>> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(ordered(
            state.tables.incoming.values().filter(|row| {
                row.envelope.status == EnvelopeStatus::Scheduled
                    && matches!(row.envelope.scheduled_time, Some(time) if time <= now)
            }),
            limit,
        ))
    }

    async fn load_unowned_incoming(&self, limit: usize) -> Result<Vec<Envelope>> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(ordered(
            state.tables.incoming.values().filter(|row| {
                row.envelope.status == EnvelopeStatus::Incoming
                    && row.envelope.owner_id.is_any_node()
            }),
            limit,
        ))
    }

    async fn load_unowned_outgoing(&self, limit: usize) -> Result<Vec<Envelope>> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(ordered(
            state
                .tables
                .outgoing
                .values()
                .filter(|row| row.envelope.owner_id.is_any_node()),
            limit,
        ))
    }

    async fn record_heartbeat(&self, node: &NodeId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables.heartbeats.insert(node.clone(), now);
        Ok(())
    }

    async fn dormant_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeId>> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut nodes: Vec<NodeId> = state
            .tables
            .heartbeats
            .iter()
            .filter(|(_, seen)| **seen < cutoff)
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    async fn reassign_dormant_node(&self, node: &NodeId) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut released = 0;
        let tables = &mut state.tables;
        for row in tables.incoming.values_mut().chain(tables.outgoing.values_mut()) {
            if row.envelope.owner_id.is_node(node) {
                row.envelope.owner_id = OwnerId::AnyNode;
                released += 1;
            }
        }
        tables.heartbeats.remove(node);
        Ok(released)
    }

    async fn rebuild(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tables = Tables::default();
        tracing::info!("envelope_store_rebuilt");
        Ok(())
    }

    fn session(&self) -> Box<dyn StoreSession> {
        Box::new(InMemorySession {
            state: self.state.clone(),
            active: false,
            staged: Vec::new(),
            commit_hooks: Vec::new(),
            rollback_hooks: Vec::new(),
        })
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug)]
enum StagedOp {
    StoreIncoming(Envelope),
    StoreOutgoing(Envelope, OwnerId),
    ScheduleJob(Envelope),
    MarkHandled(EnvelopeId, DateTime<Utc>),
    DeleteExpiredHandled(DateTime<Utc>),
}

struct InMemorySession {
    state: Arc<Mutex<StoreState>>,
    active: bool,
    staged: Vec<StagedOp>,
    commit_hooks: Vec<SessionHook>,
    rollback_hooks: Vec<SessionHook>,
}

impl std::fmt::Debug for InMemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySession")
            .field("active", &self.active)
            .field("staged", &self.staged.len())
            .finish()
    }
}

impl InMemorySession {
    fn stage(&mut self, op: StagedOp) -> Result<()> {
        if !self.active {
            return Err(Error::persistence("session has not begun"));
        }
        self.staged.push(op);
        Ok(())
    }

    fn finish(&mut self) -> Vec<SessionHook> {
        self.active = false;
        self.staged.clear();
        self.rollback_hooks.clear();
        std::mem::take(&mut self.commit_hooks)
    }

    fn abandon(&mut self) -> Vec<SessionHook> {
        self.active = false;
        self.staged.clear();
        self.commit_hooks.clear();
        std::mem::take(&mut self.rollback_hooks)
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn begin(&mut self) -> Result<()> {
        if self.active {
            return Err(Error::persistence("session already begun"));
        }
        self.active = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<CommitSummary> {
        if !self.active {
            return Err(Error::persistence("session has not begun"));
        }

        let applied = {
            let mut state = self.state.lock().await;
            match state.check_available() {
                Err(e) => Err(e),
                Ok(()) => {
                    let mut tables = state.tables.clone();
                    let mut summary = CommitSummary::default();
                    let result = self.staged.iter().try_for_each(|op| match op {
                        StagedOp::StoreIncoming(envelope) => tables.insert_incoming(envelope),
                        StagedOp::StoreOutgoing(envelope, owner) => {
                            tables.insert_outgoing(envelope, owner.clone())
                        }
                        StagedOp::ScheduleJob(envelope) => tables.upsert_scheduled(envelope),
                        StagedOp::MarkHandled(id, keep_until) => tables.mark_handled(*id, *keep_until),
                        StagedOp::DeleteExpiredHandled(cutoff) => {
                            summary.expired_deleted += tables.delete_expired_handled(*cutoff);
                            Ok(())
                        }
                    });
                    if result.is_ok() {
                        state.tables = tables;
                    }
                    result.map(|()| summary)
                }
            }
        };

        match applied {
            Ok(summary) => {
                for hook in self.finish() {
                    hook();
                }
                Ok(summary)
            }
            Err(e) => {
                for hook in self.abandon() {
                    hook();
                }
                Err(e)
            }
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        for hook in self.abandon() {
            hook();
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn on_commit(&mut self, hook: SessionHook) -> Result<()> {
        if !self.active {
            return Err(Error::persistence("session has not begun"));
        }
        self.commit_hooks.push(hook);
        Ok(())
    }

    fn on_rollback(&mut self, hook: SessionHook) -> Result<()> {
        if !self.active {
            return Err(Error::persistence("session has not begun"));
        }
        self.rollback_hooks.push(hook);
        Ok(())
    }

    async fn store_incoming(&mut self, envelope: Envelope) -> Result<()> {
        self.stage(StagedOp::StoreIncoming(envelope))
    }

    async fn store_outgoing(&mut self, envelope: Envelope, owner: OwnerId) -> Result<()> {
        self.stage(StagedOp::StoreOutgoing(envelope, owner))
    }

    async fn schedule_job(&mut self, envelope: Envelope) -> Result<()> {
        self.stage(StagedOp::ScheduleJob(envelope))
    }

    async fn mark_handled(&mut self, id: EnvelopeId, keep_until: DateTime<Utc>) -> Result<()> {
        self.stage(StagedOp::MarkHandled(id, keep_until))
    }

    async fn delete_expired_handled(&mut self, cutoff: DateTime<Utc>) -> Result<()> {
        self.stage(StagedOp::DeleteExpiredHandled(cutoff))
    }
}
