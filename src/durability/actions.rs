//! Store reconciliation actions run by the durability agent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::RecoveryTarget;
use crate::envelope::{Envelope, EnvelopeStatus, OwnerId};
use crate::persistence::EnvelopeStore;
use crate::types::{saturating_sub, Error, Result};

/// One reconciliation pass over the envelope store.
#[async_trait]
pub trait MessagingAction: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the action once. Returns the number of envelopes it moved.
    async fn execute(
        &self,
        store: &dyn EnvelopeStore,
        target: &dyn RecoveryTarget,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<usize>;
}

fn owned(mut envelope: Envelope, target: &dyn RecoveryTarget) -> Envelope {
    envelope.owner_id = OwnerId::Node(target.node_id().clone());
    envelope
}

// =============================================================================
// Node liveness
// =============================================================================

/// Record this node's heartbeat and release envelopes held by dormant nodes.
#[derive(Debug, Clone, Copy)]
pub struct NodeReassignment {
    pub liveness_window: std::time::Duration,
}

#[async_trait]
impl MessagingAction for NodeReassignment {
    fn name(&self) -> &'static str {
        "node_reassignment"
    }

    async fn execute(
        &self,
        store: &dyn EnvelopeStore,
        target: &dyn RecoveryTarget,
        _cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        store.record_heartbeat(target.node_id(), now).await?;

        let cutoff = saturating_sub(now, self.liveness_window);
        let mut released = 0;
        for node in store.dormant_nodes(cutoff).await? {
            if &node == target.node_id() {
                continue;
            }
            let count = store.reassign_dormant_node(&node).await?;
            tracing::info!("dormant_node_reassigned: node={}, envelopes={}", node, count);
            released += count;
        }
        Ok(released)
    }
}

// =============================================================================
// Incoming / outgoing recovery
// =============================================================================

/// Claim unowned incoming envelopes and hand them to local worker queues.
#[derive(Debug, Clone, Copy)]
pub struct RecoverIncoming {
    pub batch_size: usize,
}

#[async_trait]
impl MessagingAction for RecoverIncoming {
    fn name(&self) -> &'static str {
        "recover_incoming"
    }

    async fn execute(
        &self,
        store: &dyn EnvelopeStore,
        target: &dyn RecoveryTarget,
        cancel: &CancellationToken,
        _now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut recovered = 0;
        for envelope in store.load_unowned_incoming(self.batch_size).await? {
            if cancel.is_cancelled() {
                break;
            }
            let Some(destination) = envelope.destination.clone() else {
                continue;
            };
            if !target.in_durable_scope(&destination) || !target.is_accepting(&destination) {
                continue;
            }
            if !store.claim_incoming(envelope.id, target.node_id()).await? {
                continue;
            }

            let id = envelope.id;
            if cancel.is_cancelled() {
                store.release_ownership(&[id]).await?;
                break;
            }
            match target.enqueue_incoming(owned(envelope, target)).await {
                Ok(()) => recovered += 1,
                Err(e) => {
                    tracing::warn!("incoming_recovery_failed: id={}, error={}", id, e);
                    store.release_ownership(&[id]).await?;
                }
            }
        }
        if recovered > 0 {
            tracing::info!("incoming_recovered: count={}", recovered);
        }
        Ok(recovered)
    }
}

/// Claim unowned outgoing envelopes and hand them to sending agents.
#[derive(Debug, Clone, Copy)]
pub struct RecoverOutgoing {
    pub batch_size: usize,
}

#[async_trait]
impl MessagingAction for RecoverOutgoing {
    fn name(&self) -> &'static str {
        "recover_outgoing"
    }

    async fn execute(
        &self,
        store: &dyn EnvelopeStore,
        target: &dyn RecoveryTarget,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut recovered = 0;
        for envelope in store.load_unowned_outgoing(self.batch_size).await? {
            if cancel.is_cancelled() {
                break;
            }
            if !store.claim_outgoing(envelope.id, target.node_id()).await? {
                continue;
            }
            let id = envelope.id;

            if envelope.is_expired(now) {
                store.delete_outgoing(&[id]).await?;
                tracing::info!("expired_outgoing_deleted: id={}", id);
                continue;
            }
            let known = envelope
                .destination
                .as_ref()
                .is_some_and(|destination| target.has_transport_for(destination));
            if !known {
                let error = format!(
                    "No transport is registered for destination {}",
                    envelope
                        .destination
                        .as_ref()
                        .map(|d| d.as_str())
                        .unwrap_or("-")
                );
                store.move_to_dead_letter(&envelope, &error).await?;
                tracing::warn!("outgoing_dead_lettered: id={}, reason={}", id, error);
                continue;
            }

            if cancel.is_cancelled() {
                store.release_ownership(&[id]).await?;
                break;
            }
            match target.enqueue_outgoing(owned(envelope, target)).await {
                Ok(()) => recovered += 1,
                Err(e) => {
                    tracing::warn!("outgoing_recovery_failed: id={}, error={}", id, e);
                    store.release_ownership(&[id]).await?;
                }
            }
        }
        if recovered > 0 {
            tracing::info!("outgoing_recovered: count={}", recovered);
        }
        Ok(recovered)
    }
}

// =============================================================================
// Scheduled jobs
// =============================================================================

/// Claim due scheduled envelopes and release them for delivery.
#[derive(Debug, Clone, Copy)]
pub struct RunScheduledJobs {
    pub batch_size: usize,
}

#[async_trait]
impl MessagingAction for RunScheduledJobs {
    fn name(&self) -> &'static str {
        "run_scheduled_jobs"
    }

    async fn execute(
        &self,
        store: &dyn EnvelopeStore,
        target: &dyn RecoveryTarget,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut released = 0;
        for envelope in store.load_scheduled_due(now, self.batch_size).await? {
            if cancel.is_cancelled() {
                break;
            }
            if !store.claim_scheduled(envelope.id, target.node_id()).await? {
                continue;
            }
            let id = envelope.id;
            let original = envelope.clone();

            let mut envelope = owned(envelope, target);
            envelope.status = EnvelopeStatus::Incoming;
            envelope.scheduled_time = None;

            let stays_incoming = envelope
                .destination
                .as_ref()
                .is_some_and(|destination| target.is_local_durable(destination));
            if stays_incoming {
                // The claimed row becomes the durable incoming row.
                match target.enqueue_incoming(envelope).await {
                    Ok(()) => released += 1,
                    Err(e) => {
                        store.release_ownership(&[id]).await?;
                        if matches!(e, Error::Cancelled(_)) {
                            break;
                        }
                        tracing::error!("scheduled_dispatch_failed: id={}, error={}", id, e);
                    }
                }
                continue;
            }

            envelope.status = EnvelopeStatus::Outgoing;
            envelope.owner_id = OwnerId::AnyNode;
            match target.dispatch_scheduled(envelope).await {
                Ok(()) => {
                    store.delete_incoming(id).await?;
                    released += 1;
                }
                Err(e) => {
                    store.schedule_job(&original).await?;
                    if matches!(e, Error::Cancelled(_)) {
                        break;
                    }
                    tracing::error!("scheduled_dispatch_failed: id={}, error={}", id, e);
                }
            }
        }
        if released > 0 {
            tracing::debug!("scheduled_jobs_released: count={}", released);
        }
        Ok(released)
    }
}

// =============================================================================
// Expiration
// =============================================================================

/// Delete handled envelopes past their retention, in one transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteExpiredHandledEnvelopes;

#[async_trait]
impl MessagingAction for DeleteExpiredHandledEnvelopes {
    fn name(&self) -> &'static str {
        "delete_expired_handled"
    }

    async fn execute(
        &self,
        store: &dyn EnvelopeStore,
        _target: &dyn RecoveryTarget,
        _cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut session = store.session();
        session.begin().await?;
        if let Err(e) = session.delete_expired_handled(now).await {
            session.rollback().await?;
            return Err(e);
        }
        let deleted = match session.commit().await {
            Ok(summary) => summary.expired_deleted,
            Err(e) => {
                if session.is_active() {
                    session.rollback().await?;
                }
                return Err(e);
            }
        };

        if deleted > 0 {
            tracing::debug!("expired_envelopes_deleted: count={}", deleted);
        }
        Ok(deleted)
    }
}
