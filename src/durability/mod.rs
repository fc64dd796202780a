//! Durability agent.
//!
//! Background reconciliation of the envelope store, one agent per node:
//! - **Recovery** (`recovery_interval`): heartbeat, dormant node
//!   reassignment, then recovery of unowned incoming and outgoing envelopes
//! - **Scheduled dispatch** (`scheduled_job_polling_interval`): releases due
//!   scheduled envelopes
//! - **Expiration** (`expiration_interval`): deletes handled envelopes past
//!   their retention in one transaction
//!
//! Every action retries transient store failures with exponential backoff.
//! When retries run out the error is logged and the loop carries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::envelope::Envelope;
use crate::persistence::EnvelopeStore;
use crate::types::{DurabilityConfig, NodeId, Result};

mod actions;
mod backoff;

pub use actions::{
    DeleteExpiredHandledEnvelopes, MessagingAction, NodeReassignment, RecoverIncoming,
    RecoverOutgoing, RunScheduledJobs,
};
pub use backoff::run_with_backoff;

/// The node-side surface recovered envelopes are handed to.
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    fn node_id(&self) -> &NodeId;

    /// Whether incoming envelopes for `uri` are recovered by this node.
    fn in_durable_scope(&self, uri: &Url) -> bool;

    /// Whether the local listener for `uri` accepts work right now.
    fn is_accepting(&self, uri: &Url) -> bool;

    /// Whether an outgoing envelope to `uri` can be sent from this node.
    fn has_transport_for(&self, uri: &Url) -> bool;

    /// Whether `uri` is a durable local queue, whose envelopes are handled
    /// straight from their incoming row.
    fn is_local_durable(&self, uri: &Url) -> bool;

    /// Queue a claimed incoming envelope for its local handlers.
    async fn enqueue_incoming(&self, envelope: Envelope) -> Result<()>;

    /// Queue a claimed outgoing envelope on its sending agent.
    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<()>;

    /// Send a released scheduled envelope to its destination.
    async fn dispatch_scheduled(&self, envelope: Envelope) -> Result<()>;
}

/// Statistics from one full reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub reassigned: usize,
    pub incoming_recovered: usize,
    pub outgoing_recovered: usize,
    pub scheduled_released: usize,
    pub expired_deleted: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Runs the reconciliation loops of one node.
pub struct DurabilityAgent {
    store: Arc<dyn EnvelopeStore>,
    target: Arc<dyn RecoveryTarget>,
    config: DurabilityConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DurabilityAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurabilityAgent")
            .field("node", self.target.node_id())
            .field("config", &self.config)
            .finish()
    }
}

impl DurabilityAgent {
    pub fn new(
        store: Arc<dyn EnvelopeStore>,
        target: Arc<dyn RecoveryTarget>,
        config: DurabilityConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            target,
            config,
            cancel,
        })
    }

    fn reassignment(&self) -> NodeReassignment {
        NodeReassignment {
            liveness_window: self.config.node_liveness_window,
        }
    }

    /// Run one action with backoff. Exhausted retries are logged, not returned.
    pub async fn run_action(&self, action: &dyn MessagingAction) -> usize {
        let outcome = run_with_backoff(&self.config.backoff, &self.cancel, action.name(), || {
            action.execute(
                self.store.as_ref(),
                self.target.as_ref(),
                &self.cancel,
                Utc::now(),
            )
        })
        .await;
        match outcome {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(
                    "durability_action_failed: action={}, error={}",
                    action.name(),
                    e
                );
                0
            }
        }
    }

    /// Run every action once, in loop order.
    pub async fn execute_now(&self) -> RecoveryStats {
        let batch_size = self.config.recovery_batch_size;
        let mut stats = RecoveryStats {
            reassigned: self.run_action(&self.reassignment()).await,
            incoming_recovered: self.run_action(&RecoverIncoming { batch_size }).await,
            outgoing_recovered: self.run_action(&RecoverOutgoing { batch_size }).await,
            scheduled_released: self.run_action(&RunScheduledJobs { batch_size }).await,
            expired_deleted: self.run_action(&DeleteExpiredHandledEnvelopes).await,
            completed_at: None,
        };
        stats.completed_at = Some(Utc::now());
        stats
    }

    /// Start the three loops in the background.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let batch_size = self.config.recovery_batch_size;

        let recovery = self.spawn_loop(
            "recovery",
            self.config.recovery_interval,
            vec![
                Box::new(self.reassignment()),
                Box::new(RecoverIncoming { batch_size }),
                Box::new(RecoverOutgoing { batch_size }),
            ],
        );
        let scheduled = self.spawn_loop(
            "scheduled_jobs",
            self.config.scheduled_job_polling_interval,
            vec![Box::new(RunScheduledJobs { batch_size })],
        );
        let expiration = self.spawn_loop(
            "expiration",
            self.config.expiration_interval,
            vec![Box::new(DeleteExpiredHandledEnvelopes)],
        );

        tracing::info!("durability_agent_started: node={}", self.target.node_id());
        vec![recovery, scheduled, expiration]
    }

    fn spawn_loop(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        actions: Vec<Box<dyn MessagingAction>>,
    ) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for action in &actions {
                            agent.run_action(action.as_ref()).await;
                        }
                    }
                    _ = agent.cancel.cancelled() => {
                        tracing::debug!("durability_loop_stopped: loop={}", name);
                        break;
                    }
                }
            }
        })
    }
}
