//! Listening agent: one per inbound endpoint (local queue or transport listener).
//!
//! Receive semantics by endpoint mode:
//! - Inline: execute the handler while the transport message is held
//! - BufferedInMemory: acknowledge the transport, then queue locally
//! - Durable: persist as Incoming, acknowledge, then queue locally
//!
//! Expired envelopes are discarded on arrival. Every execution outcome feeds
//! the optional circuit breaker; a trip pauses the agent.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    CircuitBreaker, ExecutionOutcome, HandlerPipeline, Listener, ListeningAgentControl, Receiver,
    WorkerQueue,
};
use crate::envelope::{EndpointMode, Envelope, EnvelopeStatus, ListeningStatus, OwnerId};
use crate::persistence::EnvelopeStore;
use crate::routing::{BufferingLimits, Endpoint};
use crate::runtime::MessageLogger;
use crate::types::{Error, NodeId, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Collaborators shared by every listening agent of a runtime.
#[derive(Clone)]
pub struct ListeningServices {
    pub node_id: NodeId,
    pub store: Arc<dyn EnvelopeStore>,
    pub logger: Arc<dyn MessageLogger>,
    pub pipeline: Arc<dyn HandlerPipeline>,
    pub cancel: CancellationToken,
}

/// Inbound worker for one endpoint.
pub struct ListeningAgent {
    endpoint: Arc<Endpoint>,
    services: ListeningServices,
    pipeline: Arc<dyn HandlerPipeline>,
    queue: Option<Arc<WorkerQueue>>,
    transport: Mutex<Option<Arc<dyn Listener>>>,
    status: Mutex<ListeningStatus>,
    breaker: Option<CircuitBreaker>,
    me: Weak<ListeningAgent>,
}

impl std::fmt::Debug for ListeningAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningAgent")
            .field("uri", &self.endpoint.uri.as_str())
            .field("mode", &self.endpoint.mode)
            .field("status", &self.status())
            .finish()
    }
}

impl ListeningAgent {
    pub fn new(endpoint: Arc<Endpoint>, services: ListeningServices) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ListeningAgent>| {
            let pipeline: Arc<dyn HandlerPipeline> = Arc::new(MonitoredPipeline {
                inner: services.pipeline.clone(),
                agent: me.clone(),
            });
            let queue = match endpoint.mode {
                EndpointMode::Inline => None,
                _ => Some(WorkerQueue::new(endpoint.clone(), pipeline.clone())),
            };
            Self {
                breaker: endpoint.circuit_breaker.map(CircuitBreaker::new),
                endpoint,
                services,
                pipeline,
                queue,
                transport: Mutex::new(None),
                status: Mutex::new(ListeningStatus::Unknown),
                me: me.clone(),
            }
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Wire the transport listener that delivers to this agent.
    pub fn attach(&self, listener: Arc<dyn Listener>) {
        *lock(&self.transport) = Some(listener);
    }

    fn transport_listener(&self) -> Option<Arc<dyn Listener>> {
        lock(&self.transport).clone()
    }

    fn set_status(&self, status: ListeningStatus) {
        *lock(&self.status) = status;
    }

    /// Start the worker queue and begin receiving.
    pub async fn activate(&self) -> Result<Option<JoinHandle<()>>> {
        let handle = match &self.queue {
            Some(queue) => Some(queue.start(self.services.cancel.clone())?),
            None => None,
        };
        ListeningAgentControl::start(self).await?;
        Ok(handle)
    }

    /// Hand an envelope that is already accounted for (persisted or not
    /// durable) to the handlers of this endpoint.
    pub fn enqueue(&self, envelope: Envelope) -> Result<()> {
        if let Some(queue) = &self.queue {
            return queue.enqueue(envelope);
        }
        let channel = self.transport_listener().ok_or_else(|| {
            Error::configuration(format!(
                "inline endpoint {} has no transport listener",
                self.endpoint.uri
            ))
        })?;
        let pipeline = self.pipeline.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            pipeline.execute(&endpoint, envelope, channel).await;
        });
        Ok(())
    }

    /// Stop receiving for good.
    pub async fn dispose(&self) -> Result<()> {
        self.set_status(ListeningStatus::Stopped);
        if let Some(listener) = self.transport_listener() {
            listener.dispose().await?;
        }
        Ok(())
    }

    /// Envelopes queued but not yet taken by a handler.
    pub async fn drain(&self) -> Vec<Envelope> {
        match &self.queue {
            Some(queue) => queue.drain().await,
            None => Vec::new(),
        }
    }

    async fn record_outcome(&self, outcome: ExecutionOutcome) {
        let Some(breaker) = &self.breaker else {
            return;
        };
        if breaker.record(outcome) {
            if let Err(e) = self.pause(breaker.pause_time()).await {
                tracing::error!("circuit_pause_failed: uri={}, error={}", self.endpoint.uri, e);
            }
        }
    }

    async fn receive_one(&self, listener: &Arc<dyn Listener>, mut envelope: Envelope) -> Result<()> {
        let now = Utc::now();
        envelope.received_at = Some(now);
        if envelope.destination.is_none() {
            envelope.destination = Some(self.endpoint.uri.clone());
        }
        self.services.logger.received(&envelope);

        if envelope.is_expired(now) {
            self.services.logger.discarded(&envelope);
            return listener.complete(&envelope).await;
        }

        match self.endpoint.mode {
            EndpointMode::Inline => {
                self.pipeline
                    .execute(&self.endpoint, envelope, listener.clone())
                    .await;
                Ok(())
            }
            EndpointMode::BufferedInMemory => {
                listener.complete(&envelope).await?;
                self.enqueue(envelope)
            }
            EndpointMode::Durable => {
                envelope.status = EnvelopeStatus::Incoming;
                envelope.owner_id = OwnerId::Node(self.services.node_id.clone());
                match self.services.store.store_incoming(&envelope).await {
                    Ok(()) => {}
                    Err(Error::DuplicateEnvelope(id)) => {
                        tracing::debug!("duplicate_envelope_skipped: id={}", id);
                        return listener.complete(&envelope).await;
                    }
                    Err(e) => return Err(e),
                }
                listener.complete(&envelope).await?;
                self.enqueue(envelope)
            }
        }
    }
}

#[async_trait]
impl Receiver for ListeningAgent {
    async fn received(&self, listener: Arc<dyn Listener>, envelopes: Vec<Envelope>) -> Result<()> {
        for envelope in envelopes {
            self.receive_one(&listener, envelope).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ListeningAgentControl for ListeningAgent {
    fn uri(&self) -> Url {
        self.endpoint.uri.clone()
    }

    fn status(&self) -> ListeningStatus {
        *lock(&self.status)
    }

    fn queue_count(&self) -> usize {
        self.queue.as_ref().map(|q| q.queue_count()).unwrap_or(0)
    }

    fn buffering_limits(&self) -> BufferingLimits {
        self.endpoint.buffering_limits
    }

    async fn mark_as_too_busy_and_stop_receiving(&self) -> Result<()> {
        self.set_status(ListeningStatus::TooBusy);
        if let Some(listener) = self.transport_listener() {
            listener.stop().await?;
        }
        tracing::info!(
            "listener_too_busy: uri={}, queue_count={}",
            self.endpoint.uri,
            self.queue_count()
        );
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue.set_running(true);
        }
        if let Some(listener) = self.transport_listener() {
            listener.start().await?;
        }
        self.set_status(ListeningStatus::Accepting);
        tracing::debug!("listener_accepting: uri={}", self.endpoint.uri);
        Ok(())
    }

    async fn pause(&self, pause: Duration) -> Result<()> {
        self.set_status(ListeningStatus::Stopped);
        if let Some(listener) = self.transport_listener() {
            listener.stop().await?;
        }
        if let Some(queue) = &self.queue {
            queue.set_running(false);
        }
        tracing::warn!(
            "listener_paused: uri={}, pause={:?}",
            self.endpoint.uri,
            pause
        );

        let agent = self.me.clone();
        let cancel = self.services.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(pause) => {
                    if let Some(agent) = agent.upgrade() {
                        if agent.status() == ListeningStatus::Stopped {
                            if let Err(e) = ListeningAgentControl::start(agent.as_ref()).await {
                                tracing::error!("listener_restart_failed: uri={}, error={}", agent.endpoint.uri, e);
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

/// Feeds execution outcomes back to the owning agent.
struct MonitoredPipeline {
    inner: Arc<dyn HandlerPipeline>,
    agent: Weak<ListeningAgent>,
}

#[async_trait]
impl HandlerPipeline for MonitoredPipeline {
    async fn execute(
        &self,
        endpoint: &Arc<Endpoint>,
        envelope: Envelope,
        channel: Arc<dyn Listener>,
    ) -> ExecutionOutcome {
        let outcome = self.inner.execute(endpoint, envelope, channel).await;
        if let Some(agent) = self.agent.upgrade() {
            agent.record_outcome(outcome).await;
        }
        outcome
    }
}
