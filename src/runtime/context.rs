//! Handler-facing message context and the lifecycle of a received envelope.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::Runtime;
use crate::continuation::EnvelopeLifecycle;
use crate::envelope::{EndpointMode, Envelope, EnvelopeStatus, Message, OwnerId};
use crate::persistence::{SessionHook, StoreSession};
use crate::routing::Endpoint;
use crate::transports::Listener;
use crate::types::{saturating_add, Error, Result};

// =============================================================================
// MessageContext
// =============================================================================

/// A message produced by a handler, delivered once the handler succeeds.
#[derive(Debug, Clone)]
pub(crate) enum Cascade {
    /// Routed by message type.
    Routed(Envelope),
    /// Sent to an endpoint name or uri.
    Addressed(String, Envelope),
    /// Response addressed to the reply uri of the handled envelope.
    Response(Envelope),
}

/// Side effects a handler enlisted in its unit of work.
///
/// Exactly one of `commit` or `rollback` runs them.
#[derive(Default)]
pub(crate) struct Enlisted {
    commit: Vec<SessionHook>,
    rollback: Vec<SessionHook>,
}

impl std::fmt::Debug for Enlisted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enlisted")
            .field("commit", &self.commit.len())
            .field("rollback", &self.rollback.len())
            .finish()
    }
}

impl Enlisted {
    pub fn commit(self) {
        for hook in self.commit {
            hook();
        }
    }

    pub fn rollback(self) {
        for hook in self.rollback {
            hook();
        }
    }

    /// Hand every hook to an active session, which then owns running them.
    fn enlist(self, session: &mut dyn StoreSession) -> Result<()> {
        for hook in self.commit {
            session.on_commit(hook)?;
        }
        for hook in self.rollback {
            session.on_rollback(hook)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ContextState {
    envelope: Envelope,
    service_name: String,
    cascades: Mutex<Vec<Cascade>>,
    enlisted: Mutex<Enlisted>,
}

/// What a handler sees of the envelope it is handling.
///
/// Messages published through the context are held until the handler
/// succeeds. On a durable endpoint they commit together with the handled
/// mark, and so do the hooks enlisted with `on_commit` / `on_rollback`:
/// handler state changes registered there are applied or undone with the
/// envelope's unit of work.
#[derive(Debug, Clone)]
pub struct MessageContext {
    state: Arc<ContextState>,
}

impl MessageContext {
    pub fn new(envelope: Envelope, service_name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(ContextState {
                envelope,
                service_name: service_name.into(),
                cascades: Mutex::new(Vec::new()),
                enlisted: Mutex::new(Enlisted::default()),
            }),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.state.envelope
    }

    pub fn service_name(&self) -> &str {
        &self.state.service_name
    }

    fn cascades(&self) -> MutexGuard<'_, Vec<Cascade>> {
        self.state
            .cascades
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a follow-up message, routed by type.
    pub fn publish<M: Message>(&self, message: &M) -> Result<()> {
        let child = self.envelope().cascade(Envelope::for_message(message)?);
        self.cascades().push(Cascade::Routed(child));
        Ok(())
    }

    /// Send a follow-up message to an endpoint name or uri.
    pub fn send_to<M: Message>(&self, address: &str, message: &M) -> Result<()> {
        let child = self.envelope().cascade(Envelope::for_message(message)?);
        self.cascades()
            .push(Cascade::Addressed(address.to_string(), child));
        Ok(())
    }

    /// Publish a follow-up message for delivery at `time`.
    pub fn schedule<M: Message>(&self, message: &M, time: DateTime<Utc>) -> Result<()> {
        let child = self
            .envelope()
            .cascade(Envelope::for_message(message)?)
            .schedule_at(time);
        self.cascades().push(Cascade::Routed(child));
        Ok(())
    }

    /// Reply to the sender of the handled envelope.
    pub fn respond<M: Message>(&self, response: &M) -> Result<()> {
        let envelope = self
            .envelope()
            .create_response(response, self.service_name())?;
        self.cascades().push(Cascade::Response(envelope));
        Ok(())
    }

    fn enlisted(&self) -> MutexGuard<'_, Enlisted> {
        self.state
            .enlisted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `hook` once the handled envelope's unit of work commits.
    pub fn on_commit(&self, hook: impl FnOnce() + Send + 'static) {
        self.enlisted().commit.push(Box::new(hook));
    }

    /// Run `hook` if the handler fails or its unit of work does not commit.
    pub fn on_rollback(&self, hook: impl FnOnce() + Send + 'static) {
        self.enlisted().rollback.push(Box::new(hook));
    }

    pub(crate) fn take_cascades(&self) -> Vec<Cascade> {
        std::mem::take(&mut *self.cascades())
    }

    pub(crate) fn take_enlisted(&self) -> Enlisted {
        std::mem::take(&mut *self.enlisted())
    }
}

/// Where a cascade goes once the handled envelope's session commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staged {
    /// Hand to the endpoint; `persisted` when its durable row was committed.
    Deliver { persisted: bool },
    /// Committed as a scheduled job; the durability agent releases it.
    Scheduled,
}

/// Reply owed to the sender once the handler succeeded without answering.
pub(crate) fn owed_reply(
    envelope: &Envelope,
    cascades: &[Cascade],
    source: &str,
) -> Result<Option<Envelope>> {
    if envelope.reply_uri.is_none() {
        return Ok(None);
    }
    let responded = |message_type: &str| {
        cascades.iter().any(|cascade| {
            matches!(cascade, Cascade::Response(response) if response.message_type == message_type)
        })
    };
    if let Some(expected) = &envelope.reply_requested {
        if !responded(expected) {
            let message = format!("No response was created for expected response '{}'", expected);
            return envelope.failure_acknowledgement(&message, source);
        }
        return Ok(None);
    }
    if envelope.ack_requested {
        return Ok(envelope.acknowledgement(source));
    }
    Ok(None)
}

// =============================================================================
// Receive lifecycle
// =============================================================================

/// Lifecycle of an envelope received on a listening endpoint.
///
/// Completing or deferring goes through `channel`, the transport listener or
/// local queue the envelope came from.
pub(crate) struct ReceiveLifecycle {
    runtime: Runtime,
    endpoint: Arc<Endpoint>,
    channel: Arc<dyn Listener>,
    envelope: Envelope,
    retry_now: bool,
}

impl ReceiveLifecycle {
    pub fn new(
        runtime: Runtime,
        endpoint: Arc<Endpoint>,
        channel: Arc<dyn Listener>,
        envelope: Envelope,
    ) -> Self {
        Self {
            runtime,
            endpoint,
            channel,
            envelope,
            retry_now: false,
        }
    }

    fn is_durable(&self) -> bool {
        self.endpoint.mode == EndpointMode::Durable
    }

    pub fn retry_requested(&self) -> bool {
        self.retry_now
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }

    fn keep_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let keep = self.runtime.config().durability.keep_after_message_handling;
        saturating_add(now, keep)
    }

    /// Finish a successfully handled envelope and release what the handler
    /// produced.
    ///
    /// On a durable endpoint the handled mark, every durable cascade row and
    /// the handler's enlisted hooks commit in one session; nothing is
    /// delivered unless it commits.
    pub async fn complete_with(
        &mut self,
        mut outgoing: Vec<(Arc<Endpoint>, Envelope)>,
        enlisted: Enlisted,
    ) -> Result<()> {
        if !self.is_durable() {
            if let Err(e) = self.channel.complete(&self.envelope).await {
                enlisted.rollback();
                return Err(e);
            }
            enlisted.commit();
            for (endpoint, envelope) in outgoing {
                self.runtime.deliver(&endpoint, envelope, false).await?;
            }
            return Ok(());
        }

        let store = self.runtime.store().clone();
        let mut session = store.session();
        if let Err(e) = session.begin().await {
            enlisted.rollback();
            return Err(e);
        }

        let now = Utc::now();
        let staged = self.stage(session.as_mut(), &mut outgoing, enlisted, now).await;
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                session.rollback().await?;
                return Err(e);
            }
        };
        session.commit().await?;

        self.channel.complete(&self.envelope).await?;
        for ((endpoint, envelope), staged) in outgoing.into_iter().zip(staged) {
            let Staged::Deliver { persisted } = staged else {
                continue;
            };
            let id = envelope.id;
            if let Err(e) = self.runtime.deliver(&endpoint, envelope, persisted).await {
                tracing::error!(
                    "cascade_delivery_failed: parent={}, endpoint={}, error={}",
                    self.envelope.id,
                    endpoint.uri,
                    e
                );
                if persisted {
                    if let Err(e) = store.release_ownership(&[id]).await {
                        tracing::warn!("cascade_release_failed: id={}, error={}", id, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stage the handled mark, the durable cascades and the enlisted hooks.
    async fn stage(
        &self,
        session: &mut dyn StoreSession,
        outgoing: &mut [(Arc<Endpoint>, Envelope)],
        enlisted: Enlisted,
        now: DateTime<Utc>,
    ) -> Result<Vec<Staged>> {
        enlisted.enlist(session)?;
        session
            .mark_handled(self.envelope.id, self.keep_until(now))
            .await?;

        let node = OwnerId::Node(self.runtime.node_id().clone());
        let mut staged = Vec::with_capacity(outgoing.len());
        for (endpoint, envelope) in outgoing.iter_mut() {
            self.runtime.prepare(endpoint, envelope, now);
            if envelope.is_scheduled_for_later(now) {
                session.schedule_job(envelope.clone()).await?;
                staged.push(Staged::Scheduled);
                continue;
            }
            if endpoint.mode != EndpointMode::Durable {
                staged.push(Staged::Deliver { persisted: false });
                continue;
            }
            envelope.owner_id = node.clone();
            if endpoint.is_local() {
                envelope.status = EnvelopeStatus::Incoming;
                session.store_incoming(envelope.clone()).await?;
            } else {
                session.store_outgoing(envelope.clone(), node.clone()).await?;
            }
            staged.push(Staged::Deliver { persisted: true });
        }
        Ok(staged)
    }
}

#[async_trait]
impl EnvelopeLifecycle for ReceiveLifecycle {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    async fn complete(&mut self) -> Result<()> {
        if self.is_durable() {
            match self
                .runtime
                .store()
                .mark_handled(self.envelope.id, self.keep_until(Utc::now()))
                .await
            {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.channel.complete(&self.envelope).await
    }

    async fn defer(&mut self, delay: Option<Duration>) -> Result<()> {
        if self.is_durable() {
            self.runtime
                .store()
                .increment_attempts(self.envelope.id, self.envelope.attempts)
                .await?;
        }
        match delay {
            None => self.channel.defer(self.envelope.clone()).await,
            Some(delay) => {
                let channel = self.channel.clone();
                let envelope = self.envelope.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = channel.defer(envelope).await {
                        tracing::warn!("delayed_requeue_failed: error={}", e);
                    }
                });
                Ok(())
            }
        }
    }

    fn retry_execution_now(&mut self) {
        self.retry_now = true;
    }

    async fn reschedule(&mut self, time: DateTime<Utc>) -> Result<()> {
        let scheduled = self.envelope.clone().schedule_at(time);
        self.runtime.store().schedule_job(&scheduled).await?;
        tracing::debug!(
            "envelope_rescheduled: id={}, at={}",
            self.envelope.id,
            time.to_rfc3339()
        );
        self.channel.complete(&self.envelope).await
    }

    async fn move_to_dead_letter(&mut self, error: &str) -> Result<()> {
        self.runtime
            .store()
            .move_to_dead_letter(&self.envelope, error)
            .await?;
        self.channel.complete(&self.envelope).await
    }

    async fn send_failure_acknowledgement(&mut self, message: &str) -> Result<()> {
        if !self.envelope.expects_reply() {
            return Ok(());
        }
        match self
            .envelope
            .failure_acknowledgement(message, self.runtime.service_name())?
        {
            Some(ack) => self.runtime.send_reply(ack).await,
            None => Ok(()),
        }
    }
}
