//! Sending agent: one per outbound endpoint.
//!
//! Drains its queue in batches of up to `sending_batch_size`, sending in
//! submission order. Durable outgoing rows are deleted once their batch is
//! sent. A failed send goes through the endpoint's failure rules (by default
//! requeue up to 3 attempts, then dead-letter). After `failures_before_latch`
//! consecutive failures the agent latches and pings the sender every
//! `ping_interval` until it answers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::Sender;
use crate::continuation::{
    classify, ContinuationRuntime, EnvelopeLifecycle, FailureRuleCollection,
};
use crate::envelope::{EndpointMode, Envelope};
use crate::persistence::EnvelopeStore;
use crate::routing::Endpoint;
use crate::runtime::MessageLogger;
use crate::types::{EnvelopeId, Error, MessagingConfig, Result};

/// Send attempts before a failing envelope is dead-lettered by default.
const DEFAULT_SEND_ATTEMPTS: u32 = 3;

/// Outbound worker around a transport [`Sender`].
pub struct SendingAgent {
    endpoint: Arc<Endpoint>,
    sender: Arc<dyn Sender>,
    store: Arc<dyn EnvelopeStore>,
    logger: Arc<dyn MessageLogger>,
    config: MessagingConfig,
    failures: FailureRuleCollection,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    /// Unsent remainder of the batch in flight when the run loop stopped.
    stranded: Mutex<VecDeque<Envelope>>,
    queued: AtomicUsize,
    send_attempts: Mutex<HashMap<EnvelopeId, u32>>,
    consecutive_failures: AtomicU32,
    latched: AtomicBool,
    me: Weak<SendingAgent>,
}

impl std::fmt::Debug for SendingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendingAgent")
            .field("destination", &self.endpoint.uri.as_str())
            .field("queued", &self.queued())
            .field("latched", &self.is_latched())
            .finish()
    }
}

impl SendingAgent {
    pub fn new(
        endpoint: Arc<Endpoint>,
        sender: Arc<dyn Sender>,
        store: Arc<dyn EnvelopeStore>,
        logger: Arc<dyn MessageLogger>,
        config: MessagingConfig,
    ) -> Arc<Self> {
        let mut failures = endpoint.failures.clone();
        if failures.is_empty() {
            failures.on_where(|_| true).requeue(DEFAULT_SEND_ATTEMPTS);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            endpoint,
            sender,
            store,
            logger,
            config,
            failures,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            stranded: Mutex::new(VecDeque::new()),
            queued: AtomicUsize::new(0),
            send_attempts: Mutex::new(HashMap::new()),
            consecutive_failures: AtomicU32::new(0),
            latched: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn destination(&self) -> Url {
        self.sender.destination()
    }

    pub fn supports_native_scheduled_send(&self) -> bool {
        self.sender.supports_native_scheduled_send()
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }

    /// Envelopes waiting to be sent.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn is_durable(&self) -> bool {
        self.endpoint.mode == EndpointMode::Durable
    }

    pub fn enqueue(&self, envelope: Envelope) -> Result<()> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.send(envelope).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            Error::cancelled(format!("sending agent {} is closed", self.endpoint.uri))
        })
    }

    /// Send in the caller, bypassing the queue and the failure rules.
    pub async fn send_now(&self, envelope: Envelope) -> Result<()> {
        self.sender.send(envelope.clone()).await?;
        self.logger.sent(&envelope);
        Ok(())
    }

    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let agent = self
            .me
            .upgrade()
            .ok_or_else(|| Error::internal("sending agent dropped before start"))?;
        Ok(tokio::spawn(agent.run(cancel)))
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let batch_size = self.config.sending_batch_size.max(1);
        let mut rx = self.rx.lock().await;
        let mut batch = VecDeque::new();
        tracing::debug!("sending_agent_started: destination={}", self.endpoint.uri);

        loop {
            if batch.is_empty() {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                batch.push_back(first);
            }
            while batch.len() < batch_size {
                match rx.try_recv() {
                    Ok(envelope) => batch.push_back(envelope),
                    Err(_) => break,
                }
            }
            if !self.send_batch(&mut batch, &cancel).await {
                break;
            }
        }

        if !batch.is_empty() {
            self.stranded
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend(batch);
        }
        tracing::debug!("sending_agent_stopped: destination={}", self.endpoint.uri);
    }

    /// Send a batch in order. A retried envelope goes back to the front.
    /// Returns `false` when cancelled mid-batch, leaving the unsent
    /// remainder in `batch`.
    async fn send_batch(&self, batch: &mut VecDeque<Envelope>, cancel: &CancellationToken) -> bool {
        let mut delivered = Vec::new();
        let mut completed = true;

        while let Some(envelope) = batch.pop_front() {
            if self.is_latched() && !self.wait_until_reachable(cancel).await {
                batch.push_front(envelope);
                completed = false;
                break;
            }
            self.queued.fetch_sub(1, Ordering::SeqCst);

            match self.sender.send(envelope.clone()).await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.forget_attempts(envelope.id);
                    self.logger.sent(&envelope);
                    if self.is_durable() {
                        delivered.push(envelope.id);
                    }
                }
                Err(e) => {
                    if let Some(retry) = self.handle_failure(envelope, e).await {
                        self.queued.fetch_add(1, Ordering::SeqCst);
                        batch.push_front(retry);
                    }
                }
            }
        }

        if !delivered.is_empty() {
            if let Err(e) = self.store.delete_outgoing(&delivered).await {
                tracing::error!(
                    "outgoing_delete_failed: destination={}, count={}, error={}",
                    self.endpoint.uri,
                    delivered.len(),
                    e
                );
            }
        }
        completed
    }

    /// Apply the failure rules to a failed send. Returns the envelope when
    /// it should be sent again before anything queued behind it.
    async fn handle_failure(&self, envelope: Envelope, error: Error) -> Option<Envelope> {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let attempts = {
            let mut send_attempts = self
                .send_attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let attempts = send_attempts.entry(envelope.id).or_insert(0);
            *attempts += 1;
            *attempts
        };
        tracing::warn!(
            "send_failed: id={}, destination={}, attempt={}, error={}",
            envelope.id,
            self.endpoint.uri,
            attempts,
            error
        );

        let mut failed = envelope;
        failed.attempts = attempts;
        let kind = classify(&error, &failed, &[&self.failures]);
        let continuation = kind.build(&error.to_string());

        let mut lifecycle = SendingLifecycle {
            agent: self,
            envelope: failed,
            resend: false,
        };
        if let Err(e) = continuation.execute(&mut lifecycle, self, Utc::now()).await {
            tracing::error!(
                "send_continuation_failed: id={}, error={}",
                lifecycle.envelope.id,
                e
            );
        }

        if failures >= self.config.failures_before_latch && !self.latched.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "sending_agent_latched: destination={}, consecutive_failures={}",
                self.endpoint.uri,
                failures
            );
        }
        lifecycle.resend.then_some(lifecycle.envelope)
    }

    /// Ping until the sender answers. `false` when cancelled first.
    async fn wait_until_reachable(&self, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.ping_interval) => {}
            }
            if self.sender.ping().await {
                self.latched.store(false, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                tracing::info!("sending_agent_resumed: destination={}", self.endpoint.uri);
                return true;
            }
            tracing::debug!("sending_agent_ping_failed: destination={}", self.endpoint.uri);
        }
    }

    fn forget_attempts(&self, id: EnvelopeId) {
        self.send_attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    /// Take every envelope still queued, in send order. Waits for the run
    /// loop to stop.
    pub async fn drain(&self) -> Vec<Envelope> {
        let mut rx = self.rx.lock().await;
        let mut drained: Vec<Envelope> = std::mem::take(
            &mut *self
                .stranded
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
        .into();
        self.queued.fetch_sub(drained.len(), Ordering::SeqCst);
        while let Ok(envelope) = rx.try_recv() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            drained.push(envelope);
        }
        drained
    }

    fn requeue_later(&self, envelope: Envelope, delay: Duration) {
        let agent = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(agent) = agent.upgrade() {
                if let Err(e) = agent.enqueue(envelope) {
                    tracing::warn!("delayed_requeue_failed: error={}", e);
                }
            }
        });
    }
}

#[async_trait]
impl ContinuationRuntime for SendingAgent {
    fn message_logger(&self) -> &dyn MessageLogger {
        self.logger.as_ref()
    }

    async fn pause_listener(&self, endpoint: &Url, _pause: Duration) -> Result<()> {
        tracing::debug!("pause_ignored_for_sender: endpoint={}", endpoint);
        Ok(())
    }
}

/// Lifecycle of an envelope whose send failed.
struct SendingLifecycle<'a> {
    agent: &'a SendingAgent,
    envelope: Envelope,
    resend: bool,
}

#[async_trait]
impl EnvelopeLifecycle for SendingLifecycle<'_> {
    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    async fn complete(&mut self) -> Result<()> {
        self.agent.forget_attempts(self.envelope.id);
        if self.agent.is_durable() {
            self.agent.store.delete_outgoing(&[self.envelope.id]).await?;
        }
        Ok(())
    }

    async fn defer(&mut self, delay: Option<Duration>) -> Result<()> {
        match delay {
            Some(delay) => {
                self.agent.requeue_later(self.envelope.clone(), delay);
                Ok(())
            }
            None => {
                self.resend = true;
                Ok(())
            }
        }
    }

    fn retry_execution_now(&mut self) {
        self.resend = true;
    }

    async fn reschedule(&mut self, time: DateTime<Utc>) -> Result<()> {
        self.agent.forget_attempts(self.envelope.id);
        let scheduled = self.envelope.clone().schedule_at(time);
        self.agent.store.schedule_job(&scheduled).await
    }

    async fn move_to_dead_letter(&mut self, error: &str) -> Result<()> {
        self.agent.forget_attempts(self.envelope.id);
        self.agent.store.move_to_dead_letter(&self.envelope, error).await
    }

    async fn send_failure_acknowledgement(&mut self, _message: &str) -> Result<()> {
        Ok(())
    }
}
