//! Message bus runtime.
//!
//! A [`Runtime`] ties the pieces together for one node:
//! - routing of published and sent messages to endpoints
//! - one [`ListeningAgent`] per listening endpoint, one [`SendingAgent`]
//!   per outbound endpoint, created on first use
//! - the handler pipeline and the continuation engine behind it
//! - request/reply correlation
//! - the back-pressure and durability background loops
//!
//! Built with [`BusBuilder`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::continuation::{ContinuationRuntime, FailureRuleCollection};
use crate::durability::{DurabilityAgent, RecoveryStats, RecoveryTarget};
use crate::envelope::{EndpointMode, Envelope, EnvelopeStatus, ListeningStatus, Message, OwnerId};
use crate::persistence::{DeadLetterEntry, EnvelopeStore, PersistedCounts};
use crate::routing::{Endpoint, Router};
use crate::transports::{
    BackPressureAgent, HandlerPipeline, ListeningAgent, ListeningAgentControl, ListeningServices,
    Receiver, SendingAgent, Transport,
};
use crate::types::{Config, ConversationId, EnvelopeId, Error, NodeId, Result};

mod builder;
mod context;
mod handlers;
mod logger;
mod pipeline;
pub mod recovery;
mod replies;

pub use builder::BusBuilder;
use context::Cascade;
pub use context::MessageContext;
pub use handlers::{FnHandler, HandlerEntry, HandlerInvoker, HandlerRegistry};
#[cfg(test)]
pub use logger::MockMessageLogger;
pub use logger::{
    MessageEvent, MessageEventKind, MessageLogger, RecordingMessageLogger, TracingMessageLogger,
};
pub use replies::ReplyTracker;

/// How long shutdown waits for each background loop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Inner {
    config: Config,
    node_id: NodeId,
    store: Arc<dyn EnvelopeStore>,
    logger: Arc<dyn MessageLogger>,
    router: Router,
    transports: HashMap<String, Arc<dyn Transport>>,
    handlers: HandlerRegistry,
    failures: FailureRuleCollection,
    reply_uri: Url,
    replies: ReplyTracker,
    senders: RwLock<HashMap<Url, Arc<SendingAgent>>>,
    listeners: RwLock<HashMap<Url, Arc<ListeningAgent>>>,
    back_pressure: Arc<BackPressureAgent>,
    pipeline: Arc<dyn HandlerPipeline>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running message bus node. Cheap to clone.
#[derive(Clone)]
pub struct Runtime(Arc<Inner>);

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node_id", &self.0.node_id)
            .field("service", &self.service_name())
            .field("reply_uri", &self.0.reply_uri.as_str())
            .finish()
    }
}

impl Runtime {
    pub fn builder(config: Config) -> BusBuilder {
        BusBuilder::new(config)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn node_id(&self) -> &NodeId {
        &self.0.node_id
    }

    pub fn service_name(&self) -> &str {
        &self.0.config.node.service_name
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn store(&self) -> &Arc<dyn EnvelopeStore> {
        &self.0.store
    }

    pub fn logger(&self) -> &Arc<dyn MessageLogger> {
        &self.0.logger
    }

    pub fn router(&self) -> &Router {
        &self.0.router
    }

    pub fn reply_uri(&self) -> &Url {
        &self.0.reply_uri
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.0.cancel.clone()
    }

    pub fn listening_agent(&self, uri: &Url) -> Option<Arc<ListeningAgent>> {
        read(&self.0.listeners).get(uri).cloned()
    }

    pub fn sending_agent(&self, uri: &Url) -> Option<Arc<SendingAgent>> {
        read(&self.0.senders).get(uri).cloned()
    }

    pub fn listener_status(&self, uri: &Url) -> Option<ListeningStatus> {
        self.listening_agent(uri).map(|agent| agent.status())
    }

    pub async fn persisted_counts(&self) -> Result<PersistedCounts> {
        self.0.store.fetch_counts().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        self.0.store.dead_letters().await
    }

    /// Put a dead-lettered envelope back in the inbox for recovery.
    pub async fn replay_dead_letter(&self, id: EnvelopeId) -> Result<()> {
        self.0.store.replay_dead_letter(id).await
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.0
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    // =========================================================================
    // Startup / shutdown
    // =========================================================================

    /// Start listeners, back pressure and (when enabled) the durability loops.
    ///
    /// Envelopes still owned by this node id belong to a previous run that
    /// did not shut down cleanly; they are released before any listener
    /// accepts work so recovery can pick them up.
    pub async fn start(&self) -> Result<()> {
        let stranded = self.0.store.reassign_dormant_node(&self.0.node_id).await?;
        if stranded > 0 {
            tracing::info!(
                "stranded_envelopes_released: node={}, envelopes={}",
                self.0.node_id,
                stranded
            );
        }

        for endpoint in self.0.router.endpoints() {
            if endpoint.is_listener {
                self.listening_agent_for(&endpoint).await?;
            }
        }

        self.track(self.0.back_pressure.start(self.0.cancel.child_token()));

        if self.0.config.durability.enabled {
            let agent = DurabilityAgent::new(
                self.0.store.clone(),
                Arc::new(self.clone()),
                self.0.config.durability.clone(),
                self.0.cancel.child_token(),
            );
            for handle in agent.start() {
                self.track(handle);
            }
        }

        tracing::info!(
            "runtime_started: node={}, service={}, endpoints={}, handlers={}",
            self.0.node_id,
            self.service_name(),
            self.0.router.endpoints().len(),
            self.0.handlers.len()
        );
        Ok(())
    }

    /// Run every durability action once, outside the background loops.
    pub async fn recover_now(&self) -> RecoveryStats {
        DurabilityAgent::new(
            self.0.store.clone(),
            Arc::new(self.clone()),
            self.0.config.durability.clone(),
            self.0.cancel.child_token(),
        )
        .execute_now()
        .await
    }

    /// Stop every agent and loop, then release this node's envelopes so
    /// another node can recover them.
    pub async fn shutdown(&self) -> Result<()> {
        if self.0.cancel.is_cancelled() {
            return Ok(());
        }
        tracing::info!("runtime_stopping: node={}", self.0.node_id);
        self.0.cancel.cancel();

        let listeners: Vec<Arc<ListeningAgent>> = read(&self.0.listeners).values().cloned().collect();
        for listener in listeners {
            if let Err(e) = listener.dispose().await {
                tracing::warn!(
                    "listener_dispose_failed: uri={}, error={}",
                    listener.endpoint().uri,
                    e
                );
            }
        }

        let tasks = std::mem::take(
            &mut *self
                .0
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("background_task_shutdown_timeout: node={}", self.0.node_id);
            }
        }

        self.drain_agents().await;

        let released = self.0.store.reassign_dormant_node(&self.0.node_id).await?;
        tracing::info!(
            "runtime_stopped: node={}, released_envelopes={}",
            self.0.node_id,
            released
        );
        Ok(())
    }

    /// Account for what stopped agents still hold. Durable envelopes already
    /// have rows and are released with the rest of this node's envelopes.
    /// Buffered outgoing envelopes are persisted unowned so any node sends
    /// them; buffered incoming envelopes are lost and reported.
    async fn drain_agents(&self) {
        let senders: Vec<Arc<SendingAgent>> = read(&self.0.senders).values().cloned().collect();
        for sender in senders {
            let Ok(drained) = tokio::time::timeout(SHUTDOWN_GRACE, sender.drain()).await else {
                tracing::warn!("sender_drain_timeout: uri={}", sender.endpoint().uri);
                continue;
            };
            if drained.is_empty() || sender.endpoint().mode == EndpointMode::Durable {
                continue;
            }
            let mut persisted = 0;
            for envelope in &drained {
                match self.0.store.store_outgoing(envelope, OwnerId::AnyNode).await {
                    Ok(()) => persisted += 1,
                    Err(e) => tracing::error!(
                        "drained_envelope_lost: id={}, destination={}, error={}",
                        envelope.id,
                        sender.endpoint().uri,
                        e
                    ),
                }
            }
            tracing::info!(
                "sender_drained: uri={}, persisted={}",
                sender.endpoint().uri,
                persisted
            );
        }

        let listeners: Vec<Arc<ListeningAgent>> = read(&self.0.listeners).values().cloned().collect();
        for listener in listeners {
            let Ok(drained) = tokio::time::timeout(SHUTDOWN_GRACE, listener.drain()).await else {
                tracing::warn!("listener_drain_timeout: uri={}", listener.endpoint().uri);
                continue;
            };
            if drained.is_empty() || listener.endpoint().mode == EndpointMode::Durable {
                continue;
            }
            tracing::warn!(
                "buffered_envelopes_dropped: uri={}, count={}",
                listener.endpoint().uri,
                drained.len()
            );
        }
    }

    // =========================================================================
    // Agents
    // =========================================================================

    fn transport_for(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
        let transport = self.0.transports.get(endpoint.scheme()).ok_or_else(|| {
            Error::configuration(format!("no transport registered for {}", endpoint.uri))
        })?;
        if !transport.supports_mode(endpoint.mode) {
            return Err(Error::configuration(format!(
                "transport '{}' does not support {:?} endpoints ({})",
                transport.scheme(),
                endpoint.mode,
                endpoint.uri
            )));
        }
        Ok(transport.clone())
    }

    fn listening_services(&self) -> ListeningServices {
        ListeningServices {
            node_id: self.0.node_id.clone(),
            store: self.0.store.clone(),
            logger: self.0.logger.clone(),
            pipeline: self.0.pipeline.clone(),
            cancel: self.0.cancel.child_token(),
        }
    }

    /// The listening agent of `endpoint`, created and started on first use.
    async fn listening_agent_for(&self, endpoint: &Arc<Endpoint>) -> Result<Arc<ListeningAgent>> {
        if let Some(agent) = self.listening_agent(&endpoint.uri) {
            return Ok(agent);
        }

        let agent = ListeningAgent::new(endpoint.clone(), self.listening_services());
        if !endpoint.is_local() {
            let transport = self.transport_for(endpoint)?;
            let receiver: Arc<dyn Receiver> = agent.clone();
            let listener = transport.build_listener(endpoint, receiver).await?;
            agent.attach(listener);
        }

        let existing = {
            let mut listeners = write(&self.0.listeners);
            match listeners.get(&endpoint.uri) {
                Some(existing) => Some(existing.clone()),
                None => {
                    listeners.insert(endpoint.uri.clone(), agent.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            if let Err(e) = agent.dispose().await {
                tracing::debug!("duplicate_listener_dispose_failed: error={}", e);
            }
            return Ok(existing);
        }

        if let Some(handle) = agent.activate().await? {
            self.track(handle);
        }
        self.0.back_pressure.watch(agent.clone());
        tracing::debug!(
            "listener_started: uri={}, mode={:?}",
            endpoint.uri,
            endpoint.mode
        );
        Ok(agent)
    }

    /// The sending agent of `endpoint`, created and started on first use.
    async fn sending_agent_for(&self, endpoint: &Arc<Endpoint>) -> Result<Arc<SendingAgent>> {
        if let Some(agent) = self.sending_agent(&endpoint.uri) {
            return Ok(agent);
        }

        let sender = self.transport_for(endpoint)?.build_sender(endpoint).await?;
        let agent = SendingAgent::new(
            endpoint.clone(),
            sender,
            self.0.store.clone(),
            self.0.logger.clone(),
            self.0.config.messaging.clone(),
        );

        {
            let mut senders = write(&self.0.senders);
            if let Some(existing) = senders.get(&endpoint.uri) {
                return Ok(existing.clone());
            }
            senders.insert(endpoint.uri.clone(), agent.clone());
        }
        self.track(agent.start(self.0.cancel.child_token())?);
        tracing::debug!(
            "sender_started: uri={}, mode={:?}",
            endpoint.uri,
            endpoint.mode
        );
        Ok(agent)
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Address an envelope to `endpoint` and stamp its send time.
    pub(crate) fn prepare(&self, endpoint: &Endpoint, envelope: &mut Envelope, now: DateTime<Utc>) {
        envelope.destination = Some(endpoint.uri.clone());
        if envelope.source.is_none() {
            envelope.source = Some(self.service_name().to_string());
        }
        envelope.sent_at = Some(now);
    }

    /// Hand one envelope to `endpoint` according to its mode.
    ///
    /// `persisted` is set when the durable row already exists (recovery,
    /// or committed together with a handled envelope).
    pub(crate) async fn deliver(
        &self,
        endpoint: &Arc<Endpoint>,
        mut envelope: Envelope,
        persisted: bool,
    ) -> Result<()> {
        let now = Utc::now();
        self.prepare(endpoint, &mut envelope, now);

        if envelope.is_scheduled_for_later(now) {
            if !endpoint.is_local() {
                let agent = self.sending_agent_for(endpoint).await?;
                if agent.supports_native_scheduled_send() {
                    return agent.enqueue(envelope);
                }
            }
            self.0.store.schedule_job(&envelope).await?;
            tracing::debug!(
                "envelope_scheduled: id={}, destination={}",
                envelope.id,
                endpoint.uri
            );
            return Ok(());
        }
        if envelope.status == EnvelopeStatus::Scheduled {
            envelope.status = EnvelopeStatus::Outgoing;
            envelope.scheduled_time = None;
        }

        let owner = OwnerId::Node(self.0.node_id.clone());
        if endpoint.is_local() {
            let agent = self.listening_agent_for(endpoint).await?;
            if endpoint.mode == EndpointMode::Durable && !persisted {
                envelope.status = EnvelopeStatus::Incoming;
                envelope.owner_id = owner;
                self.0.store.store_incoming(&envelope).await?;
            }
            self.0.logger.sent(&envelope);
            return agent.enqueue(envelope);
        }

        let agent = self.sending_agent_for(endpoint).await?;
        match endpoint.mode {
            EndpointMode::Inline => agent.send_now(envelope).await,
            EndpointMode::BufferedInMemory => agent.enqueue(envelope),
            EndpointMode::Durable => {
                if !persisted {
                    envelope.owner_id = owner.clone();
                    self.0.store.store_outgoing(&envelope, owner).await?;
                }
                agent.enqueue(envelope)
            }
        }
    }

    fn route_reply(&self, reply: Envelope) -> Result<Vec<(Arc<Endpoint>, Envelope)>> {
        let destination = reply.destination.clone().ok_or_else(|| {
            Error::validation(format!("reply {} has no destination", reply.id))
        })?;
        let endpoint = self.0.router.find_or_create(&destination)?;
        Ok(vec![(endpoint, reply)])
    }

    fn route_cascade(&self, cascade: Cascade) -> Result<Vec<(Arc<Endpoint>, Envelope)>> {
        match cascade {
            Cascade::Response(reply) => self.route_reply(reply),
            Cascade::Addressed(address, envelope) => {
                let endpoint = self.0.router.resolve_address(&address)?;
                Ok(vec![(endpoint, envelope)])
            }
            Cascade::Routed(envelope) => {
                let routes = self.0.router.resolve(&envelope.message_type)?;
                if routes.is_empty() {
                    self.0.logger.no_routes(&envelope);
                }
                Ok(fan_out(routes, envelope))
            }
        }
    }

    pub(crate) async fn send_reply(&self, reply: Envelope) -> Result<()> {
        for (endpoint, envelope) in self.route_reply(reply)? {
            self.deliver(&endpoint, envelope, false).await?;
        }
        Ok(())
    }

    async fn route_and_deliver(&self, envelope: Envelope, require_route: bool) -> Result<()> {
        envelope.validate(Utc::now())?;
        let routes = self.0.router.resolve(&envelope.message_type)?;
        if routes.is_empty() {
            if require_route {
                return Err(Error::no_routes(&envelope.message_type));
            }
            self.0.logger.no_routes(&envelope);
            return Ok(());
        }
        for (endpoint, envelope) in fan_out(routes, envelope) {
            self.deliver(&endpoint, envelope, false).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Publishing API
    // =========================================================================

    /// Publish to every route of the message type. No route is not an error.
    pub async fn publish<M: Message>(&self, message: &M) -> Result<()> {
        self.publish_envelope(Envelope::for_message(message)?).await
    }

    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<()> {
        self.route_and_deliver(envelope, false).await
    }

    /// Send to every route of the message type. Fails with `NoRoutes` when
    /// there is none.
    pub async fn send<M: Message>(&self, message: &M) -> Result<()> {
        self.send_envelope(Envelope::for_message(message)?).await
    }

    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.route_and_deliver(envelope, true).await
    }

    /// Send to an endpoint name or uri, bypassing routing rules.
    pub async fn send_to<M: Message>(&self, address: &str, message: &M) -> Result<()> {
        let envelope = Envelope::for_message(message)?;
        envelope.validate(Utc::now())?;
        let endpoint = self.0.router.resolve_address(address)?;
        self.deliver(&endpoint, envelope, false).await
    }

    /// Deliver at `time` instead of now.
    pub async fn schedule<M: Message>(&self, message: &M, time: DateTime<Utc>) -> Result<()> {
        let envelope = Envelope::for_message(message)?.schedule_at(time);
        self.route_and_deliver(envelope, true).await
    }

    /// Execute the local handler in the caller. Handler failures are returned
    /// as `Error::Handler`; no failure rules apply.
    pub async fn invoke<M: Message>(&self, message: &M) -> Result<()> {
        let envelope = Envelope::for_message(message)?;
        let handler = self.0.handlers.get(&envelope.message_type).cloned().ok_or_else(|| {
            Error::not_found(format!("no handler for message type '{}'", envelope.message_type))
        })?;
        let timeout = handler
            .timeout
            .unwrap_or(self.0.config.messaging.default_execution_timeout);

        let context = MessageContext::new(envelope, self.service_name());
        let invocation = handler
            .invoker
            .invoke(context.clone(), self.0.cancel.child_token());
        let outcome = recovery::with_recovery_async(
            async move {
                match tokio::time::timeout(timeout, invocation).await {
                    Ok(result) => result.map_err(|e| Error::handler(e.to_string())),
                    Err(_) => Err(Error::timeout(format!("handler exceeded {:?}", timeout))),
                }
            },
            "invoke",
        )
        .await;

        let enlisted = context.take_enlisted();
        let delivered = match outcome {
            Ok(()) => self.deliver_cascades(context.take_cascades()).await,
            Err(e) => Err(e),
        };
        match delivered {
            Ok(()) => {
                enlisted.commit();
                Ok(())
            }
            Err(e) => {
                enlisted.rollback();
                Err(e)
            }
        }
    }

    async fn deliver_cascades(&self, cascades: Vec<Cascade>) -> Result<()> {
        for cascade in cascades {
            for (endpoint, envelope) in self.route_cascade(cascade)? {
                self.deliver(&endpoint, envelope, false).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Request / reply
    // =========================================================================

    /// Send a request to its single route and wait for the typed response.
    pub async fn request<Req: Message, Resp: Message>(&self, message: &Req) -> Result<Resp> {
        self.request_inner::<Req, Resp>(None, message).await
    }

    pub async fn request_to<Req: Message, Resp: Message>(
        &self,
        address: &str,
        message: &Req,
    ) -> Result<Resp> {
        self.request_inner::<Req, Resp>(Some(address), message).await
    }

    /// Send and wait until the receiver acknowledges handling.
    pub async fn send_and_wait<M: Message>(&self, message: &M) -> Result<()> {
        self.send_and_wait_inner(None, message).await
    }

    pub async fn send_and_wait_to<M: Message>(&self, address: &str, message: &M) -> Result<()> {
        self.send_and_wait_inner(Some(address), message).await
    }

    async fn request_inner<Req: Message, Resp: Message>(
        &self,
        address: Option<&str>,
        message: &Req,
    ) -> Result<Resp> {
        let mut envelope = Envelope::for_message(message)?;
        envelope.reply_requested = Some(Resp::message_type());
        let timeout = Req::execution_timeout()
            .unwrap_or(self.0.config.messaging.default_request_timeout);
        let reply = self
            .await_reply(
                envelope,
                address,
                timeout,
                format!("Timed out waiting for expected response {}", Resp::message_type()),
            )
            .await?;
        reply.decode::<Resp>()
    }

    async fn send_and_wait_inner<M: Message>(&self, address: Option<&str>, message: &M) -> Result<()> {
        let mut envelope = Envelope::for_message(message)?;
        envelope.ack_requested = true;
        let timeout = M::execution_timeout()
            .unwrap_or(self.0.config.messaging.default_request_timeout);
        let reply = self
            .await_reply(
                envelope,
                address,
                timeout,
                format!("Timed out waiting for acknowledgement of {}", M::message_type()),
            )
            .await?;
        if !reply.is_acknowledgement() {
            tracing::debug!(
                "unexpected_acknowledgement: type={}, conversation={:?}",
                reply.message_type,
                reply.conversation_id
            );
        }
        Ok(())
    }

    /// The one endpoint a request goes to.
    fn single_route(&self, message_type: &str, address: Option<&str>) -> Result<Arc<Endpoint>> {
        if let Some(address) = address {
            return self.0.router.resolve_address(address);
        }
        let routes = self.0.router.resolve(message_type)?;
        match routes.as_slice() {
            [] => Err(Error::no_routes(message_type)),
            [single] => Ok(single.clone()),
            many => Err(Error::configuration(format!(
                "There are multiple subscribing endpoints {} for message {}",
                many.iter()
                    .map(|e| e.uri.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                message_type
            ))),
        }
    }

    async fn await_reply(
        &self,
        mut envelope: Envelope,
        address: Option<&str>,
        timeout: Duration,
        timeout_message: String,
    ) -> Result<Envelope> {
        let endpoint = self.single_route(&envelope.message_type, address)?;
        let conversation_id = ConversationId::new();
        envelope.conversation_id = Some(conversation_id);
        envelope.reply_uri = Some(self.0.reply_uri.clone());
        let envelope = envelope.with_deliver_within(timeout, Utc::now());
        envelope.validate(Utc::now())?;

        let rx = self.0.replies.register(conversation_id);
        if let Err(e) = self.deliver(&endpoint, envelope, false).await {
            self.0.replies.remove(&conversation_id);
            return Err(e);
        }

        let outcome = tokio::select! {
            _ = self.0.cancel.cancelled() => {
                Err(Error::cancelled("runtime stopped while waiting for a reply"))
            }
            reply = tokio::time::timeout(timeout, rx) => match reply {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(Error::cancelled("reply waiter dropped")),
                Err(_) => Err(Error::timeout(timeout_message)),
            },
        };
        if outcome.is_err() {
            self.0.replies.remove(&conversation_id);
        }

        let reply = outcome?;
        if reply.is_failure_acknowledgement() {
            let message = reply
                .failure_message()
                .unwrap_or_else(|| "remote handler failed".to_string());
            return Err(Error::request_failed(message));
        }
        Ok(reply)
    }
}

/// One envelope per route. A single route keeps the original envelope id.
fn fan_out(routes: Vec<Arc<Endpoint>>, envelope: Envelope) -> Vec<(Arc<Endpoint>, Envelope)> {
    if routes.len() == 1 {
        return routes.into_iter().map(|e| (e, envelope.clone())).collect();
    }
    routes
        .into_iter()
        .map(|endpoint| {
            let copy = envelope.for_destination(endpoint.uri.clone());
            (endpoint, copy)
        })
        .collect()
}

// =============================================================================
// Continuation and recovery seams
// =============================================================================

#[async_trait]
impl ContinuationRuntime for Runtime {
    fn message_logger(&self) -> &dyn MessageLogger {
        self.0.logger.as_ref()
    }

    async fn pause_listener(&self, endpoint: &Url, pause: Duration) -> Result<()> {
        match self.listening_agent(endpoint) {
            Some(agent) => agent.pause(pause).await,
            None => Err(Error::not_found(format!("no listener at {}", endpoint))),
        }
    }
}

#[async_trait]
impl RecoveryTarget for Runtime {
    fn node_id(&self) -> &NodeId {
        &self.0.node_id
    }

    fn in_durable_scope(&self, uri: &Url) -> bool {
        self.0.router.in_durable_scope(uri)
    }

    fn is_accepting(&self, uri: &Url) -> bool {
        self.listener_status(uri)
            .map(ListeningStatus::is_accepting)
            .unwrap_or(false)
    }

    fn has_transport_for(&self, uri: &Url) -> bool {
        self.0.router.has_transport_for(uri)
    }

    fn is_local_durable(&self, uri: &Url) -> bool {
        self.0
            .router
            .find_or_create(uri)
            .is_ok_and(|endpoint| endpoint.is_local() && endpoint.mode == EndpointMode::Durable)
    }

    async fn enqueue_incoming(&self, envelope: Envelope) -> Result<()> {
        let destination = envelope
            .destination
            .clone()
            .ok_or_else(|| Error::validation(format!("envelope {} has no destination", envelope.id)))?;
        let agent = match self.listening_agent(&destination) {
            Some(agent) => agent,
            None => {
                let endpoint = self.0.router.find_or_create(&destination)?;
                if !endpoint.is_local() {
                    return Err(Error::not_found(format!("no listener at {}", destination)));
                }
                self.listening_agent_for(&endpoint).await?
            }
        };
        agent.enqueue(envelope)
    }

    async fn enqueue_outgoing(&self, envelope: Envelope) -> Result<()> {
        let destination = envelope
            .destination
            .clone()
            .ok_or_else(|| Error::validation(format!("envelope {} has no destination", envelope.id)))?;
        let endpoint = self.0.router.find_or_create(&destination)?;
        if endpoint.is_local() {
            return Err(Error::validation(format!(
                "outgoing envelope {} targets local queue {}",
                envelope.id, destination
            )));
        }
        self.sending_agent_for(&endpoint).await?.enqueue(envelope)
    }

    async fn dispatch_scheduled(&self, envelope: Envelope) -> Result<()> {
        let destination = envelope
            .destination
            .clone()
            .ok_or_else(|| Error::validation(format!("envelope {} has no destination", envelope.id)))?;
        let endpoint = self.0.router.find_or_create(&destination)?;
        self.deliver(&endpoint, envelope, false).await
    }
}
