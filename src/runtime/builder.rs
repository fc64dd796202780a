//! Runtime builder.
//!
//! Everything a node needs is declared here before it starts: handlers,
//! endpoints, static routes, policies, transports, the store and the
//! message logger. `build` applies policies, validates endpoint modes
//! against their transports and wires the runtime.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::pipeline::RuntimePipeline;
use super::{
    HandlerInvoker, HandlerRegistry, Inner, MessageContext, MessageLogger, ReplyTracker, Runtime,
    TracingMessageLogger,
};
use crate::continuation::FailureRuleCollection;
use crate::envelope::Message;
use crate::persistence::{EnvelopeStore, InMemoryEnvelopeStore};
use crate::routing::{
    ConventionalRouting, Endpoint, EndpointPolicy, InlineListenersAndSenders, Router,
    RoutingOptions, Subscription, UseDurableInboxOnAllListeners, UseDurableLocalQueues,
    UseDurableOutboxOnAllSendingEndpoints, LOCAL_SCHEME,
};
use crate::transports::{BackPressureAgent, Transport};
use crate::types::{BoxError, Config, Error, NodeId, Result};

/// Address of the reply endpoint when none is configured.
pub const DEFAULT_REPLY_URI: &str = "local://replies";

/// Declarative setup of a [`Runtime`].
pub struct BusBuilder {
    config: Config,
    store: Option<Arc<dyn EnvelopeStore>>,
    logger: Option<Arc<dyn MessageLogger>>,
    transports: HashMap<String, Arc<dyn Transport>>,
    endpoints: Vec<Endpoint>,
    routes: Vec<(String, Subscription)>,
    handlers: HandlerRegistry,
    failures: FailureRuleCollection,
    policies: Vec<Arc<dyn EndpointPolicy>>,
    conventions: Vec<ConventionalRouting>,
    local_routing: bool,
    reply_uri: Option<String>,
}

impl std::fmt::Debug for BusBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusBuilder")
            .field("service", &self.config.node.service_name)
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("endpoints", &self.endpoints.len())
            .field("handlers", &self.handlers.len())
            .field("policies", &self.policies)
            .finish()
    }
}

impl BusBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            logger: None,
            transports: HashMap::new(),
            endpoints: Vec::new(),
            routes: Vec::new(),
            handlers: HandlerRegistry::new(),
            failures: FailureRuleCollection::new(),
            policies: Vec::new(),
            conventions: Vec::new(),
            local_routing: true,
            reply_uri: None,
        }
    }

    /// Envelope store. Defaults to a fresh in-memory store.
    pub fn store(mut self, store: Arc<dyn EnvelopeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Message event sink. Defaults to [`TracingMessageLogger`].
    pub fn message_logger(mut self, logger: Arc<dyn MessageLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Register a transport for its uri scheme.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        let scheme = transport.scheme().to_string();
        self.transports.insert(scheme, Arc::new(transport));
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    // =========================================================================
    // Handlers and failure rules
    // =========================================================================

    /// Handle messages of type `M` on this node.
    pub fn handle<M, F, Fut>(self, handler: F) -> Self
    where
        M: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.handle_with::<M, F, Fut>(handler, |_| {})
    }

    /// Handle `M` with failure rules specific to this handler.
    pub fn handle_with<M, F, Fut>(
        mut self,
        handler: F,
        configure: impl FnOnce(&mut FailureRuleCollection),
    ) -> Self
    where
        M: Message,
        F: Fn(M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let mut failures = FailureRuleCollection::new();
        configure(&mut failures);
        self.handlers.register::<M, F, Fut>(handler, failures);
        self
    }

    /// Register an untyped handler for `message_type`.
    pub fn handler(
        mut self,
        message_type: impl Into<String>,
        invoker: Arc<dyn HandlerInvoker>,
        timeout: Option<Duration>,
    ) -> Self {
        self.handlers
            .register_invoker(message_type, invoker, FailureRuleCollection::new(), timeout);
        self
    }

    /// Global failure rules, consulted after handler and endpoint rules.
    pub fn on_failure(mut self, configure: impl FnOnce(&mut FailureRuleCollection)) -> Self {
        configure(&mut self.failures);
        self
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Publish messages of type `M` to `address` (endpoint name or uri).
    pub fn route<M: Message>(mut self, address: impl Into<String>) -> Self {
        self.routes
            .push((address.into(), Subscription::MessageType(M::message_type())));
        self
    }

    /// Publish every message to `address`.
    pub fn route_all(mut self, address: impl Into<String>) -> Self {
        self.routes.push((address.into(), Subscription::All));
        self
    }

    pub fn policy(mut self, policy: impl EndpointPolicy + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn use_durable_local_queues(self) -> Self {
        self.policy(UseDurableLocalQueues)
    }

    pub fn use_durable_outbox_on_all_sending_endpoints(self) -> Self {
        self.policy(UseDurableOutboxOnAllSendingEndpoints)
    }

    pub fn use_durable_inbox_on_all_listeners(self) -> Self {
        self.policy(UseDurableInboxOnAllListeners)
    }

    pub fn inline_listeners_and_senders(self) -> Self {
        self.policy(InlineListenersAndSenders)
    }

    pub fn conventional_routing(mut self, convention: ConventionalRouting) -> Self {
        self.conventions.push(convention);
        self
    }

    /// Stop routing locally handled types to `local://default` when no
    /// other route exists.
    pub fn disable_local_routing(mut self) -> Self {
        self.local_routing = false;
        self
    }

    /// Address replies are sent to. Defaults to `local://replies`.
    pub fn reply_uri(mut self, uri: impl Into<String>) -> Self {
        self.reply_uri = Some(uri.into());
        self
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Attach static routes to declared endpoints, declaring the missing ones.
    fn declare_routes(&mut self) -> Result<()> {
        for (address, subscription) in std::mem::take(&mut self.routes) {
            let position = self.endpoints.iter().position(|e| {
                e.name == address || e.uri.as_str() == address || e.uri.as_str().trim_end_matches('/') == address
            });
            let index = match position {
                Some(index) => index,
                None => {
                    let uri = Url::parse(&address).map_err(|e| {
                        Error::configuration(format!("invalid route address '{}': {}", address, e))
                    })?;
                    let endpoint = if uri.scheme() == LOCAL_SCHEME {
                        Endpoint::new(uri).listener()
                    } else {
                        Endpoint::new(uri)
                    };
                    self.endpoints.push(endpoint);
                    self.endpoints.len() - 1
                }
            };
            self.endpoints[index].subscriptions.push(subscription);
        }
        Ok(())
    }

    pub fn build(mut self) -> Result<Runtime> {
        self.declare_routes()?;

        let node_id = match self.config.node.node_id.clone() {
            Some(raw) => NodeId::from_string(raw).map_err(Error::configuration)?,
            None => NodeId::generate(&self.config.node.service_name),
        };

        let reply_address = self
            .reply_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_REPLY_URI.to_string());
        let reply_uri = Url::parse(&reply_address).map_err(|e| {
            Error::configuration(format!("invalid reply uri '{}': {}", reply_address, e))
        })?;
        match self.endpoints.iter_mut().find(|e| e.uri == reply_uri) {
            Some(existing) => existing.is_listener = true,
            None => self
                .endpoints
                .push(Endpoint::new(reply_uri.clone()).system().listener()),
        }

        let handled_types: HashSet<String> = self.handlers.handled_types().cloned().collect();
        let router = Router::new(
            self.endpoints,
            RoutingOptions {
                policies: self.policies,
                conventions: self.conventions,
                handled_types,
                local_default: self.local_routing,
                schemes: self.transports.keys().cloned().collect(),
            },
        )?;

        for endpoint in router.endpoints() {
            if endpoint.is_local() {
                continue;
            }
            let supported = self
                .transports
                .get(endpoint.scheme())
                .map(|t| t.supports_mode(endpoint.mode))
                .unwrap_or(false);
            if !supported {
                return Err(Error::configuration(format!(
                    "endpoint {} uses {:?}, which its transport does not support",
                    endpoint.uri, endpoint.mode
                )));
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEnvelopeStore::new()));
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingMessageLogger));
        let back_pressure = BackPressureAgent::new(self.config.messaging.back_pressure_interval);

        tracing::debug!(
            "runtime_built: node={}, reply_uri={}, transports={}",
            node_id,
            reply_uri,
            self.transports.len()
        );

        let inner = Arc::new_cyclic(|me| Inner {
            config: self.config,
            node_id,
            store,
            logger,
            router,
            transports: self.transports,
            handlers: self.handlers,
            failures: self.failures,
            reply_uri,
            replies: ReplyTracker::new(),
            senders: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            back_pressure,
            pipeline: Arc::new(RuntimePipeline::new(me.clone())),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        Ok(Runtime(inner))
    }

    /// Build and start the runtime.
    pub async fn start(self) -> Result<Runtime> {
        let runtime = self.build()?;
        runtime.start().await?;
        Ok(runtime)
    }
}
