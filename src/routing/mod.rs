//! Endpoint and routing layer.
//!
//! Maps a message type, or an explicit address, to the endpoints an
//! envelope is delivered to. Resolution order for a message type:
//! 1. static subscriptions declared on endpoints (including "publish all")
//! 2. conventional routing, when enabled
//! 3. the default local queue, for types handled on this node
//!
//! Resolved routes are cached per message type. Explicit addresses bypass
//! the table: a known endpoint name or uri wins, and an unknown uri whose
//! scheme has a registered transport creates the endpoint on the fly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use url::Url;

use crate::envelope::EndpointMode;
use crate::types::{Error, Result};

mod endpoint;
mod policies;

pub use endpoint::{BufferingLimits, CircuitBreakerOptions, Endpoint, Subscription, LOCAL_SCHEME};
pub use policies::{
    apply_policies, ConventionTarget, ConventionalRouting, EndpointPolicy,
    InlineListenersAndSenders, LambdaEndpointPolicy, UseDurableInboxOnAllListeners,
    UseDurableLocalQueues, UseDurableOutboxOnAllSendingEndpoints,
};

/// Name of the local queue used for locally handled types without a route.
pub const DEFAULT_LOCAL_QUEUE: &str = "default";

/// Inputs to the routing table besides the declared endpoints.
#[derive(Debug, Clone, Default)]
pub struct RoutingOptions {
    pub policies: Vec<Arc<dyn EndpointPolicy>>,
    pub conventions: Vec<ConventionalRouting>,
    /// Message types with a handler on this node.
    pub handled_types: HashSet<String>,
    /// Route handled types without any other route to `local://default`.
    pub local_default: bool,
    /// Schemes with a registered transport. `local` is always available.
    pub schemes: HashSet<String>,
}

/// Routing table.
#[derive(Debug)]
pub struct Router {
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
    policies: Vec<Arc<dyn EndpointPolicy>>,
    conventions: Vec<ConventionalRouting>,
    handled_types: HashSet<String>,
    local_default: Option<Url>,
    schemes: HashSet<String>,
    cache: RwLock<HashMap<String, Vec<Arc<Endpoint>>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Router {
    /// Build the table: apply policies to every declared endpoint, create
    /// conventional local queues for handled types, then validate.
    pub fn new(declared: Vec<Endpoint>, options: RoutingOptions) -> Result<Self> {
        let RoutingOptions {
            policies,
            conventions,
            handled_types,
            local_default,
            schemes,
        } = options;

        let mut router = Self {
            endpoints: RwLock::new(Vec::new()),
            policies,
            conventions,
            handled_types,
            local_default: None,
            schemes,
            cache: RwLock::new(HashMap::new()),
        };

        for endpoint in declared {
            router.register(endpoint)?;
        }

        let mut handled: Vec<&String> = router.handled_types.iter().collect();
        handled.sort();
        for convention in &router.conventions {
            if convention.target() != &ConventionTarget::Local {
                continue;
            }
            for message_type in &handled {
                if convention.applies_to(message_type) {
                    router.register(convention.endpoint_for(message_type)?)?;
                }
            }
        }

        if local_default {
            let queue = router.register(Endpoint::local_queue(DEFAULT_LOCAL_QUEUE)?)?;
            router.local_default = Some(queue.uri.clone());
        }

        tracing::debug!(
            "router_built: endpoints={}, conventions={}, handled_types={}",
            read(&router.endpoints).len(),
            router.conventions.len(),
            router.handled_types.len()
        );
        Ok(router)
    }

    /// Apply policies, validate, and add the endpoint unless its uri is known.
    fn register(&self, mut endpoint: Endpoint) -> Result<Arc<Endpoint>> {
        if let Some(existing) = self.find(&endpoint.uri) {
            return Ok(existing);
        }
        if !endpoint.is_local() && !self.schemes.contains(endpoint.scheme()) {
            return Err(Error::configuration(format!(
                "no transport registered for scheme '{}' (endpoint {})",
                endpoint.scheme(),
                endpoint.uri
            )));
        }
        apply_policies(&mut endpoint, &self.policies);
        endpoint.validate()?;

        let mut endpoints = write(&self.endpoints);
        if let Some(existing) = endpoints.iter().find(|e| e.uri == endpoint.uri) {
            return Ok(existing.clone());
        }
        let endpoint = Arc::new(endpoint);
        endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    /// Every endpoint, in registration order.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        read(&self.endpoints).clone()
    }

    pub fn find(&self, uri: &Url) -> Option<Arc<Endpoint>> {
        read(&self.endpoints).iter().find(|e| &e.uri == uri).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Endpoint>> {
        read(&self.endpoints)
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    /// Known endpoint at `uri`, or a new one when a transport handles its scheme.
    pub fn find_or_create(&self, uri: &Url) -> Result<Arc<Endpoint>> {
        if let Some(endpoint) = self.find(uri) {
            return Ok(endpoint);
        }
        let endpoint = if uri.scheme() == LOCAL_SCHEME {
            Endpoint::new(uri.clone()).listener()
        } else {
            Endpoint::new(uri.clone())
        };
        let endpoint = self.register(endpoint)?;
        tracing::debug!("endpoint_created: uri={}", endpoint.uri);
        Ok(endpoint)
    }

    /// Resolve an explicit destination given as endpoint name or uri.
    pub fn resolve_address(&self, address: &str) -> Result<Arc<Endpoint>> {
        if let Some(endpoint) = self.find_by_name(address) {
            return Ok(endpoint);
        }
        let uri = Url::parse(address).map_err(|_| {
            Error::not_found(format!("no endpoint named or addressed '{}'", address))
        })?;
        self.find_or_create(&uri)
    }

    /// Destinations of a message type, in route order. May be empty.
    pub fn resolve(&self, message_type: &str) -> Result<Vec<Arc<Endpoint>>> {
        if let Some(routes) = read(&self.cache).get(message_type) {
            return Ok(routes.clone());
        }

        let mut routes: Vec<Arc<Endpoint>> = read(&self.endpoints)
            .iter()
            .filter(|e| e.subscribes_to(message_type))
            .cloned()
            .collect();

        if routes.is_empty() {
            for convention in &self.conventions {
                if !convention.applies_to(message_type) {
                    continue;
                }
                let applies = match convention.target() {
                    ConventionTarget::Local => self.handled_types.contains(message_type),
                    ConventionTarget::Transport { .. } => true,
                };
                if applies {
                    let endpoint = self.register(convention.endpoint_for(message_type)?)?;
                    if !routes.iter().any(|r| r.uri == endpoint.uri) {
                        routes.push(endpoint);
                    }
                }
            }
        }

        if routes.is_empty() && self.handled_types.contains(message_type) {
            if let Some(default) = self.local_default.as_ref().and_then(|uri| self.find(uri)) {
                routes.push(default);
            }
        }

        tracing::debug!(
            "routes_resolved: type={}, routes={}",
            message_type,
            routes.len()
        );
        write(&self.cache).insert(message_type.to_string(), routes.clone());
        Ok(routes)
    }

    /// Uris of durable endpoints, scanned by the durability agent.
    pub fn durable_scope(&self) -> Vec<Url> {
        read(&self.endpoints)
            .iter()
            .filter(|e| e.mode == EndpointMode::Durable)
            .map(|e| e.uri.clone())
            .collect()
    }

    pub fn in_durable_scope(&self, uri: &Url) -> bool {
        self.find(uri)
            .map(|e| e.mode == EndpointMode::Durable)
            .unwrap_or(false)
    }

    pub fn has_transport_for(&self, uri: &Url) -> bool {
        uri.scheme() == LOCAL_SCHEME || self.schemes.contains(uri.scheme())
    }
}
