//! Endpoint policies and conventional routing.
//!
//! Policies are pure transforms over configured endpoints, applied once when
//! the runtime is built (and to endpoints created later on the fly). They
//! only ever touch `Application` endpoints.

use std::fmt;
use std::sync::Arc;

use super::endpoint::{Endpoint, LOCAL_SCHEME};
use crate::envelope::{EndpointMode, EndpointRole};
use crate::types::Result;

/// Transform applied to endpoints at startup.
pub trait EndpointPolicy: Send + Sync + fmt::Debug {
    fn apply(&self, endpoint: &mut Endpoint);
}

/// Apply every policy, in order, to every application endpoint.
pub fn apply_policies(endpoint: &mut Endpoint, policies: &[Arc<dyn EndpointPolicy>]) {
    if endpoint.role != EndpointRole::Application {
        return;
    }
    for policy in policies {
        policy.apply(endpoint);
    }
}

/// Every local queue becomes durable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseDurableLocalQueues;

impl EndpointPolicy for UseDurableLocalQueues {
    fn apply(&self, endpoint: &mut Endpoint) {
        if endpoint.is_local() {
            endpoint.mode = EndpointMode::Durable;
        }
    }
}

/// Every external sending endpoint uses the durable outbox.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseDurableOutboxOnAllSendingEndpoints;

impl EndpointPolicy for UseDurableOutboxOnAllSendingEndpoints {
    fn apply(&self, endpoint: &mut Endpoint) {
        if !endpoint.is_local() && !endpoint.is_listener {
            endpoint.mode = EndpointMode::Durable;
        }
    }
}

/// Every external listener uses the durable inbox.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseDurableInboxOnAllListeners;

impl EndpointPolicy for UseDurableInboxOnAllListeners {
    fn apply(&self, endpoint: &mut Endpoint) {
        if !endpoint.is_local() && endpoint.is_listener {
            endpoint.mode = EndpointMode::Durable;
        }
    }
}

/// Every external endpoint processes inline.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineListenersAndSenders;

impl EndpointPolicy for InlineListenersAndSenders {
    fn apply(&self, endpoint: &mut Endpoint) {
        if !endpoint.is_local() {
            endpoint.mode = EndpointMode::Inline;
        }
    }
}

/// Policy from a closure.
pub struct LambdaEndpointPolicy<F> {
    description: String,
    apply: F,
}

impl<F> LambdaEndpointPolicy<F>
where
    F: Fn(&mut Endpoint) + Send + Sync,
{
    pub fn new(description: impl Into<String>, apply: F) -> Self {
        Self {
            description: description.into(),
            apply,
        }
    }
}

impl<F> fmt::Debug for LambdaEndpointPolicy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LambdaEndpointPolicy")
            .field("description", &self.description)
            .finish()
    }
}

impl<F> EndpointPolicy for LambdaEndpointPolicy<F>
where
    F: Fn(&mut Endpoint) + Send + Sync,
{
    fn apply(&self, endpoint: &mut Endpoint) {
        (self.apply)(endpoint);
    }
}

// =============================================================================
// Conventional routing
// =============================================================================

type TypeFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type QueueCustomization = Arc<dyn Fn(Endpoint, &str) -> Endpoint + Send + Sync>;

/// Where conventionally named queues live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConventionTarget {
    /// In-process queue per locally handled message type.
    Local,
    /// Queue per message type on the transport registered for `scheme`.
    Transport { scheme: String },
}

/// Derive a queue per message type from its lower-cased name.
#[derive(Clone)]
pub struct ConventionalRouting {
    target: ConventionTarget,
    includes: Vec<TypeFilter>,
    excludes: Vec<TypeFilter>,
    customize: Option<QueueCustomization>,
}

impl fmt::Debug for ConventionalRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConventionalRouting")
            .field("target", &self.target)
            .field("includes", &self.includes.len())
            .field("excludes", &self.excludes.len())
            .finish()
    }
}

impl ConventionalRouting {
    pub fn local() -> Self {
        Self::new(ConventionTarget::Local)
    }

    pub fn transport(scheme: impl Into<String>) -> Self {
        Self::new(ConventionTarget::Transport {
            scheme: scheme.into(),
        })
    }

    fn new(target: ConventionTarget) -> Self {
        Self {
            target,
            includes: Vec::new(),
            excludes: Vec::new(),
            customize: None,
        }
    }

    pub fn target(&self) -> &ConventionTarget {
        &self.target
    }

    /// Only route types accepted by `filter` (any include filter suffices).
    pub fn include_types(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.includes.push(Arc::new(filter));
        self
    }

    /// Never route types accepted by `filter`.
    pub fn exclude_types(mut self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.excludes.push(Arc::new(filter));
        self
    }

    /// Adjust each generated queue.
    pub fn customize_queues(
        mut self,
        customize: impl Fn(Endpoint, &str) -> Endpoint + Send + Sync + 'static,
    ) -> Self {
        self.customize = Some(Arc::new(customize));
        self
    }

    pub fn applies_to(&self, message_type: &str) -> bool {
        if self.excludes.iter().any(|exclude| exclude(message_type)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|include| include(message_type))
    }

    /// Queue name for a message type.
    pub fn queue_name(message_type: &str) -> String {
        message_type
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// Build the (uncustomized-by-policy) endpoint for a message type.
    pub fn endpoint_for(&self, message_type: &str) -> Result<Endpoint> {
        let name = Self::queue_name(message_type);
        let endpoint = match &self.target {
            ConventionTarget::Local => Endpoint::parse(&format!("{}://{}", LOCAL_SCHEME, name))?
                .listener(),
            ConventionTarget::Transport { scheme } => {
                Endpoint::parse(&format!("{}://{}", scheme, name))?
            }
        };
        Ok(match &self.customize {
            Some(customize) => customize(endpoint, message_type),
            None => endpoint,
        })
    }
}
