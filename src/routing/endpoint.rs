//! Endpoint configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::continuation::FailureRuleCollection;
use crate::envelope::{EndpointMode, EndpointRole};
use crate::types::{Error, Result};

/// Scheme of in-process queues.
pub const LOCAL_SCHEME: &str = "local";

/// Queue-depth hysteresis band for back pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferingLimits {
    /// Stop receiving above this many queued envelopes.
    pub maximum: usize,
    /// Resume receiving at or below this many.
    pub restart: usize,
}

impl BufferingLimits {
    pub fn new(maximum: usize, restart: usize) -> Self {
        Self { maximum, restart }
    }
}

impl Default for BufferingLimits {
    fn default() -> Self {
        Self {
            maximum: 1000,
            restart: 500,
        }
    }
}

/// Failure-rate circuit breaker for a listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Samples required before the failure rate is evaluated.
    pub minimum_threshold: usize,
    /// How long the listener stays stopped once tripped.
    #[serde(with = "humantime_serde")]
    pub pause_time: Duration,
    /// Rolling window of outcomes.
    #[serde(with = "humantime_serde")]
    pub tracking_period: Duration,
    /// Failure percentage (0-100) that trips the breaker.
    pub failure_percentage_threshold: u8,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            minimum_threshold: 10,
            pause_time: Duration::from_secs(180),
            tracking_period: Duration::from_secs(600),
            failure_percentage_threshold: 15,
        }
    }
}

/// Which message types an endpoint receives from static publish rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    All,
    MessageType(String),
}

impl Subscription {
    pub fn matches(&self, message_type: &str) -> bool {
        match self {
            Subscription::All => true,
            Subscription::MessageType(subscribed) => subscribed == message_type,
        }
    }
}

/// An addressable destination or source.
///
/// Immutable once the runtime is built; policies transform endpoints before
/// that.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub uri: Url,
    pub name: String,
    pub mode: EndpointMode,
    pub role: EndpointRole,
    pub is_listener: bool,
    pub buffering_limits: BufferingLimits,
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    /// Rules for failures on this endpoint (handling on listeners, sending otherwise).
    pub failures: FailureRuleCollection,
    pub max_parallelism: usize,
    pub subscriptions: Vec<Subscription>,
}

impl Endpoint {
    /// Endpoint with default settings. The name defaults to the uri's host or path.
    pub fn new(uri: Url) -> Self {
        let name = endpoint_name(&uri);
        Self {
            uri,
            name,
            mode: EndpointMode::BufferedInMemory,
            role: EndpointRole::Application,
            is_listener: false,
            buffering_limits: BufferingLimits::default(),
            circuit_breaker: None,
            failures: FailureRuleCollection::new(),
            max_parallelism: 10,
            subscriptions: Vec::new(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(uri)?))
    }

    /// In-process queue named `name`.
    pub fn local_queue(name: &str) -> Result<Self> {
        let mut endpoint = Self::parse(&format!("{}://{}", LOCAL_SCHEME, name.to_lowercase()))?;
        endpoint.is_listener = true;
        Ok(endpoint)
    }

    pub fn is_local(&self) -> bool {
        self.uri.scheme() == LOCAL_SCHEME
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    pub fn subscribes_to(&self, message_type: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|subscription| subscription.matches(message_type))
    }

    // =========================================================================
    // Configuration builders
    // =========================================================================

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn durable(mut self) -> Self {
        self.mode = EndpointMode::Durable;
        self
    }

    pub fn buffered(mut self) -> Self {
        self.mode = EndpointMode::BufferedInMemory;
        self
    }

    pub fn inline(mut self) -> Self {
        self.mode = EndpointMode::Inline;
        self
    }

    pub fn system(mut self) -> Self {
        self.role = EndpointRole::System;
        self
    }

    pub fn listener(mut self) -> Self {
        self.is_listener = true;
        self
    }

    pub fn max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    /// Process one envelope at a time, in order.
    pub fn sequential(self) -> Self {
        self.max_parallelism(1)
    }

    pub fn buffering_limits(mut self, maximum: usize, restart: usize) -> Self {
        self.buffering_limits = BufferingLimits::new(maximum, restart);
        self
    }

    pub fn circuit_breaker(mut self, options: CircuitBreakerOptions) -> Self {
        self.circuit_breaker = Some(options);
        self
    }

    pub fn failures(mut self, configure: impl FnOnce(&mut FailureRuleCollection)) -> Self {
        configure(&mut self.failures);
        self
    }

    pub fn subscribe(mut self, subscription: Subscription) -> Self {
        if !self.subscriptions.contains(&subscription) {
            self.subscriptions.push(subscription);
        }
        self
    }

    /// Check the settings that do not depend on a transport.
    pub fn validate(&self) -> Result<()> {
        if self.is_local() && self.mode == EndpointMode::Inline {
            return Err(Error::configuration(format!(
                "local queue '{}' cannot be inline",
                self.uri
            )));
        }
        if self.buffering_limits.restart > self.buffering_limits.maximum {
            return Err(Error::configuration(format!(
                "endpoint '{}' restart limit {} exceeds maximum {}",
                self.uri, self.buffering_limits.restart, self.buffering_limits.maximum
            )));
        }
        if let Some(breaker) = &self.circuit_breaker {
            if breaker.failure_percentage_threshold == 0 || breaker.failure_percentage_threshold > 100 {
                return Err(Error::configuration(format!(
                    "endpoint '{}' failure percentage must be within 1..=100",
                    self.uri
                )));
            }
        }
        Ok(())
    }
}

/// Host of the uri, or its trimmed path for host-less uris.
fn endpoint_name(uri: &Url) -> String {
    match uri.host_str() {
        Some(host) if !host.is_empty() => {
            let path = uri.path().trim_matches('/');
            if path.is_empty() {
                host.to_string()
            } else {
                format!("{}/{}", host, path)
            }
        }
        _ => uri.path().trim_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_queue_name_and_scheme() {
        let endpoint = Endpoint::local_queue("Important").unwrap();
        assert!(endpoint.is_local());
        assert!(endpoint.is_listener);
        assert_eq!(endpoint.name, "important");
        assert_eq!(endpoint.uri.as_str(), "local://important");
    }

    #[test]
    fn test_local_queue_cannot_be_inline() {
        let endpoint = Endpoint::local_queue("one").unwrap().inline();
        assert!(matches!(endpoint.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_buffering_limits_must_be_ordered() {
        let endpoint = Endpoint::parse("memory://q").unwrap().buffering_limits(100, 250);
        assert!(endpoint.validate().is_err());
    }

    #[test]
    fn test_subscriptions() {
        let endpoint = Endpoint::parse("memory://receiver1")
            .unwrap()
            .subscribe(Subscription::MessageType("app.Request1".into()))
            .subscribe(Subscription::MessageType("app.Request1".into()));
        assert_eq!(endpoint.subscriptions.len(), 1);
        assert!(endpoint.subscribes_to("app.Request1"));
        assert!(!endpoint.subscribes_to("app.Request2"));

        let all = endpoint.subscribe(Subscription::All);
        assert!(all.subscribes_to("anything"));
    }

    #[test]
    fn test_name_includes_path() {
        let endpoint = Endpoint::parse("memory://broker/orders").unwrap();
        assert_eq!(endpoint.name, "broker/orders");
    }
}
