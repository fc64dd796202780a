//! Configuration structures.
//!
//! Configuration is loaded from a JSON document (file or string) with a small
//! set of environment overrides. Every section has working defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::Result;

/// Global node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Durability agent configuration.
    #[serde(default)]
    pub durability: DurabilityConfig,

    /// Messaging defaults (timeouts, batching, back pressure).
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Apply `COURIER_SERVICE_NAME` and `COURIER_NODE_ID` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("COURIER_SERVICE_NAME") {
            if !name.is_empty() {
                self.node.service_name = name;
            }
        }
        if let Ok(node_id) = std::env::var("COURIER_NODE_ID") {
            if !node_id.is_empty() {
                self.node.node_id = Some(node_id);
            }
        }
    }
}

/// Node identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Logical service name, stamped as `source` on outgoing envelopes.
    pub service_name: String,

    /// Stable node identifier. Generated from the service name when absent.
    pub node_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".to_string(),
            node_id: None,
        }
    }
}

/// Durability agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    /// Run the background durability agent.
    pub enabled: bool,

    /// How often orphaned envelopes are recovered.
    #[serde(with = "humantime_serde")]
    pub recovery_interval: Duration,

    /// How often due scheduled envelopes are dispatched.
    #[serde(with = "humantime_serde")]
    pub scheduled_job_polling_interval: Duration,

    /// How often expired handled envelopes are deleted.
    #[serde(with = "humantime_serde")]
    pub expiration_interval: Duration,

    /// How long handled envelopes are retained (idempotency window).
    #[serde(with = "humantime_serde")]
    pub keep_after_message_handling: Duration,

    /// A node whose heartbeat is older than this is considered dormant.
    #[serde(with = "humantime_serde")]
    pub node_liveness_window: Duration,

    /// Maximum envelopes claimed per recovery pass.
    pub recovery_batch_size: usize,

    /// Retry policy for transient persistence failures.
    pub backoff: BackoffConfig,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recovery_interval: Duration::from_secs(5),
            scheduled_job_polling_interval: Duration::from_secs(5),
            expiration_interval: Duration::from_secs(300),
            keep_after_message_handling: Duration::from_secs(300),
            node_liveness_window: Duration::from_secs(30),
            recovery_batch_size: 100,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff for durability jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Growth factor applied per retry.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Messaging defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Handler execution timeout when the handler chain sets none.
    #[serde(with = "humantime_serde")]
    pub default_execution_timeout: Duration,

    /// Request/reply timeout when the message type sets none.
    #[serde(with = "humantime_serde")]
    pub default_request_timeout: Duration,

    /// Back-pressure sampling interval for listening endpoints.
    #[serde(with = "humantime_serde")]
    pub back_pressure_interval: Duration,

    /// Maximum envelopes a sending agent drains per batch.
    pub sending_batch_size: usize,

    /// Consecutive send failures before a sending agent latches.
    pub failures_before_latch: u32,

    /// Ping interval for a latched sending agent.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_execution_timeout: Duration::from_secs(60),
            default_request_timeout: Duration::from_secs(5),
            back_pressure_interval: Duration::from_secs(2),
            sending_batch_size: 100,
            failures_before_latch: 3,
            ping_interval: Duration::from_secs(1),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
