//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use courier_core::Config;

/// Config for a test node. Background durability loops are off; tests
/// drive recovery with `recover_now`.
pub fn config(service: &str) -> Config {
    let mut config = Config::default();
    config.node.service_name = service.to_string();
    config.node.node_id = Some(format!("{}-node", service));
    config.durability.enabled = false;
    config.messaging.default_request_timeout = Duration::from_secs(5);
    config
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition never held: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
