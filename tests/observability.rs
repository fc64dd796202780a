//! Runs in its own test binary: `init_tracing` installs the process-global
//! subscriber, which would otherwise collide with `#[traced_test]` unit tests.

use courier_core::observability::{init_tracing, init_tracing_with};
use courier_core::types::ObservabilityConfig;

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing_with(&ObservabilityConfig {
        log_level: "debug".to_string(),
        json_logs: true,
    });
}
