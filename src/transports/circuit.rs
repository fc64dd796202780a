//! Failure-rate circuit breaker for listening endpoints.
//!
//! Sliding time window of execution outcomes. The breaker trips when the
//! window holds at least `minimum_threshold` samples and the failure share
//! reaches `failure_percentage_threshold`. A trip clears the window so the
//! restarted listener is judged on fresh samples.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::ExecutionOutcome;
use crate::routing::CircuitBreakerOptions;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    failed: bool,
}

/// Rolling outcome window.
#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    samples: Mutex<VecDeque<Sample>>,
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pause_time(&self) -> Duration {
        self.options.pause_time
    }

    /// Record an outcome. Returns `true` when this sample trips the breaker.
    pub fn record(&self, outcome: ExecutionOutcome) -> bool {
        self.record_at(outcome, Instant::now())
    }

    fn record_at(&self, outcome: ExecutionOutcome, now: Instant) -> bool {
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while let Some(oldest) = samples.front() {
            if now.saturating_duration_since(oldest.at) > self.options.tracking_period {
                samples.pop_front();
            } else {
                break;
            }
        }
        samples.push_back(Sample {
            at: now,
            failed: outcome == ExecutionOutcome::Failed,
        });

        let total = samples.len();
        if total < self.options.minimum_threshold.max(1) {
            return false;
        }
        let failures = samples.iter().filter(|s| s.failed).count();
        let percentage = failures * 100 / total;
        if percentage >= usize::from(self.options.failure_percentage_threshold) {
            tracing::warn!(
                "circuit_breaker_tripped: samples={}, failures={}, percentage={}",
                total,
                failures,
                percentage
            );
            samples.clear();
            return true;
        }
        false
    }

    /// Failure share of the current window, 0-100.
    pub fn failure_percentage(&self) -> usize {
        let samples = self
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if samples.is_empty() {
            return 0;
        }
        samples.iter().filter(|s| s.failed).count() * 100 / samples.len()
    }
}
