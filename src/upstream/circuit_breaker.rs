//! Circuit breaker guarding upstream assistant calls

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Entry {
    state: BreakerState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-operation circuit breaker
///
/// Operations are tracked independently, so a failing `stream_run` does not
/// block `post_message`.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    entries: Mutex<HashMap<&'static str, Entry>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<&'static str, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether calls for `operation` should be rejected right now.
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open and
    /// lets the call through as a probe.
    pub fn is_open(&self, operation: &'static str) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(operation).or_default();

        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => match entry.opened_at {
                Some(opened_at) if opened_at.elapsed() >= self.config.reset_timeout => {
                    entry.state = BreakerState::HalfOpen;
                    false
                }
                _ => true,
            },
        }
    }

    pub fn mark_success(&self, operation: &'static str) {
        let mut entries = self.lock();
        *entries.entry(operation).or_default() = Entry::default();
    }

    pub fn mark_failure(&self, operation: &'static str) {
        let mut entries = self.lock();
        let entry = entries.entry(operation).or_default();
        entry.consecutive_failures += 1;

        // A failed half-open probe reopens immediately
        if entry.state == BreakerState::HalfOpen
            || entry.consecutive_failures >= self.config.failure_threshold
        {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self, operation: &'static str) -> BreakerState {
        self.lock()
            .get(operation)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn failure_count(&self, operation: &'static str) -> usize {
        self.lock()
            .get(operation)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}
