//! Per-path failure gate.
//!
//! After `threshold` consecutive failures the breaker opens and saves to
//! that path fail fast without touching the disk.  Once `cooldown` has
//! elapsed since the last failure the breaker closes again on its own.
//! Any success resets the count.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_count: u32,
    last_failure: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_open(&self, now: Instant) -> bool {
        if self.failure_count < self.threshold {
            return false;
        }
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) < self.cooldown,
            None => false,
        }
    }

    /// Gate an attempt.  An expired open breaker closes here.
    pub fn allow(&mut self, now: Instant) -> bool {
        if self.is_open(now) {
            return false;
        }
        if self.failure_count >= self.threshold {
            self.failure_count = 0;
            self.last_failure = None;
        }
        true
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
    }

    /// Returns `true` when this failure opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        self.failure_count == self.threshold
    }
}

/// Breakers keyed by normalized path.  Lives inside the save manager's state
/// table so it shares that lock.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: HashMap<PathBuf, CircuitBreaker>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: HashMap::new(),
            threshold,
            cooldown,
        }
    }

    pub fn allow(&mut self, path: &Path, now: Instant) -> bool {
        match self.breakers.get_mut(path) {
            Some(breaker) => breaker.allow(now),
            None => true,
        }
    }

    pub fn record_success(&mut self, path: &Path) {
        // Healthy paths carry no entry.
        self.breakers.remove(path);
    }

    pub fn record_failure(&mut self, path: &Path, now: Instant) {
        let (threshold, cooldown) = (self.threshold, self.cooldown);
        let breaker = self
            .breakers
            .entry(path.to_path_buf())
            .or_insert_with(|| CircuitBreaker::new(threshold, cooldown));
        if breaker.record_failure(now) {
            warn!(
                path = %path.display(),
                failures = breaker.failure_count(),
                cooldown_secs = cooldown.as_secs(),
                "circuit opened; saves to this path fail fast until the cooldown elapses"
            );
        }
    }

    pub fn failure_count(&self, path: &Path) -> u32 {
        self.breakers.get(path).map(CircuitBreaker::failure_count).unwrap_or(0)
    }
}
