//! Three-state circuit breaker protecting the upstream client.
//!
//! One mutex per breaker instance guards all state transitions, covering
//! the full `closed → open → half_open` state machine with bounded probes
//! and a monotonic clock so wall-clock drift cannot affect recovery timing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateTag {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    tag: BreakerStateTag,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    half_open_in_flight: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            tag: BreakerStateTag::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            half_open_in_flight: 0,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
            half_open_max: config.half_open_max.max(1),
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decide whether a request may proceed. May itself transition
    /// `open → half_open` as a time-driven side effect of being consulted.
    pub async fn can_execute(&self) -> bool {
        let mut state = self.state.lock().await;
        match state.tag {
            BreakerStateTag::Closed => true,
            BreakerStateTag::Open => {
                let elapsed = state.last_failure_time.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    state.tag = BreakerStateTag::HalfOpen;
                    state.half_open_in_flight = 0;
                    tracing::info!(breaker = %self.name, "recovery timeout elapsed, admitting probe");
                    state.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerStateTag::HalfOpen => {
                if state.half_open_in_flight < self.half_open_max {
                    state.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.tag = BreakerStateTag::Closed;
        state.consecutive_failures = 0;
        state.half_open_in_flight = 0;
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        match state.tag {
            BreakerStateTag::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    state.tag = BreakerStateTag::Open;
                    state.last_failure_time = Some(Instant::now());
                    tracing::warn!(breaker = %self.name, "circuit opened");
                }
            }
            BreakerStateTag::HalfOpen => {
                state.tag = BreakerStateTag::Open;
                state.last_failure_time = Some(Instant::now());
                state.consecutive_failures += 1;
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            BreakerStateTag::Open => {}
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = BreakerState::new();
    }

    #[cfg(test)]
    async fn tag(&self) -> BreakerStateTag {
        self.state.lock().await.tag
    }
}

/// Lazily creates and holds breakers by name, so a single code path can
/// multiplex several independent breakers (one per upstream, per model).
#[derive(Clone)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub async fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        if let Some(existing) = breakers.get(name) {
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(name, &self.config));
        breakers.insert(name.to_string(), breaker.clone());
        breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, recovery_secs: f64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
            half_open_max: 1,
        }
    }

    #[tokio::test]
    async fn exactly_threshold_failures_open_the_breaker() {
        let breaker = CircuitBreaker::new("test", &config(3, 60.0));
        breaker.record_failure().await;
        assert_eq!(breaker.tag().await, BreakerStateTag::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.tag().await, BreakerStateTag::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.tag().await, BreakerStateTag::Open);
    }

    #[tokio::test]
    async fn open_breaker_rejects_until_recovery_timeout() {
        let breaker = CircuitBreaker::new("test", &config(1, 0.05));
        breaker.record_failure().await;
        assert!(!breaker.can_execute().await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breaker.can_execute().await);
        assert_eq!(breaker.tag().await, BreakerStateTag::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes_breaker() {
        let breaker = CircuitBreaker::new("test", &config(1, 0.01));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);
        breaker.record_success().await;
        assert_eq!(breaker.tag().await, BreakerStateTag::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_breaker() {
        let breaker = CircuitBreaker::new("test", &config(1, 0.01));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);
        breaker.record_failure().await;
        assert_eq!(breaker.tag().await, BreakerStateTag::Open);
    }

    #[tokio::test]
    async fn half_open_probes_are_bounded() {
        let breaker = CircuitBreaker::new("test", &config(1, 0.01));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute().await);
        // Second concurrent probe while the first is in flight is rejected.
        assert!(!breaker.can_execute().await);
    }

    #[tokio::test]
    async fn registry_lazily_creates_and_reuses_breakers_by_name() {
        let registry = BreakerRegistry::new(config(5, 30.0));
        let a = registry.get("upstream-a").await;
        let a_again = registry.get("upstream-a").await;
        let b = registry.get("upstream-b").await;
        assert!(Arc::ptr_eq(&a, &a_again));
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn reset_forces_closed_and_zeroes_fields() {
        let breaker = CircuitBreaker::new("test", &config(1, 60.0));
        breaker.record_failure().await;
        assert_eq!(breaker.tag().await, BreakerStateTag::Open);
        breaker.reset().await;
        assert_eq!(breaker.tag().await, BreakerStateTag::Closed);
    }
}
