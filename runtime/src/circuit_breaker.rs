//! Per-endpoint circuit breaker.
//!
//! Prevents the knowledge orchestrator from repeatedly dialing an endpoint
//! that has been failing all process lifetime, even before its own
//! rate-limit or timeout would shed the call. Standard Closed → Open →
//! Half-Open state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("circuit open for endpoint '{endpoint_id}': {consecutive_failures} consecutive failures, recovery in {recovery_remaining:?}")]
pub struct CircuitOpenError {
    pub endpoint_id: String,
    pub consecutive_failures: u32,
    pub recovery_remaining: Duration,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
        }
    }

    pub fn check(&mut self, endpoint_id: &str) -> Result<(), CircuitOpenError> {
        match &self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 1;
                    tracing::info!(endpoint_id, "circuit transitioning to half-open");
                    Ok(())
                } else {
                    let remaining = self.config.recovery_timeout - opened_at.elapsed();
                    Err(CircuitOpenError {
                        endpoint_id: endpoint_id.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: remaining,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        endpoint_id: endpoint_id.to_string(),
                        consecutive_failures: self.failure_count,
                        recovery_remaining: Duration::from_secs(0),
                    })
                }
            }
        }
    }

    pub fn record_success(&mut self, endpoint_id: &str) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.half_open_calls = 0;
                tracing::info!(endpoint_id, "circuit recovered, now closed");
            }
            CircuitState::Open { .. } => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
            }
        }
    }

    pub fn record_failure(&mut self, endpoint_id: &str) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open { opened_at: Instant::now() };
                    tracing::warn!(endpoint_id, failures = self.failure_count, "circuit tripped open");
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open { opened_at: Instant::now() };
                self.half_open_calls = 0;
                tracing::warn!(endpoint_id, "circuit recovery failed, back to open");
            }
            CircuitState::Open { .. } => {
                self.failure_count += 1;
            }
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Registry of circuit breakers keyed by endpoint id.
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    pub async fn check(&self, endpoint_id: &str) -> Result<(), CircuitOpenError> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(endpoint_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.check(endpoint_id)
    }

    pub async fn record_success(&self, endpoint_id: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(endpoint_id) {
            breaker.record_success(endpoint_id);
        }
    }

    pub async fn record_failure(&self, endpoint_id: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers
            .entry(endpoint_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()));
        breaker.record_failure(endpoint_id);
    }

    pub async fn get_state(&self, endpoint_id: &str) -> Option<CircuitState> {
        let breakers = self.breakers.read().await;
        breakers.get(endpoint_id).map(|b| b.state().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(*cb.state(), CircuitState::Closed);
    }

    #[test]
    fn trips_after_threshold() {
        let config = CircuitBreakerConfig { failure_threshold: 3, recovery_timeout: Duration::from_secs(30), half_open_max_calls: 1 };
        let mut cb = CircuitBreaker::new(config);
        cb.record_failure("ep");
        cb.record_failure("ep");
        assert_eq!(*cb.state(), CircuitState::Closed);
        cb.record_failure("ep");
        assert!(matches!(*cb.state(), CircuitState::Open { .. }));
        assert!(cb.check("ep").is_err());
    }

    #[test]
    fn recovers_through_half_open() {
        let config = CircuitBreakerConfig { failure_threshold: 2, recovery_timeout: Duration::from_millis(1), half_open_max_calls: 1 };
        let mut cb = CircuitBreaker::new(config);
        cb.record_failure("ep");
        cb.record_failure("ep");
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.check("ep").is_ok());
        assert_eq!(*cb.state(), CircuitState::HalfOpen);
        cb.record_success("ep");
        assert_eq!(*cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_isolates_endpoints() {
        let registry = CircuitBreakerRegistry::default();
        for _ in 0..5 {
            registry.record_failure("bad").await;
        }
        assert!(registry.check("bad").await.is_err());
        assert!(registry.check("good").await.is_ok());
    }
}
