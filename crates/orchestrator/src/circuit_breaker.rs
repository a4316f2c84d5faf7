//! Prevents rapid re-provisioning attempts against engines that consistently
//! fail to come up, giving the underlying problem (VPN, image, host
//! resources) time to resolve before retrying.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    /// Wall-clock timestamp of the last recorded failure, for the status
    /// endpoint; recovery-timeout math itself uses `Instant`, which can't be
    /// rendered as ISO-8601.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
            }),
        }
    }

    /// Transitions Open -> HalfOpen once the recovery timeout has elapsed,
    /// as a side effect of checking.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed > self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!("circuit breaker moving to half-open, testing recovery");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        if inner.state != CircuitState::Closed {
            info!("circuit breaker closed, operations restored");
            inner.state = CircuitState::Closed;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(failure_count = inner.failure_count, "circuit breaker reopened, recovery test failed");
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                warn!(
                    failure_count = inner.failure_count,
                    threshold = self.failure_threshold,
                    "circuit breaker opened after consecutive failures"
                );
                inner.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.inner.lock();
        CircuitStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs(),
            last_failure_at: inner.last_failure_at,
        }
    }

    pub fn force_reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
    }
}

/// Circuit breaker classes keyed by operation type, each with its own
/// threshold/timeout. "general" and "replacement" always exist; other keys
/// fall back to "general".
pub struct CircuitBreakerManager {
    breakers: DashMap<String, CircuitBreaker>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(300), 3, Duration::from_secs(180))
    }
}

impl CircuitBreakerManager {
    pub fn new(
        general_threshold: u32,
        general_timeout: Duration,
        replacement_threshold: u32,
        replacement_timeout: Duration,
    ) -> Self {
        let breakers = DashMap::new();
        breakers.insert("general".to_string(), CircuitBreaker::new(general_threshold, general_timeout));
        breakers.insert(
            "replacement".to_string(),
            CircuitBreaker::new(replacement_threshold, replacement_timeout),
        );
        Self { breakers }
    }

    fn class_key(&self, operation_type: &str) -> String {
        if self.breakers.contains_key(operation_type) {
            operation_type.to_string()
        } else {
            "general".to_string()
        }
    }

    pub fn can_provision(&self, operation_type: &str) -> bool {
        let key = self.class_key(operation_type);
        self.breakers.get(&key).map(|b| b.can_execute()).unwrap_or(true)
    }

    pub fn record_success(&self, operation_type: &str) {
        let key = self.class_key(operation_type);
        if let Some(b) = self.breakers.get(&key) {
            b.record_success();
        }
        debug!(operation_type, "recorded successful provisioning");
    }

    pub fn record_failure(&self, operation_type: &str) {
        let key = self.class_key(operation_type);
        if let Some(b) = self.breakers.get(&key) {
            b.record_failure();
        }
        warn!(operation_type, "recorded failed provisioning");
    }

    pub fn status(&self) -> std::collections::HashMap<String, CircuitStatus> {
        self.breakers.iter().map(|e| (e.key().clone(), e.value().status())).collect()
    }

    /// Resets one class, or every class when `operation_type` is `None`.
    pub fn force_reset(&self, operation_type: Option<&str>) {
        match operation_type {
            Some(ty) => {
                if let Some(b) = self.breakers.get(ty) {
                    b.force_reset();
                    info!(operation_type = ty, "force reset circuit breaker");
                }
            }
            None => {
                for entry in self.breakers.iter() {
                    entry.value().force_reset();
                }
                info!("force reset all circuit breakers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(300));
        assert!(cb.can_execute());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_execute());
        cb.record_failure();
        assert!(!cb.can_execute());
        assert_eq!(cb.status().state, CircuitState::Open);
    }

    #[test]
    fn half_open_failure_reopens_circuit() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0));
        cb.record_failure();
        assert!(cb.can_execute(), "recovery timeout elapsed, should move to half-open");
        cb.record_failure();
        assert!(!cb.can_execute());
    }

    #[test]
    fn success_resets_failure_count_and_closes() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(300));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.can_execute(), "count should have reset after success");
    }

    #[test]
    fn manager_unknown_operation_type_falls_back_to_general() {
        let mgr = CircuitBreakerManager::default();
        assert!(mgr.can_provision("does-not-exist"));
        mgr.record_failure("does-not-exist");
        let status = mgr.status();
        assert_eq!(status.get("general").unwrap().failure_count, 1);
    }

    #[test]
    fn manager_force_reset_single_class() {
        let mgr = CircuitBreakerManager::default();
        for _ in 0..3 {
            mgr.record_failure("replacement");
        }
        assert!(!mgr.can_provision("replacement"));
        mgr.force_reset(Some("replacement"));
        assert!(mgr.can_provision("replacement"));
    }
}
