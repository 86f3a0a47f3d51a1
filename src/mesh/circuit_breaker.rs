//! Per-plugin circuit breaker
//!
//! States:
//! - Closed: calls pass; consecutive failures are counted
//! - Open: calls are rejected until `timeout` has elapsed since the last failure
//! - Half-Open: up to `half_open_limit` trial calls pass; one success closes,
//!   one failure re-opens
//!
//! Each plugin id owns its own mutex, so the open → half-open transition and
//! trial-slot accounting happen inside one critical section per plugin.

use crate::config::CircuitBreakerConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit for '{plugin}' is open, retry in {}s", .retry_after.as_secs())]
    Open {
        plugin: String,
        retry_after: Duration,
    },

    #[error("circuit for '{plugin}' is half-open and all {limit} trial calls are in flight")]
    TrialsExhausted { plugin: String, limit: u32 },
}

/// Snapshot of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Trial calls admitted since entering half-open
    trials: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            trials: 0,
            last_failure: None,
            last_failure_wall: None,
        }
    }
}

/// Circuit breakers for every plugin
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: DashMap<String, Arc<Mutex<BreakerState>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    fn entry(&self, plugin_id: &str) -> Arc<Mutex<BreakerState>> {
        if let Some(existing) = self.states.get(plugin_id) {
            return existing.clone();
        }
        self.states
            .entry(plugin_id.to_string())
            .or_default()
            .clone()
    }

    fn with_state<R>(&self, plugin_id: &str, f: impl FnOnce(&mut BreakerState) -> R) -> R {
        let entry = self.entry(plugin_id);
        let mut guard = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Check whether a call to `plugin_id` may proceed.
    pub fn allow(&self, plugin_id: &str) -> Result<(), CircuitBreakerError> {
        self.allow_at(plugin_id, Instant::now())
    }

    pub fn allow_at(&self, plugin_id: &str, now: Instant) -> Result<(), CircuitBreakerError> {
        let timeout = self.config.timeout();
        let limit = self.config.half_open_limit;

        self.with_state(plugin_id, |s| {
            if s.state == CircuitState::Open {
                let since = s
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(timeout);
                if since < timeout {
                    return Err(CircuitBreakerError::Open {
                        plugin: plugin_id.to_string(),
                        retry_after: timeout - since,
                    });
                }
                s.state = CircuitState::HalfOpen;
                s.trials = 0;
                tracing::info!(plugin_id = %plugin_id, "Circuit breaker transitioning to half-open");
            }

            if s.state == CircuitState::HalfOpen {
                if s.trials >= limit {
                    return Err(CircuitBreakerError::TrialsExhausted {
                        plugin: plugin_id.to_string(),
                        limit,
                    });
                }
                s.trials += 1;
            }
            Ok(())
        })
    }

    pub fn record_success(&self, plugin_id: &str) {
        self.with_state(plugin_id, |s| {
            s.success_count = s.success_count.saturating_add(1);
            match s.state {
                CircuitState::Closed => {
                    s.failure_count = 0;
                }
                CircuitState::HalfOpen => {
                    s.state = CircuitState::Closed;
                    s.failure_count = 0;
                    s.success_count = 0;
                    s.trials = 0;
                    tracing::info!(plugin_id = %plugin_id, "Circuit breaker closed after successful trial");
                }
                // A call admitted before the breaker opened finished late.
                CircuitState::Open => {}
            }
        })
    }

    pub fn record_error(&self, plugin_id: &str) {
        self.record_error_at(plugin_id, Instant::now())
    }

    pub fn record_error_at(&self, plugin_id: &str, now: Instant) {
        let threshold = self.config.failure_threshold;
        self.with_state(plugin_id, |s| {
            s.failure_count = s.failure_count.saturating_add(1);
            s.last_failure = Some(now);
            s.last_failure_wall = Some(Utc::now());

            match s.state {
                CircuitState::Closed if s.failure_count >= threshold => {
                    s.state = CircuitState::Open;
                    tracing::warn!(
                        plugin_id = %plugin_id,
                        failure_count = s.failure_count,
                        threshold,
                        "Circuit breaker opened due to failures"
                    );
                }
                CircuitState::HalfOpen => {
                    s.state = CircuitState::Open;
                    s.trials = 0;
                    // Keep the open invariant: failure_count >= threshold.
                    s.failure_count = s.failure_count.max(threshold);
                    tracing::warn!(plugin_id = %plugin_id, "Circuit breaker re-opened after failed trial");
                }
                _ => {}
            }
        })
    }

    pub fn status(&self, plugin_id: &str) -> CircuitBreakerStatus {
        match self.states.get(plugin_id).map(|e| e.clone()) {
            Some(entry) => {
                let s = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                CircuitBreakerStatus {
                    state: s.state,
                    failure_count: s.failure_count,
                    success_count: s.success_count,
                    last_failure_time: s.last_failure_wall,
                }
            }
            None => CircuitBreakerStatus {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            },
        }
    }

    /// Forget a plugin's state (on unload).
    pub fn reset(&self, plugin_id: &str) {
        self.states.remove(plugin_id);
    }

    pub fn open_count(&self) -> usize {
        self.states
            .iter()
            .filter(|e| {
                e.value()
                    .lock()
                    .map(|s| s.state == CircuitState::Open)
                    .unwrap_or(false)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64, half_open_limit: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout_ms,
            half_open_limit,
        })
    }

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let cb = breaker(3, 30_000, 2);
        let t0 = Instant::now();

        cb.record_error_at("p", t0);
        cb.record_error_at("p", t0);
        assert_eq!(cb.status("p").state, CircuitState::Closed);
        assert!(cb.allow_at("p", t0).is_ok());

        cb.record_error_at("p", t0);
        let status = cb.status("p");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 3);
        assert!(status.last_failure_time.is_some());

        let err = cb.allow_at("p", t0 + Duration::from_secs(10)).unwrap_err();
        match err {
            CircuitBreakerError::Open { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(20));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = breaker(3, 30_000, 1);
        cb.record_error("p");
        cb.record_error("p");
        cb.record_success("p");
        cb.record_error("p");
        assert_eq!(cb.status("p").state, CircuitState::Closed);
        assert_eq!(cb.status("p").failure_count, 1);
    }

    #[test]
    fn test_half_open_admits_exactly_limit_trials() {
        let cb = breaker(3, 1_000, 2);
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_error_at("p", t0);
        }

        let later = t0 + Duration::from_millis(1_500);
        assert!(cb.allow_at("p", later).is_ok());
        assert_eq!(cb.status("p").state, CircuitState::HalfOpen);
        assert!(cb.allow_at("p", later).is_ok());
        assert!(matches!(
            cb.allow_at("p", later),
            Err(CircuitBreakerError::TrialsExhausted { limit: 2, .. })
        ));

        cb.record_success("p");
        let status = cb.status("p");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(cb.allow_at("p", later).is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens_and_restarts_clock() {
        let cb = breaker(2, 1_000, 1);
        let t0 = Instant::now();
        cb.record_error_at("p", t0);
        cb.record_error_at("p", t0);

        let t1 = t0 + Duration::from_millis(1_200);
        assert!(cb.allow_at("p", t1).is_ok());
        cb.record_error_at("p", t1);
        assert_eq!(cb.status("p").state, CircuitState::Open);
        assert!(cb.status("p").failure_count >= 2);

        // Clock restarted at t1, so t1 + 500ms is still inside the timeout.
        assert!(cb.allow_at("p", t1 + Duration::from_millis(500)).is_err());
        assert!(cb.allow_at("p", t1 + Duration::from_millis(1_000)).is_ok());
    }

    #[test]
    fn test_plugins_are_independent() {
        let cb = breaker(1, 60_000, 1);
        cb.record_error("a");
        assert!(cb.allow("a").is_err());
        assert!(cb.allow("b").is_ok());
        assert_eq!(cb.open_count(), 1);

        cb.reset("a");
        assert!(cb.allow("a").is_ok());
        assert_eq!(cb.open_count(), 0);
    }

    #[test]
    fn test_concurrent_half_open_trials_are_bounded() {
        let cb = Arc::new(breaker(1, 0, 3));
        cb.record_error("p");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || cb.allow("p").is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 3);
    }
}
