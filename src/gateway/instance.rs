use crate::plugin::{
    HealthCheck, HealthStatus, Plugin, PluginConfig, PluginInfo, PluginMetrics, PluginStatus,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct InstanceState {
    info: PluginInfo,
    last_seen: DateTime<Utc>,
    health: HealthCheck,
    last_request_time: Option<DateTime<Utc>>,
}

/// A loaded plugin as the gateway holds it
///
/// Hot-path counters are atomics; status, health and timestamps sit behind a
/// per-instance mutex, so requests to different plugins never share a lock.
pub struct PluginInstance {
    id: String,
    config: PluginConfig,
    plugin: Arc<dyn Plugin>,
    state: Mutex<InstanceState>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    total_response_micros: AtomicU64,
    loaded_at: Instant,
}

impl PluginInstance {
    pub fn new(
        id: String,
        config: PluginConfig,
        plugin: Arc<dyn Plugin>,
        info: PluginInfo,
        health: HealthCheck,
    ) -> Self {
        Self {
            id,
            config,
            plugin,
            state: Mutex::new(InstanceState {
                info,
                last_seen: Utc::now(),
                health,
                last_request_time: None,
            }),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_response_micros: AtomicU64::new(0),
            loaded_at: Instant::now(),
        }
    }

    fn state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn status(&self) -> PluginStatus {
        self.state().info.status
    }

    pub fn set_status(&self, status: PluginStatus) {
        let mut state = self.state();
        if state.info.status != status {
            state.info.status = status;
            state.info.updated_at = Utc::now();
        }
    }

    pub fn info(&self) -> PluginInfo {
        self.state().info.clone()
    }

    pub fn health(&self) -> HealthCheck {
        self.state().health.clone()
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.state().last_seen
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&self, at: DateTime<Utc>) {
        self.state().last_seen = at;
    }

    pub fn health_is_stale(&self, now: DateTime<Utc>) -> bool {
        self.state().health.is_stale(now)
    }

    /// Store a health-check result and move between `Active` and `Failed`
    /// accordingly. Returns `(before, after)`.
    pub fn record_health(
        &self,
        status: HealthStatus,
        now: DateTime<Utc>,
    ) -> (PluginStatus, PluginStatus) {
        let mut state = self.state();
        let before = state.info.status;
        let healthy = status.is_healthy();
        state.health.status = status;
        state.health.last_check = now;

        let after = match (before, healthy) {
            (PluginStatus::Active, false) => PluginStatus::Failed,
            (PluginStatus::Failed, true) => PluginStatus::Active,
            (other, _) => other,
        };
        if healthy {
            state.last_seen = now;
        }
        if after != before {
            state.info.status = after;
            state.info.updated_at = now;
        }
        (before, after)
    }

    /// Routable: active and last health check passed.
    pub fn is_routable(&self) -> bool {
        let state = self.state();
        state.info.status == PluginStatus::Active && state.health.status.is_healthy()
    }

    pub fn record_request(&self, elapsed: Duration, success: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_response_micros
            .fetch_add(micros, Ordering::Relaxed);

        let now = Utc::now();
        let mut state = self.state();
        state.last_request_time = Some(now);
        if success {
            state.last_seen = now;
        }
    }

    /// Gateway-side counters merged with what the plugin reports about itself.
    pub fn metrics(&self) -> PluginMetrics {
        let reported = self.plugin.metrics();
        let requests = self.request_count.load(Ordering::Relaxed);
        let total = self.total_response_micros.load(Ordering::Relaxed);
        let average_ms = if requests == 0 {
            0.0
        } else {
            total as f64 / requests as f64 / 1000.0
        };

        PluginMetrics {
            request_count: requests,
            error_count: self.error_count.load(Ordering::Relaxed),
            response_time_ms: average_ms,
            cpu_usage: reported.cpu_usage,
            memory_usage_mb: reported.memory_usage_mb,
            active_connections: reported.active_connections,
            last_request_time: self.state().last_request_time,
            uptime_seconds: self.loaded_at.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::EchoPlugin;

    fn instance() -> PluginInstance {
        let plugin = Arc::new(EchoPlugin::new());
        let info = plugin.info().with_status(PluginStatus::Active);
        PluginInstance::new(
            "echo".into(),
            PluginConfig::native("echo", "echo"),
            plugin,
            info,
            HealthCheck::new(Duration::from_secs(30), Duration::from_secs(5)),
        )
    }

    #[test]
    fn test_health_transitions() {
        let inst = instance();
        assert!(inst.is_routable());

        let now = Utc::now();
        let (before, after) = inst.record_health(HealthStatus::unhealthy("down"), now);
        assert_eq!((before, after), (PluginStatus::Active, PluginStatus::Failed));
        assert!(!inst.is_routable());

        let (_, after) = inst.record_health(HealthStatus::healthy(), now);
        assert_eq!(after, PluginStatus::Active);
        assert!(inst.is_routable());

        // Stopped instances are not revived by a healthy check.
        inst.set_status(PluginStatus::Stopped);
        let (_, after) = inst.record_health(HealthStatus::healthy(), now);
        assert_eq!(after, PluginStatus::Stopped);
    }

    #[test]
    fn test_request_counters() {
        let inst = instance();
        inst.record_request(Duration::from_millis(10), true);
        inst.record_request(Duration::from_millis(30), false);

        let m = inst.metrics();
        assert_eq!(m.request_count, 2);
        assert_eq!(m.error_count, 1);
        assert!((m.response_time_ms - 20.0).abs() < 0.01);
        assert!(m.last_request_time.is_some());
    }
}
