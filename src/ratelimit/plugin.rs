//! Plugin-scoped limits enforced by the gateway after routing

use super::{RateLimitDecision, RateLimitError, SlidingWindow};
use crate::config::RateLimitingConfig;
use crate::plugin::PluginEndpoint;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginLimit {
    pub capacity: u32,
    pub window: Duration,
}

pub struct PluginRateLimiter {
    default_limit: PluginLimit,
    overrides: DashMap<String, PluginLimit>,
    windows: SlidingWindow,
}

impl PluginRateLimiter {
    pub fn new(config: &RateLimitingConfig) -> Self {
        Self {
            default_limit: PluginLimit {
                capacity: config.capacity(),
                window: config.window(),
            },
            overrides: DashMap::new(),
            windows: SlidingWindow::new(),
        }
    }

    pub fn get_limit(&self, plugin_id: &str) -> PluginLimit {
        self.overrides
            .get(plugin_id)
            .map(|l| *l)
            .unwrap_or(self.default_limit)
    }

    pub fn set_limit(&self, plugin_id: &str, limit: PluginLimit) {
        self.overrides.insert(plugin_id.to_string(), limit);
    }

    pub fn allow(&self, plugin_id: &str) -> Result<RateLimitDecision, RateLimitError> {
        self.allow_at(plugin_id, Instant::now())
    }

    pub fn allow_at(
        &self,
        plugin_id: &str,
        now: Instant,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let limit = self.get_limit(plugin_id);
        self.windows
            .check_at(&format!("plugin:{plugin_id}"), limit.capacity, limit.window, now)
            .into_result(format!("plugin {plugin_id}"))
    }

    /// Per-minute limit declared on one of the plugin's endpoints. Keyed by
    /// user when the endpoint requires auth and a user is known.
    pub fn allow_endpoint_at(
        &self,
        plugin_id: &str,
        endpoint: &PluginEndpoint,
        user_id: Option<&str>,
        now: Instant,
    ) -> Result<Option<RateLimitDecision>, RateLimitError> {
        if endpoint.rate_limit == 0 {
            return Ok(None);
        }
        let identifier = match (endpoint.auth, user_id) {
            (true, Some(user)) => format!("user:{user}"),
            _ => "plugin".to_string(),
        };
        let key = format!(
            "plugin:{}:endpoint:{}:{}:{}",
            plugin_id, endpoint.method, endpoint.path, identifier
        );
        self.windows
            .check_at(&key, endpoint.rate_limit, Duration::from_secs(60), now)
            .into_result(format!("endpoint {} {}", endpoint.method, endpoint.path))
            .map(Some)
    }

    /// Forget every window and override belonging to `plugin_id`.
    pub fn reset(&self, plugin_id: &str) {
        self.windows.remove(&format!("plugin:{plugin_id}"));
        self.windows.remove_prefix(&format!("plugin:{plugin_id}:"));
        self.overrides.remove(plugin_id);
    }

    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.windows.sweep_expired(now)
    }
}
