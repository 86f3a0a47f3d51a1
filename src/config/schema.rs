use crate::plugin::{LoaderLimits, PluginConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_max_plugins")]
    pub max_plugins: usize,
    #[serde(default = "default_plugin_timeout")]
    pub plugin_timeout_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub request_guard: RequestGuardConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlagConfig,
    /// Plugins loaded on start
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_half_open_limit")]
    pub half_open_limit: u32,
}

/// Plugin-wide request budget
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitingConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestGuardConfig {
    #[serde(default)]
    pub endpoint_limits: Vec<EndpointLimitConfig>,
    #[serde(default = "default_global_ip_limit")]
    pub global_ip_limit: u32,
    #[serde(default = "default_minute")]
    pub global_ip_window_seconds: u64,
    #[serde(default = "default_user_limit")]
    pub user_limit: u32,
    #[serde(default = "default_minute")]
    pub user_window_seconds: u64,
    #[serde(default = "default_ddos_threshold")]
    pub ddos_threshold: u32,
    #[serde(default = "default_minute")]
    pub ddos_window_seconds: u64,
    #[serde(default = "default_ddos_ban")]
    pub ddos_ban_seconds: u64,
    #[serde(default = "default_whitelist")]
    pub whitelist_ips: Vec<String>,
    #[serde(default)]
    pub blacklist_ips: Vec<String>,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are honored
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointLimitConfig {
    /// `METHOD:/path`, `*` suffix for prefix match
    pub pattern: String,
    pub limit: u32,
    pub window_seconds: u64,
    #[serde(default)]
    pub auth_required: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_true")]
    pub health_check: bool,
    /// Base URL of the discovery backend
    #[serde(default = "default_discovery_address")]
    pub address: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_failed_retention")]
    pub failed_retention_seconds: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default = "default_route_prefix")]
    pub prefix: String,
    /// Path prefix -> plugin id
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

/// Gateway-wide flag defaults; plugins' own flags take precedence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlagConfig {
    #[serde(default = "default_flag_provider")]
    pub provider: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_flags")]
    pub default_flags: BTreeMap<String, bool>,
}

/// Flag gating every plugin load
pub const ENABLE_PLUGINS_FLAG: &str = "enable_plugins";

/// Host budget for everything the loader instantiates; 0 is unbounded
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderConfig {
    #[serde(default)]
    pub max_cpu_cores: f64,
    #[serde(default)]
    pub max_memory_mb: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// The admin API gets its own listener, loopback unless overridden
    #[serde(default = "default_true")]
    pub admin_enabled: bool,
    #[serde(default = "default_admin_host")]
    pub admin_host: String,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

// Default value functions
fn default_max_plugins() -> usize {
    100
}

fn default_plugin_timeout() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout() -> u64 {
    30_000
}

fn default_half_open_limit() -> u32 {
    3
}

fn default_requests_per_second() -> u32 {
    1000
}

fn default_burst_size() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    1000
}

fn default_global_ip_limit() -> u32 {
    30
}

fn default_user_limit() -> u32 {
    80
}

fn default_minute() -> u64 {
    60
}

fn default_ddos_threshold() -> u32 {
    100
}

fn default_ddos_ban() -> u64 {
    30 * 60
}

fn default_whitelist() -> Vec<String> {
    vec!["127.0.0.1".into(), "::1".into(), "localhost".into()]
}

fn default_provider() -> String {
    "memory".to_string()
}

fn default_service_name() -> String {
    "plugin-gateway".to_string()
}

fn default_service_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_discovery_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_failed_retention() -> u64 {
    24 * 60 * 60
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_route_prefix() -> String {
    "/api".to_string()
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_flag_provider() -> String {
    "static".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_flags() -> BTreeMap<String, bool> {
    BTreeMap::from([(ENABLE_PLUGINS_FLAG.to_string(), true)])
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8081
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_plugins: default_max_plugins(),
            plugin_timeout_ms: default_plugin_timeout(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            request_guard: RequestGuardConfig::default(),
            discovery: DiscoveryConfig::default(),
            monitoring: MonitoringConfig::default(),
            routing: RoutingConfig::default(),
            loader: LoaderConfig::default(),
            http: HttpConfig::default(),
            feature_flags: FeatureFlagConfig::default(),
            plugins: Vec::new(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_ms: default_circuit_timeout(),
            half_open_limit: default_half_open_limit(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
            window_ms: default_window_ms(),
        }
    }
}

impl Default for RequestGuardConfig {
    fn default() -> Self {
        Self {
            endpoint_limits: Vec::new(),
            global_ip_limit: default_global_ip_limit(),
            global_ip_window_seconds: default_minute(),
            user_limit: default_user_limit(),
            user_window_seconds: default_minute(),
            ddos_threshold: default_ddos_threshold(),
            ddos_window_seconds: default_minute(),
            ddos_ban_seconds: default_ddos_ban(),
            whitelist_ips: default_whitelist(),
            blacklist_ips: Vec::new(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            service_name: default_service_name(),
            service_port: default_service_port(),
            health_check: true,
            address: default_discovery_address(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_monitor_interval(),
            failed_retention_seconds: default_failed_retention(),
            health_check_interval_seconds: default_health_check_interval(),
            health_check_timeout_seconds: default_health_check_timeout(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            prefix: default_route_prefix(),
            routes: BTreeMap::new(),
        }
    }
}

impl Default for FeatureFlagConfig {
    fn default() -> Self {
        Self {
            provider: default_flag_provider(),
            environment: default_environment(),
            default_flags: default_flags(),
        }
    }
}

impl FeatureFlagConfig {
    /// Unknown flags are off.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.default_flags.get(name).copied().unwrap_or(false)
    }

    /// Loading stays on unless `enable_plugins` is explicitly false.
    pub fn plugins_enabled(&self) -> bool {
        self.default_flags
            .get(ENABLE_PLUGINS_FLAG)
            .copied()
            .unwrap_or(true)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_http_host(),
            port: default_http_port(),
            admin_enabled: true,
            admin_host: default_admin_host(),
            admin_port: default_admin_port(),
        }
    }
}

impl Config {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }

    pub fn loader_limits(&self) -> LoaderLimits {
        LoaderLimits {
            max_cpu_cores: self.loader.max_cpu_cores,
            max_memory_mb: self.loader.max_memory_mb,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Requests admitted per window: `max(ceil(rps * window), burst, 1)`.
    pub fn capacity(&self) -> u32 {
        let per_window =
            (u64::from(self.requests_per_second) * self.window_ms).div_ceil(1000);
        let per_window = u32::try_from(per_window).unwrap_or(u32::MAX);
        per_window.max(self.burst_size).max(1)
    }
}

impl RequestGuardConfig {
    pub fn global_ip_window(&self) -> Duration {
        Duration::from_secs(self.global_ip_window_seconds)
    }

    pub fn user_window(&self) -> Duration {
        Duration::from_secs(self.user_window_seconds)
    }

    pub fn ddos_window(&self) -> Duration {
        Duration::from_secs(self.ddos_window_seconds)
    }

    pub fn ddos_ban_duration(&self) -> Duration {
        Duration::from_secs(self.ddos_ban_seconds)
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_plugins, 100);
        assert_eq!(config.plugin_timeout(), Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.half_open_limit, 3);
        assert_eq!(config.monitoring.failed_retention(), Duration::from_secs(86_400));
        assert_eq!(config.request_guard.ddos_ban_duration(), Duration::from_secs(1800));
        assert_eq!(config.routing.prefix, "/api");
    }

    #[test]
    fn test_rate_limit_capacity() {
        let mut rl = RateLimitingConfig::default();
        // 1000 rps over 1s, burst 100
        assert_eq!(rl.capacity(), 1000);

        rl.requests_per_second = 3;
        rl.window_ms = 500;
        rl.burst_size = 0;
        assert_eq!(rl.capacity(), 2);

        rl.burst_size = 10;
        assert_eq!(rl.capacity(), 10);

        rl.requests_per_second = 0;
        rl.burst_size = 0;
        assert_eq!(rl.capacity(), 1);
    }

    #[test]
    fn test_deserialize_camel_case_with_defaults() {
        let json = r#"{
            "maxPlugins": 2,
            "circuitBreaker": { "failureThreshold": 3 },
            "routing": { "routes": { "/api/v2/chat": "chat" } }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_plugins, 2);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout_ms, 30_000);
        assert_eq!(config.routing.routes.get("/api/v2/chat").map(String::as_str), Some("chat"));
        assert_eq!(config.discovery.provider, "memory");
        assert!(config.feature_flags.is_enabled(ENABLE_PLUGINS_FLAG));
    }

    #[test]
    fn test_feature_flag_overrides() {
        let json = r#"{
            "featureFlags": {
                "environment": "staging",
                "defaultFlags": { "enable_plugins": false, "beta_api": true }
            },
            "http": { "adminPort": 9091 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.feature_flags.provider, "static");
        assert_eq!(config.feature_flags.environment, "staging");
        assert!(!config.feature_flags.is_enabled(ENABLE_PLUGINS_FLAG));
        assert!(config.feature_flags.is_enabled("beta_api"));
        assert!(!config.feature_flags.is_enabled("missing"));
        assert!(!config.feature_flags.plugins_enabled());
        assert!(config.http.admin_enabled);
        assert_eq!(config.http.admin_port, 9091);
        assert!(config.request_guard.trusted_proxies.is_empty());

        let json = r#"{ "featureFlags": { "defaultFlags": { "beta_api": true } } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.feature_flags.plugins_enabled());
    }
}
