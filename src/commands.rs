use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::plugin::RuntimeKind;
use crate::ratelimit::RequestGuard;
use tracing::{error, info, warn};

/// Validate `config` and log what a gateway started from it would do.
pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    RequestGuard::new(&config.request_guard)?;
    info!("✓ Configuration is valid");

    info!("  Max plugins: {}", config.max_plugins);
    info!("  Plugin timeout: {}ms", config.plugin_timeout_ms);
    info!(
        "  Circuit breaker: threshold {}, open for {}ms, {} half-open trial(s)",
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.timeout_ms,
        config.circuit_breaker.half_open_limit
    );
    info!(
        "  Plugin rate limit: {} requests per {}ms",
        config.rate_limiting.capacity(),
        config.rate_limiting.window_ms
    );
    info!(
        "  Discovery: {} ({})",
        config.discovery.provider, config.discovery.address
    );
    info!(
        "  HTTP: {}:{} (enabled: {})",
        config.http.host, config.http.port, config.http.enabled
    );
    info!(
        "  Admin: {}:{} (enabled: {})",
        config.http.admin_host, config.http.admin_port, config.http.admin_enabled
    );
    info!("  Route prefix: {}", config.routing.prefix);
    for (prefix, plugin) in &config.routing.routes {
        info!("    {} -> {}", prefix, plugin);
    }
    if !config.request_guard.endpoint_limits.is_empty() {
        info!(
            "  Endpoint limits: {}",
            config.request_guard.endpoint_limits.len()
        );
    }

    info!("Checking {} preloaded plugin(s)...", config.plugins.len());
    let mut all_ok = true;
    for plugin in &config.plugins {
        info!("\n--- Plugin: {} ({}) ---", plugin.id, plugin.runtime.as_str());
        match (&plugin.runtime, &plugin.path) {
            (RuntimeKind::Native, _) => info!("  Factory: {}", plugin.name),
            (RuntimeKind::Process, Some(path)) if path.is_file() => {
                info!("  ✓ Executable: {}", path.display())
            }
            (RuntimeKind::Process, Some(path)) => {
                error!("  ✗ Executable not found: {}", path.display());
                all_ok = false;
            }
            (runtime, _) => {
                warn!("  ! Runtime '{}' cannot be loaded by this build", runtime.as_str());
                all_ok = false;
            }
        }
        for endpoint in &plugin.endpoints {
            info!("  Endpoint: {} {}", endpoint.method, endpoint.path);
        }
        for dep in &plugin.dependencies {
            if !config.plugins.iter().any(|p| p.id == dep.service) {
                error!("  ✗ Dependency '{}' is not preloaded", dep.service);
                all_ok = false;
            }
        }
    }

    if all_ok {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(ConfigError::Validation("One or more plugins failed checks".to_string()).into())
    }
}
