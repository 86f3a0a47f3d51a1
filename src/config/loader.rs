use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const ENV_PREFIX: &str = "PLUGIN_GATEWAY_";
const PROVIDERS: &[&str] = &["memory", "consul"];
const FLAG_PROVIDERS: &[&str] = &["static"];

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("plugin-gateway.toml"))
        .merge(Json::file("plugin-gateway.json"))
        .merge(Yaml::file("plugin-gateway.yaml"))
        .merge(Yaml::file("plugin-gateway.yml"))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.max_plugins == 0 {
        return Err(ConfigError::Validation("maxPlugins must be greater than 0".into()).into());
    }
    if config.plugin_timeout_ms == 0 {
        return Err(ConfigError::Validation("pluginTimeoutMs must be greater than 0".into()).into());
    }

    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "circuitBreaker.failureThreshold must be greater than 0".into(),
        )
        .into());
    }
    if cb.half_open_limit == 0 {
        return Err(ConfigError::Validation(
            "circuitBreaker.halfOpenLimit must be greater than 0".into(),
        )
        .into());
    }

    if config.rate_limiting.window_ms == 0 {
        return Err(
            ConfigError::Validation("rateLimiting.windowMs must be greater than 0".into()).into(),
        );
    }

    let guard = &config.request_guard;
    if guard.global_ip_window_seconds == 0
        || guard.user_window_seconds == 0
        || guard.ddos_window_seconds == 0
    {
        return Err(ConfigError::Validation(
            "requestGuard windows must be greater than 0".into(),
        )
        .into());
    }
    for limit in &guard.endpoint_limits {
        crate::ratelimit::EndpointLimit::parse(limit)?;
    }

    let http = &config.http;
    if http.enabled && http.admin_enabled && http.host == http.admin_host && http.port == http.admin_port {
        return Err(ConfigError::Validation(format!(
            "http.adminPort {} collides with the proxy listener",
            http.admin_port
        ))
        .into());
    }

    if !FLAG_PROVIDERS.contains(&config.feature_flags.provider.as_str()) {
        return Err(ConfigError::Validation(format!(
            "Unknown feature flag provider '{}', expected one of {:?}",
            config.feature_flags.provider, FLAG_PROVIDERS
        ))
        .into());
    }

    if !PROVIDERS.contains(&config.discovery.provider.as_str()) {
        return Err(ConfigError::Validation(format!(
            "Unknown discovery provider '{}', expected one of {:?}",
            config.discovery.provider, PROVIDERS
        ))
        .into());
    }
    if config.discovery.provider == "consul"
        && url::Url::parse(&config.discovery.address).is_err()
    {
        return Err(ConfigError::Validation(format!(
            "discovery.address '{}' is not a valid URL",
            config.discovery.address
        ))
        .into());
    }

    if !config.routing.prefix.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "routing.prefix '{}' must start with '/'",
            config.routing.prefix
        ))
        .into());
    }
    let mut prefixes = HashSet::new();
    for (prefix, plugin) in &config.routing.routes {
        if !prefix.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "Route '{}' for plugin '{}' must start with '/'",
                prefix, plugin
            ))
            .into());
        }
        let normalized = prefix.trim_end_matches('/');
        if !prefixes.insert(normalized.to_string()) {
            return Err(ConfigError::Validation(format!(
                "Route prefix '{}' is declared more than once",
                prefix
            ))
            .into());
        }
    }

    let mut ids = HashSet::new();
    for plugin in &config.plugins {
        plugin.validate()?;
        if !ids.insert(plugin.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' is configured more than once",
                plugin.id
            ))
            .into());
        }
    }
    if config.plugins.len() > config.max_plugins {
        return Err(ConfigError::Validation(format!(
            "{} plugins configured but maxPlugins is {}",
            config.plugins.len(),
            config.max_plugins
        ))
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.discovery.address = substitute_env_vars(&config.discovery.address)?;

    for plugin in config.plugins.iter_mut() {
        if let Some(path) = &plugin.path {
            let substituted = substitute_env_vars(&path.to_string_lossy())?;
            plugin.path = Some(PathBuf::from(substituted));
        }
        for (_, value) in plugin.metadata.iter_mut() {
            *value = substitute_env_vars(value)?;
        }
    }

    Ok(config)
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env pattern"))
}

pub(crate) fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in env_pattern().captures_iter(input) {
        let expr = &cap[1];
        let value = match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).map_err(|_| {
                ConfigError::EnvVar(format!("Environment variable '{}' not found", expr))
            })?,
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
