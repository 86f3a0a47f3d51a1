use std::io;
use std::time::Duration;
use thiserror::Error;

pub use crate::discovery::RegistryError;
pub use crate::mesh::circuit_breaker::CircuitBreakerError;
pub use crate::plugin::loader::LoaderError;
pub use crate::plugin::PluginError;
pub use crate::ratelimit::RateLimitError;
pub use crate::sandbox::SandboxError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin unhealthy: {0}")]
    Unhealthy(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(#[from] RateLimitError),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(#[from] CircuitBreakerError),

    #[error("Plugin request failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),

    #[error("Plugin limit reached: {0}")]
    PluginLimit(usize),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin '{plugin}' depends on '{service}' which is not loaded")]
    MissingDependency { plugin: String, service: String },

    #[error("Feature '{0}' is disabled")]
    FeatureDisabled(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("plugin '{plugin}' failed: {source}")]
    Failed {
        plugin: String,
        #[source]
        source: PluginError,
    },

    #[error("plugin '{plugin}' timed out after {timeout_ms}ms")]
    Timeout { plugin: String, timeout_ms: u64 },
}

impl GatewayError {
    /// HTTP-equivalent status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Config(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::Unhealthy(_) => 503,
            GatewayError::RateLimited(e) => e.status_code(),
            GatewayError::CircuitOpen(_) => 503,
            GatewayError::Dispatch(DispatchError::Timeout { .. }) => 504,
            GatewayError::Dispatch(_) => 500,
            GatewayError::Registry(_) => 502,
            GatewayError::Loader(_) => 500,
            GatewayError::Plugin(_) => 500,
            GatewayError::Io(_) | GatewayError::Serialization(_) => 500,
        }
    }

    /// Machine-readable rejection reason.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::Config(ConfigError::PluginLimit(_)) => "plugin_limit_reached",
            GatewayError::Config(ConfigError::AlreadyLoaded(_)) => "plugin_already_loaded",
            GatewayError::Config(ConfigError::FeatureDisabled(_)) => "feature_disabled",
            GatewayError::Config(_) => "invalid_config",
            GatewayError::NotFound(_) => "plugin_not_found",
            GatewayError::Unhealthy(_) => "plugin_unhealthy",
            GatewayError::RateLimited(e) => e.reason(),
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::Dispatch(DispatchError::Timeout { .. }) => "dispatch_timeout",
            GatewayError::Dispatch(_) => "dispatch_failed",
            GatewayError::Registry(_) => "registry_unavailable",
            GatewayError::Loader(_) => "load_failed",
            GatewayError::Plugin(_) => "plugin_error",
            GatewayError::Io(_) => "io_error",
            GatewayError::Serialization(_) => "serialization_error",
        }
    }

    /// Backoff hint for rejections that clear on their own.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited(e) => e.retry_after(),
            GatewayError::CircuitOpen(CircuitBreakerError::Open { retry_after, .. }) => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl warp::reject::Reject for GatewayError {}
