//! Plugin contract and runtime adapters
//!
//! Every plugin, whatever runtime it lives in, is driven through the single
//! [`Plugin`] capability trait. The loader picks the adapter at load time:
//!
//! - **native**: in-process plugins produced by factories injected into the
//!   loader (see [`loader::DefaultPluginLoader::register_factory`])
//! - **process**: an external executable spoken to over stdin/stdout with
//!   newline-delimited JSON (see [`process::ProcessPlugin`])
//!
//! # Modules
//!
//! - `schema`: request/response/event wire types and status snapshots
//! - `config`: immutable plugin descriptors
//! - `loader`: resolves a descriptor into a running plugin
//! - `process`: external process adapter
//! - `builtin`: plugins shipped with the gateway

use async_trait::async_trait;
use thiserror::Error;

pub mod builtin;
pub mod config;
pub mod loader;
pub mod process;
pub mod schema;

pub use builtin::EchoPlugin;
pub use config::{
    FeatureFlag, PluginConfig, PluginDependency, PluginEndpoint, ResourceLimits, RuntimeKind,
};
pub use loader::{DefaultPluginLoader, LoaderLimits, PluginFactory, PluginLoader};
pub use process::ProcessPlugin;
pub use schema::{
    DomainEvent, HealthCheck, HealthState, HealthStatus, PluginInfo, PluginMetrics, PluginRequest,
    PluginResponse, PluginStatus,
};

/// Capability interface implemented by every plugin adapter.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError>;
    async fn start(&self) -> Result<(), PluginError>;
    async fn stop(&self) -> Result<(), PluginError>;
    async fn health_check(&self) -> HealthStatus;

    async fn handle_request(&self, req: PluginRequest) -> Result<PluginResponse, PluginError>;
    async fn handle_event(&self, event: &DomainEvent) -> Result<(), PluginError>;

    fn info(&self) -> PluginInfo;
    fn metrics(&self) -> PluginMetrics;
}

/// Plugin-specific errors
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin process failed to spawn
    #[error("Failed to spawn plugin process: {reason}")]
    SpawnFailed { reason: String },

    /// Plugin process exited or closed its pipes
    #[error("Plugin process exited: {reason}")]
    ProcessExited { reason: String },

    /// Plugin returned output that could not be decoded
    #[error("Plugin returned invalid output: {reason}")]
    InvalidOutput { reason: String },

    /// Plugin I/O error (stdin/stdout)
    #[error("Plugin I/O error: {reason}")]
    IoError { reason: String },

    /// Plugin rejected its configuration
    #[error("Plugin configuration error: {reason}")]
    ConfigError { reason: String },

    /// Plugin is not in a state that accepts the call
    #[error("Plugin not running: {state}")]
    NotRunning { state: String },

    /// Plugin-reported request failure
    #[error("Plugin request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Plugin internal error: {reason}")]
    Internal { reason: String },
}
