//! Service discovery
//!
//! The gateway mirrors every loaded plugin into a discovery registry so other
//! nodes can find it. The registry is never authoritative for routing: when it
//! fails, the gateway logs and keeps serving from its local view.

use crate::config::DiscoveryConfig;
use crate::plugin::PluginInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod consul;
pub mod memory;

pub use consul::ConsulRegistry;
pub use memory::InMemoryRegistry;

/// Buffered watch events per subscriber
pub(crate) const WATCH_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Plugin not registered: {0}")]
    NotFound(String),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Registry HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid registry entry for '{id}': {reason}")]
    Decode { id: String, reason: String },

    #[error("Invalid registry address: {0}")]
    Address(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginEventKind {
    Registered,
    Unregistered,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEvent {
    #[serde(rename = "type")]
    pub kind: PluginEventKind,
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<PluginInfo>,
    pub timestamp: DateTime<Utc>,
}

impl PluginEvent {
    pub fn new(kind: PluginEventKind, plugin_id: impl Into<String>, info: Option<PluginInfo>) -> Self {
        Self {
            kind,
            plugin_id: plugin_id.into(),
            info,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DiscoveryRegistry: Send + Sync + 'static {
    async fn start(&self) -> Result<(), RegistryError>;
    async fn stop(&self) -> Result<(), RegistryError>;
    async fn register_plugin(&self, plugin_id: &str, info: &PluginInfo) -> Result<(), RegistryError>;
    async fn unregister_plugin(&self, plugin_id: &str) -> Result<(), RegistryError>;
    async fn list_plugins(&self) -> Result<Vec<PluginInfo>, RegistryError>;
    async fn get_plugin(&self, plugin_id: &str) -> Result<PluginInfo, RegistryError>;
    /// Subscribe to registration changes
    fn watch_plugins(&self) -> broadcast::Receiver<PluginEvent>;
}

/// Build the registry named by `config.provider`.
pub fn from_config(config: &DiscoveryConfig) -> Result<Arc<dyn DiscoveryRegistry>, RegistryError> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(InMemoryRegistry::new())),
        "consul" => Ok(Arc::new(ConsulRegistry::new(config)?)),
        other => Err(RegistryError::Unavailable(format!(
            "unknown discovery provider '{other}'"
        ))),
    }
}
