use crate::discovery::{DiscoveryRegistry, PluginEvent, RegistryError};
use crate::plugin::{
    DefaultPluginLoader, DomainEvent, HealthStatus, LoaderLimits, Plugin, PluginConfig,
    PluginError, PluginInfo, PluginMetrics, PluginRequest, PluginResponse, PluginStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Scriptable plugin for gateway tests
#[derive(Default)]
pub struct MockPlugin {
    pub name: String,
    pub fail_requests: AtomicBool,
    pub fail_events: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub unhealthy: AtomicBool,
    /// Artificial latency added to every request, in milliseconds
    pub delay_ms: AtomicU64,
    pub requests: AtomicU64,
    pub events: AtomicU64,
    pub health_checks: AtomicU64,
    pub stopped: AtomicBool,
}

impl MockPlugin {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_requests.store(failing, Ordering::SeqCst);
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    async fn initialize(&self, _config: &PluginConfig) -> Result<(), PluginError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), PluginError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PluginError::Internal {
                reason: "start refused".into(),
            });
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.stopped.store(true, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(PluginError::Internal {
                reason: "stop refused".into(),
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.unhealthy.load(Ordering::SeqCst) {
            HealthStatus::unhealthy("mock marked unhealthy")
        } else {
            HealthStatus::healthy()
        }
    }

    async fn handle_request(&self, req: PluginRequest) -> Result<PluginResponse, PluginError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(PluginError::RequestFailed {
                reason: "mock failure".into(),
            });
        }
        Ok(PluginResponse::ok(json!({ "plugin": self.name, "path": req.path })))
    }

    async fn handle_event(&self, _event: &DomainEvent) -> Result<(), PluginError> {
        self.events.fetch_add(1, Ordering::SeqCst);
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(PluginError::RequestFailed {
                reason: "event rejected".into(),
            });
        }
        Ok(())
    }

    fn info(&self) -> PluginInfo {
        let now = Utc::now();
        PluginInfo {
            id: self.name.clone(),
            name: self.name.clone(),
            version: "1.0.0".into(),
            description: "mock".into(),
            author: String::new(),
            license: String::new(),
            status: PluginStatus::Active,
            endpoints: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn metrics(&self) -> PluginMetrics {
        PluginMetrics {
            request_count: self.request_count(),
            ..Default::default()
        }
    }
}

/// Loader whose native factories hand out the given mocks by plugin name.
pub fn mock_loader(plugins: &[Arc<MockPlugin>]) -> Arc<DefaultPluginLoader> {
    let loader = DefaultPluginLoader::with_builtins(LoaderLimits::default());
    for plugin in plugins {
        let plugin = plugin.clone();
        loader.register_factory(
            &plugin.name.clone(),
            Arc::new(move |_: &PluginConfig| plugin.clone() as Arc<dyn Plugin>),
        );
    }
    Arc::new(loader)
}

/// Registry that is always down
pub struct FailingRegistry {
    events: broadcast::Sender<PluginEvent>,
}

impl FailingRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }

    fn down<T>() -> Result<T, RegistryError> {
        Err(RegistryError::Unavailable("registry offline".into()))
    }
}

#[async_trait]
impl DiscoveryRegistry for FailingRegistry {
    async fn start(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn register_plugin(&self, _plugin_id: &str, _info: &PluginInfo) -> Result<(), RegistryError> {
        Self::down()
    }

    async fn unregister_plugin(&self, _plugin_id: &str) -> Result<(), RegistryError> {
        Self::down()
    }

    async fn list_plugins(&self) -> Result<Vec<PluginInfo>, RegistryError> {
        Self::down()
    }

    async fn get_plugin(&self, _plugin_id: &str) -> Result<PluginInfo, RegistryError> {
        Self::down()
    }

    fn watch_plugins(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }
}
