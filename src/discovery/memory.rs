use super::{DiscoveryRegistry, PluginEvent, PluginEventKind, RegistryError, WATCH_CAPACITY};
use crate::plugin::PluginInfo;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Process-local registry
pub struct InMemoryRegistry {
    plugins: DashMap<String, PluginInfo>,
    events: broadcast::Sender<PluginEvent>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            plugins: DashMap::new(),
            events,
        }
    }

    fn emit(&self, event: PluginEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl DiscoveryRegistry for InMemoryRegistry {
    async fn start(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn register_plugin(&self, plugin_id: &str, info: &PluginInfo) -> Result<(), RegistryError> {
        let previous = self.plugins.insert(plugin_id.to_string(), info.clone());
        let kind = match previous {
            Some(_) => PluginEventKind::Updated,
            None => PluginEventKind::Registered,
        };
        self.emit(PluginEvent::new(kind, plugin_id, Some(info.clone())));
        Ok(())
    }

    async fn unregister_plugin(&self, plugin_id: &str) -> Result<(), RegistryError> {
        let (_, info) = self
            .plugins
            .remove(plugin_id)
            .ok_or_else(|| RegistryError::NotFound(plugin_id.to_string()))?;
        self.emit(PluginEvent::new(
            PluginEventKind::Unregistered,
            plugin_id,
            Some(info),
        ));
        Ok(())
    }

    async fn list_plugins(&self) -> Result<Vec<PluginInfo>, RegistryError> {
        let mut plugins: Vec<PluginInfo> = self.plugins.iter().map(|e| e.value().clone()).collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plugins)
    }

    async fn get_plugin(&self, plugin_id: &str) -> Result<PluginInfo, RegistryError> {
        self.plugins
            .get(plugin_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::NotFound(plugin_id.to_string()))
    }

    fn watch_plugins(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }
}
