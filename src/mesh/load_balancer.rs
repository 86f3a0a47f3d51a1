use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadBalancerError {
    #[error("No instances registered for plugin '{0}'")]
    NoInstances(String),

    #[error("Instance '{instance}' already registered for plugin '{plugin}'")]
    Duplicate { plugin: String, instance: String },

    #[error("Instance '{instance}' not registered for plugin '{plugin}'")]
    UnknownInstance { plugin: String, instance: String },
}

/// Picks which instance of a plugin serves a call
pub trait LoadBalancer: Send + Sync + 'static {
    fn get_instance(&self, plugin_id: &str) -> Result<String, LoadBalancerError>;
    fn register_instance(&self, plugin_id: &str, instance: &str) -> Result<(), LoadBalancerError>;
    fn unregister_instance(&self, plugin_id: &str, instance: &str)
        -> Result<(), LoadBalancerError>;
    fn get_instances(&self, plugin_id: &str) -> Vec<String>;
}

#[derive(Default)]
struct Pool {
    instances: Vec<String>,
    next: AtomicUsize,
}

#[derive(Default)]
pub struct RoundRobinBalancer {
    pools: DashMap<String, Pool>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn get_instance(&self, plugin_id: &str) -> Result<String, LoadBalancerError> {
        let pool = self
            .pools
            .get(plugin_id)
            .filter(|p| !p.instances.is_empty())
            .ok_or_else(|| LoadBalancerError::NoInstances(plugin_id.to_string()))?;
        let idx = pool.next.fetch_add(1, Ordering::Relaxed) % pool.instances.len();
        Ok(pool.instances[idx].clone())
    }

    fn register_instance(&self, plugin_id: &str, instance: &str) -> Result<(), LoadBalancerError> {
        let mut pool = self.pools.entry(plugin_id.to_string()).or_default();
        if pool.instances.iter().any(|i| i == instance) {
            return Err(LoadBalancerError::Duplicate {
                plugin: plugin_id.to_string(),
                instance: instance.to_string(),
            });
        }
        pool.instances.push(instance.to_string());
        Ok(())
    }

    fn unregister_instance(
        &self,
        plugin_id: &str,
        instance: &str,
    ) -> Result<(), LoadBalancerError> {
        let unknown = || LoadBalancerError::UnknownInstance {
            plugin: plugin_id.to_string(),
            instance: instance.to_string(),
        };
        let empty = {
            let mut pool = self.pools.get_mut(plugin_id).ok_or_else(unknown)?;
            let before = pool.instances.len();
            pool.instances.retain(|i| i != instance);
            if pool.instances.len() == before {
                return Err(unknown());
            }
            pool.instances.is_empty()
        };
        if empty {
            self.pools.remove_if(plugin_id, |_, p| p.instances.is_empty());
        }
        Ok(())
    }

    fn get_instances(&self, plugin_id: &str) -> Vec<String> {
        self.pools
            .get(plugin_id)
            .map(|p| p.instances.clone())
            .unwrap_or_default()
    }
}
