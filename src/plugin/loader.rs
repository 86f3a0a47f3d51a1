//! Plugin loading
//!
//! Resolves a [`PluginConfig`] into a live [`Plugin`]. A load either yields a
//! plugin or fails with every reservation it made (resource budget, sandbox)
//! released again.

use super::{EchoPlugin, Plugin, PluginConfig, PluginError, ProcessPlugin, ResourceLimits, RuntimeKind};
use crate::sandbox::{SandboxError, SandboxManager};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Runtime '{runtime}' is not supported by this loader")]
    UnsupportedRuntime { runtime: String },

    #[error("No native factory registered for '{0}'")]
    UnknownFactory(String),

    #[error("Plugin path is not a file: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("Resource limits cannot be satisfied: {0}")]
    ResourceLimits(String),

    #[error("Plugin already loaded by loader: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin not loaded by loader: {0}")]
    NotLoaded(String),

    #[error("Failed to instantiate plugin: {0}")]
    Instantiate(#[from] PluginError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

#[async_trait]
pub trait PluginLoader: Send + Sync + 'static {
    async fn start(&self) -> Result<(), LoaderError>;
    async fn stop(&self) -> Result<(), LoaderError>;
    async fn load_plugin(
        &self,
        plugin_id: &str,
        config: &PluginConfig,
    ) -> Result<Arc<dyn Plugin>, LoaderError>;
    async fn unload_plugin(&self, plugin_id: &str) -> Result<(), LoaderError>;
    fn list_loaded_plugins(&self) -> Vec<String>;
}

/// Constructor for an in-process plugin
pub type PluginFactory = Arc<dyn Fn(&PluginConfig) -> Arc<dyn Plugin> + Send + Sync>;

/// Host budget shared by every plugin the loader instantiates. Zero means
/// unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoaderLimits {
    pub max_cpu_cores: f64,
    pub max_memory_mb: u64,
}

#[derive(Debug, Default)]
struct Allocation {
    cpu_cores: f64,
    memory_mb: u64,
}

struct LoadedPlugin {
    resources: ResourceLimits,
    sandboxed: bool,
}

/// Loader for native factories and external process plugins
pub struct DefaultPluginLoader {
    factories: DashMap<String, PluginFactory>,
    limits: LoaderLimits,
    allocation: Mutex<Allocation>,
    loaded: DashMap<String, LoadedPlugin>,
    sandbox_manager: Option<Arc<dyn SandboxManager>>,
}

impl DefaultPluginLoader {
    pub fn new(limits: LoaderLimits) -> Self {
        Self {
            factories: DashMap::new(),
            limits,
            allocation: Mutex::new(Allocation::default()),
            loaded: DashMap::new(),
            sandbox_manager: None,
        }
    }

    /// Loader with the built-in plugins registered.
    pub fn with_builtins(limits: LoaderLimits) -> Self {
        let loader = Self::new(limits);
        loader.register_factory("echo", Arc::new(|_: &PluginConfig| {
            Arc::new(EchoPlugin::new()) as Arc<dyn Plugin>
        }));
        loader
    }

    pub fn with_sandbox_manager(mut self, manager: Arc<dyn SandboxManager>) -> Self {
        self.sandbox_manager = Some(manager);
        self
    }

    /// Register a native plugin constructor under `name` (matched against
    /// `PluginConfig::name`).
    pub fn register_factory(&self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn allocated(&self) -> (f64, u64) {
        self.allocation
            .lock()
            .map(|a| (a.cpu_cores, a.memory_mb))
            .unwrap_or((0.0, 0))
    }

    fn reserve(&self, plugin_id: &str, wanted: &ResourceLimits) -> Result<(), LoaderError> {
        let mut alloc = self
            .allocation
            .lock()
            .map_err(|_| LoaderError::ResourceLimits("allocation lock poisoned".into()))?;

        if self.limits.max_cpu_cores > 0.0
            && alloc.cpu_cores + wanted.cpu_cores > self.limits.max_cpu_cores
        {
            return Err(LoaderError::ResourceLimits(format!(
                "plugin '{}' wants {} cpu cores, {} of {} available",
                plugin_id,
                wanted.cpu_cores,
                self.limits.max_cpu_cores - alloc.cpu_cores,
                self.limits.max_cpu_cores
            )));
        }
        if self.limits.max_memory_mb > 0
            && alloc.memory_mb + wanted.memory_mb > self.limits.max_memory_mb
        {
            return Err(LoaderError::ResourceLimits(format!(
                "plugin '{}' wants {}MB memory, {}MB of {}MB available",
                plugin_id,
                wanted.memory_mb,
                self.limits.max_memory_mb.saturating_sub(alloc.memory_mb),
                self.limits.max_memory_mb
            )));
        }

        alloc.cpu_cores += wanted.cpu_cores;
        alloc.memory_mb += wanted.memory_mb;
        Ok(())
    }

    fn release(&self, released: &ResourceLimits) {
        if let Ok(mut alloc) = self.allocation.lock() {
            alloc.cpu_cores = (alloc.cpu_cores - released.cpu_cores).max(0.0);
            alloc.memory_mb = alloc.memory_mb.saturating_sub(released.memory_mb);
        }
    }

    async fn discard_sandbox(&self, plugin_id: &str) {
        if let Some(manager) = &self.sandbox_manager {
            if let Err(e) = manager.destroy_sandbox(plugin_id).await {
                tracing::warn!(plugin_id = %plugin_id, error = %e, "Failed to destroy sandbox");
            }
        }
    }

    /// Check that the runtime can be resolved before anything is allocated.
    fn resolve(&self, config: &PluginConfig) -> Result<Option<PluginFactory>, LoaderError> {
        match config.runtime {
            RuntimeKind::Native => self
                .factories
                .get(&config.name)
                .map(|f| Some(f.value().clone()))
                .ok_or_else(|| LoaderError::UnknownFactory(config.name.clone())),
            RuntimeKind::Process | RuntimeKind::Wasm | RuntimeKind::Container => {
                let path = config
                    .path
                    .clone()
                    .ok_or_else(|| LoaderError::MissingPath(PathBuf::new()))?;
                if !path.is_file() {
                    return Err(LoaderError::MissingPath(path));
                }
                if config.runtime != RuntimeKind::Process {
                    return Err(LoaderError::UnsupportedRuntime {
                        runtime: config.runtime.as_str().to_string(),
                    });
                }
                Ok(None)
            }
        }
    }

    async fn instantiate(
        &self,
        plugin_id: &str,
        config: &PluginConfig,
        factory: Option<PluginFactory>,
    ) -> Result<Arc<dyn Plugin>, LoaderError> {
        if let Some(factory) = factory {
            return Ok(factory(config));
        }
        // resolve() guarantees a path for non-native runtimes
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| LoaderError::MissingPath(PathBuf::new()))?;
        let interpreter = config.metadata.get("interpreter").map(PathBuf::from);
        let plugin = ProcessPlugin::spawn(plugin_id, path, interpreter.as_deref()).await?;
        Ok(Arc::new(plugin))
    }
}

#[async_trait]
impl PluginLoader for DefaultPluginLoader {
    async fn start(&self) -> Result<(), LoaderError> {
        tracing::debug!(factories = self.factories.len(), "Plugin loader started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), LoaderError> {
        let ids = self.list_loaded_plugins();
        for id in ids {
            if let Err(e) = self.unload_plugin(&id).await {
                tracing::warn!(plugin_id = %id, error = %e, "Failed to release plugin on loader stop");
            }
        }
        Ok(())
    }

    async fn load_plugin(
        &self,
        plugin_id: &str,
        config: &PluginConfig,
    ) -> Result<Arc<dyn Plugin>, LoaderError> {
        if self.loaded.contains_key(plugin_id) {
            return Err(LoaderError::AlreadyLoaded(plugin_id.to_string()));
        }

        let factory = self.resolve(config)?;
        self.reserve(plugin_id, &config.resources)?;

        let mut sandboxed = false;
        if let (Some(sandbox_config), Some(manager)) = (&config.sandbox, &self.sandbox_manager) {
            if let Err(e) = manager
                .create_sandbox(plugin_id, sandbox_config.clone())
                .await
            {
                self.release(&config.resources);
                return Err(e.into());
            }
            sandboxed = true;
        }

        let plugin = match self.instantiate(plugin_id, config, factory).await {
            Ok(plugin) => plugin,
            Err(e) => {
                if sandboxed {
                    self.discard_sandbox(plugin_id).await;
                }
                self.release(&config.resources);
                return Err(e);
            }
        };

        self.loaded.insert(
            plugin_id.to_string(),
            LoadedPlugin {
                resources: config.resources,
                sandboxed,
            },
        );
        tracing::debug!(
            plugin_id = %plugin_id,
            runtime = config.runtime.as_str(),
            sandboxed,
            "Plugin instantiated"
        );
        Ok(plugin)
    }

    async fn unload_plugin(&self, plugin_id: &str) -> Result<(), LoaderError> {
        let (_, loaded) = self
            .loaded
            .remove(plugin_id)
            .ok_or_else(|| LoaderError::NotLoaded(plugin_id.to_string()))?;
        self.release(&loaded.resources);
        if loaded.sandboxed {
            self.discard_sandbox(plugin_id).await;
        }
        Ok(())
    }

    fn list_loaded_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loaded.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
