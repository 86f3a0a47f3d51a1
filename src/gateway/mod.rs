//! Plugin gateway
//!
//! Owns every loaded [`PluginInstance`] and drives each request through the
//! gates in order: route → health → endpoint limit → plugin limit → circuit
//! breaker → dispatch with timeout. Rejections never reach the plugin.
//!
//! The instance map lock is only held to read or mutate the map. Loader,
//! registry and plugin calls all happen with it released.

use crate::config::{Config, ENABLE_PLUGINS_FLAG};
use crate::discovery::{self, DiscoveryRegistry};
use crate::error::{ConfigError, DispatchError, GatewayError, Result};
use crate::mesh::{CircuitBreakerStatus, CircuitState, ServiceMesh};
use crate::plugin::{
    DefaultPluginLoader, DomainEvent, HealthCheck, HealthStatus, PluginConfig, PluginError,
    PluginInfo, PluginLoader, PluginMetrics, PluginRequest, PluginResponse, PluginStatus,
    RuntimeKind,
};
use crate::ratelimit::{RateLimitDecision, RequestGuard};
use crate::sandbox::LocalSandboxManager;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

mod instance;
mod monitor;
pub mod routing;


pub use instance::PluginInstance;
pub use monitor::MonitorReport;
pub use routing::RouteTable;

/// Releases a reserved load slot when dropped.
struct PendingSlot<'a> {
    pending: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

pub struct PluginGateway {
    config: Config,
    instances: RwLock<HashMap<String, Arc<PluginInstance>>>,
    /// Ids whose load is in flight; they count against `max_plugins`
    pending: Mutex<HashSet<String>>,
    routes: RouteTable,
    registry: Arc<dyn DiscoveryRegistry>,
    loader: Arc<dyn PluginLoader>,
    mesh: ServiceMesh,
    request_guard: RequestGuard,
    shutdown: CancellationToken,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PluginGateway {
    pub fn new(
        config: Config,
        registry: Arc<dyn DiscoveryRegistry>,
        loader: Arc<dyn PluginLoader>,
    ) -> Result<Self> {
        crate::config::validate(&config)?;
        let mesh = ServiceMesh::new(&config);
        let request_guard = RequestGuard::new(&config.request_guard)?;
        let routes = RouteTable::new(&config.routing.prefix, config.routing.routes.iter());

        Ok(Self {
            config,
            instances: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            routes,
            registry,
            loader,
            mesh,
            request_guard,
            shutdown: CancellationToken::new(),
            workers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Gateway with the configured registry provider, the built-in plugins and
    /// local sandboxes.
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = discovery::from_config(&config.discovery)?;
        let loader = DefaultPluginLoader::with_builtins(config.loader_limits())
            .with_sandbox_manager(Arc::new(LocalSandboxManager::new()));
        Self::new(config, registry, Arc::new(loader))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mesh(&self) -> &ServiceMesh {
        &self.mesh
    }

    pub fn request_guard(&self) -> &RequestGuard {
        &self.request_guard
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn registry(&self) -> &Arc<dyn DiscoveryRegistry> {
        &self.registry
    }

    /// Start collaborators, load configured and registry-known plugins and
    /// spawn the monitoring worker.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.registry.start().await?;
        self.loader.start().await?;
        self.mesh.start().await;

        for plugin in self.config.plugins.clone() {
            let id = plugin.id.clone();
            if let Err(e) = self.load_plugin(&id, plugin).await {
                tracing::error!(plugin_id = %id, error = %e, "Failed to load configured plugin");
            }
        }

        self.restore_registered_plugins().await;

        let worker = tokio::spawn(monitor::run(self.clone(), self.shutdown.child_token()));
        self.workers.lock().await.push(worker);

        tracing::info!(
            plugins = self.instances.read().await.len(),
            max_plugins = self.config.max_plugins,
            discovery = %self.config.discovery.provider,
            "Plugin gateway started"
        );
        Ok(())
    }

    /// Re-load plugins another gateway run left `active` in the registry.
    async fn restore_registered_plugins(&self) {
        let registered = match self.registry.list_plugins().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "Registry unavailable, skipping plugin restore");
                return;
            }
        };

        for info in registered {
            if info.status != PluginStatus::Active || self.is_loaded(&info.id).await {
                continue;
            }
            let config = config_from_info(&info);
            if let Err(e) = self.load_plugin(&info.id, config).await {
                tracing::warn!(plugin_id = %info.id, error = %e, "Failed to restore registered plugin");
            }
        }
    }

    /// Cancel background work, stop every plugin and the collaborators.
    /// Errors are logged; stopping always completes.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        for worker in self.workers.lock().await.drain(..) {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Monitoring worker ended abnormally");
            }
        }

        let instances: Vec<Arc<PluginInstance>> =
            self.instances.read().await.values().cloned().collect();
        let timeout = self.config.plugin_timeout();
        join_all(instances.iter().map(|instance| async move {
            match tokio::time::timeout(timeout, instance.plugin().stop()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(plugin_id = %instance.id(), error = %e, "Plugin stop failed")
                }
                Err(_) => tracing::warn!(plugin_id = %instance.id(), "Plugin stop timed out"),
            }
            instance.set_status(PluginStatus::Stopped);
        }))
        .await;

        self.mesh.stop().await;
        if let Err(e) = self.loader.stop().await {
            tracing::warn!(error = %e, "Plugin loader stop failed");
        }
        if let Err(e) = self.registry.stop().await {
            tracing::warn!(error = %e, "Discovery registry stop failed");
        }
        tracing::info!(plugins = instances.len(), "Plugin gateway stopped");
    }

    async fn is_loaded(&self, plugin_id: &str) -> bool {
        self.instances.read().await.contains_key(plugin_id)
    }

    /// Claim a load slot for `plugin_id` against `max_plugins`.
    async fn reserve_slot(&self, plugin_id: &str) -> Result<PendingSlot<'_>> {
        let instances = self.instances.read().await;
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ConfigError::Validation("pending slot lock poisoned".into()))?;

        if instances.contains_key(plugin_id) || pending.contains(plugin_id) {
            return Err(ConfigError::AlreadyLoaded(plugin_id.to_string()).into());
        }
        if instances.len() + pending.len() >= self.config.max_plugins {
            return Err(ConfigError::PluginLimit(self.config.max_plugins).into());
        }
        pending.insert(plugin_id.to_string());
        Ok(PendingSlot {
            pending: &self.pending,
            id: plugin_id.to_string(),
        })
    }

    pub async fn load_plugin(&self, plugin_id: &str, mut config: PluginConfig) -> Result<()> {
        if config.id.is_empty() {
            config.id = plugin_id.to_string();
        }
        if config.id != plugin_id {
            return Err(ConfigError::Validation(format!(
                "Plugin id '{}' does not match descriptor id '{}'",
                plugin_id, config.id
            ))
            .into());
        }
        config.validate()?;
        if !self.config.feature_flags.plugins_enabled() {
            return Err(ConfigError::FeatureDisabled(ENABLE_PLUGINS_FLAG.to_string()).into());
        }

        let slot = self.reserve_slot(plugin_id).await?;

        {
            let instances = self.instances.read().await;
            for dep in &config.dependencies {
                if !instances.contains_key(&dep.service) {
                    return Err(ConfigError::MissingDependency {
                        plugin: plugin_id.to_string(),
                        service: dep.service.clone(),
                    }
                    .into());
                }
            }
        }
        self.routes
            .check_conflicts(plugin_id, config.endpoints.iter().map(|e| e.path.as_str()))?;

        tracing::info!(plugin_id = %plugin_id, runtime = config.runtime.as_str(), "Loading plugin");

        let plugin = self.loader.load_plugin(plugin_id, &config).await?;

        let lifecycle = async {
            plugin.initialize(&config).await?;
            plugin.start().await
        };
        if let Err(e) = lifecycle.await {
            tracing::error!(plugin_id = %plugin_id, error = %e, "Plugin failed to initialize or start");
            let _ = plugin.stop().await;
            if let Err(unload) = self.loader.unload_plugin(plugin_id).await {
                tracing::warn!(plugin_id = %plugin_id, error = %unload, "Loader cleanup failed");
            }
            return Err(e.into());
        }

        let info = describe(plugin_id, &config, plugin.info());
        let health = HealthCheck::new(
            self.config.monitoring.health_check_interval(),
            self.config.monitoring.health_check_timeout(),
        );
        let instance = Arc::new(PluginInstance::new(
            plugin_id.to_string(),
            config.clone(),
            plugin,
            info.clone(),
            health,
        ));

        let loaded = {
            let mut instances = self.instances.write().await;
            instances.insert(plugin_id.to_string(), instance);
            drop(slot);
            instances.len()
        };

        self.routes
            .add_endpoints(plugin_id, config.endpoints.iter().map(|e| e.path.as_str()));
        let _ = self
            .mesh
            .load_balancer()
            .register_instance(plugin_id, &format!("local/{plugin_id}"));
        self.mesh.observability().set_loaded_plugins(loaded);

        if let Err(e) = self.registry.register_plugin(plugin_id, &info).await {
            tracing::warn!(plugin_id = %plugin_id, error = %e, "Registry sync failed, continuing with local view");
        }

        tracing::info!(plugin_id = %plugin_id, version = %info.version, "Plugin loaded");
        Ok(())
    }

    /// Remove a plugin. Unreachable as soon as this returns, whatever its
    /// `stop()` or the registry said.
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        let (instance, remaining) = {
            let mut instances = self.instances.write().await;
            let instance = instances
                .remove(plugin_id)
                .ok_or_else(|| GatewayError::NotFound(plugin_id.to_string()))?;
            (instance, instances.len())
        };
        self.routes.remove_plugin(plugin_id);

        match tokio::time::timeout(self.config.plugin_timeout(), instance.plugin().stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(plugin_id = %plugin_id, error = %e, "Plugin stop failed during unload")
            }
            Err(_) => tracing::warn!(plugin_id = %plugin_id, "Plugin stop timed out during unload"),
        }
        instance.set_status(PluginStatus::Stopped);

        if let Err(e) = self.registry.unregister_plugin(plugin_id).await {
            tracing::warn!(plugin_id = %plugin_id, error = %e, "Registry unregister failed");
        }
        if let Err(e) = self.loader.unload_plugin(plugin_id).await {
            tracing::warn!(plugin_id = %plugin_id, error = %e, "Loader unload failed");
        }
        self.mesh.forget_plugin(plugin_id);
        self.mesh.observability().set_loaded_plugins(remaining);

        tracing::info!(plugin_id = %plugin_id, "Plugin unloaded");
        Ok(())
    }

    /// Route `req` to its plugin and return the plugin's response untouched.
    pub async fn handle_request(&self, req: PluginRequest) -> Result<PluginResponse> {
        self.handle_request_at(req, Instant::now())
            .await
            .map(|(response, _)| response)
    }

    /// Like [`handle_request`](Self::handle_request), also returning the
    /// tightest rate-limit decision that admitted the call.
    pub async fn handle_request_at(
        &self,
        req: PluginRequest,
        now: Instant,
    ) -> Result<(PluginResponse, RateLimitDecision)> {
        let plugin_id = self
            .routes
            .resolve(&req.path)
            .ok_or_else(|| GatewayError::NotFound(req.path.clone()))?;
        let target = self
            .mesh
            .load_balancer()
            .get_instance(&plugin_id)
            .map_err(|_| GatewayError::NotFound(plugin_id.clone()))?;
        let instance = self
            .instances
            .read()
            .await
            .get(&plugin_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(plugin_id.clone()))?;

        let decision = self
            .admit(&instance, &req, now)
            .await
            .inspect_err(|e| {
                self.mesh
                    .observability()
                    .record_rejection(&plugin_id, e.reason())
            })?;

        let response = self.dispatch(&instance, &target, req).await?;
        Ok((response, decision))
    }

    async fn admit(
        &self,
        instance: &PluginInstance,
        req: &PluginRequest,
        now: Instant,
    ) -> Result<RateLimitDecision> {
        let plugin_id = instance.id();

        if instance.health_is_stale(Utc::now()) && instance.status() == PluginStatus::Active {
            self.check_health(instance).await;
        }
        if !instance.is_routable() {
            return Err(GatewayError::Unhealthy(plugin_id.to_string()));
        }

        let limiter = self.mesh.rate_limiter();
        let endpoint_decision = match instance
            .config()
            .endpoints
            .iter()
            .find(|e| e.matches(&req.method, &req.path))
        {
            Some(endpoint) => {
                limiter.allow_endpoint_at(plugin_id, endpoint, req.user_id.as_deref(), now)?
            }
            None => None,
        };
        let plugin_decision = limiter.allow_at(plugin_id, now)?;

        self.mesh.circuit_breaker().allow_at(plugin_id, now)?;

        Ok(match endpoint_decision {
            Some(e) if e.remaining < plugin_decision.remaining => e,
            _ => plugin_decision,
        })
    }

    async fn dispatch(
        &self,
        instance: &PluginInstance,
        target: &str,
        req: PluginRequest,
    ) -> Result<PluginResponse> {
        let plugin_id = instance.id().to_string();
        let span = tracing::info_span!(
            "plugin_dispatch",
            plugin = %plugin_id,
            instance = %target,
            request_id = %req.id,
            method = %req.method,
            path = %req.path,
        );
        let request_id = req.id.clone();
        let timeout = self.config.plugin_timeout();
        let breaker = self.mesh.circuit_breaker();
        let observability = self.mesh.observability();

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, instance.plugin().handle_request(req))
            .instrument(span)
            .await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(response)) => {
                breaker.record_success(&plugin_id);
                Ok(response)
            }
            Ok(Err(source)) => {
                breaker.record_error(&plugin_id);
                Err(DispatchError::Failed {
                    plugin: plugin_id.clone(),
                    source,
                })
            }
            Err(_) => {
                breaker.record_error(&plugin_id);
                Err(DispatchError::Timeout {
                    plugin: plugin_id.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        let success = result.is_ok();
        instance.record_request(elapsed, success);
        observability.record_dispatch(&plugin_id, elapsed, success);
        observability.record_trace(&plugin_id, &request_id, "handle_request", elapsed);
        observability.set_circuit_open(
            &plugin_id,
            breaker.status(&plugin_id).state == CircuitState::Open,
        );

        if let Err(e) = &result {
            tracing::warn!(plugin_id = %plugin_id, error = %e, elapsed_ms = elapsed.as_millis() as u64, "Plugin dispatch failed");
        }
        result.map_err(GatewayError::from)
    }

    /// Health-check one instance with the health-check timeout and apply the result.
    pub(crate) async fn check_health(&self, instance: &PluginInstance) -> HealthStatus {
        let timeout = instance.health().timeout;
        let status = match tokio::time::timeout(timeout, instance.plugin().health_check()).await {
            Ok(status) => status,
            Err(_) => HealthStatus::unhealthy(format!(
                "health check timed out after {}ms",
                timeout.as_millis()
            )),
        };

        let (before, after) = instance.record_health(status.clone(), Utc::now());
        if before != after {
            match after {
                PluginStatus::Failed => tracing::warn!(
                    plugin_id = %instance.id(),
                    message = %status.message,
                    "Plugin failed health check"
                ),
                _ => tracing::info!(plugin_id = %instance.id(), "Plugin healthy again"),
            }
            let info = instance.info();
            if let Err(e) = self.registry.register_plugin(instance.id(), &info).await {
                tracing::debug!(plugin_id = %instance.id(), error = %e, "Registry status sync failed");
            }
        }
        status
    }

    pub async fn get_plugin_info(&self, plugin_id: &str) -> Result<PluginInfo> {
        self.instance(plugin_id).await.map(|i| i.info())
    }

    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self
            .instances
            .read()
            .await
            .values()
            .map(|i| i.info())
            .collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    /// A plugin's own flag when it declares one, else the gateway default.
    pub async fn feature_enabled(&self, plugin_id: &str, flag: &str) -> Result<bool> {
        let instance = self.instance(plugin_id).await?;
        let declared = instance
            .config()
            .feature_flags
            .iter()
            .any(|f| f.name == flag);
        Ok(if declared {
            instance.config().feature_enabled(flag)
        } else {
            self.config.feature_flags.is_enabled(flag)
        })
    }

    pub async fn get_plugin_metrics(&self, plugin_id: &str) -> Result<PluginMetrics> {
        self.instance(plugin_id).await.map(|i| i.metrics())
    }

    pub async fn circuit_status(&self, plugin_id: &str) -> Result<CircuitBreakerStatus> {
        self.instance(plugin_id).await?;
        Ok(self.mesh.circuit_breaker().status(plugin_id))
    }

    async fn instance(&self, plugin_id: &str) -> Result<Arc<PluginInstance>> {
        self.instances
            .read()
            .await
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(plugin_id.to_string()))
    }

    /// Deliver `event` to every active plugin. One plugin failing does not
    /// stop delivery to the others; failures are returned.
    pub async fn publish_event(&self, event: &DomainEvent) -> Vec<(String, PluginError)> {
        let targets: Vec<Arc<PluginInstance>> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status() == PluginStatus::Active)
            .cloned()
            .collect();
        let timeout = self.config.plugin_timeout();

        let results = join_all(targets.iter().map(|instance| async move {
            let outcome = tokio::time::timeout(timeout, instance.plugin().handle_event(event)).await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => Err(PluginError::RequestFailed {
                    reason: format!("event delivery timed out after {}ms", timeout.as_millis()),
                }),
            };
            (instance.id().to_string(), result)
        }))
        .await;

        let failures: Vec<(String, PluginError)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        tracing::debug!(
            event_type = %event.event_type,
            delivered = targets.len() - failures.len(),
            failed = failures.len(),
            "Event published"
        );
        failures
    }
}

/// Public snapshot for a freshly started plugin. The descriptor is
/// authoritative for identity; the plugin fills in the rest.
fn describe(plugin_id: &str, config: &PluginConfig, reported: PluginInfo) -> PluginInfo {
    let now = Utc::now();
    let mut metadata = reported.metadata;
    metadata.extend(config.metadata.clone());
    metadata.insert("runtime".into(), config.runtime.as_str().into());
    if let Some(path) = &config.path {
        metadata.insert("path".into(), path.to_string_lossy().into_owned());
    }

    PluginInfo {
        id: plugin_id.to_string(),
        name: config.name.clone(),
        version: config.version.clone(),
        description: reported.description,
        author: reported.author,
        license: reported.license,
        status: PluginStatus::Active,
        endpoints: config.endpoints.clone(),
        metadata,
        created_at: now,
        updated_at: now,
    }
}

/// Rebuild a descriptor from what [`describe`] published.
fn config_from_info(info: &PluginInfo) -> PluginConfig {
    let mut config = PluginConfig::native(info.id.clone(), info.name.clone());
    config.version = info.version.clone();
    config.endpoints = info.endpoints.clone();
    config.runtime = info
        .metadata
        .get("runtime")
        .and_then(|r| serde_json::from_value::<RuntimeKind>(serde_json::Value::String(r.clone())).ok())
        .unwrap_or_default();
    config.path = info.metadata.get("path").map(PathBuf::from);
    config.metadata = info
        .metadata
        .iter()
        .filter(|(k, _)| k.as_str() != "runtime" && k.as_str() != "path")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    config
}
