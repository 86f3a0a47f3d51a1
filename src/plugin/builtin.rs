//! Built-in native plugins

use super::{
    Plugin, PluginConfig, PluginError, PluginInfo, PluginMetrics, PluginRequest, PluginResponse,
    PluginStatus,
};
use crate::plugin::schema::{DomainEvent, HealthStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Returns the request back to the caller.
///
/// Useful as a smoke-test target and as the reference native plugin.
pub struct EchoPlugin {
    config: RwLock<Option<PluginConfig>>,
    status: RwLock<PluginStatus>,
    started_at: RwLock<Option<Instant>>,
    requests: AtomicU64,
    events: AtomicU64,
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self {
            config: RwLock::new(None),
            status: RwLock::new(PluginStatus::Loading),
            started_at: RwLock::new(None),
            requests: AtomicU64::new(0),
            events: AtomicU64::new(0),
        }
    }

    pub fn events_seen(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    fn set_status(&self, status: PluginStatus) {
        if let Ok(mut guard) = self.status.write() {
            *guard = status;
        }
    }

    fn current_status(&self) -> PluginStatus {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(PluginStatus::Failed)
    }
}

impl Default for EchoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError> {
        let mut guard = self.config.write().map_err(|_| PluginError::Internal {
            reason: "config lock poisoned".into(),
        })?;
        *guard = Some(config.clone());
        Ok(())
    }

    async fn start(&self) -> Result<(), PluginError> {
        if let Ok(mut started) = self.started_at.write() {
            *started = Some(Instant::now());
        }
        self.set_status(PluginStatus::Active);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.set_status(PluginStatus::Stopped);
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.current_status() {
            PluginStatus::Active => HealthStatus::healthy(),
            other => HealthStatus::unhealthy(format!("echo plugin is {}", other.as_str())),
        }
    }

    async fn handle_request(&self, req: PluginRequest) -> Result<PluginResponse, PluginError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(PluginResponse::ok(json!({
            "id": req.id,
            "method": req.method,
            "path": req.path,
            "body": req.body,
        })))
    }

    async fn handle_event(&self, _event: &DomainEvent) -> Result<(), PluginError> {
        self.events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn info(&self) -> PluginInfo {
        let config = self.config.read().ok().and_then(|c| c.clone());
        let now = Utc::now();
        let (id, version, endpoints) = match config {
            Some(c) => (c.id, c.version, c.endpoints),
            None => ("echo".to_string(), "0.1.0".to_string(), Vec::new()),
        };
        PluginInfo {
            id,
            name: "echo".to_string(),
            version,
            description: "Echoes requests back to the caller".to_string(),
            author: String::new(),
            license: "MIT".to_string(),
            status: self.current_status(),
            endpoints,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn metrics(&self) -> PluginMetrics {
        let uptime = self
            .started_at
            .read()
            .ok()
            .and_then(|s| *s)
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);
        PluginMetrics {
            request_count: self.requests.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            ..Default::default()
        }
    }
}
