//! Plugin wire types
//!
//! Requests, responses, events and status snapshots exchanged between the
//! gateway and plugins. All types serialize to JSON with snake_case fields,
//! which is also the line format spoken by process plugins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::config::PluginEndpoint;

/// Lifecycle status of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Active,
    Inactive,
    Failed,
    Loading,
    Stopped,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Active => "active",
            PluginStatus::Inactive => "inactive",
            PluginStatus::Failed => "failed",
            PluginStatus::Loading => "loading",
            PluginStatus::Stopped => "stopped",
        }
    }
}

/// Public metadata snapshot of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    pub status: PluginStatus,
    #[serde(default)]
    pub endpoints: Vec<PluginEndpoint>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginInfo {
    pub fn with_status(mut self, status: PluginStatus) -> Self {
        self.status = status;
        self.updated_at = Utc::now();
        self
    }
}

/// Request forwarded to a plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PluginRequest {
    /// Build a request with a fresh id and the current timestamp.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            path: path.into(),
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Response returned by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl PluginResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status_code: u16, body: serde_json::Value) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Domain event fanned out to plugins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub version: String,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            data: HashMap::new(),
            timestamp: Utc::now(),
            version: "1".to_string(),
        }
    }
}

/// Health check outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self::new(HealthState::Healthy, "")
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthState::Unhealthy, message)
    }

    pub fn new(status: HealthState, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Health check bookkeeping held per instance
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub endpoint: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
}

impl HealthCheck {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            endpoint: "/health".to_string(),
            interval,
            timeout,
            status: HealthStatus::healthy(),
            last_check: Utc::now(),
        }
    }

    /// Whether the last check is older than the configured interval.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_check);
        elapsed.to_std().map(|e| e >= self.interval).unwrap_or(false)
    }
}

/// Counters reported for a plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetrics {
    pub request_count: u64,
    pub error_count: u64,
    #[serde(rename = "response_time_ms")]
    pub response_time_ms: f64,
    #[serde(rename = "cpu_usage_percent")]
    pub cpu_usage: f64,
    #[serde(rename = "memory_usage_mb")]
    pub memory_usage_mb: u64,
    pub active_connections: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_time: Option<DateTime<Utc>>,
    #[serde(rename = "uptime_seconds")]
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_shape() {
        let request = PluginRequest::new("GET", "/api/echo/ping")
            .with_body(json!({"hello": "world"}))
            .with_user("42");

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "GET");
        assert_eq!(value["path"], "/api/echo/ping");
        assert_eq!(value["user_id"], "42");
        assert_eq!(value["body"]["hello"], "world");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_event_type_field_name() {
        let event = DomainEvent::new("user.created", "auth");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user.created");
        assert!(value.get("event_type").is_none());
    }

    #[test]
    fn test_health_check_staleness() {
        let mut check = HealthCheck::new(Duration::from_secs(30), Duration::from_secs(5));
        let now = Utc::now();
        check.last_check = now - chrono::Duration::seconds(10);
        assert!(!check.is_stale(now));

        check.last_check = now - chrono::Duration::seconds(31);
        assert!(check.is_stale(now));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(PluginStatus::Active.as_str(), "active");
        let parsed: PluginStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, PluginStatus::Failed);
    }
}
