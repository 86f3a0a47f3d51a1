//! Plugin descriptor types
//!
//! A `PluginConfig` is created when an operator asks for a load and is never
//! mutated afterwards; the gateway keeps it behind an `Arc`.

use crate::error::ConfigError;
use crate::sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Runtime a plugin executes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// In-process plugin produced by a registered factory
    #[default]
    Native,
    /// External executable speaking JSON lines over stdio
    Process,
    Wasm,
    Container,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Native => "native",
            RuntimeKind::Process => "process",
            RuntimeKind::Wasm => "wasm",
            RuntimeKind::Container => "container",
        }
    }
}

/// Immutable plugin descriptor
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub id: String,

    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Executable, module or image path; unused by native plugins
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub runtime: RuntimeKind,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub endpoints: Vec<PluginEndpoint>,

    #[serde(default)]
    pub dependencies: Vec<PluginDependency>,

    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,

    /// Isolation required by the plugin, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
    #[serde(default)]
    pub network_mbps: u64,
}

/// Endpoint exposed by a plugin
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEndpoint {
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub auth: bool,

    /// Requests per minute; 0 disables the endpoint limit
    #[serde(default)]
    pub rate_limit: u32,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl PluginEndpoint {
    /// Whether this endpoint covers `method` + `path`.
    ///
    /// `*` as method matches any method. The path matches exactly or as a
    /// prefix ending on a segment boundary.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        let method_ok = self.method == "*" || self.method.eq_ignore_ascii_case(method);
        if !method_ok {
            return false;
        }
        let base = self.path.trim_end_matches('/');
        if base.is_empty() {
            return true;
        }
        path == base
            || path
                .strip_prefix(base)
                .map(|rest| rest.starts_with('/'))
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDependency {
    pub service: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub description: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_method() -> String {
    "*".to_string()
}

impl PluginConfig {
    /// Minimal native plugin descriptor.
    pub fn native(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            path: None,
            runtime: RuntimeKind::Native,
            resources: ResourceLimits::default(),
            endpoints: Vec::new(),
            dependencies: Vec::new(),
            feature_flags: Vec::new(),
            sandbox: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: PluginEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.feature_flags
            .iter()
            .find(|flag| flag.name == name)
            .map(|flag| flag.default)
            .unwrap_or(false)
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingField("id".into()));
        }
        if self.id.contains('/') {
            return Err(ConfigError::Validation(format!(
                "Plugin id '{}' must not contain '/'",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".into()));
        }
        if matches!(
            self.runtime,
            RuntimeKind::Process | RuntimeKind::Wasm | RuntimeKind::Container
        ) && self.path.is_none()
        {
            return Err(ConfigError::MissingField(format!(
                "path (required for {} runtime of plugin '{}')",
                self.runtime.as_str(),
                self.id
            )));
        }
        if self.resources.cpu_cores < 0.0 {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' requests negative CPU",
                self.id
            )));
        }
        for endpoint in &self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Endpoint '{}' of plugin '{}' must start with '/'",
                    endpoint.path, self.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(method: &str, path: &str) -> PluginEndpoint {
        PluginEndpoint {
            path: path.to_string(),
            method: method.to_string(),
            auth: false,
            rate_limit: 0,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_endpoint_matching_respects_segments() {
        let ep = endpoint("GET", "/api/echo");
        assert!(ep.matches("GET", "/api/echo"));
        assert!(ep.matches("get", "/api/echo/ping"));
        assert!(!ep.matches("GET", "/api/echoes"));
        assert!(!ep.matches("POST", "/api/echo"));

        let any = endpoint("*", "/api/echo/");
        assert!(any.matches("DELETE", "/api/echo/x"));
    }

    #[test]
    fn test_validation() {
        let config = PluginConfig::native("echo", "echo");
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.id = "a/b".into();
        assert!(matches!(bad.validate(), Err(ConfigError::Validation(_))));

        let mut process = config.clone();
        process.runtime = RuntimeKind::Process;
        assert!(matches!(
            process.validate(),
            Err(ConfigError::MissingField(_))
        ));

        let bad_endpoint = config.with_endpoint(endpoint("GET", "no-slash"));
        assert!(bad_endpoint.validate().is_err());
    }

    #[test]
    fn test_deserialize_camel_case() {
        let json = r#"{
            "id": "analytics",
            "name": "analytics",
            "runtime": "process",
            "path": "/opt/plugins/analytics",
            "resources": {"cpuCores": 0.5, "memoryMb": 128},
            "endpoints": [{"path": "/api/analytics", "method": "GET", "rateLimit": 60}],
            "featureFlags": [{"name": "beta", "default": true}]
        }"#;
        let config: PluginConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.runtime, RuntimeKind::Process);
        assert_eq!(config.resources.memory_mb, 128);
        assert_eq!(config.endpoints[0].rate_limit, 60);
        assert!(config.feature_enabled("beta"));
        assert!(!config.feature_enabled("missing"));
        assert_eq!(config.version, "0.1.0");
    }
}
