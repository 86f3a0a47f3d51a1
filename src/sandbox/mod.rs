//! Plugin isolation
//!
//! A sandbox bounds what a plugin may consume and touch: resource ceilings,
//! network reachability and filesystem writes. The gateway only creates and
//! destroys sandboxes through the loader; the request path never calls in.

use crate::plugin::ResourceLimits;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox already exists for plugin: {0}")]
    AlreadyExists(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox {id} is {state}")]
    NotRunning { id: String, state: String },

    #[error("Command '{command}' is not permitted in sandbox {id}")]
    CommandDenied { id: String, command: String },

    #[error("Sandbox execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub isolation: bool,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub read_only_fs: bool,
    #[serde(default)]
    pub no_network: bool,
    /// Commands the sandbox may execute; empty allows any
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Running,
    Stopped,
    Error,
}

impl SandboxState {
    fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Running => "running",
            SandboxState::Stopped => "stopped",
            SandboxState::Error => "error",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SandboxState::Running,
            1 => SandboxState::Stopped,
            _ => SandboxState::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub start_time: DateTime<Utc>,
}

#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn status(&self) -> SandboxStatus;
    async fn execute(&self, command: &str, args: &[String]) -> Result<Vec<u8>, SandboxError>;
    async fn kill(&self) -> Result<(), SandboxError>;
}

#[async_trait]
pub trait SandboxManager: Send + Sync + 'static {
    async fn create_sandbox(
        &self,
        plugin_id: &str,
        config: SandboxConfig,
    ) -> Result<Arc<dyn Sandbox>, SandboxError>;
    async fn destroy_sandbox(&self, plugin_id: &str) -> Result<(), SandboxError>;
    fn list_sandboxes(&self) -> Vec<String>;
}

/// Sandbox running commands as local child processes with a cleared environment
pub struct LocalSandbox {
    id: String,
    config: SandboxConfig,
    work_dir: Option<PathBuf>,
    state: AtomicU8,
    start_time: DateTime<Utc>,
}

impl LocalSandbox {
    fn new(id: String, config: SandboxConfig, work_dir: Option<PathBuf>) -> Self {
        Self {
            id,
            config,
            work_dir,
            state: AtomicU8::new(0),
            start_time: Utc::now(),
        }
    }

    fn state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn permits(&self, command: &str) -> bool {
        let caps = &self.config.security.capabilities;
        caps.is_empty() || caps.iter().any(|c| c == command)
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> SandboxStatus {
        SandboxStatus {
            state: self.state(),
            cpu_usage: 0.0,
            memory_usage: 0,
            start_time: self.start_time,
        }
    }

    async fn execute(&self, command: &str, args: &[String]) -> Result<Vec<u8>, SandboxError> {
        let state = self.state();
        if state != SandboxState::Running {
            return Err(SandboxError::NotRunning {
                id: self.id.clone(),
                state: state.as_str().to_string(),
            });
        }
        if !self.permits(command) {
            return Err(SandboxError::CommandDenied {
                id: self.id.clone(),
                command: command.to_string(),
            });
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| {
            self.state.store(2, Ordering::Release);
            SandboxError::Execution(format!("{command}: {e}"))
        })?;
        if !output.status.success() {
            return Err(SandboxError::Execution(format!(
                "{} exited with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        self.state.store(1, Ordering::Release);
        Ok(())
    }
}

/// Tracks one local sandbox per plugin
#[derive(Default)]
pub struct LocalSandboxManager {
    sandboxes: DashMap<String, Arc<LocalSandbox>>,
    work_dir: Option<PathBuf>,
}

impl LocalSandboxManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_work_dir(work_dir: PathBuf) -> Self {
        Self {
            sandboxes: DashMap::new(),
            work_dir: Some(work_dir),
        }
    }
}

#[async_trait]
impl SandboxManager for LocalSandboxManager {
    async fn create_sandbox(
        &self,
        plugin_id: &str,
        config: SandboxConfig,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        use dashmap::mapref::entry::Entry;

        match self.sandboxes.entry(plugin_id.to_string()) {
            Entry::Occupied(_) => Err(SandboxError::AlreadyExists(plugin_id.to_string())),
            Entry::Vacant(slot) => {
                let sandbox = Arc::new(LocalSandbox::new(
                    plugin_id.to_string(),
                    config,
                    self.work_dir.clone(),
                ));
                slot.insert(sandbox.clone());
                tracing::debug!(plugin_id = %plugin_id, "Created sandbox");
                Ok(sandbox)
            }
        }
    }

    async fn destroy_sandbox(&self, plugin_id: &str) -> Result<(), SandboxError> {
        let (_, sandbox) = self
            .sandboxes
            .remove(plugin_id)
            .ok_or_else(|| SandboxError::NotFound(plugin_id.to_string()))?;
        sandbox.kill().await?;
        tracing::debug!(plugin_id = %plugin_id, "Destroyed sandbox");
        Ok(())
    }

    fn list_sandboxes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sandboxes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
