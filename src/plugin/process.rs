//! External process adapter
//!
//! Runs a plugin as a child process and exchanges one JSON line per call over
//! stdin/stdout. Calls are serialized on the process handle.

use super::{
    Plugin, PluginConfig, PluginError, PluginInfo, PluginMetrics, PluginRequest, PluginResponse,
    PluginStatus,
};
use crate::plugin::schema::{DomainEvent, HealthStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Message written to the plugin's stdin
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ProcessMessage<'a> {
    Initialize { config: &'a PluginConfig },
    Request { request: &'a PluginRequest },
    Event { event: &'a DomainEvent },
    Health,
    Shutdown,
}

/// Line read back from the plugin's stdout
#[derive(Debug, Default, Deserialize)]
struct ProcessReply {
    #[serde(default)]
    response: Option<PluginResponse>,
    #[serde(default)]
    health: Option<HealthStatus>,
    #[serde(default)]
    error: Option<String>,
}

struct ProcessHandle {
    pid: u32,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Set while a request/reply exchange is in progress
    mid_exchange: bool,
}

impl ProcessHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn exchange(&mut self, message: &ProcessMessage<'_>) -> Result<ProcessReply, PluginError> {
        let json = serde_json::to_string(message).map_err(|e| PluginError::InvalidOutput {
            reason: format!("Failed to encode message: {e}"),
        })?;

        self.mid_exchange = true;
        self.stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to write to stdin: {e}"),
            })?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to write newline to stdin: {e}"),
            })?;
        self.stdin.flush().await.map_err(|e| PluginError::IoError {
            reason: format!("Failed to flush stdin: {e}"),
        })?;

        let mut line = String::new();
        self.stdout
            .read_line(&mut line)
            .await
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to read from stdout: {e}"),
            })?;
        if line.is_empty() {
            return Err(PluginError::ProcessExited {
                reason: "stdout closed unexpectedly".to_string(),
            });
        }
        self.mid_exchange = false;

        serde_json::from_str(line.trim()).map_err(|e| PluginError::InvalidOutput {
            reason: e.to_string(),
        })
    }
}

/// Plugin backed by an external process
pub struct ProcessPlugin {
    id: String,
    program: PathBuf,
    config: RwLock<Option<PluginConfig>>,
    status: RwLock<PluginStatus>,
    handle: Mutex<Option<ProcessHandle>>,
    started_at: Instant,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl ProcessPlugin {
    /// Spawn `program` (optionally through `interpreter`) with piped stdio.
    pub async fn spawn(
        id: &str,
        program: &Path,
        interpreter: Option<&Path>,
    ) -> Result<Self, PluginError> {
        let mut cmd = match interpreter {
            Some(interp) => {
                let mut cmd = Command::new(interp);
                cmd.arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PluginError::SpawnFailed {
            reason: format!("Failed to spawn {}: {}", program.display(), e),
        })?;

        let pid = child.id().ok_or_else(|| PluginError::SpawnFailed {
            reason: "Failed to get process ID".to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| PluginError::SpawnFailed {
            reason: "stdin is not available".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| PluginError::SpawnFailed {
                reason: "stdout is not available".to_string(),
            })?;

        if let Some(stderr) = child.stderr.take() {
            let plugin_id = id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin_id = %plugin_id, "plugin stderr: {}", line);
                }
            });
        }

        tracing::debug!(plugin_id = %id, pid, program = %program.display(), "Spawned plugin process");

        Ok(Self {
            id: id.to_string(),
            program: program.to_path_buf(),
            config: RwLock::new(None),
            status: RwLock::new(PluginStatus::Loading),
            handle: Mutex::new(Some(ProcessHandle {
                pid,
                child,
                stdin,
                stdout,
                mid_exchange: false,
            })),
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub async fn pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().map(|h| h.pid)
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

    async fn call(&self, message: ProcessMessage<'_>) -> Result<ProcessReply, PluginError> {
        let mut guard = self.handle.lock().await;
        let handle = guard.as_mut().ok_or_else(|| PluginError::NotRunning {
            state: self.current_status().as_str().to_string(),
        })?;

        // A dropped caller may have left a reply unread; the stream can't be trusted.
        if handle.mid_exchange || !handle.is_alive() {
            let _ = handle.child.kill().await;
            *guard = None;
            self.set_status(PluginStatus::Failed);
            return Err(PluginError::ProcessExited {
                reason: format!("process for plugin '{}' is no longer usable", self.id),
            });
        }

        let reply = handle.exchange(&message).await?;
        match reply.error {
            Some(reason) => Err(PluginError::RequestFailed { reason }),
            None => Ok(reply),
        }
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    async fn initialize(&self, config: &PluginConfig) -> Result<(), PluginError> {
        self.call(ProcessMessage::Initialize { config })
            .await
            .map_err(|e| PluginError::ConfigError {
                reason: e.to_string(),
            })?;
        if let Ok(mut guard) = self.config.write() {
            *guard = Some(config.clone());
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), PluginError> {
        let mut guard = self.handle.lock().await;
        let alive = guard.as_mut().map(|h| h.is_alive()).unwrap_or(false);
        match guard.as_ref() {
            Some(_) if alive => {
                self.set_status(PluginStatus::Active);
                Ok(())
            }
            _ => {
                *guard = None;
                self.set_status(PluginStatus::Failed);
                Err(PluginError::ProcessExited {
                    reason: format!("{} exited before start", self.program.display()),
                })
            }
        }
    }

    async fn stop(&self) -> Result<(), PluginError> {
        let mut guard = self.handle.lock().await;
        self.set_status(PluginStatus::Stopped);
        if let Some(mut handle) = guard.take() {
            if let Ok(json) = serde_json::to_string(&ProcessMessage::Shutdown) {
                let _ = handle.stdin.write_all(json.as_bytes()).await;
                let _ = handle.stdin.write_all(b"\n").await;
                let _ = handle.stdin.flush().await;
            }
            handle.child.kill().await.map_err(|e| PluginError::IoError {
                reason: format!("Failed to kill process: {e}"),
            })?;
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.call(ProcessMessage::Health).await {
            Ok(ProcessReply {
                health: Some(status),
                ..
            }) => status,
            Ok(_) => HealthStatus::unhealthy("health reply carried no status"),
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        }
    }

    async fn handle_request(&self, req: PluginRequest) -> Result<PluginResponse, PluginError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let result = self
            .call(ProcessMessage::Request { request: &req })
            .await
            .and_then(|reply| {
                reply.response.ok_or_else(|| PluginError::InvalidOutput {
                    reason: "reply carried no response".to_string(),
                })
            });
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn handle_event(&self, event: &DomainEvent) -> Result<(), PluginError> {
        self.call(ProcessMessage::Event { event }).await.map(|_| ())
    }

    fn info(&self) -> PluginInfo {
        let now = Utc::now();
        let config = self.config.read().ok().and_then(|c| c.clone());
        let mut info = PluginInfo {
            id: self.id.clone(),
            name: self.id.clone(),
            version: String::new(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            status: self.current_status(),
            endpoints: Vec::new(),
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
        };
        if let Some(config) = config {
            info.name = config.name;
            info.version = config.version;
            info.endpoints = config.endpoints;
            info.metadata = config.metadata;
        }
        info.metadata
            .insert("path".to_string(), self.program.display().to_string());
        info.metadata
            .insert("runtime".to_string(), "process".to_string());
        info
    }

    fn metrics(&self) -> PluginMetrics {
        PluginMetrics {
            request_count: self.requests.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            ..Default::default()
        }
    }
}
