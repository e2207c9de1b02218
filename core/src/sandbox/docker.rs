//! Docker sandbox backend (spec §4.B "Docker variant"): lazy container launch
//! state machine, grounded on `docker_backend.py`'s `DockerSandboxBackend`.
//! Upload/download go through `docker exec` + base64 rather than `docker cp`
//! so the server itself may run inside a container with a mounted socket.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::WardenError;
use crate::trace::{EventBus, TraceEvent, TraceKind};

use super::{combine_output, truncate_output, ExecuteResponse, FileDownload, FileOpResult, SandboxBackend};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 100_000;
/// Max time `_wait_for_container` polls a `launching` container before giving up
/// (spec: "block up to 60s polling for launched"; 120 * 0.5s = 60s).
const LAUNCH_POLL_ATTEMPTS: u32 = 120;
const LAUNCH_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Lifecycle state of the managed container (spec §4.B state diagram).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Idle,
    Launching,
    Launched,
    Error,
}

struct LaunchState {
    status: ContainerStatus,
    error: Option<String>,
    /// Set while a launch is in flight; `cancel_launch` aborts it.
    launch_handle: Option<tokio::task::JoinHandle<()>>,
}

pub struct DockerBackend {
    container_name: String,
    workdir: String,
    docker_host: Option<String>,
    image: String,
    username: String,
    timeout_secs: u64,
    max_output_bytes: usize,
    events: Arc<EventBus>,
    state: Arc<Mutex<LaunchState>>,
}

impl DockerBackend {
    pub fn new(
        container_name: impl Into<String>,
        workdir: impl Into<String>,
        docker_host: Option<String>,
        image: impl Into<String>,
        username: impl Into<String>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            container_name: container_name.into(),
            workdir: workdir.into(),
            docker_host,
            image: image.into(),
            username: username.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            events,
            state: Arc::new(Mutex::new(LaunchState {
                status: ContainerStatus::Idle,
                error: None,
                launch_handle: None,
            })),
        }
    }

    pub fn with_limits(mut self, timeout_secs: u64, max_output_bytes: usize) -> Self {
        self.timeout_secs = timeout_secs;
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub async fn container_status(&self) -> ContainerStatus {
        self.state.lock().await.status
    }

    pub async fn container_error(&self) -> Option<String> {
        self.state.lock().await.error.clone()
    }

    /// Aborts any in-flight launch task, returning the container to `idle`
    /// (spec: "aborts an in-flight launch task cleanly before teardown").
    pub async fn cancel_launch(&self) {
        let mut guard = self.state.lock().await;
        if let Some(handle) = guard.launch_handle.take() {
            handle.abort();
            guard.status = ContainerStatus::Idle;
        }
    }

    fn broadcast_status(&self) {
        self.events.publish(
            Some(self.username.clone()),
            TraceEvent::now(TraceKind::ContainerStatus, None, serde_json::json!({"container_name": self.container_name})),
        );
    }

    fn docker_cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(host) = &self.docker_host {
            cmd.arg("-H").arg(host);
        }
        cmd.args(args);
        cmd
    }

    /// Idempotently ensures the container exists and is running: inspects it,
    /// removes any stale instance, then launches a fresh one running `sleep
    /// infinity` so later `exec` calls succeed.
    async fn ensure_container(&self) -> Result<(), WardenError> {
        let inspect = self
            .docker_cmd(&["inspect", "--format", "{{.State.Running}}", &self.container_name])
            .output()
            .await;
        if let Ok(output) = &inspect {
            if output.status.success() && String::from_utf8_lossy(&output.stdout).to_lowercase().contains("true") {
                info!(container = %self.container_name, "sandbox container already running");
                return Ok(());
            }
        }

        let target = self.docker_host.as_deref().unwrap_or("local daemon");
        info!(container = %self.container_name, %target, "launching sandbox container");

        let _ = self.docker_cmd(&["rm", "-f", &self.container_name]).output().await;

        let status = self
            .docker_cmd(&[
                "run",
                "-d",
                "--name",
                &self.container_name,
                "-w",
                &self.workdir,
                &self.image,
                "sleep",
                "infinity",
            ])
            .status()
            .await
            .map_err(|e| WardenError::BackendError(format!("docker run failed: {e}")))?;

        if !status.success() {
            return Err(WardenError::BackendError(format!(
                "docker run exited with status {status}"
            )));
        }
        Ok(())
    }

    pub async fn stop_container(&self) {
        let _ = self.docker_cmd(&["rm", "-f", &self.container_name]).output().await;
        let mut guard = self.state.lock().await;
        guard.status = ContainerStatus::Idle;
        guard.error = None;
        drop(guard);
        self.broadcast_status();
    }

    /// Runs the `idle`/`launching`/`error` dispatch described in spec §4.B
    /// before every `execute`/`upload`/`download` call.
    async fn wait_for_container(&self) -> Result<(), WardenError> {
        {
            let guard = self.state.lock().await;
            if guard.status == ContainerStatus::Launched {
                return Ok(());
            }
        }

        let mut guard = self.state.lock().await;
        match guard.status {
            ContainerStatus::Launched => Ok(()),
            ContainerStatus::Idle => {
                guard.status = ContainerStatus::Launching;
                guard.error = None;
                drop(guard);
                self.broadcast_status();

                let result = self.ensure_container().await;
                let mut guard = self.state.lock().await;
                match result {
                    Ok(()) => {
                        guard.status = ContainerStatus::Launched;
                        drop(guard);
                        self.broadcast_status();
                        Ok(())
                    }
                    Err(e) => {
                        guard.status = ContainerStatus::Error;
                        guard.error = Some(e.to_string());
                        drop(guard);
                        self.broadcast_status();
                        Err(e)
                    }
                }
            }
            ContainerStatus::Launching => {
                drop(guard);
                for _ in 0..LAUNCH_POLL_ATTEMPTS {
                    tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
                    let guard = self.state.lock().await;
                    match guard.status {
                        ContainerStatus::Launched => return Ok(()),
                        ContainerStatus::Error | ContainerStatus::Idle => break,
                        ContainerStatus::Launching => continue,
                    }
                }
                let guard = self.state.lock().await;
                Err(WardenError::BackendError(format!(
                    "container not available (status: {:?}). {}",
                    guard.status,
                    guard.error.clone().unwrap_or_default()
                )))
            }
            ContainerStatus::Error => {
                let msg = guard.error.clone().unwrap_or_default();
                Err(WardenError::BackendError(format!("container is in error state: {msg}")))
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn execute(&self, command: &str) -> Result<ExecuteResponse, WardenError> {
        if command.trim().is_empty() {
            return Ok(ExecuteResponse {
                output: "Error: Command must be a non-empty string.".into(),
                exit_code: 1,
                truncated: false,
            });
        }
        if let Err(e) = self.wait_for_container().await {
            return Ok(ExecuteResponse { output: format!("Error: {e}"), exit_code: 1, truncated: false });
        }

        let run = self
            .docker_cmd(&["exec", "-w", &self.workdir, &self.container_name, "sh", "-c", command])
            .output();

        match tokio::time::timeout(std::time::Duration::from_secs(self.timeout_secs), run).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);
                let combined = combine_output(&stdout, &stderr, exit_code);
                let (out, truncated) = truncate_output(combined, self.max_output_bytes);
                Ok(ExecuteResponse { output: out, exit_code, truncated })
            }
            Ok(Err(e)) => Ok(ExecuteResponse {
                output: format!("Error executing command in container: {e}"),
                exit_code: 1,
                truncated: false,
            }),
            Err(_) => Ok(ExecuteResponse {
                output: format!("Error: Command timed out after {:.1} seconds.", self.timeout_secs as f64),
                exit_code: 124,
                truncated: false,
            }),
        }
    }

    async fn upload(&self, files: Vec<(String, Vec<u8>)>) -> Result<Vec<FileOpResult>, WardenError> {
        self.wait_for_container().await?;
        let mut results = Vec::with_capacity(files.len());
        for (dest, content) in files {
            let parent = std::path::Path::new(&dest)
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let mkdir_ok = self
                .docker_cmd(&["exec", &self.container_name, "mkdir", "-p", &parent])
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false);
            if !mkdir_ok {
                results.push(FileOpResult { path: dest, error: Some("permission_denied".into()) });
                continue;
            }

            let mut child = match self
                .docker_cmd(&["exec", "-i", &self.container_name, "sh", "-c", &format!("base64 -d > {}", super_quote(&dest))])
                .stdin(Stdio::piped())
                .spawn()
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("upload_files failed for {dest}: {e}");
                    results.push(FileOpResult { path: dest, error: Some("permission_denied".into()) });
                    continue;
                }
            };
            let encoded = BASE64.encode(&content);
            let write_ok = async {
                let stdin = child.stdin.as_mut().ok_or("no stdin")?;
                stdin.write_all(encoded.as_bytes()).await.map_err(|e| e.to_string())?;
                Ok::<(), String>(())
            }
            .await;
            let _ = child.stdin.take();
            let status = child.wait().await;
            match (write_ok, status) {
                (Ok(()), Ok(s)) if s.success() => results.push(FileOpResult { path: dest, error: None }),
                _ => {
                    warn!("upload_files failed for {dest}");
                    results.push(FileOpResult { path: dest, error: Some("permission_denied".into()) });
                }
            }
        }
        Ok(results)
    }

    async fn download(&self, paths: Vec<String>) -> Result<Vec<FileDownload>, WardenError> {
        self.wait_for_container().await?;
        let mut results = Vec::with_capacity(paths.len());
        for src in paths {
            let output = self
                .docker_cmd(&["exec", &self.container_name, "sh", "-c", &format!("base64 {}", super_quote(&src))])
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => {
                    let stdout = String::from_utf8_lossy(&out.stdout);
                    match BASE64.decode(stdout.trim()) {
                        Ok(content) => results.push(FileDownload { path: src, content: Some(content), error: None }),
                        Err(_) => results.push(FileDownload { path: src, content: None, error: Some("permission_denied".into()) }),
                    }
                }
                Ok(_) => results.push(FileDownload { path: src, content: None, error: Some("file_not_found".into()) }),
                Err(e) => {
                    warn!("download_files failed for {src}: {e}");
                    results.push(FileDownload { path: src, content: None, error: Some("permission_denied".into()) });
                }
            }
        }
        Ok(results)
    }

    fn check_path(&self, path: &str) -> Result<(), WardenError> {
        if std::path::Path::new(path).components().any(|c| c == std::path::Component::ParentDir) {
            return Err(WardenError::BadRequest(format!("path escapes sandbox root: {path}")));
        }
        Ok(())
    }

    fn as_docker(&self) -> Option<&DockerBackend> {
        Some(self)
    }
}

fn super_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_backend_starts_idle() {
        let backend = DockerBackend::new("test-sandbox", "/workspace", None, "python:3.11-slim", "alice", Arc::new(EventBus::new()));
        assert_eq!(backend.container_status().await, ContainerStatus::Idle);
    }

    #[tokio::test]
    async fn cancel_launch_on_idle_backend_is_a_no_op() {
        let backend = DockerBackend::new("test-sandbox", "/workspace", None, "python:3.11-slim", "alice", Arc::new(EventBus::new()));
        backend.cancel_launch().await;
        assert_eq!(backend.container_status().await, ContainerStatus::Idle);
    }

    #[test]
    fn check_path_rejects_parent_dir_escape() {
        let backend = DockerBackend::new("test-sandbox", "/workspace", None, "python:3.11-slim", "alice", Arc::new(EventBus::new()));
        assert!(backend.check_path("../../etc/passwd").is_err());
        assert!(backend.check_path("notes/today.txt").is_ok());
    }
}
