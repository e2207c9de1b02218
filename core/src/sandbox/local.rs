//! Local sandbox backend (spec §4.B "Local variant"): runs commands via a
//! shell in a per-user working directory under a configured root, grounded on
//! `local_backend.py`'s `LocalSandboxBackend`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::WardenError;

use super::{combine_output, truncate_output, ExecuteResponse, FileDownload, FileOpResult, SandboxBackend};

/// Default per-invocation command timeout, matching the Python default (`timeout: float = 120.0`).
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Default output cap, matching `max_output_bytes: int = 100_000`.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 100_000;

/// Executes commands directly on the host, scoped to `root/username`.
pub struct LocalBackend {
    root: PathBuf,
    workdir: PathBuf,
    timeout_secs: u64,
    max_output_bytes: usize,
}

impl LocalBackend {
    /// Creates the backend and ensures `root/username` exists (spec: "Workdir
    /// is created on construction").
    pub async fn new(root: impl Into<PathBuf>, username: &str) -> Result<Self, WardenError> {
        let root = root.into();
        let workdir = root.join(username);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| WardenError::BackendError(format!("creating sandbox workdir: {e}")))?;
        Ok(Self {
            root,
            workdir,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        })
    }

    pub fn with_limits(mut self, timeout_secs: u64, max_output_bytes: usize) -> Self {
        self.timeout_secs = timeout_secs;
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Resolves `path` relative to this backend's workdir and rejects any
    /// result that would escape `root` (the "absolute-path violation" check,
    /// spec §7 — a supplement over the original, which scoped the workdir but
    /// never validated operation paths against it).
    fn resolve(&self, path: &str) -> Result<PathBuf, WardenError> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workdir.join(candidate)
        };
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.root) {
            return Err(WardenError::BadRequest(format!(
                "path escapes sandbox root: {path}"
            )));
        }
        Ok(normalized)
    }
}

/// Lexically normalizes `.`/`..` components without touching the filesystem
/// (the path need not exist yet, e.g. for a file about to be written).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    async fn execute(&self, command: &str) -> Result<ExecuteResponse, WardenError> {
        if command.trim().is_empty() {
            return Ok(ExecuteResponse {
                output: "Error: Command must be a non-empty string.".into(),
                exit_code: 1,
                truncated: false,
            });
        }

        let run = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
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
                output: format!("Error executing command: {e}"),
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
        let mut results = Vec::with_capacity(files.len());
        for (dest, content) in files {
            let resolved = match self.resolve(&dest) {
                Ok(p) => p,
                Err(_) => {
                    results.push(FileOpResult { path: dest, error: Some("permission_denied".into()) });
                    continue;
                }
            };
            let outcome = async {
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&resolved, &content).await
            }
            .await;
            match outcome {
                Ok(()) => results.push(FileOpResult { path: dest, error: None }),
                Err(e) => {
                    tracing::warn!("upload_files failed for {dest}: {e}");
                    results.push(FileOpResult { path: dest, error: Some("permission_denied".into()) });
                }
            }
        }
        Ok(results)
    }

    async fn download(&self, paths: Vec<String>) -> Result<Vec<FileDownload>, WardenError> {
        let mut results = Vec::with_capacity(paths.len());
        for src in paths {
            let resolved = match self.resolve(&src) {
                Ok(p) => p,
                Err(_) => {
                    results.push(FileDownload { path: src, content: None, error: Some("permission_denied".into()) });
                    continue;
                }
            };
            if !resolved.exists() {
                results.push(FileDownload { path: src, content: None, error: Some("file_not_found".into()) });
                continue;
            }
            match tokio::fs::read(&resolved).await {
                Ok(content) => results.push(FileDownload { path: src, content: Some(content), error: None }),
                Err(e) => {
                    tracing::warn!("download_files failed for {src}: {e}");
                    results.push(FileDownload { path: src, content: None, error: Some("permission_denied".into()) });
                }
            }
        }
        Ok(results)
    }

    fn check_path(&self, path: &str) -> Result<(), WardenError> {
        self.resolve(path).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_runs_a_command_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path(), "alice").await.unwrap();
        let resp = backend.execute("echo hi").await.unwrap();
        assert_eq!(resp.exit_code, 0);
        assert!(resp.output.contains("hi"));
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path(), "alice").await.unwrap();
        backend.upload(vec![("notes.txt".into(), b"hello".to_vec())]).await.unwrap();
        let downloaded = backend.download(vec!["notes.txt".into()]).await.unwrap();
        assert_eq!(downloaded[0].content.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn download_missing_file_reports_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path(), "alice").await.unwrap();
        let downloaded = backend.download(vec!["ghost.txt".into()]).await.unwrap();
        assert_eq!(downloaded[0].error.as_deref(), Some("file_not_found"));
    }

    #[tokio::test]
    async fn path_escaping_the_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path(), "alice").await.unwrap();
        assert!(backend.check_path("../../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn two_users_get_isolated_workdirs() {
        let dir = tempfile::tempdir().unwrap();
        let alice = LocalBackend::new(dir.path(), "alice").await.unwrap();
        let bob = LocalBackend::new(dir.path(), "bob").await.unwrap();
        alice.upload(vec![("secret.txt".into(), b"alice-only".to_vec())]).await.unwrap();
        let bob_read = bob.download(vec!["secret.txt".into()]).await.unwrap();
        assert_eq!(bob_read[0].error.as_deref(), Some("file_not_found"));
    }
}
