//! Sandbox backend (spec §4.B): the trait contract plus default file
//! operations derived from `execute` by composing shell commands, the way
//! the original Python `BaseSandbox` derives `ls_info`/`read`/`edit`/`grep_raw`
//! from a single `execute()` primitive.

pub mod docker;
pub mod local;

use async_trait::async_trait;

use crate::error::WardenError;

pub use docker::DockerBackend;
pub use local::LocalBackend;

/// Result of running one command (spec §4.B: `{output, exit_code, truncated}`).
#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteResponse {
    pub output: String,
    pub exit_code: i32,
    pub truncated: bool,
}

/// One uploaded file's outcome: `Ok` or a named failure (`permission_denied`, ...).
#[derive(Clone, Debug, PartialEq)]
pub struct FileOpResult {
    pub path: String,
    pub error: Option<String>,
}

/// A downloaded file's bytes, or a named failure (`file_not_found`, `permission_denied`).
#[derive(Clone, Debug, PartialEq)]
pub struct FileDownload {
    pub path: String,
    pub content: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// Wraps `s` in single quotes for `sh -c`, the same manual quoting convention
/// the original backends use for embedding a path into a shell command
/// (`f"base64 -d > '{dest_path}'"`). Embedded single quotes are closed,
/// escaped, and reopened.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Sandbox execution backend: a place agent tool calls run shell commands and
/// touch files. `LocalBackend` runs directly on the host; `DockerBackend` runs
/// inside a managed container.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Runs `command` through a shell, returning combined stdout/stderr capped
    /// at this backend's configured byte limit.
    async fn execute(&self, command: &str) -> Result<ExecuteResponse, WardenError>;

    /// Writes files directly (no shell quoting needed since bytes go over the
    /// backend's own upload channel — `exec`+base64 for Docker, a plain write
    /// for Local).
    async fn upload(&self, files: Vec<(String, Vec<u8>)>) -> Result<Vec<FileOpResult>, WardenError>;

    /// Reads files back out of the sandbox.
    async fn download(&self, paths: Vec<String>) -> Result<Vec<FileDownload>, WardenError>;

    /// Rejects any path that would resolve outside this backend's configured
    /// root (spec §7: "absolute-path violation in file operations").
    fn check_path(&self, path: &str) -> Result<(), WardenError>;

    /// Downcast hook so callers holding `Arc<dyn SandboxBackend>` can reach
    /// Docker-specific lifecycle operations (`cancel_launch`) without the
    /// trait itself depending on Docker. Only `DockerBackend` overrides this.
    fn as_docker(&self) -> Option<&DockerBackend> {
        None
    }

    async fn read_file(&self, path: &str) -> Result<ExecuteResponse, WardenError> {
        self.check_path(path)?;
        self.execute(&format!("cat -- {}", quote(path))).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<ExecuteResponse, WardenError> {
        self.check_path(path)?;
        let result = self
            .upload(vec![(path.to_string(), content.as_bytes().to_vec())])
            .await?;
        match result.into_iter().next() {
            Some(FileOpResult { error: None, .. }) => {
                Ok(ExecuteResponse { output: format!("wrote {path}"), exit_code: 0, truncated: false })
            }
            Some(FileOpResult { error: Some(e), .. }) => {
                Ok(ExecuteResponse { output: format!("Error: {e}"), exit_code: 1, truncated: false })
            }
            None => Ok(ExecuteResponse { output: "Error: no result".into(), exit_code: 1, truncated: false }),
        }
    }

    async fn list_dir(&self, path: &str) -> Result<ExecuteResponse, WardenError> {
        self.check_path(path)?;
        self.execute(&format!("ls -la -- {}", quote(path))).await
    }

    async fn grep(&self, pattern: &str, path: &str) -> Result<ExecuteResponse, WardenError> {
        self.check_path(path)?;
        self.execute(&format!("grep -rn -- {} {}", quote(pattern), quote(path))).await
    }

    async fn glob(&self, pattern: &str, path: &str) -> Result<ExecuteResponse, WardenError> {
        self.check_path(path)?;
        self.execute(&format!("cd -- {} && for f in {}; do echo \"$f\"; done", quote(path), pattern))
            .await
    }
}

/// Truncates `output` to `max_bytes`, appending the same marker both backends use.
pub(crate) fn truncate_output(mut output: String, max_bytes: usize) -> (String, bool) {
    if output.len() <= max_bytes {
        return (output, false);
    }
    // Byte-based truncation (spec §9 Open Question resolution): cut on a char
    // boundary at or before max_bytes so we never split a multi-byte UTF-8 sequence.
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(&format!("\n\n... Output truncated at {max_bytes} bytes."));
    (output, true)
}

/// Combines stdout/stderr the way both backends do: stderr lines get an
/// `[stderr]` prefix, and a non-zero exit code appends an `Exit code: N` line.
pub(crate) fn combine_output(stdout: &str, stderr: &str, exit_code: i32) -> String {
    let mut parts = Vec::new();
    if !stdout.is_empty() {
        parts.push(stdout.to_string());
    }
    if !stderr.is_empty() {
        for line in stderr.trim().split('\n') {
            parts.push(format!("[stderr] {line}"));
        }
    }
    let mut output = if parts.is_empty() { "<no output>".to_string() } else { parts.join("\n") };
    if exit_code != 0 {
        output = format!("{}\n\nExit code: {exit_code}", output.trim_end());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_output_appends_marker_only_when_over_limit() {
        let (out, truncated) = truncate_output("hello".to_string(), 100);
        assert_eq!(out, "hello");
        assert!(!truncated);

        let (out, truncated) = truncate_output("a".repeat(10), 4);
        assert!(truncated);
        assert!(out.starts_with("aaaa"));
        assert!(out.contains("truncated at 4 bytes"));
    }

    #[test]
    fn truncate_output_never_splits_a_utf8_boundary() {
        let s = "é".repeat(5); // 2 bytes each
        let (out, truncated) = truncate_output(s, 3);
        assert!(truncated);
        assert!(String::from_utf8(out.into_bytes()[..2].to_vec()).is_ok());
    }

    #[test]
    fn combine_output_prefixes_stderr_lines_and_appends_exit_code() {
        let out = combine_output("ok\n", "bad thing\nanother", 2);
        assert!(out.contains("ok"));
        assert!(out.contains("[stderr] bad thing"));
        assert!(out.contains("[stderr] another"));
        assert!(out.contains("Exit code: 2"));
    }

    #[test]
    fn combine_output_with_nothing_reports_no_output() {
        assert_eq!(combine_output("", "", 0), "<no output>");
    }
}
