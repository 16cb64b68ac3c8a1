//! One-shot external command execution with a timeout.
//!
//! Used for short-lived helpers such as `ffprobe`; long-running encoders go
//! through [`crate::supervisor`] instead.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Output captured from a finished command.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Builder for a single tool invocation.
///
/// ```no_run
/// use mq_av::ToolCommand;
///
/// # async fn example() -> mq_core::Result<()> {
/// let out = ToolCommand::new("ffprobe")
///     .args(["-v", "error", "-show_format"])
///     .arg("/media/movie.mkv")
///     .execute()
///     .await?;
/// println!("{}", out.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, s: impl Into<String>) -> Self {
        self.args.push(s.into());
        self
    }

    pub fn args(mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Run to completion, capturing stdout and stderr.
    ///
    /// Spawn failures, non-zero exits and timeouts all surface as
    /// [`mq_core::Error::Tool`]; a timed-out process is killed.
    pub async fn execute(&self) -> mq_core::Result<ToolOutput> {
        let tool = self.tool_name();

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| mq_core::Error::tool(&tool, format!("failed to spawn: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(mq_core::Error::tool(
                    tool,
                    format!("I/O error waiting for process: {e}"),
                ))
            }
            // Dropping the future drops the child, and kill_on_drop reaps it.
            Err(_) => {
                return Err(mq_core::Error::tool(
                    tool,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        };

        let result = ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.status.success() {
            return Err(mq_core::Error::tool(
                tool,
                format!("exited with status {}: {}", result.status, result.stderr.trim()),
            ));
        }

        tracing::trace!(tool = %tool, args = ?self.args, "command finished");
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = ToolCommand::new("sh")
            .args(["-c", "echo hello"])
            .execute()
            .await
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_includes_stderr() {
        let err = ToolCommand::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .execute()
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Tool error [sh]"), "unexpected error: {msg}");
        assert!(msg.contains("broken"), "unexpected error: {msg}");
    }

    #[tokio::test]
    async fn nonexistent_tool() {
        let result = ToolCommand::new("nonexistent_tool_xyz_12345").execute().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timeout_fires() {
        let err = ToolCommand::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
    }
}
