//! Project executor backed by the local file system and `sh -c`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use agentry_core::executor::{validate_relative_path, CommandOutput, ProjectExecutor};
use agentry_core::ExecutorError;

const DEFAULT_SHELL: &str = "sh";

/// Writes files and runs commands inside one project root.
///
/// Paths are validated before use: absolute paths and `..` traversal are
/// rejected, so nothing outside the root is ever touched.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    root: PathBuf,
    shell: String,
}

impl LocalExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shell: DEFAULT_SHELL.to_string(),
        }
    }

    /// Create the root directory (and parents) if needed.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, ExecutorError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;
        Ok(Self::new(root))
    }

    /// Shell used to interpret commands. Called as `<shell> -c <command>`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ExecutorError> {
        Ok(self.root.join(validate_relative_path(path)?))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> ExecutorError {
    ExecutorError::Io(format!("{}: {err}", path.display()))
}

#[async_trait]
impl ProjectExecutor for LocalExecutor {
    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecutorError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| io_error(&target, e))?;
        debug!(path = %target.display(), bytes = content.len(), "file written");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, ExecutorError> {
        let target = self.resolve(path)?;
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|e| io_error(&target, e))
    }

    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutorError> {
        if command.trim().is_empty() {
            return Err(ExecutorError::Io("empty command".to_string()));
        }
        let started = Instant::now();

        // Dropping the child on timeout kills it.
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Io(format!("cannot spawn {command:?}: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ExecutorError::Io(format!("{command:?}: {e}")))?,
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "command timed out");
                return Err(ExecutorError::Timeout {
                    command: command.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(
            command = %command,
            exit_code,
            duration_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
