//! Project executor interface: file writes and shell commands.
//!
//! Path and command safety is the executor's job. [`validate_relative_path`]
//! is the shared check every executor applies to paths.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::ExecutorError;

/// Result of a finished command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Side-effecting operations on the target project.
#[async_trait]
pub trait ProjectExecutor: Send + Sync {
    /// Write `content` to `path`, relative to the project root.
    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecutorError>;

    async fn read_file(&self, path: &str) -> Result<String, ExecutorError>;

    /// Run a shell command in the project root.
    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutorError>;
}

/// Accept only non-empty relative paths that stay inside the project root.
pub fn validate_relative_path(path: &str) -> Result<PathBuf, ExecutorError> {
    if path.trim().is_empty() {
        return Err(ExecutorError::PathRejected("empty path".to_string()));
    }
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ExecutorError::PathRejected(format!(
                    "{path}: parent traversal is not allowed"
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ExecutorError::PathRejected(format!(
                    "{path}: absolute paths are not allowed"
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ExecutorError::PathRejected(format!("{path}: no file name")));
    }
    Ok(clean)
}
