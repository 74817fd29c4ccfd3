//! Direct sandbox variant: runs commands on the host under a restricted
//! working directory, with no network interposition. The degraded mode —
//! the policy gate compensates by forcing approval on destructive patterns
//! and on every outbound request (see `flatline-kernel::policy`).

use crate::executor::{
    ExecuteOptions, ExecuteResult, Executor, ExecutorError, ExecutorHealth, ExecutorKind,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout as tokio_timeout;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Patterns the policy gate treats as destructive for the direct variant.
/// This is a coarse heuristic, not a content-safety claim.
const DESTRUCTIVE_PATTERNS: &[&str] = &["rm -rf", "mkfs", "dd if=", "> /dev/sd", ":(){:|:&};:"];

pub fn looks_destructive(command: &str) -> bool {
    DESTRUCTIVE_PATTERNS.iter().any(|p| command.contains(p))
}

/// True if `path` would resolve outside of `root` once joined.
pub fn escapes_root(root: &Path, path: &Path) -> bool {
    let joined = root.join(path);
    match joined.canonicalize() {
        Ok(resolved) => !resolved.starts_with(root),
        // Path doesn't exist yet (e.g. about to be created) — fall back to
        // lexical containment.
        Err(_) => !joined.starts_with(root),
    }
}

pub struct DirectExecutor {
    workspace_dir: PathBuf,
    tools_dir: PathBuf,
}

impl DirectExecutor {
    pub fn new(workspace_dir: PathBuf, tools_dir: PathBuf) -> Self {
        Self {
            workspace_dir,
            tools_dir,
        }
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }
}

#[async_trait]
impl Executor for DirectExecutor {
    async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<ExecuteResult, ExecutorError> {
        let cwd = options
            .working_dir
            .map(|p| self.workspace_dir.join(p))
            .unwrap_or_else(|| self.workspace_dir.clone());
        let inner_timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .envs(options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(stdin_data) = options.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(stdin_data.as_bytes()).await;
            }
        }

        let started = Instant::now();
        match tokio_timeout(inner_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecuteResult {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                wall_time: started.elapsed(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(ExecutorError::Io(e)),
            Err(_) => Ok(ExecuteResult {
                exit_code: None,
                stdout: String::new(),
                stderr: "command timed out".into(),
                wall_time: started.elapsed(),
                timed_out: true,
            }),
        }
    }

    async fn health_check(&self) -> ExecutorHealth {
        ExecutorHealth {
            kind: ExecutorKind::Direct,
            alive: self.workspace_dir.exists(),
            last_reset_time: None,
        }
    }

    async fn reset(&self) -> Result<(), ExecutorError> {
        // Nothing to recreate; the direct variant has no isolated state of
        // its own beyond the workspace directory, which the caller owns.
        Ok(())
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Direct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_known_destructive_patterns() {
        assert!(looks_destructive("rm -rf /"));
        assert!(!looks_destructive("ls -la"));
    }

    #[tokio::test]
    async fn runs_a_trivial_command() {
        let dir = tempfile::tempdir().unwrap();
        let exec = DirectExecutor::new(dir.path().to_path_buf(), dir.path().to_path_buf());
        let result = exec
            .execute("echo hi", ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "hi");
        assert_eq!(result.exit_code, Some(0));
    }
}
