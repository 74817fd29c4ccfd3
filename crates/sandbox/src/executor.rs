//! The executor contract shared by the container and direct sandbox variants.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which sandbox variant is backing the current [`Executor`].
///
/// Exposed to the policy gate (risk predicates differ per variant) and to
/// the identity document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Container,
    Direct,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Container => write!(f, "container"),
            ExecutorKind::Direct => write!(f, "direct"),
        }
    }
}

/// Options for a single [`Executor::execute`] call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Wall-clock timeout for the command. `None` falls back to the
    /// executor's configured default.
    pub timeout: Option<Duration>,
    /// Working directory relative to the sandbox root.
    pub working_dir: Option<PathBuf>,
    /// Additional environment entries. Must never carry credential values —
    /// callers are responsible for keeping the redactor's secrets out of
    /// this map; the executor does not re-check it.
    pub env: HashMap<String, String>,
    /// Optional standard input to feed the command.
    pub stdin: Option<String>,
}

/// The result of running a command to completion (or timeout) inside the
/// boundary. A nonzero exit code or a timeout is a normal result, not a
/// fault — the caller (the policy-gated tool router) interprets it.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub wall_time: Duration,
    pub timed_out: bool,
}

/// Point-in-time liveness of the sandbox boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutorHealth {
    pub kind: ExecutorKind,
    pub alive: bool,
    pub last_reset_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// A fault in the boundary itself — container gone, bind mount lost, proxy
/// unreachable. Fatal for the affected invocation and reported upward; the
/// supervisor may trigger a [`Executor::reset`] in response.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("sandbox boundary unavailable: {0}")]
    BoundaryGone(String),
    #[error("failed to reset sandbox: {0}")]
    ResetFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs an opaque command string against the sandbox's filesystem and
/// network environment, enforcing timeouts and capturing output streams.
///
/// Implemented by [`crate::container::ContainerExecutor`] (the primary,
/// isolated variant) and [`crate::direct::DirectExecutor`] (the degraded
/// fallback used when no container runtime is reachable).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command` to completion or timeout.
    async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<ExecuteResult, ExecutorError>;

    /// Report current boundary liveness.
    async fn health_check(&self) -> ExecutorHealth;

    /// Destroy and recreate the sandbox boundary from its base state. For
    /// the container variant this rebuilds from the base image and reruns
    /// the tools-directory bootstrap scripts; for the direct variant this
    /// is a no-op beyond clearing scratch state.
    async fn reset(&self) -> Result<(), ExecutorError>;

    fn kind(&self) -> ExecutorKind;
}
