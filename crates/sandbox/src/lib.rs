//! The sandbox boundary the runtime kernel executes model-proposed commands inside.
//!
//! Two independent concerns live here: the [`Executor`] trait and its two
//! variants (container, direct), and the [`egress`] proxy that forces
//! outbound sandbox traffic through a domain allowlist. Neither component
//! attempts to understand the *content* of what runs inside the boundary —
//! containment here is perimeter, not semantics.

pub mod container;
pub mod direct;
pub mod egress;
pub mod executor;

pub use executor::{
    ExecuteOptions, ExecuteResult, Executor, ExecutorError, ExecutorHealth, ExecutorKind,
};

pub use container::ContainerExecutor;
pub use direct::DirectExecutor;
pub use egress::{AllowlistSnapshot, EgressFilter};

/// Probe for a usable container runtime and construct the appropriate
/// [`Executor`], falling back to the direct variant with a warning log
/// event when no container runtime is reachable.
///
/// There is no configuration knob for this choice — the system adapts.
pub async fn select_executor(cfg: ExecutorConfig) -> Box<dyn Executor> {
    match ContainerExecutor::connect(cfg.clone()).await {
        Ok(exec) => Box::new(exec),
        Err(e) => {
            tracing::warn!(error = %e, "container runtime unavailable, falling back to direct executor");
            Box::new(DirectExecutor::new(cfg.workspace_dir, cfg.tools_dir))
        }
    }
}

/// Shared executor configuration resolved from `config.toml`.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workspace_dir: std::path::PathBuf,
    pub tools_dir: std::path::PathBuf,
    pub base_image: String,
    pub egress_proxy_addr: std::net::SocketAddr,
    pub memory_limit_bytes: u64,
    pub cpu_limit_nanos: u64,
    pub process_limit: u64,
    pub inner_timeout_grace: std::time::Duration,
    pub outer_timeout_grace: std::time::Duration,
}
