//! Error taxonomy for the kernel. Kinds, not a single flat type — each
//! variant carries its own propagation policy on its face: boundary/timeout
//! errors bubble from the executor, policy/budget errors are handled
//! inline by the session loop, provider errors retry then fall back,
//! persistence errors are process-fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("sandbox boundary error: {0}")]
    Boundary(#[from] flatline_sandbox::ExecutorError),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("model provider error: {0}")]
    Provider(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed tool descriptor `{name}`: {reason}")]
    SchemaError { name: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
