//! The health snapshot written to `health.json` on every heartbeat tick
//! and read by the supervisor.

use flatline_sandbox::Executor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub uptime_secs: u64,
    pub executor_alive: bool,
    pub executor_kind: String,
    pub active_session_count: usize,
    pub daily_tokens_spent: u64,
    pub daily_tokens_limit: u64,
    pub pending_approval_count: usize,
    pub dynamic_tool_count: usize,
    pub memory_active_count: u64,
    pub memory_pending_count: u64,
    pub last_heartbeat_tick: chrono::DateTime<chrono::Utc>,
}

/// Collect a fresh snapshot from live component state. Each probe
/// degrades independently — a stuck executor does not prevent the rest
/// of the report from being written, since the supervisor keys off
/// individual fields.
pub async fn check_health(
    executor: &Arc<dyn Executor>,
    start_time: Instant,
    active_session_count: usize,
    daily_tokens_spent: u64,
    daily_tokens_limit: u64,
    pending_approval_count: usize,
    dynamic_tool_count: usize,
    memory_active_count: u64,
    memory_pending_count: u64,
) -> HealthSnapshot {
    let executor_health = executor.health_check().await;
    HealthSnapshot {
        generated_at: chrono::Utc::now(),
        uptime_secs: start_time.elapsed().as_secs(),
        executor_alive: executor_health.alive,
        executor_kind: executor_health.kind.to_string(),
        active_session_count,
        daily_tokens_spent,
        daily_tokens_limit,
        pending_approval_count,
        dynamic_tool_count,
        memory_active_count,
        memory_pending_count,
        last_heartbeat_tick: chrono::Utc::now(),
    }
}

/// Atomic temp-file-then-rename write so the supervisor never observes a
/// half-written `health.json`.
pub async fn write_health_file(snapshot: &HealthSnapshot, path: &Path) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(tmp, path).await
}

/// A snapshot is stale once it is older than roughly two heartbeat
/// intervals; the supervisor treats a stale file the same as a missing
/// process.
pub fn is_stale(snapshot: &HealthSnapshot, max_age: Duration) -> bool {
    let age = chrono::Utc::now() - snapshot.generated_at;
    age.to_std().map(|a| a > max_age).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_snapshot_is_not_stale() {
        let snap = HealthSnapshot {
            generated_at: chrono::Utc::now(),
            uptime_secs: 10,
            executor_alive: true,
            executor_kind: "container".into(),
            active_session_count: 0,
            daily_tokens_spent: 0,
            daily_tokens_limit: 1,
            pending_approval_count: 0,
            dynamic_tool_count: 0,
            memory_active_count: 0,
            memory_pending_count: 0,
            last_heartbeat_tick: chrono::Utc::now(),
        };
        assert!(!is_stale(&snap, Duration::from_secs(120)));
    }

    #[test]
    fn old_snapshot_is_stale() {
        let snap = HealthSnapshot {
            generated_at: chrono::Utc::now() - chrono::Duration::seconds(600),
            uptime_secs: 10,
            executor_alive: true,
            executor_kind: "container".into(),
            active_session_count: 0,
            daily_tokens_spent: 0,
            daily_tokens_limit: 1,
            pending_approval_count: 0,
            dynamic_tool_count: 0,
            memory_active_count: 0,
            memory_pending_count: 0,
            last_heartbeat_tick: chrono::Utc::now(),
        };
        assert!(is_stale(&snap, Duration::from_secs(120)));
    }
}
