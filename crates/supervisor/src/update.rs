//! Binary self-update lifecycle: check a release index, verify a
//! checksum, wait for an idle window, back up the current binary,
//! replace it, watch agent health, and roll back on regression.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flatline_kernel::config::RuntimePaths;
use flatline_kernel::health::HealthSnapshot;

use crate::state::SupervisorState;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReleaseIndexEntry {
    pub version: String,
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent did not report healthy within the watch window")]
    HealthWatchTimedOut,
}

/// Poll a release index URL and return the newest entry if it differs
/// from the currently running version.
pub async fn check_for_update(
    client: &reqwest::Client,
    index_url: &str,
    current_version: &str,
) -> Result<Option<ReleaseIndexEntry>, UpdateError> {
    let entries: Vec<ReleaseIndexEntry> = client.get(index_url).send().await?.json().await?;
    Ok(entries.into_iter().find(|e| e.version != current_version))
}

pub async fn download_and_verify(
    client: &reqwest::Client,
    entry: &ReleaseIndexEntry,
    dest: &Path,
) -> Result<(), UpdateError> {
    let bytes = client.get(&entry.url).send().await?.bytes().await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let actual = hex_encode(&hasher.finalize());
    if actual != entry.sha256 {
        return Err(UpdateError::ChecksumMismatch { expected: entry.sha256.clone(), actual });
    }
    tokio::fs::write(dest, &bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(dest)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(dest, perms)?;
    }
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// An update only proceeds when no session has been active recently,
/// avoiding an in-flight turn getting killed mid-response.
pub fn in_idle_window(last_session_activity: Option<chrono::DateTime<chrono::Utc>>, min_idle: Duration) -> bool {
    match last_session_activity {
        None => true,
        Some(last) => (chrono::Utc::now() - last).to_std().map(|elapsed| elapsed >= min_idle).unwrap_or(false),
    }
}

fn backup_path(current_binary: &Path) -> PathBuf {
    current_binary.with_extension("prev")
}

/// Perform the full replace-then-watch-then-possibly-rollback sequence.
/// Only exits the current process (status 10, signalling a supervised
/// restart) after the new binary's agent reports healthy within the
/// watch window; otherwise the `.prev` backup is restored in place.
pub async fn apply_update(
    paths: &RuntimePaths,
    state: &SupervisorState,
    current_binary: &Path,
    new_binary: &Path,
    current_version: &str,
    new_version: &str,
    watch_health: impl Fn() -> Option<HealthSnapshot>,
    watch_window: Duration,
) -> Result<(), UpdateError> {
    let update_id = state.record_update_start(current_version, new_version).map_err(|e| {
        tracing::error!(error = %e, "failed to record update start");
        UpdateError::Io(std::io::Error::other(e.to_string()))
    })?;

    let backup = backup_path(current_binary);
    std::fs::copy(current_binary, &backup)?;
    std::fs::rename(new_binary, current_binary)?;

    let deadline = std::time::Instant::now() + watch_window;
    let mut healthy = false;
    while std::time::Instant::now() < deadline {
        if let Some(snapshot) = watch_health() {
            if snapshot.executor_alive && !flatline_kernel::health::is_stale(&snapshot, Duration::from_secs(120)) {
                healthy = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    if healthy {
        let _ = state.record_update_outcome(update_id, "applied");
        let _ = std::fs::remove_file(paths.flatline_dir.join("reset_requested"));
        Ok(())
    } else {
        std::fs::rename(&backup, current_binary)?;
        let _ = state.record_update_outcome(update_id, "rolled_back");
        Err(UpdateError::HealthWatchTimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_window_true_when_never_active() {
        assert!(in_idle_window(None, Duration::from_secs(60)));
    }

    #[test]
    fn idle_window_false_when_recently_active() {
        let now = chrono::Utc::now();
        assert!(!in_idle_window(Some(now), Duration::from_secs(600)));
    }
}
