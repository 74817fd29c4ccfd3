//! The dynamic tool registry: a hot-reloaded, filesystem-backed map from
//! tool name to descriptor.
//!
//! Populated at startup from compiled-in core descriptors plus every
//! descriptor file under the tools directory. A `notify` watcher reloads
//! on change; readers always see either the old or the new complete map —
//! never a torn snapshot — via an atomic swap of an `Arc`.

use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The machine-readable contract for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub timeout_secs: u64,
    #[serde(default, rename = "_meta")]
    pub meta: ToolHealth,
}

/// Mutable health block tracked per tool, updated on every execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolHealth {
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_used_at: Option<chrono::DateTime<chrono::Utc>>,
    pub invocation_count: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub last_error: Option<String>,
    pub version: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid tool name `{0}`: must be alphanumeric/underscore with no path separators")]
    InvalidName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("filesystem watcher error: {0}")]
    Watch(String),
}

/// An immutable point-in-time view of the registry, safe to share across
/// threads without locking.
pub type Snapshot = Arc<HashMap<String, ToolDescriptor>>;

/// Compiled-in descriptors for tools the session dispatches directly,
/// independent of anything found under the tools directory.
pub fn core_tool_descriptors() -> Vec<ToolDescriptor> {
    vec![ToolDescriptor {
        name: "remember".to_owned(),
        description: "Record a fact, procedure, episode, or skill worth keeping beyond this turn. Independent extractions of the same content are promoted to active memory once enough of them agree.".to_owned(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "kind": {"type": "string", "enum": ["fact", "procedure", "episode", "skill"]},
                "content": {"type": "string"},
            },
            "required": ["kind", "content"],
        }),
        timeout_secs: 5,
        meta: ToolHealth::default(),
    }]
}

pub struct ToolRegistry {
    tools_dir: PathBuf,
    core_tools: Vec<ToolDescriptor>,
    snapshot: ArcSwap<HashMap<String, ToolDescriptor>>,
    /// Kept alive for as long as the registry is; dropping it stops the
    /// watch. `None` until `watch_for_changes` is called.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ToolRegistry {
    pub fn new(tools_dir: PathBuf, core_tools: Vec<ToolDescriptor>) -> Result<Self, RegistryError> {
        let registry = Self {
            tools_dir,
            core_tools,
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            watcher: Mutex::new(None),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Start a background filesystem watch on the tools directory; any
    /// create, modify, or remove event triggers a full `reload` so a
    /// descriptor dropped in by another process takes effect without a
    /// restart. Requires `self` behind an `Arc` since the watch callback
    /// runs on notify's own thread for the registry's lifetime.
    pub fn watch_for_changes(self: &Arc<Self>) -> Result<(), RegistryError> {
        if !self.tools_dir.is_dir() {
            return Ok(());
        }
        let registry = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) => {
                if let Err(e) = registry.reload() {
                    tracing::warn!(error = %e, "tool registry reload after filesystem event failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "tool registry filesystem watch error"),
        })
        .map_err(|e| RegistryError::Watch(e.to_string()))?;
        watcher
            .watch(&self.tools_dir, RecursiveMode::NonRecursive)
            .map_err(|e| RegistryError::Watch(e.to_string()))?;
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }

    /// Rebuild the map from compiled-in core descriptors plus every
    /// readable `*.json` descriptor file under the tools directory.
    /// Malformed descriptor files are logged and skipped; other tools
    /// remain available.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let mut map = HashMap::new();
        for tool in &self.core_tools {
            map.insert(tool.name.clone(), tool.clone());
        }

        if self.tools_dir.is_dir() {
            for entry in std::fs::read_dir(&self.tools_dir)?.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .map_err(RegistryError::from)
                    .and_then(|text| serde_json::from_str::<ToolDescriptor>(&text).map_err(Into::into))
                {
                    Ok(descriptor) => {
                        map.insert(descriptor.name.clone(), descriptor);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed tool descriptor");
                    }
                }
            }
        }

        self.snapshot.store(Arc::new(map));
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.load_full()
    }

    pub fn dynamic_tool_count(&self) -> usize {
        let core_names: std::collections::HashSet<&str> =
            self.core_tools.iter().map(|t| t.name.as_str()).collect();
        self.snapshot()
            .keys()
            .filter(|name| !core_names.contains(name.as_str()))
            .count()
    }

    /// Validate the name, write the descriptor and implementation files
    /// atomically (temp file + rename), and commit the change in the
    /// tools directory's git history.
    pub fn create_or_update(
        &self,
        name: &str,
        descriptor: &ToolDescriptor,
        implementation: &str,
        impl_extension: &str,
    ) -> Result<(), RegistryError> {
        validate_tool_name(name)?;

        let descriptor_path = self.tools_dir.join(format!("{name}.json"));
        let impl_path = self.tools_dir.join(format!("{name}.{impl_extension}"));

        atomic_write(&descriptor_path, &serde_json::to_vec_pretty(descriptor)?)?;
        atomic_write(&impl_path, implementation.as_bytes())?;

        commit_tools_dir(&self.tools_dir, &format!("create tool: {name}"));

        self.reload()
    }

    /// Update the mutable health block after an execution and republish.
    pub fn record_execution(
        &self,
        name: &str,
        success: bool,
        duration_ms: f64,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let descriptor_path = self.tools_dir.join(format!("{name}.json"));
        if !descriptor_path.exists() {
            // Core tools have no descriptor file on disk; health is
            // tracked in-memory only for the lifetime of the process.
            return Ok(());
        }
        let text = std::fs::read_to_string(&descriptor_path)?;
        let mut descriptor: ToolDescriptor = serde_json::from_str(&text)?;

        let meta = &mut descriptor.meta;
        let n = meta.invocation_count as f64;
        meta.success_rate = (meta.success_rate * n + if success { 1.0 } else { 0.0 }) / (n + 1.0);
        meta.average_duration_ms = (meta.average_duration_ms * n + duration_ms) / (n + 1.0);
        meta.invocation_count += 1;
        meta.last_used_at = Some(chrono::Utc::now());
        meta.version += 1;
        if !success {
            meta.last_error = error;
        }

        atomic_write(&descriptor_path, &serde_json::to_vec_pretty(&descriptor)?)?;
        self.reload()
    }

    /// Rename a tool's descriptor to a sidelined name so it no longer
    /// appears in `snapshot()`. The supervisor's quarantine action.
    pub fn quarantine(&self, name: &str) -> Result<(), RegistryError> {
        let from = self.tools_dir.join(format!("{name}.json"));
        let to = self.tools_dir.join(format!("{name}.json.quarantined"));
        if from.exists() {
            std::fs::rename(from, to)?;
        }
        self.reload()
    }

    pub fn unquarantine(&self, name: &str) -> Result<(), RegistryError> {
        let from = self.tools_dir.join(format!("{name}.json.quarantined"));
        let to = self.tools_dir.join(format!("{name}.json"));
        if from.exists() {
            std::fs::rename(from, to)?;
        }
        self.reload()
    }
}

fn validate_tool_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.contains('/')
        && !name.contains('\\');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_owned()))
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(tmp, path)
}

/// Commit the current state of the tools directory. Shells out rather
/// than embedding a mutation-capable git library — read-only history
/// inspection (the supervisor's pattern matching) can use a richer
/// library, but writes stay as plain commands.
fn commit_tools_dir(tools_dir: &Path, message: &str) {
    let _ = std::process::Command::new("git")
        .args(["add", "."])
        .current_dir(tools_dir)
        .status();
    let _ = std::process::Command::new("git")
        .args(["commit", "-m", message, "--allow-empty"])
        .current_dir(tools_dir)
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_owned(),
            description: "test tool".into(),
            parameters: serde_json::json!({"type": "object"}),
            timeout_secs: 30,
            meta: ToolHealth::default(),
        }
    }

    #[test]
    fn rejects_names_with_path_separators() {
        assert!(validate_tool_name("a/b").is_err());
        assert!(validate_tool_name("good_name").is_ok());
    }

    #[test]
    fn reload_is_all_or_nothing_against_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), serde_json::to_vec(&descriptor("good")).unwrap()).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"not json").unwrap();

        let registry = ToolRegistry::new(dir.path().to_path_buf(), vec![]).unwrap();
        let snap = registry.snapshot();
        assert!(snap.contains_key("good"));
        assert!(!snap.contains_key("bad"));
    }

    #[test]
    fn create_then_reload_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path().to_path_buf(), vec![]).unwrap();
        registry
            .create_or_update("utc_time", &descriptor("utc_time"), "print('x')", "py")
            .unwrap();
        assert!(registry.snapshot().contains_key("utc_time"));
    }

    #[test]
    fn watch_for_changes_picks_up_a_file_dropped_externally() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new(dir.path().to_path_buf(), vec![]).unwrap());
        registry.watch_for_changes().unwrap();

        std::fs::write(dir.path().join("dropped.json"), serde_json::to_vec(&descriptor("dropped")).unwrap()).unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if registry.snapshot().contains_key("dropped") {
                seen = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        assert!(seen, "registry never picked up the externally written descriptor");
    }

    #[test]
    fn quarantine_hides_tool_until_restored() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path().to_path_buf(), vec![]).unwrap();
        registry
            .create_or_update("flaky", &descriptor("flaky"), "print('x')", "py")
            .unwrap();
        assert!(registry.snapshot().contains_key("flaky"));
        registry.quarantine("flaky").unwrap();
        assert!(!registry.snapshot().contains_key("flaky"));
        registry.unquarantine("flaky").unwrap();
        assert!(registry.snapshot().contains_key("flaky"));
    }
}
