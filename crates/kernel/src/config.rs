//! On-disk configuration and the resolved runtime path layout.
//!
//! Two documents with distinct ownership: [`Config`]
//! (human-owned, `config.toml` — security policy) and [`AgentConfig`]
//! (agent-owned, `agent.toml` — personality and schedules, git-committed
//! on change).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolved absolute paths under the runtime root, typically
/// `~/.wintermute`. Resolved once at startup.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub root: PathBuf,
    pub config_toml: PathBuf,
    pub agent_toml: PathBuf,
    pub env_file: PathBuf,
    pub identity_md: PathBuf,
    pub lessons_md: PathBuf,
    pub user_md: PathBuf,
    pub docs_dir: PathBuf,
    pub memory_db: PathBuf,
    pub workspace_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub health_json: PathBuf,
    pub logs_dir: PathBuf,
    pub flatline_dir: PathBuf,
}

impl RuntimePaths {
    pub fn resolve(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_toml: root.join("config.toml"),
            agent_toml: root.join("agent.toml"),
            env_file: root.join(".env"),
            identity_md: root.join("IDENTITY.md"),
            lessons_md: root.join("AGENTS.md"),
            user_md: root.join("USER.md"),
            docs_dir: root.join("docs"),
            memory_db: root.join("data").join("memory.db"),
            workspace_dir: root.join("workspace"),
            tools_dir: root.join("scripts"),
            health_json: root.join("health.json"),
            logs_dir: root.join("logs"),
            flatline_dir: root.join("flatline"),
            root,
        }
    }

    /// Create every directory this layout names, if missing. Called by
    /// `init`.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.root,
            &self.docs_dir,
            self.memory_db.parent().unwrap(),
            &self.workspace_dir,
            &self.tools_dir,
            &self.logs_dir,
            &self.flatline_dir,
            &self.flatline_dir.join("updates"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Human-owned security policy: `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub domains: DomainConfig,
    #[serde(default)]
    pub executor: ExecutorLimits,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default: String,
    #[serde(default)]
    pub roles: HashMap<String, String>,
    #[serde(default)]
    pub skills: HashMap<String, String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: "anthropic/claude-sonnet".into(),
            roles: HashMap::new(),
            skills: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub max_tokens_per_session: u64,
    pub max_tokens_per_day: u64,
    pub max_dynamic_tools_per_turn: usize,
    pub max_tool_calls_per_turn: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_session: 200_000,
            max_tokens_per_day: 2_000_000,
            max_dynamic_tools_per_turn: 20,
            max_tool_calls_per_turn: 25,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub blocklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorLimits {
    pub memory_limit_mb: u64,
    pub cpu_limit_cores: f64,
    pub process_limit: u64,
    pub base_image: String,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 1024,
            cpu_limit_cores: 1.0,
            process_limit: 128,
            base_image: "flatline-sandbox:latest".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub proactive: bool,
    pub proactive_interval_mins: u32,
    pub user_digest_interval_days: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            proactive: false,
            proactive_interval_mins: 240,
            user_digest_interval_days: 7,
        }
    }
}

/// Agent-owned configuration: `agent.toml`. Git-committed on change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub personality: Personality,
    #[serde(default)]
    pub scheduled_tasks: Vec<ScheduledTask>,
    #[serde(default)]
    pub learning: LearningFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub name: String,
    pub soul: String,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            name: "agent".into(),
            soul: String::new(),
        }
    }
}

/// The heartbeat's unit of dispatch: a cron-scheduled, optionally
/// budget-capped task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub builtin: Option<String>,
    pub tool: Option<String>,
    #[serde(default)]
    pub budget_tokens: Option<u64>,
    /// Count of consecutive failures; the supervisor disables the task
    /// after it crosses the configured threshold.
    #[serde(default)]
    pub consecutive_failures: u32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningFlags {
    #[serde(default = "default_true")]
    pub lessons_enabled: bool,
    #[serde(default)]
    pub soul_modification: SoulModification,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoulModification {
    #[default]
    Disabled,
    ProposeOnly,
    AutoApply,
}

pub fn load_config(path: &Path) -> Result<Config, crate::KernelError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| crate::KernelError::Configuration(e.to_string()))
}

pub fn load_agent_config(path: &Path) -> Result<AgentConfig, crate::KernelError> {
    if !path.exists() {
        return Ok(AgentConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| crate::KernelError::Configuration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_expected_layout() {
        let paths = RuntimePaths::resolve("/tmp/flatline-test");
        assert_eq!(paths.memory_db, PathBuf::from("/tmp/flatline-test/data/memory.db"));
        assert_eq!(paths.tools_dir, PathBuf::from("/tmp/flatline-test/scripts"));
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let cfg = load_config(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(cfg.budget.max_tokens_per_session, 200_000);
    }
}
