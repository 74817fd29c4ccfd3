//! Pattern matching and the fixed remediation action set. The supervisor
//! only ever touches the filesystem or sends signals — it never shares
//! process memory with the agent.

use flatline_kernel::config::RuntimePaths;
use flatline_kernel::health::HealthSnapshot;
use std::time::Duration;

use crate::state::SupervisorState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationAction {
    RestartAgentProcess,
    RevertToolsDir,
    QuarantineTool(String),
    ResetSandbox,
    DisableScheduledTask(String),
    AlertOnly(String),
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestartAgentProcess => write!(f, "restart_agent_process"),
            Self::RevertToolsDir => write!(f, "revert_tools_dir"),
            Self::QuarantineTool(name) => write!(f, "quarantine_tool:{name}"),
            Self::ResetSandbox => write!(f, "reset_sandbox"),
            Self::DisableScheduledTask(name) => write!(f, "disable_scheduled_task:{name}"),
            Self::AlertOnly(reason) => write!(f, "alert_only:{reason}"),
        }
    }
}

/// A single recognized evidence pattern and the action it maps to.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub pattern: &'static str,
    pub action: RemediationAction,
}

const STALE_HEALTH_THRESHOLD: Duration = Duration::from_secs(180);
const TASK_FAILURE_THRESHOLD: u32 = 3;

/// Evaluate the fixed pattern table against current evidence, in a
/// defined priority order: process liveness first, then the sandbox
/// boundary, then tool/task-level signals, then cost.
pub fn diagnose(
    health: Option<&HealthSnapshot>,
    scheduled_tasks: &[flatline_kernel::config::ScheduledTask],
    tool_health: &[(String, flatline_kernel::registry::ToolHealth)],
    daily_burn_fraction: f64,
) -> Vec<Diagnosis> {
    let mut findings = Vec::new();

    match health {
        None => findings.push(Diagnosis {
            pattern: "missing_health_snapshot",
            action: RemediationAction::RestartAgentProcess,
        }),
        Some(snapshot) if flatline_kernel::health::is_stale(snapshot, STALE_HEALTH_THRESHOLD) => {
            findings.push(Diagnosis {
                pattern: "stale_health_snapshot",
                action: RemediationAction::RestartAgentProcess,
            });
        }
        Some(snapshot) if !snapshot.executor_alive => {
            findings.push(Diagnosis {
                pattern: "executor_boundary_gone",
                action: RemediationAction::ResetSandbox,
            });
        }
        _ => {}
    }

    for task in scheduled_tasks {
        if task.enabled && task.consecutive_failures >= TASK_FAILURE_THRESHOLD {
            findings.push(Diagnosis {
                pattern: "scheduled_task_consecutive_failures",
                action: RemediationAction::DisableScheduledTask(task.name.clone()),
            });
        }
    }

    for (name, meta) in tool_health {
        if meta.invocation_count >= 5 && meta.success_rate < 0.2 {
            findings.push(Diagnosis {
                pattern: "tool_repeatedly_failing",
                action: RemediationAction::QuarantineTool(name.clone()),
            });
        }
    }

    if daily_burn_fraction >= 0.9 {
        findings.push(Diagnosis {
            pattern: "daily_burn_rate",
            action: RemediationAction::AlertOnly(format!("daily budget at {:.0}%", daily_burn_fraction * 100.0)),
        });
    }

    findings
}

/// Apply an action. Every branch is a filesystem operation or a process
/// signal — never a shared-memory call into the running agent.
pub fn apply(paths: &RuntimePaths, state: &SupervisorState, diagnosis: &Diagnosis) -> anyhow::Result<()> {
    let fix_id = state.record_fix(diagnosis.pattern, &diagnosis.action.to_string())?;

    let result = match &diagnosis.action {
        RemediationAction::RestartAgentProcess => restart_agent_process(paths),
        RemediationAction::RevertToolsDir => revert_tools_dir(paths),
        RemediationAction::QuarantineTool(name) => quarantine_tool(paths, name),
        RemediationAction::ResetSandbox => reset_sandbox_marker(paths),
        RemediationAction::DisableScheduledTask(name) => disable_scheduled_task(paths, name),
        RemediationAction::AlertOnly(reason) => {
            tracing::warn!(reason = %reason, "alert only, no corrective action taken");
            Ok(())
        }
    };

    state.mark_verified(fix_id, result.is_ok())?;
    result
}

fn pid_file(paths: &RuntimePaths) -> std::path::PathBuf {
    paths.flatline_dir.join("agent.pid")
}

fn restart_agent_process(paths: &RuntimePaths) -> anyhow::Result<()> {
    let pid_path = pid_file(paths);
    if let Ok(pid_text) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = pid_text.trim().parse::<i32>() {
            // SIGTERM only; the agent process owns its own graceful
            // shutdown and a process supervisor (systemd, the `start`
            // subcommand's retry loop) is responsible for respawning it.
            unsafe {
                libc_kill(pid, 15);
            }
        }
    }
    Ok(())
}

/// Minimal `kill(2)` wrapper kept local so this crate does not take on a
/// full libc dependency for one syscall.
unsafe fn libc_kill(pid: i32, sig: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let _ = kill(pid, sig);
}

fn revert_tools_dir(paths: &RuntimePaths) -> anyhow::Result<()> {
    let status = std::process::Command::new("git")
        .args(["revert", "--no-edit", "HEAD"])
        .current_dir(&paths.tools_dir)
        .status()?;
    anyhow::ensure!(status.success(), "git revert failed in tools dir");
    Ok(())
}

fn quarantine_tool(paths: &RuntimePaths, name: &str) -> anyhow::Result<()> {
    let from = paths.tools_dir.join(format!("{name}.json"));
    let to = paths.tools_dir.join(format!("{name}.json.quarantined"));
    if from.exists() {
        std::fs::rename(from, to)?;
    }
    Ok(())
}

fn reset_sandbox_marker(paths: &RuntimePaths) -> anyhow::Result<()> {
    // The agent process owns the live executor handle; the supervisor
    // cannot call `Executor::reset` directly without sharing memory, so
    // it drops a marker file the agent's heartbeat watches for and acts
    // on at its next tick.
    std::fs::write(paths.flatline_dir.join("reset_requested"), chrono::Utc::now().to_rfc3339())?;
    Ok(())
}

fn disable_scheduled_task(paths: &RuntimePaths, name: &str) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&paths.agent_toml)?;
    let mut config: flatline_kernel::config::AgentConfig = toml::from_str(&text)?;
    if let Some(task) = config.scheduled_tasks.iter_mut().find(|t| t.name == name) {
        task.enabled = false;
    }
    std::fs::write(&paths.agent_toml, toml::to_string_pretty(&config)?)?;
    let _ = std::process::Command::new("git").args(["add", "agent.toml"]).current_dir(&paths.root).status();
    let _ = std::process::Command::new("git")
        .args(["commit", "-m", &format!("supervisor: disable task {name}"), "--allow-empty"])
        .current_dir(&paths.root)
        .status();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_health_triggers_restart() {
        let diagnoses = diagnose(None, &[], &[], 0.0);
        assert_eq!(diagnoses[0].action, RemediationAction::RestartAgentProcess);
    }

    #[test]
    fn failing_tool_triggers_quarantine() {
        let mut meta = flatline_kernel::registry::ToolHealth::default();
        meta.invocation_count = 10;
        meta.success_rate = 0.1;
        let diagnoses = diagnose(None, &[], &[("flaky".into(), meta)], 0.0);
        assert!(diagnoses.iter().any(|d| matches!(&d.action, RemediationAction::QuarantineTool(n) if n == "flaky")));
    }

    #[test]
    fn high_burn_rate_is_alert_only() {
        let diagnoses = diagnose(None, &[], &[], 0.95);
        assert!(diagnoses.iter().any(|d| matches!(d.action, RemediationAction::AlertOnly(_))));
    }
}
