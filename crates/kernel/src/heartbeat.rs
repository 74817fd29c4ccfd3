//! The 60-second heartbeat: cron-scheduled task dispatch, identity
//! regeneration, health snapshots, and the weekly user-profile digest.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::approval::ApprovalManager;
use crate::budget::DailyBudget;
use crate::config::{AgentConfig, Config, RuntimePaths};
use crate::health;
use crate::identity::{self, IdentitySnapshot};
use crate::memory::{MemoryStatus, MemoryStore};
use crate::registry::ToolRegistry;
use crate::router::{CompletionRequest, Message, ModelRouter, Role};
use crate::session::OutboundMessage;
use flatline_sandbox::Executor;

pub struct HeartbeatDeps {
    pub config: Arc<Config>,
    pub agent_config: Arc<RwLock<AgentConfig>>,
    pub memory: Arc<MemoryStore>,
    pub executor: Arc<dyn Executor>,
    pub registry: Arc<ToolRegistry>,
    pub router: Arc<ModelRouter>,
    pub approvals: Arc<ApprovalManager>,
    pub daily_budget: Arc<DailyBudget>,
    pub outbound_tx: mpsc::Sender<OutboundMessage>,
    pub notify_session_id: String,
    pub paths: RuntimePaths,
    pub active_session_count: Arc<AtomicUsize>,
    pub identity_doc: Arc<RwLock<String>>,
    pub user_profile: Arc<RwLock<Option<String>>>,
}

struct SchedulerState {
    last_fired: HashMap<String, chrono::DateTime<chrono::Utc>>,
    last_digest_at: Option<chrono::DateTime<chrono::Utc>>,
    last_proactive_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SchedulerState {
    fn new() -> Self {
        Self { last_fired: HashMap::new(), last_digest_at: None, last_proactive_at: None }
    }
}

pub async fn run_heartbeat(deps: HeartbeatDeps, start_time: Instant, mut shutdown_rx: watch::Receiver<bool>) {
    let interval_secs = deps.config.heartbeat.interval_secs;
    info!(interval_secs, "heartbeat started");

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    let mut state = SchedulerState::new();
    let mut tick_count: u64 = 0;

    interval.tick().await; // skip the immediate first tick
    regenerate_identity(&deps, start_time).await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tick_count = tick_count.saturating_add(1);
                run_tick(&deps, &mut state, start_time).await;
                if tick_count.is_multiple_of(5) {
                    regenerate_identity(&deps, start_time).await;
                }
                maybe_run_weekly_digest(&deps, &mut state).await;
                maybe_run_proactive_check(&deps, &mut state).await;
                deps.approvals.sweep_expired();
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("heartbeat shutting down");
                    break;
                }
            }
        }
    }

    info!("heartbeat stopped");
}

async fn run_tick(deps: &HeartbeatDeps, state: &mut SchedulerState, start_time: Instant) {
    let now = chrono::Utc::now();
    let due = due_tasks(deps, state, now);

    for mut task in due {
        let outcome = execute_scheduled_task(deps, &task).await;
        match outcome {
            Ok(()) => {
                task.consecutive_failures = 0;
                info!(task = %task.name, "scheduled task completed");
            }
            Err(e) => {
                task.consecutive_failures = task.consecutive_failures.saturating_add(1);
                error!(task = %task.name, error = %e, failures = task.consecutive_failures, "scheduled task failed");
            }
        }
        persist_task_state(deps, &task);
        state.last_fired.insert(task.name.clone(), now);
    }

    let report = health::check_health(
        &deps.executor,
        start_time,
        deps.active_session_count.load(Ordering::SeqCst),
        deps.daily_budget.spent(),
        deps.daily_budget.limit(),
        0,
        deps.registry.dynamic_tool_count(),
        deps.memory.count_by_status(MemoryStatus::Active).unwrap_or(0),
        deps.memory.count_by_status(MemoryStatus::Pending).unwrap_or(0),
    )
    .await;

    if let Err(e) = health::write_health_file(&report, &deps.paths.health_json).await {
        warn!(error = %e, "failed to write health.json");
    }
}

/// Cron-evaluate every enabled scheduled task against the time elapsed
/// since its last recorded fire.
fn due_tasks(
    deps: &HeartbeatDeps,
    state: &SchedulerState,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<crate::config::ScheduledTask> {
    let agent_config = deps.agent_config.read();
    agent_config
        .scheduled_tasks
        .iter()
        .filter(|t| t.enabled)
        .filter(|t| {
            let schedule = match cron::Schedule::from_str(&t.cron) {
                Ok(s) => s,
                Err(e) => {
                    warn!(task = %t.name, cron = %t.cron, error = %e, "invalid cron expression, skipping");
                    return false;
                }
            };
            let since = state.last_fired.get(&t.name).copied().unwrap_or(now - chrono::Duration::hours(24));
            schedule.after(&since).take_while(|fire| *fire <= now).next().is_some()
        })
        .cloned()
        .collect()
}

async fn execute_scheduled_task(deps: &HeartbeatDeps, task: &crate::config::ScheduledTask) -> Result<(), String> {
    if let Some(builtin) = &task.builtin {
        return match builtin.as_str() {
            "health_report" => Ok(()), // the tick already writes health.json
            "memory_sweep" => {
                deps.approvals.sweep_expired();
                Ok(())
            }
            other => Err(format!("unknown builtin task `{other}`")),
        };
    }

    if let Some(tool_name) = &task.tool {
        let descriptor = deps.registry.snapshot().get(tool_name).cloned();
        let Some(descriptor) = descriptor else {
            return Err(format!("scheduled tool `{tool_name}` is not registered"));
        };
        let result = deps
            .executor
            .execute(
                &format!("python3 scripts/{tool_name}.py"),
                flatline_sandbox::ExecuteOptions {
                    timeout: Some(std::time::Duration::from_secs(descriptor.timeout_secs)),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        if result.exit_code == Some(0) && !result.timed_out {
            Ok(())
        } else {
            Err(format!("tool exited with {:?}", result.exit_code))
        }
    } else {
        Err(format!("task `{}` has neither a builtin nor a tool", task.name))
    }
}

fn persist_task_state(deps: &HeartbeatDeps, task: &crate::config::ScheduledTask) {
    let mut agent_config = deps.agent_config.write();
    if let Some(slot) = agent_config.scheduled_tasks.iter_mut().find(|t| t.name == task.name) {
        slot.consecutive_failures = task.consecutive_failures;
    }
    let Ok(body) = toml::to_string_pretty(&*agent_config) else { return };
    drop(agent_config);
    if std::fs::write(&deps.paths.agent_toml, body).is_ok() {
        commit_agent_toml(&deps.paths);
    }
}

fn commit_agent_toml(paths: &RuntimePaths) {
    let _ = std::process::Command::new("git").args(["add", "agent.toml"]).current_dir(&paths.root).status();
    let _ = std::process::Command::new("git")
        .args(["commit", "-m", "heartbeat: update scheduled task state", "--allow-empty"])
        .current_dir(&paths.root)
        .status();
}

async fn regenerate_identity(deps: &HeartbeatDeps, start_time: Instant) {
    let active_count = deps.memory.count_by_status(MemoryStatus::Active).unwrap_or(0);
    let pending_count = deps.memory.count_by_status(MemoryStatus::Pending).unwrap_or(0);
    let dynamic_tool_count = deps.registry.dynamic_tool_count();
    let docs_count = std::fs::read_dir(&deps.paths.docs_dir).map(|e| e.filter_map(|x| x.ok()).count()).unwrap_or(0);

    let agent_config = deps.agent_config.read();
    let scheduled_task_summaries: Vec<String> = agent_config
        .scheduled_tasks
        .iter()
        .filter(|t| t.enabled)
        .map(|t| match (&t.builtin, &t.tool) {
            (Some(b), _) => format!("{} (builtin: {b}, cron: {})", t.name, t.cron),
            (None, Some(tool)) => format!("{} (tool: {tool}, cron: {})", t.name, t.cron),
            (None, None) => format!("{} (cron: {})", t.name, t.cron),
        })
        .collect();
    let soul_modification_mode = format!("{:?}", agent_config.learning.soul_modification).to_lowercase();
    let agent_name = agent_config.personality.name.clone();
    drop(agent_config);

    let snapshot = deps.registry.snapshot();
    let dynamic_tool_summaries: Vec<(String, String, u64, f64)> = snapshot
        .values()
        .map(|d| (d.name.clone(), d.description.clone(), d.meta.invocation_count, d.meta.success_rate))
        .collect();

    let snap = IdentitySnapshot {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        agent_name,
        model_id: deps.config.models.default.clone(),
        oracle_model: deps.config.models.roles.get("oracle").cloned(),
        executor_kind: deps.executor.kind(),
        uptime: start_time.elapsed(),
        soul_modification_mode,
        core_tool_count: snapshot.len().saturating_sub(dynamic_tool_count),
        dynamic_tool_count,
        active_memory_count: active_count,
        pending_memory_count: pending_count,
        has_vector_search: deps.memory.has_embedder(),
        docs_count,
        session_budget_limit: deps.config.budget.max_tokens_per_session,
        daily_budget_limit: deps.config.budget.max_tokens_per_day,
        scheduled_task_summaries,
        dynamic_tool_summaries,
    };

    match identity::render_identity(&snap) {
        Ok(content) => {
            if let Err(e) = identity::write_identity_file(&content, &deps.paths.identity_md) {
                warn!(error = %e, "failed to write IDENTITY.md");
            } else {
                *deps.identity_doc.write() = content;
            }
        }
        Err(e) => warn!(error = %e, "failed to render IDENTITY.md"),
    }
}

/// Once a week (configurable), ask the router's `observer` role to
/// distill a short user profile from recent conversation and write
/// `USER.md` atomically.
async fn maybe_run_weekly_digest(deps: &HeartbeatDeps, state: &mut SchedulerState) {
    let interval = chrono::Duration::days(deps.config.heartbeat.user_digest_interval_days.into());
    let now = chrono::Utc::now();
    let due = state.last_digest_at.is_none_or(|last| now - last >= interval);
    if !due {
        return;
    }

    let recent = deps.memory.search("", 50).unwrap_or_default();
    let transcript: String = recent.iter().map(|m| m.content.clone()).collect::<Vec<_>>().join("\n");
    if transcript.trim().is_empty() {
        state.last_digest_at = Some(now);
        return;
    }

    let request = CompletionRequest {
        messages: vec![Message {
            role: Role::User,
            content: format!("Summarize what we know about the user in under 500 tokens, from this history:\n\n{transcript}"),
        }],
        system: Some("You are distilling a concise user profile from conversation history.".into()),
        tool_descriptors: vec![],
        max_tokens: Some(700),
    };

    match deps.router.complete_with_retry(None, Some("observer"), request, 1).await {
        Ok(response) => {
            if let Some(text) = response.text {
                if std::fs::write(&deps.paths.user_md, &text).is_ok() {
                    *deps.user_profile.write() = Some(text);
                    debug!("weekly user digest written");
                }
            }
        }
        Err(e) => warn!(error = %e, "weekly user digest failed"),
    }

    state.last_digest_at = Some(now);
}

/// If proactive check-ins are enabled, ask the router's `observer` role
/// at most once per `proactive_interval_mins` whether recent memories
/// warrant telling the user something unprompted. The model is expected
/// to reply with exactly `NONE` when there is nothing worth surfacing,
/// so a quiet interval produces no outbound traffic.
async fn maybe_run_proactive_check(deps: &HeartbeatDeps, state: &mut SchedulerState) {
    if !deps.config.heartbeat.proactive {
        return;
    }

    let interval = chrono::Duration::minutes(deps.config.heartbeat.proactive_interval_mins.into());
    let now = chrono::Utc::now();
    let due = state.last_proactive_at.is_none_or(|last| now - last >= interval);
    if !due {
        return;
    }
    state.last_proactive_at = Some(now);

    let recent = deps.memory.search("", 20).unwrap_or_default();
    if recent.is_empty() {
        return;
    }
    let notes: String = recent.iter().map(|m| format!("- {}", m.content)).collect::<Vec<_>>().join("\n");

    let request = CompletionRequest {
        messages: vec![Message {
            role: Role::User,
            content: format!(
                "Here is what you remember about recent activity:\n\n{notes}\n\n\
                 Is there anything worth proactively telling the user right now? \
                 Reply with exactly NONE if not."
            ),
        }],
        system: Some("You decide whether a proactive check-in is warranted; reply NONE when it isn't.".into()),
        tool_descriptors: vec![],
        max_tokens: Some(300),
    };

    match deps.router.complete_with_retry(None, Some("observer"), request, 1).await {
        Ok(response) => {
            if let Some(text) = response.text {
                let trimmed = text.trim();
                if !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("none") {
                    let msg = OutboundMessage {
                        session_id: deps.notify_session_id.clone(),
                        text: trimmed.to_owned(),
                        approval_prompt: None,
                    };
                    if deps.outbound_tx.send(msg).await.is_ok() {
                        info!("sent proactive check-in");
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "proactive check failed"),
    }
}
