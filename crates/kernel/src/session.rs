//! The session runtime: one Tokio task per conversation, driven by
//! [`SessionEvent`]s delivered over its own mpsc channel.
//!
//! A session never blocks waiting on a human. A tool call that needs
//! approval returns a placeholder result on the current turn and the
//! eventual decision arrives later as an ordinary [`SessionEvent`] on the
//! same channel — there is no separate synchronization primitive for it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::approval::{ApprovalManager, ApprovalOutcome, ApprovalRecord};
use crate::budget::SessionBudget;
use crate::config::{BudgetConfig, DomainConfig};
use crate::context::{
    assemble_system_prompt, compact_if_needed, estimate_messages_tokens, last_user_text, trim_messages, AssemblyInputs,
};
use crate::memory::{ConversationEntry, MemoryKind, MemorySource, MemoryStore};
use crate::policy::{self, Invocation, PolicyContext, PolicyDecision};
use crate::redactor::Redactor;
use crate::registry::ToolRegistry;
use crate::router::{CompletionRequest, Message, ModelRouter, Role, StopReason, ToolCall};
use flatline_sandbox::{ExecuteOptions, Executor};

/// Events a session processes. Arrives on a per-session mpsc channel fed
/// by the transport/gateway layer above the kernel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    UserMessage(String),
    ApprovalResolved(ApprovalRecord),
    Cancel,
    Shutdown,
}

/// A message the session wants delivered to the user-facing transport.
/// The kernel does not know what that transport is — CLI stdout, a
/// messaging gateway, a websocket — it only produces this value.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub session_id: String,
    pub text: String,
    /// Set when this message is an approval prompt; carries the short id
    /// and tool name the gateway renders as confirm/deny affordances.
    pub approval_prompt: Option<(String, String)>,
}

/// Resources shared by one running session. Bundled to avoid long
/// parameter lists through the turn loop.
pub struct SessionConfig {
    pub session_id: String,
    pub user_id: String,
    pub router: Arc<ModelRouter>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<dyn Executor>,
    pub memory: Arc<MemoryStore>,
    pub budget: SessionBudget,
    pub budget_limits: BudgetConfig,
    pub approval_manager: Arc<ApprovalManager>,
    pub redactor: Arc<Redactor>,
    pub domains: DomainConfig,
    pub egress: Arc<flatline_sandbox::EgressFilter>,
    pub known_container_images: Arc<RwLock<HashSet<String>>>,
    pub identity_doc: Arc<RwLock<String>>,
    pub lessons_doc: Arc<RwLock<Option<String>>>,
    pub user_profile: Arc<RwLock<Option<String>>>,
    pub outbound_tx: mpsc::Sender<OutboundMessage>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 4096;

/// Top-level entry point spawned as a Tokio task per session. Runs until
/// `Shutdown` is received or the channel closes.
pub async fn run_session(cfg: SessionConfig, mut event_rx: mpsc::Receiver<SessionEvent>) {
    info!(session_id = %cfg.session_id, user_id = %cfg.user_id, "session started");
    let mut conversation: Vec<Message> = Vec::new();

    loop {
        match event_rx.recv().await {
            Some(SessionEvent::UserMessage(text)) => {
                debug!(session_id = %cfg.session_id, "received user message");
                match cfg.redactor.inbound_screen(&text) {
                    crate::redactor::InboundDecision::Blocked => {
                        warn!(session_id = %cfg.session_id, "inbound message blocked, looked mostly like a credential");
                        send_text(&cfg, "That message looked like it contained a credential, so I didn't process it.").await;
                        continue;
                    }
                    crate::redactor::InboundDecision::Accept(screened) => {
                        conversation.push(Message { role: Role::User, content: screened.clone() });
                        let entry = ConversationEntry {
                            session_id: cfg.session_id.clone(),
                            role: "user".into(),
                            content: screened,
                            tokens_used: None,
                        };
                        if let Err(e) = cfg.memory.save_conversation(entry).await {
                            warn!(error = %e, "failed to save user conversation entry");
                        }
                        run_agent_turn(&cfg, &mut conversation).await;
                    }
                }
            }
            Some(SessionEvent::ApprovalResolved(record)) => {
                debug!(session_id = %cfg.session_id, "received approval resolution");
                handle_approval_resolved(&cfg, &mut conversation, record).await;
            }
            Some(SessionEvent::Cancel) => {
                debug!(session_id = %cfg.session_id, "turn cancelled");
            }
            Some(SessionEvent::Shutdown) | None => {
                info!(session_id = %cfg.session_id, "session shutting down");
                break;
            }
        }
    }
}

/// One full reasoning turn: may involve several model calls while the
/// provider keeps requesting tool use.
async fn run_agent_turn(cfg: &SessionConfig, conversation: &mut Vec<Message>) {
    let tool_call_count = AtomicU32::new(0);

    loop {
        let query = last_user_text(conversation);
        let memories = match cfg.memory.search(&query, 5) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "memory search failed, proceeding without memories");
                Vec::new()
            }
        };

        let pending_approvals = cfg.approval_manager.pending_count(&cfg.session_id);
        let current_time = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let snapshot = cfg.registry.snapshot();
        let tool_descriptors: Vec<crate::registry::ToolDescriptor> = snapshot
            .values()
            .take(cfg.budget_limits.max_dynamic_tools_per_turn)
            .cloned()
            .collect();

        let identity_doc = cfg.identity_doc.read().clone();
        let lessons_doc = cfg.lessons_doc.read().clone();
        let user_profile = cfg.user_profile.read().clone();

        let inputs = AssemblyInputs {
            identity_doc: &identity_doc,
            lessons_doc: lessons_doc.as_deref(),
            user_profile: user_profile.as_deref(),
            memories: &memories,
            pending_approvals,
            dynamic_tool_count: tool_descriptors.len(),
            budget_warning: None,
            current_time: &current_time,
        };
        let system_prompt = assemble_system_prompt(&inputs);

        match compact_if_needed(&cfg.router, conversation, cfg.budget_limits.max_tokens_per_session).await {
            Ok(Some(usage)) => {
                debug!(input = usage.input_tokens, output = usage.output_tokens, "compacted conversation history");
                cfg.budget.add(usage.input_tokens + usage.output_tokens);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "compaction call failed, continuing with untrimmed history"),
        }

        let trimmed = trim_messages(conversation, cfg.budget_limits.max_tokens_per_session);
        let estimated = estimate_messages_tokens(&trimmed);

        match cfg.budget.add(estimated) {
            crate::budget::BudgetOutcome::SessionExhausted => {
                send_text(cfg, "This session has used its token budget. Say `continue` to renew it if you want to keep going.").await;
                break;
            }
            crate::budget::BudgetOutcome::DailyExhausted => {
                send_text(cfg, "The daily token budget is exhausted; this will renew at UTC midnight.").await;
                break;
            }
            _ => {}
        }

        let request = CompletionRequest {
            messages: trimmed,
            system: Some(system_prompt),
            tool_descriptors,
            max_tokens: Some(DEFAULT_MAX_RESPONSE_TOKENS),
        };

        let response = match cfg.router.complete_with_retry(None, None, request, 2).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "model completion failed");
                send_text(cfg, &format!("Model error: {e}")).await;
                break;
            }
        };

        if let Some(text) = &response.text {
            if !text.is_empty() {
                send_text(cfg, &cfg.redactor.redact(text)).await;
                let entry = ConversationEntry {
                    session_id: cfg.session_id.clone(),
                    role: "assistant".into(),
                    content: text.clone(),
                    tokens_used: Some((response.usage.input_tokens + response.usage.output_tokens) as i64),
                };
                if let Err(e) = cfg.memory.save_conversation(entry).await {
                    warn!(error = %e, "failed to save assistant conversation entry");
                }
            }
        }
        conversation.push(Message {
            role: Role::Assistant,
            content: response.text.clone().unwrap_or_default(),
        });

        if response.tool_calls.is_empty() {
            break;
        }

        for call in &response.tool_calls {
            let count = tool_call_count.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = if count > cfg.budget_limits.max_tool_calls_per_turn {
                format!("error: exceeded the limit of {} tool calls for this turn", cfg.budget_limits.max_tool_calls_per_turn)
            } else {
                dispatch_tool_call(cfg, call).await
            };
            conversation.push(Message { role: Role::User, content: format!("tool `{}` result: {}", call.name, outcome) });
        }

        if response.stop_reason != StopReason::ToolUse {
            break;
        }
    }
}

/// Evaluate policy for one tool call and execute, request approval, or
/// deny accordingly. `remember` is handled here directly: it writes to
/// the memory store rather than running anything in the sandbox, so it
/// never touches the policy gate or the executor.
async fn dispatch_tool_call(cfg: &SessionConfig, call: &ToolCall) -> String {
    if call.name == "remember" {
        return dispatch_remember(cfg, call).await;
    }

    let trust_ledger: HashSet<String> = cfg.memory.trusted_domains().unwrap_or_default().into_iter().collect();
    let static_allowlist: HashSet<String> = cfg.domains.allowlist.iter().cloned().collect();
    let blocklist: HashSet<String> = cfg.domains.blocklist.iter().cloned().collect();
    let known_images = cfg.known_container_images.read().clone();

    let ctx = PolicyContext {
        executor_kind: cfg.executor.kind(),
        static_allowlist: &static_allowlist,
        trust_ledger: &trust_ledger,
        blocklist: &blocklist,
        known_container_images: &known_images,
    };
    let invocation = Invocation { tool_name: &call.name, input: &call.input };
    let decision = policy::evaluate(&invocation, &ctx);

    match decision {
        PolicyDecision::Allow => execute_and_record(cfg, call).await,
        PolicyDecision::Deny(reason) => format!("denied: {reason}"),
        PolicyDecision::RequireApproval => {
            let short_id = cfg.approval_manager.request(
                call.name.clone(),
                call.input.clone(),
                cfg.session_id.clone(),
                cfg.user_id.clone(),
            );
            let _ = cfg
                .outbound_tx
                .send(OutboundMessage {
                    session_id: cfg.session_id.clone(),
                    text: format!("Tool `{}` needs your approval.", call.name),
                    approval_prompt: Some((short_id, call.name.clone())),
                })
                .await;
            "pending: waiting for approval, I'll continue once you respond".to_owned()
        }
    }
}

/// Record an extraction as a `pending` memory. Promotion to `active`
/// happens inside the memory store once enough consistent extractions
/// have landed; this call only ever reports what it did locally.
async fn dispatch_remember(cfg: &SessionConfig, call: &ToolCall) -> String {
    let kind = match call.input.get("kind").and_then(Value::as_str) {
        Some("fact") => MemoryKind::Fact,
        Some("procedure") => MemoryKind::Procedure,
        Some("episode") => MemoryKind::Episode,
        Some("skill") => MemoryKind::Skill,
        _ => return "error: `kind` must be one of fact, procedure, episode, skill".to_owned(),
    };
    let content = match call.input.get("content").and_then(Value::as_str) {
        Some(c) if !c.trim().is_empty() => c.to_owned(),
        _ => return "error: `content` must be a non-empty string".to_owned(),
    };

    match cfg.memory.record_extraction(kind, cfg.redactor.redact(&content), MemorySource::Agent).await {
        Ok(memory) => format!("recorded as pending ({})", memory.id),
        Err(e) => {
            warn!(error = %e, "failed to record extraction");
            format!("error: could not record memory: {e}")
        }
    }
}

async fn execute_and_record(cfg: &SessionConfig, call: &ToolCall) -> String {
    let descriptor = cfg.registry.snapshot().get(&call.name).cloned();
    let timeout = descriptor
        .as_ref()
        .map(|d| std::time::Duration::from_secs(d.timeout_secs))
        .unwrap_or(std::time::Duration::from_secs(30));
    let command = build_command(&call.name, &call.input);

    let start = std::time::Instant::now();
    let result = cfg
        .executor
        .execute(&command, ExecuteOptions { timeout: Some(timeout), ..Default::default() })
        .await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(outcome) => {
            let success = outcome.exit_code == Some(0) && !outcome.timed_out;
            let _ = cfg.registry.record_execution(&call.name, success, duration_ms, None);
            let redacted_stdout = cfg.redactor.redact(&outcome.stdout);
            let redacted_stderr = cfg.redactor.redact(&outcome.stderr);
            if outcome.timed_out {
                format!("error: tool timed out after {:?}", outcome.wall_time)
            } else if success {
                redacted_stdout
            } else {
                format!("error (exit {:?}): {redacted_stderr}", outcome.exit_code)
            }
        }
        Err(e) => {
            let _ = cfg.registry.record_execution(&call.name, false, duration_ms, Some(e.to_string()));
            format!("error: sandbox boundary fault: {e}")
        }
    }
}

/// Translate a tool call into a command line for the executor. Core
/// tools are interpreted directly; dynamic tools are dispatched to their
/// registered script via the stdin/stdout JSON contract.
fn build_command(tool_name: &str, input: &Value) -> String {
    match tool_name {
        "shell" | "exec" => input.get("command").and_then(Value::as_str).unwrap_or_default().to_owned(),
        _ => format!("python3 scripts/{tool_name}.py"),
    }
}

async fn handle_approval_resolved(cfg: &SessionConfig, conversation: &mut Vec<Message>, record: ApprovalRecord) {
    match record.outcome {
        ApprovalOutcome::Approved => {
            let call = ToolCall { id: record.short_id.clone(), name: record.tool_name.clone(), input: record.tool_input.clone() };
            let invocation = Invocation { tool_name: &call.name, input: &call.input };
            if let Some(domain) = invocation.outbound_domain() {
                if let Err(e) = cfg.memory.trust_domain(domain, "user").await {
                    warn!(error = %e, domain = %domain, "failed to persist trust ledger entry after approval");
                }
                cfg.egress.trust_domain(domain);
            }
            let outcome = execute_and_record(cfg, &call).await;
            send_text(cfg, &format!("Approved tool `{}` executed.", record.tool_name)).await;
            conversation.push(Message {
                role: Role::User,
                content: format!("tool `{}` (approved) result: {outcome}", record.tool_name),
            });
            run_agent_turn(cfg, conversation).await;
        }
        ApprovalOutcome::Denied => {
            send_text(cfg, &format!("Tool `{}` was denied.", record.tool_name)).await;
            conversation.push(Message {
                role: Role::User,
                content: format!("tool `{}` was denied by the user", record.tool_name),
            });
            run_agent_turn(cfg, conversation).await;
        }
        ApprovalOutcome::Expired => {
            send_text(cfg, "An approval request expired before it was answered.").await;
        }
        ApprovalOutcome::Pending => {
            warn!(session_id = %cfg.session_id, "handle_approval_resolved called with a still-pending record");
        }
    }
}

async fn send_text(cfg: &SessionConfig, text: &str) {
    let msg = OutboundMessage { session_id: cfg.session_id.clone(), text: text.to_owned(), approval_prompt: None };
    if let Err(e) = cfg.outbound_tx.send(msg).await {
        error!(error = %e, "failed to deliver outbound message, receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_uses_shell_field_for_shell_tool() {
        let input = serde_json::json!({"command": "echo hi"});
        assert_eq!(build_command("shell", &input), "echo hi");
    }

    #[test]
    fn build_command_dispatches_dynamic_tool_to_its_script() {
        let input = serde_json::json!({});
        assert_eq!(build_command("utc_time", &input), "python3 scripts/utc_time.py");
    }
}
