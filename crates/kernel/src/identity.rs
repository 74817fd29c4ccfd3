//! Rendering of `IDENTITY.md`, the agent's own system-identity document.
//!
//! The heartbeat regenerates this file every few ticks from a fresh
//! [`IdentitySnapshot`]; the context assembler reads it back verbatim as
//! the first block of every system prompt.

use flatline_sandbox::ExecutorKind;
use minijinja::{context, Environment};
use std::path::Path;
use std::time::Duration;

const TEMPLATE: &str = r#"# Identity

You are {{ agent_name }}, version {{ version }}.

- Default model: {{ model_id }}
{%- if oracle_model %}
- Oracle model: {{ oracle_model }}
{%- endif %}
- Executor: {{ executor_kind }}
- Uptime: {{ uptime_human }}
- Soul modification: {{ soul_modification_mode }}

## Memory

- {{ active_memory_count }} active, {{ pending_memory_count }} pending
- Vector search: {{ "enabled" if has_vector_search else "disabled (full-text only)" }}
- {{ docs_count }} reference documents in docs/

## Tools

- {{ core_tool_count }} core tools, {{ dynamic_tool_count }} dynamic tools
{%- for name, description, invocations, success_rate in dynamic_tool_summaries %}
- `{{ name }}` ({{ invocations }} calls, {{ (success_rate * 100) | round }}% success): {{ description }}
{%- endfor %}

## Budget

- Session limit: {{ session_budget_limit }} tokens
- Daily limit: {{ daily_budget_limit }} tokens

## Scheduled tasks
{%- for task in scheduled_task_summaries %}
- {{ task }}
{%- else %}
- none configured
{%- endfor %}
"#;

#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    pub version: String,
    pub agent_name: String,
    pub model_id: String,
    pub oracle_model: Option<String>,
    pub executor_kind: ExecutorKind,
    pub uptime: Duration,
    pub soul_modification_mode: String,
    pub core_tool_count: usize,
    pub dynamic_tool_count: usize,
    pub active_memory_count: u64,
    pub pending_memory_count: u64,
    pub has_vector_search: bool,
    pub docs_count: usize,
    pub session_budget_limit: u64,
    pub daily_budget_limit: u64,
    pub scheduled_task_summaries: Vec<String>,
    pub dynamic_tool_summaries: Vec<(String, String, u64, f64)>,
}

pub fn render_identity(snap: &IdentitySnapshot) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("identity", TEMPLATE)?;
    let tmpl = env.get_template("identity")?;
    tmpl.render(context! {
        version => snap.version,
        agent_name => snap.agent_name,
        model_id => snap.model_id,
        oracle_model => snap.oracle_model,
        executor_kind => snap.executor_kind.to_string(),
        uptime_human => humantime::format_duration(round_to_secs(snap.uptime)).to_string(),
        soul_modification_mode => snap.soul_modification_mode,
        core_tool_count => snap.core_tool_count,
        dynamic_tool_count => snap.dynamic_tool_count,
        active_memory_count => snap.active_memory_count,
        pending_memory_count => snap.pending_memory_count,
        has_vector_search => snap.has_vector_search,
        docs_count => snap.docs_count,
        session_budget_limit => snap.session_budget_limit,
        daily_budget_limit => snap.daily_budget_limit,
        scheduled_task_summaries => snap.scheduled_task_summaries,
        dynamic_tool_summaries => snap.dynamic_tool_summaries,
    })
}

fn round_to_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}

/// Atomic temp-file-then-rename write, same pattern as the registry and
/// health snapshot writers use.
pub fn write_identity_file(content: &str, path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IdentitySnapshot {
        IdentitySnapshot {
            version: "0.1.0".into(),
            agent_name: "flatline".into(),
            model_id: "anthropic/claude-sonnet".into(),
            oracle_model: None,
            executor_kind: ExecutorKind::Container,
            uptime: Duration::from_secs(3_725),
            soul_modification_mode: "disabled".into(),
            core_tool_count: 7,
            dynamic_tool_count: 2,
            active_memory_count: 12,
            pending_memory_count: 1,
            has_vector_search: false,
            docs_count: 3,
            session_budget_limit: 200_000,
            daily_budget_limit: 2_000_000,
            scheduled_task_summaries: vec!["nightly_review (cron: 0 3 * * *)".into()],
            dynamic_tool_summaries: vec![("utc_time".into(), "current time".into(), 4, 1.0)],
        }
    }

    #[test]
    fn renders_without_error_and_includes_key_facts() {
        let out = render_identity(&sample()).unwrap();
        assert!(out.contains("flatline"));
        assert!(out.contains("12 active, 1 pending"));
        assert!(out.contains("utc_time"));
    }

    #[test]
    fn renders_with_no_scheduled_tasks() {
        let mut snap = sample();
        snap.scheduled_task_summaries.clear();
        let out = render_identity(&snap).unwrap();
        assert!(out.contains("none configured"));
    }
}
