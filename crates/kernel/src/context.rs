//! Context assembler: builds the system prompt and trims conversation
//! history for each model call, in a fixed order: identity document,
//! lessons file, user profile, injected memories, executor/tool/budget
//! notes, then the (possibly compacted) history.

use crate::memory::Memory;
use crate::router::{CompletionRequest, Message, ModelRouter, ProviderError, Role, Usage};

/// Rough token estimate used for pre-call budget checks: four characters
/// per token rather than a real tokenizer, which the kernel does not
/// depend on.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Drop the oldest messages (keeping the system/identity content intact,
/// since that is assembled separately) until the remaining history fits
/// under `budget_tokens`. A single oversized message is kept as-is rather
/// than truncated mid-content — the provider call will fail loudly on
/// `ContextLengthExceeded` instead of silently corrupting the exchange.
pub fn trim_messages(messages: &[Message], budget_tokens: u64) -> Vec<Message> {
    let mut total = estimate_messages_tokens(messages);
    let mut start = 0;
    while total > budget_tokens && start < messages.len().saturating_sub(1) {
        total -= estimate_tokens(&messages[start].content);
        start += 1;
    }
    messages[start..].to_vec()
}

/// Marks the front-of-history entry produced by [`compact_if_needed`] so
/// it can be recognized and folded into the next compaction pass instead
/// of accumulating a chain of summaries: one summary entry, re-summarized
/// wholesale when the threshold recurs again.
const SUMMARY_PREFIX: &str = "[conversation summary]\n";

/// How many of the most recent messages are left unsummarized so the
/// model keeps verbatim access to the immediate exchange.
const COMPACTION_TAIL_LEN: usize = 4;

pub fn is_summary_entry(message: &Message) -> bool {
    message.role == Role::System && message.content.starts_with(SUMMARY_PREFIX)
}

/// Out-of-band compaction call: once the projected history exceeds 60%
/// of the session's token budget, ask the model for
/// a preserved-state summary and replace the summarized prefix with a
/// single summary entry. Returns the compaction call's own usage so the
/// caller can charge it against the budget, or `None` if compaction did
/// not run this turn.
pub async fn compact_if_needed(
    router: &ModelRouter,
    conversation: &mut Vec<Message>,
    session_budget_tokens: u64,
) -> Result<Option<Usage>, ProviderError> {
    let projected = estimate_messages_tokens(conversation);
    if projected * 100 < session_budget_tokens * 60 {
        return Ok(None);
    }

    let prior_summary = conversation.first().filter(|m| is_summary_entry(m)).cloned();
    let rest = if prior_summary.is_some() { &conversation[1..] } else { &conversation[..] };

    let tail_len = COMPACTION_TAIL_LEN.min(rest.len().saturating_sub(1));
    let split = rest.len() - tail_len;
    let to_summarize = &rest[..split];
    if to_summarize.is_empty() {
        return Ok(None);
    }

    let mut prompt = String::from(
        "Summarize the conversation so far into a compact preserved-state summary, \
         bounded to roughly 500 tokens, preserving facts, decisions, and open threads. \
         Respond with only the summary text.\n\n",
    );
    if let Some(prior) = &prior_summary {
        prompt.push_str("Prior summary:\n");
        prompt.push_str(prior.content.trim_start_matches(SUMMARY_PREFIX));
        prompt.push_str("\n\n");
    }
    for message in to_summarize {
        prompt.push_str(&format!("{:?}: {}\n", message.role, message.content));
    }

    let request = CompletionRequest {
        messages: vec![Message { role: Role::User, content: prompt }],
        system: None,
        tool_descriptors: vec![],
        max_tokens: Some(1024),
    };

    let response = router.complete_with_retry(None, Some("compaction"), request, 1).await?;
    let summary_entry = Message {
        role: Role::System,
        content: format!("{SUMMARY_PREFIX}{}", response.text.unwrap_or_default()),
    };

    let tail = rest[split..].to_vec();
    *conversation = std::iter::once(summary_entry).chain(tail).collect();
    Ok(Some(response.usage))
}

#[derive(Debug, Clone, Default)]
pub struct AssemblyInputs<'a> {
    pub identity_doc: &'a str,
    pub lessons_doc: Option<&'a str>,
    pub user_profile: Option<&'a str>,
    pub memories: &'a [Memory],
    pub pending_approvals: usize,
    pub dynamic_tool_count: usize,
    pub budget_warning: Option<u8>,
    pub current_time: &'a str,
}

/// Build the complete system prompt for one model call, in the fixed
/// order: identity, lessons, user profile, memories, then ambient notes.
pub fn assemble_system_prompt(inputs: &AssemblyInputs<'_>) -> String {
    let mut sections = Vec::new();

    sections.push(inputs.identity_doc.to_owned());

    if let Some(lessons) = inputs.lessons_doc {
        if !lessons.trim().is_empty() {
            sections.push(format!("# Lessons\n\n{lessons}"));
        }
    }

    if let Some(profile) = inputs.user_profile {
        if !profile.trim().is_empty() {
            sections.push(format!("# User profile\n\n{profile}"));
        }
    }

    if !inputs.memories.is_empty() {
        let mut block = String::from("# Relevant memories\n\n");
        for memory in inputs.memories {
            block.push_str(&format!("- ({:?}) {}\n", memory.kind, memory.content));
        }
        sections.push(block);
    }

    let mut notes = format!("Current time: {}\n", inputs.current_time);
    notes.push_str(&format!("Dynamic tools available this turn: {}\n", inputs.dynamic_tool_count));
    if inputs.pending_approvals > 0 {
        notes.push_str(&format!(
            "{} tool call(s) are waiting on your approval.\n",
            inputs.pending_approvals
        ));
    }
    if let Some(pct) = inputs.budget_warning {
        notes.push_str(&format!(
            "Note: this session has used {pct}% of its token budget.\n"
        ));
    }
    sections.push(notes);

    sections.join("\n\n---\n\n")
}

/// Find the most recent user-authored message, used to seed the memory
/// search query for the turn.
pub fn last_user_text(conversation: &[Message]) -> String {
    conversation
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, MemorySource, MemoryStatus};
    use crate::router::EchoProvider;
    use std::sync::Arc;

    fn msg(role: Role, content: &str) -> Message {
        Message { role, content: content.to_owned() }
    }

    fn echo_router() -> ModelRouter {
        let mut router = ModelRouter::new("default".into());
        router.register_provider("default", Arc::new(EchoProvider));
        router
    }

    #[tokio::test]
    async fn compacts_when_over_threshold_and_keeps_one_summary_entry() {
        let router = echo_router();
        let mut conversation: Vec<Message> = (0..20)
            .map(|i| msg(if i % 2 == 0 { Role::User } else { Role::Assistant }, &"x".repeat(100)))
            .collect();

        let outcome = compact_if_needed(&router, &mut conversation, 100).await.unwrap();
        assert!(outcome.is_some());
        assert!(is_summary_entry(&conversation[0]));
        assert!(conversation.len() < 20);
    }

    #[tokio::test]
    async fn does_not_compact_under_threshold() {
        let router = echo_router();
        let mut conversation = vec![msg(Role::User, "hi")];
        let outcome = compact_if_needed(&router, &mut conversation, 100_000).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn trims_oldest_messages_first() {
        let messages = vec![
            msg(Role::User, &"a".repeat(40)),
            msg(Role::Assistant, &"b".repeat(40)),
            msg(Role::User, &"c".repeat(40)),
        ];
        let trimmed = trim_messages(&messages, 15);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].content, "c".repeat(40));
    }

    #[test]
    fn keeps_at_least_the_last_message_even_over_budget() {
        let messages = vec![msg(Role::User, &"x".repeat(4000))];
        let trimmed = trim_messages(&messages, 1);
        assert_eq!(trimmed.len(), 1);
    }

    #[test]
    fn assembly_order_is_identity_then_lessons_then_profile_then_memories() {
        let now = chrono::Utc::now();
        let mem = Memory {
            id: "m1".into(),
            kind: MemoryKind::Fact,
            content: "likes dark roast".into(),
            status: MemoryStatus::Active,
            source: MemorySource::User,
            created_at: now,
            updated_at: now,
            promoted_from: Vec::new(),
        };
        let memories = vec![mem];
        let inputs = AssemblyInputs {
            identity_doc: "IDENTITY",
            lessons_doc: Some("LESSONS"),
            user_profile: Some("PROFILE"),
            memories: &memories,
            pending_approvals: 1,
            dynamic_tool_count: 3,
            budget_warning: Some(70),
            current_time: "2026-01-01 00:00:00 UTC",
        };
        let prompt = assemble_system_prompt(&inputs);
        let identity_pos = prompt.find("IDENTITY").unwrap();
        let lessons_pos = prompt.find("LESSONS").unwrap();
        let profile_pos = prompt.find("PROFILE").unwrap();
        let memory_pos = prompt.find("dark roast").unwrap();
        assert!(identity_pos < lessons_pos);
        assert!(lessons_pos < profile_pos);
        assert!(profile_pos < memory_pos);
        assert!(prompt.contains("used 70%"));
    }
}
