//! Model router: resolves a logical role/skill/default to a concrete
//! provider instance and delegates completion calls.
//!
//! The concrete provider HTTP clients are out of scope for this crate —
//! [`ModelProvider`] is the entire contact surface with them. The only
//! implementation shipped here is [`EchoProvider`], a test double used by
//! the kernel's own tests and by `cli status --dry-run`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tool_descriptors: Vec<crate::registry::ToolDescriptor>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("context length exceeded")]
    ContextLengthExceeded,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

/// Resolution order: skill override (if the call is tagged with a skill)
/// -> role override (if tagged with a role) -> default. When a provider
/// is unavailable the router falls back to the default; if the default
/// is also unavailable, resolution fails and the session reports an
/// error to the user.
pub struct ModelRouter {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    default: String,
    role_overrides: HashMap<String, String>,
    skill_overrides: HashMap<String, String>,
}

impl ModelRouter {
    pub fn new(default: String) -> Self {
        Self {
            providers: HashMap::new(),
            default,
            role_overrides: HashMap::new(),
            skill_overrides: HashMap::new(),
        }
    }

    pub fn register_provider(&mut self, key: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(key.into(), provider);
    }

    pub fn set_role_override(&mut self, role: impl Into<String>, provider_key: impl Into<String>) {
        self.role_overrides.insert(role.into(), provider_key.into());
    }

    pub fn set_skill_override(&mut self, skill: impl Into<String>, provider_key: impl Into<String>) {
        self.skill_overrides.insert(skill.into(), provider_key.into());
    }

    pub fn resolve(
        &self,
        skill: Option<&str>,
        role: Option<&str>,
    ) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        let candidates = [
            skill.and_then(|s| self.skill_overrides.get(s)),
            role.and_then(|r| self.role_overrides.get(r)),
            Some(&self.default),
        ];

        for key in candidates.into_iter().flatten() {
            if let Some(provider) = self.providers.get(key) {
                return Ok(provider.clone());
            }
        }

        self.providers
            .get(&self.default)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(format!("no provider registered for `{}`", self.default)))
    }

    /// Retry with bounded backoff for transient provider errors, falling
    /// back to the default provider if retries are exhausted.
    pub async fn complete_with_retry(
        &self,
        skill: Option<&str>,
        role: Option<&str>,
        request: CompletionRequest,
        max_retries: u32,
    ) -> Result<CompletionResponse, ProviderError> {
        let provider = self.resolve(skill, role)?;
        let mut attempt = 0;
        loop {
            match provider.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(ProviderError::Transient(_)) if attempt < max_retries => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(200 * 2u64.pow(attempt))).await;
                }
                Err(e) => {
                    if attempt > 0 {
                        // Exhausted retries on the originally-resolved
                        // provider; fall back to default once.
                        if let Some(default_provider) = self.providers.get(&self.default) {
                            return default_provider.complete(request).await;
                        }
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// A deterministic test double: echoes the last user message back as a
/// final assistant reply. Never used in production — concrete providers
/// are an external collaborator.
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(CompletionResponse {
            text: Some(format!("echo: {last_user}")),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: last_user.len() as u64 / 4,
                output_tokens: 8,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_skill_before_role_before_default() {
        let mut router = ModelRouter::new("default".into());
        router.register_provider("default", Arc::new(EchoProvider));
        router.register_provider("oracle", Arc::new(EchoProvider));
        router.set_role_override("observer", "oracle");
        let resolved = router.resolve(None, Some("observer"));
        assert!(resolved.is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_default_when_override_missing() {
        let mut router = ModelRouter::new("default".into());
        router.register_provider("default", Arc::new(EchoProvider));
        let resolved = router.resolve(Some("nonexistent-skill"), None);
        assert!(resolved.is_ok());
    }
}
