//! The policy gate: a pure function of (invocation, trust ledger snapshot,
//! executor variant) deciding `{allow, require-approval, deny}` for a
//! proposed tool invocation. Rules are evaluated in a fixed order.

use flatline_sandbox::ExecutorKind;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    RequireApproval,
    Deny(String),
}

/// Everything the gate needs to evaluate a single invocation, assembled
/// fresh from current state on every call so the gate itself stays a pure
/// function.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub executor_kind: ExecutorKind,
    pub static_allowlist: &'a HashSet<String>,
    pub trust_ledger: &'a HashSet<String>,
    pub blocklist: &'a HashSet<String>,
    pub known_container_images: &'a HashSet<String>,
}

/// A proposed tool call, reduced to the fields the gate cares about.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub tool_name: &'a str,
    pub input: &'a Value,
}

impl<'a> Invocation<'a> {
    /// The target domain of an outbound-request tool call, if this
    /// invocation is one. Shared with the session runtime so an approved
    /// first-time domain can be persisted to the trust ledger.
    pub fn outbound_domain(&self) -> Option<&str> {
        if self.tool_name != "http_request" && self.tool_name != "web_fetch" {
            return None;
        }
        self.input.get("domain").and_then(Value::as_str)
    }

    fn pulled_image(&self) -> Option<&str> {
        if self.tool_name != "pull_container_image" {
            return None;
        }
        self.input.get("image").and_then(Value::as_str)
    }

    fn command(&self) -> Option<&str> {
        if self.tool_name != "shell" && self.tool_name != "exec" {
            return None;
        }
        self.input.get("command").and_then(Value::as_str)
    }

    fn target_path(&self) -> Option<&str> {
        self.input.get("path").and_then(Value::as_str)
    }
}

/// Evaluate the five rules in order, short-circuiting on the first match.
pub fn evaluate(invocation: &Invocation<'_>, ctx: &PolicyContext<'_>) -> PolicyDecision {
    // Rule 1: deny known-bad outbound targets.
    if let Some(domain) = invocation.outbound_domain() {
        if ctx.blocklist.contains(domain) {
            return PolicyDecision::Deny(format!("domain `{domain}` is blocked"));
        }

        // Rule 2: unknown domain needs approval.
        if !ctx.static_allowlist.contains(domain) && !ctx.trust_ledger.contains(domain) {
            return PolicyDecision::RequireApproval;
        }
    }

    // Rule 3: first-time container image pull needs approval.
    if let Some(image) = invocation.pulled_image() {
        if !ctx.known_container_images.contains(image) {
            return PolicyDecision::RequireApproval;
        }
    }

    // Rule 4: executor-variant-specific risk predicate.
    if ctx.executor_kind == ExecutorKind::Direct {
        if let Some(command) = invocation.command() {
            if flatline_sandbox::direct::looks_destructive(command) {
                return PolicyDecision::RequireApproval;
            }
        }
        if let Some(path) = invocation.target_path() {
            if path.contains("..") || std::path::Path::new(path).is_absolute() {
                return PolicyDecision::RequireApproval;
            }
        }
    }

    // Rule 5: otherwise allow.
    PolicyDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        allow: &'a HashSet<String>,
        trust: &'a HashSet<String>,
        block: &'a HashSet<String>,
        images: &'a HashSet<String>,
        kind: ExecutorKind,
    ) -> PolicyContext<'a> {
        PolicyContext {
            executor_kind: kind,
            static_allowlist: allow,
            trust_ledger: trust,
            blocklist: block,
            known_container_images: images,
        }
    }

    #[test]
    fn unknown_domain_requires_approval() {
        let (allow, trust, block, images) = Default::default();
        let c = ctx(&allow, &trust, &block, &images, ExecutorKind::Container);
        let input = json!({"domain": "api.example.org"});
        let inv = Invocation {
            tool_name: "http_request",
            input: &input,
        };
        assert_eq!(evaluate(&inv, &c), PolicyDecision::RequireApproval);
    }

    #[test]
    fn trusted_domain_then_allowed() {
        let allow = HashSet::new();
        let mut trust = HashSet::new();
        trust.insert("api.example.org".to_owned());
        let (block, images) = Default::default();
        let c = ctx(&allow, &trust, &block, &images, ExecutorKind::Container);
        let input = json!({"domain": "api.example.org"});
        let inv = Invocation {
            tool_name: "http_request",
            input: &input,
        };
        assert_eq!(evaluate(&inv, &c), PolicyDecision::Allow);
    }

    #[test]
    fn blocked_domain_denied_even_if_trusted() {
        let allow = HashSet::new();
        let mut trust = HashSet::new();
        trust.insert("evil.example".to_owned());
        let mut block = HashSet::new();
        block.insert("evil.example".to_owned());
        let images = HashSet::new();
        let c = ctx(&allow, &trust, &block, &images, ExecutorKind::Container);
        let input = json!({"domain": "evil.example"});
        let inv = Invocation {
            tool_name: "http_request",
            input: &input,
        };
        matches!(evaluate(&inv, &c), PolicyDecision::Deny(_));
    }

    #[test]
    fn direct_executor_flags_destructive_shell() {
        let (allow, trust, block, images) = Default::default();
        let c = ctx(&allow, &trust, &block, &images, ExecutorKind::Direct);
        let input = json!({"command": "rm -rf /"});
        let inv = Invocation {
            tool_name: "shell",
            input: &input,
        };
        assert_eq!(evaluate(&inv, &c), PolicyDecision::RequireApproval);
    }

    #[test]
    fn container_executor_ignores_direct_risk_predicate() {
        let (allow, trust, block, images) = Default::default();
        let c = ctx(&allow, &trust, &block, &images, ExecutorKind::Container);
        let input = json!({"command": "rm -rf /"});
        let inv = Invocation {
            tool_name: "shell",
            input: &input,
        };
        assert_eq!(evaluate(&inv, &c), PolicyDecision::Allow);
    }
}
