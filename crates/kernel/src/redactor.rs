//! The single chokepoint every string leaving the sandbox passes through
//! before reaching the conversation history or the user-facing channel.
//!
//! Two layered passes: exact substring replacement of values loaded from
//! the credentials file at startup, then regex-based replacement of known
//! token formats. Also screens inbound user messages for pasted
//! credentials.

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

/// Well-known secret-token shapes, compiled once for the process. The
/// authoritative, maintained pattern table lives outside the kernel's
/// scope; this covers the common cases so the redactor is never a no-op
/// out of the box.
static DEFAULT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"sk-ant-[a-zA-Z0-9_-]{20,}",
        r"sk-[a-zA-Z0-9]{20,}",
        r"ghp_[a-zA-Z0-9]{36}",
        r"ntn_[a-zA-Z0-9]{20,}",
        r"AKIA[0-9A-Z]{16}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Outcome of screening an inbound user message for accidental credential
/// paste.
pub enum InboundDecision {
    /// Message passed through unchanged (or with an in-place span
    /// replacement) and may enter the pipeline.
    Accept(String),
    /// More than half the message looked like a credential; the message
    /// never entered the pipeline at all.
    Blocked,
}

/// A pure function from string to string, built once at startup from the
/// credentials file and a small built-in set of known token-format
/// patterns. The pattern contents are an external concern; this module
/// owns only the mechanism and its invocation sites.
pub struct Redactor {
    exact: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Build from the literal values read from the credentials (`.env`)
    /// file plus a fixed pattern table for common token shapes.
    pub fn new(credential_values: Vec<String>) -> Self {
        Self {
            exact: credential_values.into_iter().filter(|s| !s.is_empty()).collect(),
            patterns: DEFAULT_PATTERNS.clone(),
        }
    }

    /// Scrub every known credential value and pattern-matched token from
    /// `input`. Never bypassable: every path from executor output into
    /// history or the outbound user channel must call this.
    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_owned();
        for secret in &self.exact {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        for pattern in &self.patterns {
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, REDACTED).into_owned();
            }
        }
        out
    }

    /// Screen an inbound user message. If more than half its characters
    /// belong to a matched credential span, the message is dropped
    /// wholesale; otherwise the offending span is replaced in place.
    pub fn inbound_screen(&self, input: &str) -> InboundDecision {
        let total_len = input.chars().count().max(1);
        let mut matched_len = 0usize;
        let mut out = input.to_owned();

        for secret in &self.exact {
            if !secret.is_empty() && out.contains(secret.as_str()) {
                matched_len += out.matches(secret.as_str()).count() * secret.chars().count();
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        for pattern in &self.patterns {
            for m in pattern.find_iter(input) {
                matched_len += m.as_str().chars().count();
            }
            if pattern.is_match(&out) {
                out = pattern.replace_all(&out, REDACTED).into_owned();
            }
        }

        if matched_len * 2 > total_len {
            InboundDecision::Blocked
        } else {
            InboundDecision::Accept(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_exact_secret() {
        let r = Redactor::new(vec!["sup3r-s3cr3t".into()]);
        assert_eq!(r.redact("token=sup3r-s3cr3t"), "token=[REDACTED]");
    }

    #[test]
    fn redacts_known_pattern() {
        let r = Redactor::new(vec![]);
        let out = r.redact("use key sk-ant-REDACTED please");
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("sk-ant-"));
    }

    #[test]
    fn blocks_message_mostly_credential() {
        let r = Redactor::new(vec![]);
        let msg = "ntn_abcdefghijklmnopqrstuvwxyz0123456789";
        match r.inbound_screen(msg) {
            InboundDecision::Blocked => {}
            InboundDecision::Accept(_) => panic!("expected block"),
        }
    }

    #[test]
    fn accepts_message_with_small_credential_span() {
        let r = Redactor::new(vec![]);
        let msg = "here is a long message describing my day and also sk-ant-REDACTED just in case, but mostly unrelated prose that goes on for a while to dilute the ratio comfortably past half";
        match r.inbound_screen(msg) {
            InboundDecision::Accept(text) => assert!(!text.contains("sk-ant-")),
            InboundDecision::Blocked => panic!("expected accept with in-place redaction"),
        }
    }
}
