//! Non-blocking approval protocol.
//!
//! A gated tool call never blocks its session task waiting on a human. It
//! registers a short-lived [`ApprovalRecord`], returns a synthetic
//! "pending" result on the same turn, and the eventual user decision is
//! delivered back to the session through its normal event channel — the
//! same path as a new user message, no special synchronization primitive.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_EXPIRY: Duration = Duration::from_secs(5 * 60);
const BASE62_ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone)]
pub struct ApprovalRecord {
    pub short_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub session_id: String,
    pub user_id: String,
    pub created_at: Instant,
    pub expiry: Duration,
    pub outcome: ApprovalOutcome,
    /// Set once `resolve` succeeds; a second call is rejected.
    pub resolved: bool,
}

impl ApprovalRecord {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.expiry
    }
}

/// What a caller gets back after asking to resolve an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveResult {
    Ok,
    NotFound,
    Expired,
    AlreadyResolved,
    WrongUser,
}

/// Owns the table of pending approvals. Holds are short — O(1) map
/// operations only, behind a single mutex.
pub struct ApprovalManager {
    records: Mutex<HashMap<String, ApprovalRecord>>,
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a short id, store the record, and return it so the caller
    /// can route a user-facing prompt bearing it as callback payload.
    pub fn request(
        &self,
        tool_name: String,
        tool_input: Value,
        session_id: String,
        user_id: String,
    ) -> String {
        let short_id = generate_short_id();
        let record = ApprovalRecord {
            short_id: short_id.clone(),
            tool_name,
            tool_input,
            session_id,
            user_id,
            created_at: Instant::now(),
            expiry: DEFAULT_EXPIRY,
            outcome: ApprovalOutcome::Pending,
            resolved: false,
        };
        self.records.lock().insert(short_id.clone(), record);
        short_id
    }

    /// Resolve a pending approval. Verifies the id exists, is unexpired,
    /// has not already been used, and matches the expected user.
    pub fn resolve(
        &self,
        short_id: &str,
        user_id: &str,
        approved: bool,
    ) -> (ResolveResult, Option<ApprovalRecord>) {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(short_id) else {
            return (ResolveResult::NotFound, None);
        };
        if record.resolved {
            return (ResolveResult::AlreadyResolved, None);
        }
        if record.is_expired() {
            record.outcome = ApprovalOutcome::Expired;
            record.resolved = true;
            return (ResolveResult::Expired, None);
        }
        if record.user_id != user_id {
            return (ResolveResult::WrongUser, None);
        }
        record.outcome = if approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Denied
        };
        record.resolved = true;
        (ResolveResult::Ok, Some(record.clone()))
    }

    /// Count of still-pending (unresolved, unexpired) approvals for a
    /// session, surfaced in the context assembler's system prompt.
    pub fn pending_count(&self, session_id: &str) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| !r.resolved && !r.is_expired() && r.session_id == session_id)
            .count()
    }

    /// Drop expired, resolved records to bound memory growth. Safe to
    /// call periodically from the heartbeat.
    pub fn sweep_expired(&self) {
        self.records.lock().retain(|_, r| !r.is_expired() || !r.resolved);
    }
}

fn generate_short_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| BASE62_ALPHABET[rng.gen_range(0..BASE62_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_id_is_eight_base62_chars() {
        let id = generate_short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn resolve_happy_path() {
        let mgr = ApprovalManager::new();
        let id = mgr.request(
            "http_request".into(),
            json!({"domain": "api.example.org"}),
            "sess-1".into(),
            "user-1".into(),
        );
        let (result, record) = mgr.resolve(&id, "user-1", true);
        assert_eq!(result, ResolveResult::Ok);
        assert_eq!(record.unwrap().outcome, ApprovalOutcome::Approved);
    }

    #[test]
    fn resolve_rejects_wrong_user() {
        let mgr = ApprovalManager::new();
        let id = mgr.request("t".into(), json!({}), "s".into(), "user-1".into());
        let (result, _) = mgr.resolve(&id, "user-2", true);
        assert_eq!(result, ResolveResult::WrongUser);
    }

    #[test]
    fn resolve_is_single_use() {
        let mgr = ApprovalManager::new();
        let id = mgr.request("t".into(), json!({}), "s".into(), "user-1".into());
        let (first, _) = mgr.resolve(&id, "user-1", true);
        assert_eq!(first, ResolveResult::Ok);
        let (second, _) = mgr.resolve(&id, "user-1", true);
        assert_eq!(second, ResolveResult::AlreadyResolved);
    }

    #[test]
    fn unknown_id_not_found() {
        let mgr = ApprovalManager::new();
        let (result, _) = mgr.resolve("zzzzzzzz", "user-1", true);
        assert_eq!(result, ResolveResult::NotFound);
    }
}
