//! Session-scoped and process-wide daily token budgets, with
//! pause-and-renew semantics.
//!
//! Session exhaustion pauses, it never kills: the per-session cap guards
//! against runaway turn loops, not against a user who wants to keep
//! going. Daily exhaustion pauses until the shared counter resets at the
//! configured boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed warning thresholds as fractions of the relevant limit.
const WARNING_THRESHOLDS: [f64; 3] = [0.70, 0.85, 0.95];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetOutcome {
    Ok,
    Warning(u8),
    SessionExhausted,
    DailyExhausted,
}

/// Process-wide counter shared across every session. Modifications are
/// atomic; it only decreases at the configured day-boundary reset.
pub struct DailyBudget {
    spent: AtomicU64,
    limit: u64,
    reset_at: parking_lot::Mutex<chrono::DateTime<chrono::Utc>>,
}

impl DailyBudget {
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            spent: AtomicU64::new(0),
            limit,
            reset_at: parking_lot::Mutex::new(next_midnight_utc()),
        })
    }

    pub fn add(&self, tokens: u64) -> BudgetOutcome {
        self.maybe_reset();
        let total = self.spent.fetch_add(tokens, Ordering::SeqCst) + tokens;
        classify(total, self.limit, BudgetOutcome::DailyExhausted)
    }

    pub fn spent(&self) -> u64 {
        self.spent.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn maybe_reset(&self) {
        let mut reset_at = self.reset_at.lock();
        if chrono::Utc::now() >= *reset_at {
            self.spent.store(0, Ordering::SeqCst);
            *reset_at = next_midnight_utc();
        }
    }
}

fn next_midnight_utc() -> chrono::DateTime<chrono::Utc> {
    let now = chrono::Utc::now();
    (now + chrono::Duration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

/// A single session's token counter and pause flag, plus a handle to the
/// shared daily budget it also charges against.
pub struct SessionBudget {
    spent: AtomicU64,
    limit: u64,
    paused: AtomicBool,
    daily: Arc<DailyBudget>,
    last_warned: parking_lot::Mutex<u8>,
}

impl SessionBudget {
    pub fn new(limit: u64, daily: Arc<DailyBudget>) -> Self {
        Self {
            spent: AtomicU64::new(0),
            limit,
            paused: AtomicBool::new(false),
            daily,
            last_warned: parking_lot::Mutex::new(0),
        }
    }

    /// Pre-check before a model call. Charges both the session and daily
    /// counters and classifies the combined outcome.
    pub fn add(&self, tokens: u64) -> BudgetOutcome {
        if self.paused.load(Ordering::SeqCst) {
            return BudgetOutcome::SessionExhausted;
        }

        let daily_outcome = self.daily.add(tokens);
        if matches!(daily_outcome, BudgetOutcome::DailyExhausted) {
            self.paused.store(true, Ordering::SeqCst);
            return BudgetOutcome::DailyExhausted;
        }

        let total = self.spent.fetch_add(tokens, Ordering::SeqCst) + tokens;
        let outcome = classify(total, self.limit, BudgetOutcome::SessionExhausted);
        if matches!(outcome, BudgetOutcome::SessionExhausted) {
            self.paused.store(true, Ordering::SeqCst);
        }
        if let BudgetOutcome::Warning(pct) = outcome {
            let mut last = self.last_warned.lock();
            if pct <= *last {
                return BudgetOutcome::Ok; // already warned at this threshold
            }
            *last = pct;
        }
        outcome
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear the session counter and pause flag, provided the daily
    /// counter is still under its limit. Returns false (and leaves the
    /// pause engaged) if the daily budget is exhausted.
    pub fn renew(&self) -> bool {
        if self.daily.spent() >= self.daily.limit() {
            return false;
        }
        self.spent.store(0, Ordering::SeqCst);
        *self.last_warned.lock() = 0;
        self.paused.store(false, Ordering::SeqCst);
        true
    }

    pub fn spent(&self) -> u64 {
        self.spent.load(Ordering::SeqCst)
    }
}

fn classify(total: u64, limit: u64, exhausted: BudgetOutcome) -> BudgetOutcome {
    if total >= limit {
        return exhausted;
    }
    let fraction = total as f64 / limit as f64;
    for threshold in WARNING_THRESHOLDS.iter().rev() {
        if fraction >= *threshold {
            return BudgetOutcome::Warning((threshold * 100.0).round() as u8);
        }
    }
    BudgetOutcome::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_exhausts_then_pauses_not_kills() {
        let daily = DailyBudget::new(1_000_000);
        let session = SessionBudget::new(1_000, daily);
        assert_eq!(session.add(999), BudgetOutcome::Ok);
        assert_eq!(session.add(1), BudgetOutcome::SessionExhausted);
        assert!(session.is_paused());
        assert!(session.renew());
        assert!(!session.is_paused());
        assert_eq!(session.spent(), 0);
    }

    #[test]
    fn daily_exhaustion_blocks_renew() {
        let daily = DailyBudget::new(100);
        let session = SessionBudget::new(1_000_000, daily);
        assert_eq!(session.add(100), BudgetOutcome::DailyExhausted);
        assert!(!session.renew());
    }

    #[test]
    fn warning_thresholds_fire_once_each() {
        let daily = DailyBudget::new(1_000_000);
        let session = SessionBudget::new(100, daily);
        assert_eq!(session.add(70), BudgetOutcome::Warning(70));
        assert_eq!(session.add(1), BudgetOutcome::Ok);
    }
}
