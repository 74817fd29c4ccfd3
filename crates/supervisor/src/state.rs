//! The supervisor's own small persistence layer: a fix log and update
//! bookkeeping, kept separate from the kernel's `memory.db`.

use rusqlite::Connection;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fix_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern TEXT NOT NULL,
    action TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    verified INTEGER
);
CREATE TABLE IF NOT EXISTS update_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_version TEXT NOT NULL,
    to_version TEXT NOT NULL,
    started_at TEXT NOT NULL,
    outcome TEXT
);
";

pub struct SupervisorState {
    conn: Connection,
}

impl SupervisorState {
    pub fn open(db_path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn record_fix(&self, pattern: &str, action: &str) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO fix_log (pattern, action, applied_at, verified) VALUES (?1, ?2, ?3, NULL)",
            rusqlite::params![pattern, action, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn mark_verified(&self, fix_id: i64, verified: bool) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE fix_log SET verified = ?1 WHERE id = ?2",
            rusqlite::params![verified, fix_id],
        )?;
        Ok(())
    }

    pub fn recent_fixes_for_pattern(&self, pattern: &str, since_hours: i64) -> rusqlite::Result<u64> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::hours(since_hours)).to_rfc3339();
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM fix_log WHERE pattern = ?1 AND applied_at >= ?2",
            rusqlite::params![pattern, cutoff],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn record_update_start(&self, from_version: &str, to_version: &str) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO update_log (from_version, to_version, started_at, outcome) VALUES (?1, ?2, ?3, NULL)",
            rusqlite::params![from_version, to_version, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn record_update_outcome(&self, update_id: i64, outcome: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE update_log SET outcome = ?1 WHERE id = ?2",
            rusqlite::params![outcome, update_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_counts_fixes_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let state = SupervisorState::open(&dir.path().join("state.db")).unwrap();
        state.record_fix("daily_burn_rate", "alert_only").unwrap();
        state.record_fix("daily_burn_rate", "alert_only").unwrap();
        assert_eq!(state.recent_fixes_for_pattern("daily_burn_rate", 24).unwrap(), 2);
        assert_eq!(state.recent_fixes_for_pattern("other", 24).unwrap(), 0);
    }
}
