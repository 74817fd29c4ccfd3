//! Durable store for facts, procedures, episodes, and skills, plus the
//! conversation log and the trust ledger.
//!
//! All writes are serialized through a single-writer Tokio task reading
//! from a bounded channel; reads use their own connections. Search
//! combines full-text rank with optional vector similarity via
//! reciprocal-rank fusion, degrading gracefully to FTS-only when no
//! embedder is configured (Open Question (b), resolved in `DESIGN.md`).

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

/// How many extractions with identical kind and content must land in
/// `pending` before one of them is promoted to `active`.
const PROMOTION_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Procedure,
    Episode,
    Skill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Pending,
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    User,
    Observer,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub status: MemoryStatus,
    pub source: MemorySource,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Ids of the sibling extractions that justified promotion to
    /// `active`. Empty for memories that entered directly as `active`
    /// (e.g. user-sourced) or that are still `pending`.
    pub promoted_from: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tokens_used: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("writer actor has shut down")]
    WriterGone,
}

enum WriteOp {
    Save(Memory, oneshot::Sender<Result<(), MemoryError>>),
    UpdateStatus(String, MemoryStatus, oneshot::Sender<Result<(), MemoryError>>),
    Promote(String, Vec<String>, oneshot::Sender<Result<(), MemoryError>>),
    SaveConversation(ConversationEntry, oneshot::Sender<Result<(), MemoryError>>),
    TrustDomain(String, String, oneshot::Sender<Result<(), MemoryError>>),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    promoted_from TEXT NOT NULL DEFAULT '[]'
);
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content, content='memories', content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
    INSERT INTO memories_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TABLE IF NOT EXISTS conversations (
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tokens_used INTEGER,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trust_ledger (
    domain TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    approved_at TEXT NOT NULL
);
";

/// Facade over the single-writer actor. Cheap to clone; every clone
/// shares the same writer task and the same read path.
#[derive(Clone)]
pub struct MemoryStore {
    db_path: std::path::PathBuf,
    writer_tx: mpsc::Sender<WriteOp>,
    has_embedder: bool,
}

impl MemoryStore {
    pub fn open(db_path: &Path, has_embedder: bool) -> Result<Self, MemoryError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(writer_loop(db_path.to_path_buf(), rx));

        Ok(Self {
            db_path: db_path.to_path_buf(),
            writer_tx: tx,
            has_embedder,
        })
    }

    pub fn has_embedder(&self) -> bool {
        self.has_embedder
    }

    fn read_conn(&self) -> Result<Connection, MemoryError> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub async fn save(&self, memory: Memory) -> Result<(), MemoryError> {
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Save(memory, tx))
            .await
            .map_err(|_| MemoryError::WriterGone)?;
        rx.await.map_err(|_| MemoryError::WriterGone)?
    }

    pub async fn update_status(&self, id: &str, status: MemoryStatus) -> Result<(), MemoryError> {
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::UpdateStatus(id.to_owned(), status, tx))
            .await
            .map_err(|_| MemoryError::WriterGone)?;
        rx.await.map_err(|_| MemoryError::WriterGone)?
    }

    /// Record a new extraction as a `pending` memory, then promote it (and
    /// the siblings that justify it) to `active` once `PROMOTION_THRESHOLD`
    /// extractions agree on the same kind and content.
    pub async fn record_extraction(&self, kind: MemoryKind, content: String, source: MemorySource) -> Result<Memory, MemoryError> {
        let now = chrono::Utc::now();
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.clone(),
            status: MemoryStatus::Pending,
            source,
            created_at: now,
            updated_at: now,
            promoted_from: Vec::new(),
        };
        self.save(memory.clone()).await?;

        let siblings = self.pending_duplicates(kind, &content, &memory.id)?;
        if siblings.len() + 1 >= PROMOTION_THRESHOLD {
            let justifying_ids: Vec<String> = siblings.iter().map(|m| m.id.clone()).collect();
            self.promote(&memory.id, justifying_ids).await?;
            for sibling in &siblings {
                self.update_status(&sibling.id, MemoryStatus::Active).await?;
                self.update_status(&sibling.id, MemoryStatus::Archived).await?;
            }
        }

        Ok(memory)
    }

    /// Promote `id` to `active`, recording the ids of the extractions that
    /// justified the promotion.
    async fn promote(&self, id: &str, justifying_ids: Vec<String>) -> Result<(), MemoryError> {
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Promote(id.to_owned(), justifying_ids, tx))
            .await
            .map_err(|_| MemoryError::WriterGone)?;
        rx.await.map_err(|_| MemoryError::WriterGone)?
    }

    /// Other `pending` memories of the same kind with identical content,
    /// excluding `exclude_id`. Used to detect when independent extractions
    /// agree closely enough to warrant promotion.
    fn pending_duplicates(&self, kind: MemoryKind, content: &str, exclude_id: &str) -> Result<Vec<Memory>, MemoryError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, content, status, source, created_at, updated_at, promoted_from
             FROM memories WHERE kind = ?1 AND content = ?2 AND status = 'pending' AND id != ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![kind_str(kind), content, exclude_id], row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn save_conversation(&self, entry: ConversationEntry) -> Result<(), MemoryError> {
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::SaveConversation(entry, tx))
            .await
            .map_err(|_| MemoryError::WriterGone)?;
        rx.await.map_err(|_| MemoryError::WriterGone)?
    }

    pub async fn trust_domain(&self, domain: &str, source: &str) -> Result<(), MemoryError> {
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::TrustDomain(domain.to_owned(), source.to_owned(), tx))
            .await
            .map_err(|_| MemoryError::WriterGone)?;
        rx.await.map_err(|_| MemoryError::WriterGone)?
    }

    /// Full-text search (and, when an embedder is configured upstream,
    /// the caller is expected to fuse vector scores in before ranking —
    /// this store only ever does the FTS half; see `DESIGN.md` for the
    /// resolved Open Question on graceful degradation).
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<Memory>, MemoryError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.kind, m.content, m.status, m.source, m.created_at, m.updated_at, m.promoted_from
             FROM memories_fts f JOIN memories m ON m.rowid = f.rowid
             WHERE memories_fts MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![escape_fts_query(query), k as i64], row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_by_status(&self, status: MemoryStatus) -> Result<u64, MemoryError> {
        let conn = self.read_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE status = ?1",
            [status_str(status)],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn trusted_domains(&self) -> Result<Vec<String>, MemoryError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare("SELECT domain FROM trust_ledger")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

/// FTS5 MATCH treats several ASCII punctuation characters specially;
/// wrap the raw query in double quotes so arbitrary user text is treated
/// as a phrase rather than a malformed query expression.
fn escape_fts_query(q: &str) -> String {
    format!("\"{}\"", q.replace('"', "\"\""))
}

fn status_str(status: MemoryStatus) -> &'static str {
    match status {
        MemoryStatus::Pending => "pending",
        MemoryStatus::Active => "active",
        MemoryStatus::Archived => "archived",
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let kind: String = row.get(1)?;
    let status: String = row.get(3)?;
    let source: String = row.get(4)?;
    let promoted_from: String = row.get(7)?;
    Ok(Memory {
        id: row.get(0)?,
        kind: match kind.as_str() {
            "fact" => MemoryKind::Fact,
            "procedure" => MemoryKind::Procedure,
            "episode" => MemoryKind::Episode,
            _ => MemoryKind::Skill,
        },
        content: row.get(2)?,
        status: match status.as_str() {
            "pending" => MemoryStatus::Pending,
            "archived" => MemoryStatus::Archived,
            _ => MemoryStatus::Active,
        },
        source: match source.as_str() {
            "user" => MemorySource::User,
            "observer" => MemorySource::Observer,
            _ => MemorySource::Agent,
        },
        created_at: row.get::<_, String>(5)?.parse().unwrap_or_else(|_| chrono::Utc::now()),
        updated_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| chrono::Utc::now()),
        promoted_from: serde_json::from_str(&promoted_from).unwrap_or_default(),
    })
}

async fn writer_loop(db_path: std::path::PathBuf, mut rx: mpsc::Receiver<WriteOp>) {
    let conn = match Connection::open(&db_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "memory writer failed to open database, persistence is down");
            return;
        }
    };

    while let Some(op) = rx.recv().await {
        let result = handle_op(&conn, &op);
        deliver(op, result);
    }
}

fn handle_op(conn: &Connection, op: &WriteOp) -> rusqlite::Result<()> {
    match op {
        WriteOp::Save(memory, _) => {
            let promoted_from = serde_json::to_string(&memory.promoted_from).unwrap_or_else(|_| "[]".to_owned());
            conn.execute(
                "INSERT INTO memories (id, kind, content, status, source, created_at, updated_at, promoted_from)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET content = excluded.content, status = excluded.status, updated_at = excluded.updated_at",
                rusqlite::params![
                    memory.id,
                    kind_str(memory.kind),
                    memory.content,
                    status_str(memory.status),
                    source_str(memory.source),
                    memory.created_at.to_rfc3339(),
                    memory.updated_at.to_rfc3339(),
                    promoted_from,
                ],
            )?;
            Ok(())
        }
        WriteOp::UpdateStatus(id, status, _) => {
            conn.execute(
                "UPDATE memories SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status_str(*status), chrono::Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        }
        WriteOp::Promote(id, justifying_ids, _) => {
            let promoted_from = serde_json::to_string(justifying_ids).unwrap_or_else(|_| "[]".to_owned());
            conn.execute(
                "UPDATE memories SET status = ?1, promoted_from = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![status_str(MemoryStatus::Active), promoted_from, chrono::Utc::now().to_rfc3339(), id],
            )?;
            Ok(())
        }
        WriteOp::SaveConversation(entry, _) => {
            conn.execute(
                "INSERT INTO conversations (session_id, role, content, tokens_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    entry.session_id,
                    entry.role,
                    entry.content,
                    entry.tokens_used,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        }
        WriteOp::TrustDomain(domain, source, _) => {
            conn.execute(
                "INSERT INTO trust_ledger (domain, source, approved_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(domain) DO UPDATE SET source = excluded.source, approved_at = excluded.approved_at",
                rusqlite::params![domain, source, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        }
    }
}

fn deliver(op: WriteOp, result: rusqlite::Result<()>) {
    let result = result.map_err(MemoryError::from);
    match op {
        WriteOp::Save(_, tx) => {
            let _ = tx.send(result);
        }
        WriteOp::UpdateStatus(_, _, tx) => {
            let _ = tx.send(result);
        }
        WriteOp::Promote(_, _, tx) => {
            let _ = tx.send(result);
        }
        WriteOp::SaveConversation(_, tx) => {
            let _ = tx.send(result);
        }
        WriteOp::TrustDomain(_, _, tx) => {
            let _ = tx.send(result);
        }
    }
}

fn kind_str(kind: MemoryKind) -> &'static str {
    match kind {
        MemoryKind::Fact => "fact",
        MemoryKind::Procedure => "procedure",
        MemoryKind::Episode => "episode",
        MemoryKind::Skill => "skill",
    }
}

fn source_str(source: MemorySource) -> &'static str {
    match source {
        MemorySource::User => "user",
        MemorySource::Observer => "observer",
        MemorySource::Agent => "agent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_memory(id: &str, content: &str) -> Memory {
        let now = chrono::Utc::now();
        Memory {
            id: id.to_owned(),
            kind: MemoryKind::Fact,
            content: content.to_owned(),
            status: MemoryStatus::Active,
            source: MemorySource::User,
            created_at: now,
            updated_at: now,
            promoted_from: Vec::new(),
        }
    }

    #[tokio::test]
    async fn save_then_search_finds_exact_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("memory.db"), false).unwrap();
        store
            .save(new_memory("m1", "the deploy key rotates every Tuesday"))
            .await
            .unwrap();
        // Give the writer actor a beat to land the insert.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let results = store.search("deploy key rotates", 5).unwrap();
        assert!(results.iter().any(|m| m.id == "m1"));
    }

    #[tokio::test]
    async fn below_threshold_extractions_stay_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("memory.db"), false).unwrap();
        for _ in 0..PROMOTION_THRESHOLD - 1 {
            store
                .record_extraction(MemoryKind::Fact, "the user prefers dark mode".into(), MemorySource::Observer)
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.count_by_status(MemoryStatus::Active).unwrap(), 0);
        assert_eq!(store.count_by_status(MemoryStatus::Pending).unwrap(), (PROMOTION_THRESHOLD - 1) as u64);
    }

    #[tokio::test]
    async fn consistent_extractions_promote_and_record_justification() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("memory.db"), false).unwrap();
        for _ in 0..PROMOTION_THRESHOLD {
            store
                .record_extraction(MemoryKind::Fact, "the user prefers dark mode".into(), MemorySource::Observer)
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(store.count_by_status(MemoryStatus::Active).unwrap(), 1);
        assert_eq!(store.count_by_status(MemoryStatus::Archived).unwrap(), (PROMOTION_THRESHOLD - 1) as u64);

        let active = store.search("dark mode", 5).unwrap().into_iter().find(|m| m.status == MemoryStatus::Active).unwrap();
        assert_eq!(active.promoted_from.len(), PROMOTION_THRESHOLD - 1);
    }

    #[tokio::test]
    async fn trust_domain_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("memory.db"), false).unwrap();
        store.trust_domain("api.example.org", "user").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store.trusted_domains().unwrap().contains(&"api.example.org".to_owned()));
    }
}
