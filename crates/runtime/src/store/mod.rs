//! Persistent state backed by SQLite.
//!
//! The store exclusively owns every durable entity: users, tasks, the queue,
//! rate-limit records, statistics, papers, analyses, findings, settings,
//! outbound messages, and worker heartbeats. All mutations run as serialized
//! transactions over a single connection; reads are snapshot-consistent
//! within one operation.

use chrono::{DateTime, Utc};

use crate::types::StoreError;

mod outbound;
mod paper;
mod rate_limit;
mod stats;
mod task;
mod user;

pub use task::SelectedResult;

/// SQLite-backed store for the research engine.
pub struct SqliteStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path)?;

        // WAL mode for concurrent access.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS user (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id           TEXT NOT NULL UNIQUE,
                display_name          TEXT,
                plan                  TEXT NOT NULL DEFAULT 'free',
                daily_task_limit      INTEGER NOT NULL DEFAULT 5,
                concurrent_task_limit INTEGER NOT NULL DEFAULT 1,
                daily_tasks_created   INTEGER NOT NULL DEFAULT 0,
                last_daily_reset      TEXT NOT NULL,
                plan_expires_at       TEXT,
                is_active             INTEGER NOT NULL DEFAULT 1,
                is_banned             INTEGER NOT NULL DEFAULT 0,
                ban_reason            TEXT,
                created_at            TEXT NOT NULL,
                updated_at            TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_task (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id                 INTEGER NOT NULL REFERENCES user(id),
                title                   TEXT NOT NULL,
                description             TEXT NOT NULL,
                status                  TEXT NOT NULL DEFAULT 'queued',
                cycles_completed        INTEGER NOT NULL DEFAULT 0,
                max_cycles              INTEGER NOT NULL DEFAULT 5,
                processing_started_at   TEXT,
                processing_completed_at TEXT,
                error_message           TEXT,
                created_at              TEXT NOT NULL,
                updated_at              TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_task_user_status
                ON user_task(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_user_task_status_created
                ON user_task(status, created_at);

            CREATE TABLE IF NOT EXISTS task_queue (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id              INTEGER NOT NULL UNIQUE REFERENCES user_task(id),
                priority             INTEGER NOT NULL DEFAULT 100,
                queue_position       INTEGER NOT NULL DEFAULT 0,
                estimated_start_time TEXT,
                worker_id            TEXT,
                started_at           TEXT,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_queue_priority
                ON task_queue(priority, created_at);

            CREATE TABLE IF NOT EXISTS rate_limit_record (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id          INTEGER NOT NULL REFERENCES user(id),
                action_kind      TEXT NOT NULL,
                count_per_minute INTEGER NOT NULL DEFAULT 0,
                count_per_hour   INTEGER NOT NULL DEFAULT 0,
                count_per_day    INTEGER NOT NULL DEFAULT 0,
                minute_reset_at  TEXT NOT NULL,
                hour_reset_at    TEXT NOT NULL,
                day_reset_at     TEXT NOT NULL,
                last_action_at   TEXT NOT NULL,
                UNIQUE (user_id, action_kind)
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limit_user_action
                ON rate_limit_record(user_id, action_kind);

            CREATE TABLE IF NOT EXISTS task_statistics (
                id                            INTEGER PRIMARY KEY CHECK (id = 1),
                total_tasks_processed         INTEGER NOT NULL DEFAULT 0,
                total_processing_time_seconds INTEGER NOT NULL DEFAULT 0,
                median_processing_time        REAL NOT NULL DEFAULT 300.0,
                avg_processing_time           REAL NOT NULL DEFAULT 300.0,
                min_processing_time           REAL NOT NULL DEFAULT 60.0,
                max_processing_time           REAL NOT NULL DEFAULT 1800.0,
                current_queue_length          INTEGER NOT NULL DEFAULT 0,
                active_workers                INTEGER NOT NULL DEFAULT 1,
                recent_completed_tasks        INTEGER NOT NULL DEFAULT 0,
                recent_failed_tasks           INTEGER NOT NULL DEFAULT 0,
                recent_avg_time               REAL NOT NULL DEFAULT 300.0,
                last_updated                  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS search_query (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id       INTEGER NOT NULL REFERENCES user_task(id),
                query_text    TEXT NOT NULL,
                rationale     TEXT,
                categories    TEXT,
                enabled       INTEGER NOT NULL DEFAULT 1,
                success_count INTEGER NOT NULL DEFAULT 0,
                last_run_at   TEXT,
                created_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS arxiv_paper (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id        TEXT NOT NULL UNIQUE,
                title            TEXT NOT NULL,
                summary          TEXT NOT NULL DEFAULT '',
                categories       TEXT NOT NULL DEFAULT '[]',
                published        TEXT,
                updated          TEXT,
                pdf_url          TEXT,
                abs_url          TEXT,
                primary_category TEXT,
                created_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS paper_analysis (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                paper_id             INTEGER NOT NULL REFERENCES arxiv_paper(id),
                task_id              INTEGER NOT NULL REFERENCES user_task(id),
                relevance            REAL NOT NULL,
                summary              TEXT,
                key_fragments        TEXT,
                contextual_reasoning TEXT,
                status               TEXT NOT NULL DEFAULT 'analyzed',
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL,
                UNIQUE (paper_id, task_id)
            );

            CREATE TABLE IF NOT EXISTS finding (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id     INTEGER NOT NULL REFERENCES user_task(id),
                paper_id    INTEGER NOT NULL REFERENCES arxiv_paper(id),
                relevance   REAL NOT NULL,
                summary     TEXT,
                notified_at TEXT,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_finding_task ON finding(task_id);

            CREATE TABLE IF NOT EXISTS user_settings (
                id                             INTEGER PRIMARY KEY AUTOINCREMENT,
                user_external_id               TEXT NOT NULL UNIQUE,
                min_relevance                  REAL NOT NULL DEFAULT 50.0,
                instant_notification_threshold REAL NOT NULL DEFAULT 80.0,
                group_chat_id                  INTEGER,
                monitoring_enabled             INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS outbound_message (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                kind             TEXT NOT NULL,
                user_external_id TEXT NOT NULL,
                payload_text     TEXT NOT NULL,
                status           TEXT NOT NULL DEFAULT 'completed',
                result_text      TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_status
                ON outbound_message(status, id);

            CREATE TABLE IF NOT EXISTS agent_status (
                worker_id        TEXT PRIMARY KEY,
                session_id       TEXT NOT NULL,
                status           TEXT NOT NULL,
                activity         TEXT NOT NULL,
                papers_processed INTEGER NOT NULL DEFAULT 0,
                papers_found     INTEGER NOT NULL DEFAULT 0,
                last_activity    TEXT NOT NULL,
                session_start    TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Startup cleanup: delete queue entries pointing to terminal tasks.
    /// Returns the number of orphaned entries removed.
    pub async fn cleanup_orphaned_queue_entries(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM task_queue
             WHERE task_id IN (
                 SELECT id FROM user_task
                 WHERE status IN ('completed', 'failed', 'cancelled')
             )",
            [],
        )?;
        if removed > 0 {
            tracing::info!("Removed {} orphaned queue entries", removed);
        }
        Ok(removed)
    }
}

// ── Shared row helpers ────────────────────────────────────────────────

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp '{s}': {e}")))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_ts(&s)).transpose()
}

/// Extension trait so queries can use `optional()` without pulling in the
/// rusqlite feature flag everywhere.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserProfile;

    #[tokio::test]
    async fn open_in_memory_initializes_schema() {
        let store = SqliteStore::open_in_memory().unwrap();
        // A fresh store has no queued tasks and empty statistics.
        assert!(store.next_queued_task().await.unwrap().is_none());
        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.total_tasks_processed, 0);
    }

    #[tokio::test]
    async fn open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scout.db");
        let store = SqliteStore::open(&path).unwrap();
        store
            .get_or_create_user("u1", &UserProfile::default())
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn cleanup_removes_entries_for_terminal_tasks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store
            .get_or_create_user("u1", &UserProfile::default())
            .await
            .unwrap();
        let (task, _) = store
            .create_task_and_enqueue(user.id, "quantum error correction")
            .await
            .unwrap();

        // Simulate a crash that left the task terminal with a live entry.
        {
            let conn = store.conn.lock().await;
            conn.execute(
                "UPDATE user_task SET status = 'failed' WHERE id = ?1",
                rusqlite::params![task.id],
            )
            .unwrap();
        }

        let removed = store.cleanup_orphaned_queue_entries().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.next_queued_task().await.unwrap().is_none());
    }
}
