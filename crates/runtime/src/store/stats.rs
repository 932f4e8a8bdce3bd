//! Global processing statistics and worker heartbeats.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::{parse_ts, ts, OptionalExt, SqliteStore};
use crate::types::{StoreError, TaskStatistics, WorkerHeartbeat};

/// Workers whose heartbeat is older than this no longer count as active.
const ACTIVE_WORKER_WINDOW_SECS: i64 = 120;

impl SqliteStore {
    /// The singleton statistics row, created with defaults on first read.
    pub async fn get_statistics(&self) -> Result<TaskStatistics, StoreError> {
        let conn = self.conn.lock().await;
        ensure_statistics_row(&conn)?;
        read_statistics(&conn)
    }

    /// Fold one finished cycle into the statistics: counters, running
    /// averages, min/max, the three-sample median approximation, and the
    /// live queue length.
    pub async fn record_task_outcome(
        &self,
        processing_seconds: f64,
        success: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_statistics_row(&tx)?;
        let mut stats = read_statistics(&tx)?;

        if success {
            stats.total_tasks_processed += 1;
            stats.recent_completed_tasks += 1;
            stats.total_processing_time_seconds += processing_seconds.max(0.0) as u64;
            stats.avg_processing_time =
                stats.total_processing_time_seconds as f64 / stats.total_tasks_processed as f64;
            stats.min_processing_time = stats.min_processing_time.min(processing_seconds);
            stats.max_processing_time = stats.max_processing_time.max(processing_seconds);

            // Midpoint of (min, last, max). An ETA approximation only.
            let mut samples = [
                stats.min_processing_time,
                processing_seconds,
                stats.max_processing_time,
            ];
            samples.sort_by(f64::total_cmp);
            stats.median_processing_time = samples[1];

            stats.recent_avg_time = (stats.recent_avg_time + processing_seconds) / 2.0;
        } else {
            stats.recent_failed_tasks += 1;
        }

        let queue_length: u32 =
            tx.query_row("SELECT COUNT(*) FROM task_queue", [], |row| row.get(0))?;
        stats.current_queue_length = queue_length;
        stats.last_updated = Utc::now();

        write_statistics(&tx, &stats)?;
        tx.commit()?;
        Ok(())
    }

    /// Upsert the per-worker heartbeat row and refresh the active-worker
    /// count used by queue ETAs. `session_start` is preserved while the
    /// session id stays the same and reset when a new session takes over
    /// the worker id.
    pub async fn update_heartbeat(
        &self,
        worker_id: &str,
        session_id: Uuid,
        status: &str,
        activity: &str,
        papers_processed: u64,
        papers_found: u64,
    ) -> Result<(), StoreError> {
        let now = ts(Utc::now());
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO agent_status
                 (worker_id, session_id, status, activity, papers_processed,
                  papers_found, last_activity, session_start)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(worker_id) DO UPDATE SET
                 status = excluded.status,
                 activity = excluded.activity,
                 papers_processed = excluded.papers_processed,
                 papers_found = excluded.papers_found,
                 last_activity = excluded.last_activity,
                 session_start = CASE
                     WHEN agent_status.session_id = excluded.session_id
                     THEN agent_status.session_start
                     ELSE excluded.session_start END,
                 session_id = excluded.session_id",
            params![
                worker_id,
                session_id.to_string(),
                status,
                activity,
                papers_processed as i64,
                papers_found as i64,
                now,
            ],
        )?;

        ensure_statistics_row(&tx)?;
        let cutoff = ts(Utc::now() - chrono::Duration::seconds(ACTIVE_WORKER_WINDOW_SECS));
        tx.execute(
            "UPDATE task_statistics
             SET active_workers = MAX(1,
                 (SELECT COUNT(*) FROM agent_status WHERE last_activity >= ?1))
             WHERE id = 1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_heartbeat(
        &self,
        worker_id: &str,
    ) -> Result<Option<WorkerHeartbeat>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT worker_id, session_id, status, activity, papers_processed,
                        papers_found, last_activity, session_start
                 FROM agent_status WHERE worker_id = ?1",
                params![worker_id],
                |row| {
                    let worker_id: String = row.get(0)?;
                    let session_str: String = row.get(1)?;
                    let status: String = row.get(2)?;
                    let activity: String = row.get(3)?;
                    let papers_processed: i64 = row.get(4)?;
                    let papers_found: i64 = row.get(5)?;
                    let last_str: String = row.get(6)?;
                    let start_str: String = row.get(7)?;
                    Ok((|| -> Result<WorkerHeartbeat, StoreError> {
                        let session_id = Uuid::parse_str(&session_str)
                            .map_err(|e| StoreError::Serialization(e.to_string()))?;
                        Ok(WorkerHeartbeat {
                            worker_id,
                            session_id,
                            status,
                            activity,
                            papers_processed: papers_processed as u64,
                            papers_found: papers_found as u64,
                            last_activity: parse_ts(&last_str)?,
                            session_start: parse_ts(&start_str)?,
                        })
                    })())
                },
            )
            .optional()?;
        row.transpose()
    }
}

fn ensure_statistics_row(conn: &rusqlite::Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO task_statistics (id, last_updated) VALUES (1, ?1)",
        params![ts(Utc::now())],
    )?;
    Ok(())
}

fn read_statistics(conn: &rusqlite::Connection) -> Result<TaskStatistics, StoreError> {
    conn.query_row(
        "SELECT total_tasks_processed, total_processing_time_seconds,
                median_processing_time, avg_processing_time, min_processing_time,
                max_processing_time, current_queue_length, active_workers,
                recent_completed_tasks, recent_failed_tasks, recent_avg_time,
                last_updated
         FROM task_statistics WHERE id = 1",
        [],
        |row| {
            let total: i64 = row.get(0)?;
            let total_secs: i64 = row.get(1)?;
            let median: f64 = row.get(2)?;
            let avg: f64 = row.get(3)?;
            let min: f64 = row.get(4)?;
            let max: f64 = row.get(5)?;
            let queue_len: u32 = row.get(6)?;
            let workers: u32 = row.get(7)?;
            let recent_ok: i64 = row.get(8)?;
            let recent_failed: i64 = row.get(9)?;
            let recent_avg: f64 = row.get(10)?;
            let updated_str: String = row.get(11)?;
            Ok((|| -> Result<TaskStatistics, StoreError> {
                Ok(TaskStatistics {
                    total_tasks_processed: total as u64,
                    total_processing_time_seconds: total_secs as u64,
                    median_processing_time: median,
                    avg_processing_time: avg,
                    min_processing_time: min,
                    max_processing_time: max,
                    current_queue_length: queue_len,
                    active_workers: workers,
                    recent_completed_tasks: recent_ok as u64,
                    recent_failed_tasks: recent_failed as u64,
                    recent_avg_time: recent_avg,
                    last_updated: parse_ts(&updated_str)?,
                })
            })())
        },
    )?
}

fn write_statistics(
    conn: &rusqlite::Connection,
    stats: &TaskStatistics,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE task_statistics
         SET total_tasks_processed = ?1, total_processing_time_seconds = ?2,
             median_processing_time = ?3, avg_processing_time = ?4,
             min_processing_time = ?5, max_processing_time = ?6,
             current_queue_length = ?7, recent_completed_tasks = ?8,
             recent_failed_tasks = ?9, recent_avg_time = ?10, last_updated = ?11
         WHERE id = 1",
        params![
            stats.total_tasks_processed as i64,
            stats.total_processing_time_seconds as i64,
            stats.median_processing_time,
            stats.avg_processing_time,
            stats.min_processing_time,
            stats.max_processing_time,
            stats.current_queue_length,
            stats.recent_completed_tasks as i64,
            stats.recent_failed_tasks as i64,
            stats.recent_avg_time,
            ts(stats.last_updated),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outcome_updates_counters_and_median() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.record_task_outcome(120.0, true).await.unwrap();
        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.total_tasks_processed, 1);
        assert_eq!(stats.total_processing_time_seconds, 120);
        assert_eq!(stats.avg_processing_time, 120.0);
        assert_eq!(stats.min_processing_time, 60.0);
        // Midpoint of (60, 120, 1800).
        assert_eq!(stats.median_processing_time, 120.0);

        store.record_task_outcome(30.0, true).await.unwrap();
        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.total_tasks_processed, 2);
        assert_eq!(stats.min_processing_time, 30.0);
        // Midpoint of (30, 30, 1800).
        assert_eq!(stats.median_processing_time, 30.0);
    }

    #[tokio::test]
    async fn failures_count_separately() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.record_task_outcome(50.0, false).await.unwrap();
        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.total_tasks_processed, 0);
        assert_eq!(stats.recent_failed_tasks, 1);
        // Failure leaves the time metrics untouched.
        assert_eq!(stats.min_processing_time, 60.0);
    }

    #[tokio::test]
    async fn heartbeat_upserts_and_counts_workers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        store
            .update_heartbeat("w1", s1, "idle", "waiting for tasks", 0, 0)
            .await
            .unwrap();
        store
            .update_heartbeat("w2", s2, "processing", "task 7", 3, 1)
            .await
            .unwrap();

        let hb = store.get_heartbeat("w2").await.unwrap().unwrap();
        assert_eq!(hb.status, "processing");
        assert_eq!(hb.papers_processed, 3);
        assert_eq!(hb.session_id, s2);

        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.active_workers, 2);

        // Updating the same worker does not create a second row.
        store
            .update_heartbeat("w2", s2, "idle", "done", 4, 1)
            .await
            .unwrap();
        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.active_workers, 2);
    }

    #[tokio::test]
    async fn heartbeat_session_start_tracks_the_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = Uuid::new_v4();
        store
            .update_heartbeat("w1", session, "idle", "a", 0, 0)
            .await
            .unwrap();
        let first = store.get_heartbeat("w1").await.unwrap().unwrap();

        store
            .update_heartbeat("w1", session, "processing", "b", 1, 0)
            .await
            .unwrap();
        let second = store.get_heartbeat("w1").await.unwrap().unwrap();
        // Same session: session_start is preserved across beats.
        assert_eq!(second.session_start, first.session_start);
        assert_eq!(second.session_id, session);

        // A restart under the same worker id begins a new session.
        let restarted = Uuid::new_v4();
        store
            .update_heartbeat("w1", restarted, "idle", "c", 0, 0)
            .await
            .unwrap();
        let third = store.get_heartbeat("w1").await.unwrap().unwrap();
        assert_eq!(third.session_id, restarted);
        assert!(third.session_start >= second.session_start);
    }
}
