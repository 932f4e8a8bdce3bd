//! Task lifecycle: creation with enqueue, dispatch, cycle completion,
//! user-facing management, and persisted search queries.

use chrono::Utc;
use rusqlite::{params, Transaction};
use std::str::FromStr;

use super::{parse_ts, parse_ts_opt, ts, OptionalExt, SqliteStore};
use crate::types::{
    Analysis, AnalysisStatus, CycleOutcome, PaperRecord, QueueEntry, ResearchTask, SearchQueryRow,
    StoreError, TaskId, TaskStatus, UserId, UserPlan,
};

const TASK_COLUMNS: &str = "id, user_id, title, description, status, cycles_completed, \
     max_cycles, processing_started_at, processing_completed_at, error_message, \
     created_at, updated_at";

const QUEUE_COLUMNS: &str = "id, task_id, priority, queue_position, estimated_start_time, \
     worker_id, started_at, created_at, updated_at";

/// A selected cycle result: the analysis joined with its paper.
#[derive(Debug, Clone)]
pub struct SelectedResult {
    pub analysis: Analysis,
    pub paper: PaperRecord,
}

impl SqliteStore {
    /// Atomically create a task (status `queued`, `max_cycles` by plan),
    /// enqueue it with plan-based priority, and bump the user's daily
    /// counter. Queue positions are recomputed across all queued tasks.
    pub async fn create_task_and_enqueue(
        &self,
        user_id: UserId,
        description: &str,
    ) -> Result<(ResearchTask, QueueEntry), StoreError> {
        let now = ts(Utc::now());
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let plan_str: String = tx
            .query_row(
                "SELECT plan FROM user WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound("user", user_id))?;
        let plan = UserPlan::from_str(&plan_str).map_err(StoreError::Serialization)?;

        let title = truncate_title(description);
        tx.execute(
            "INSERT INTO user_task (user_id, title, description, status, cycles_completed,
                 max_cycles, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?5)",
            params![user_id, title, description, plan.max_cycles(), now],
        )?;
        let task_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO task_queue (task_id, priority, queue_position, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?3)",
            params![task_id, plan.queue_priority(), now],
        )?;

        tx.execute(
            "UPDATE user SET daily_tasks_created = daily_tasks_created + 1, updated_at = ?1
             WHERE id = ?2",
            params![now, user_id],
        )?;

        recompute_queue_positions(&tx)?;

        let task = tx.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM user_task WHERE id = ?1"),
            params![task_id],
            row_to_task,
        )??;
        let entry = tx.query_row(
            &format!("SELECT {QUEUE_COLUMNS} FROM task_queue WHERE task_id = ?1"),
            params![task_id],
            row_to_queue_entry,
        )??;

        tx.commit()?;
        tracing::info!(
            "Created task {} for user {} (priority {}, position {})",
            task.id,
            user_id,
            entry.priority,
            entry.queue_position
        );
        Ok((task, entry))
    }

    /// The queued task with the smallest `(priority, created_at)`, if any.
    pub async fn next_queued_task(&self) -> Result<Option<ResearchTask>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM user_task ut
                     JOIN task_queue tq ON tq.task_id = ut.id
                     WHERE ut.status = 'queued'
                     ORDER BY tq.priority ASC, tq.created_at ASC
                     LIMIT 1",
                    TASK_COLUMNS
                        .split(", ")
                        .map(|c| format!("ut.{c}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                [],
                row_to_task,
            )
            .optional()?;
        row.transpose()
    }

    /// Compare-and-set `queued` → `processing`, recording the worker and
    /// start time on the queue entry. Returns false when another worker won.
    pub async fn start_processing(
        &self,
        task_id: TaskId,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        let now = ts(Utc::now());
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE user_task
             SET status = 'processing', processing_started_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![now, task_id],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE task_queue SET worker_id = ?1, started_at = ?2, updated_at = ?2
             WHERE task_id = ?3",
            params![worker_id, now, task_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Finish one research cycle. Atomic; a no-op unless the task is
    /// currently `processing`, which makes duplicate calls harmless.
    ///
    /// On success the task either returns to `queued` (queue entry reset for
    /// re-dispatch) or, at the cycle limit, becomes `completed`, its queue
    /// entry removed and a cycle-limit notification enqueued whose body
    /// depends on whether any findings exist. On failure the task becomes
    /// `failed` and is dequeued.
    pub async fn complete_cycle(
        &self,
        task_id: TaskId,
        success: bool,
        error: Option<&str>,
        notify_target_override: Option<&str>,
    ) -> Result<CycleOutcome, StoreError> {
        let now = Utc::now();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let task = tx
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM user_task WHERE id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?
            .ok_or(StoreError::NotFound("task", task_id))??;

        if task.status != TaskStatus::Processing {
            tracing::debug!(
                "complete_cycle ignored for task {} in status {}",
                task_id,
                task.status.as_str()
            );
            return Ok(CycleOutcome::Ignored);
        }

        let outcome = if success {
            let cycles = task.cycles_completed + 1;
            if cycles >= task.max_cycles {
                tx.execute(
                    "UPDATE user_task
                     SET status = 'completed', cycles_completed = ?1,
                         processing_completed_at = ?2, updated_at = ?2
                     WHERE id = ?3",
                    params![cycles, ts(now), task_id],
                )?;
                tx.execute(
                    "DELETE FROM task_queue WHERE task_id = ?1",
                    params![task_id],
                )?;

                let finding_count: u32 = tx.query_row(
                    "SELECT COUNT(*) FROM finding WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )?;
                let had_findings = finding_count > 0;

                let (external_id, plan_str): (String, String) = tx.query_row(
                    "SELECT external_id, plan FROM user WHERE id = ?1",
                    params![task.user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let plan = UserPlan::from_str(&plan_str).map_err(StoreError::Serialization)?;
                let target =
                    effective_notify_target(&tx, &external_id, notify_target_override)?;
                let body = cycle_limit_message(&task, cycles, plan, had_findings);
                super::outbound::insert_outbound(
                    &tx,
                    crate::types::OutboundKind::CycleLimitNotification,
                    &target,
                    &body,
                )?;

                CycleOutcome::Completed { had_findings }
            } else {
                tx.execute(
                    "UPDATE user_task
                     SET status = 'queued', cycles_completed = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![cycles, ts(now), task_id],
                )?;
                // Reset the entry so the task is re-dispatchable.
                tx.execute(
                    "UPDATE task_queue
                     SET worker_id = NULL, started_at = NULL, updated_at = ?1
                     WHERE task_id = ?2",
                    params![ts(now), task_id],
                )?;
                recompute_queue_positions(&tx)?;
                CycleOutcome::Requeued {
                    cycles_completed: cycles,
                }
            }
        } else {
            tx.execute(
                "UPDATE user_task
                 SET status = 'failed', processing_completed_at = ?1,
                     error_message = ?2, updated_at = ?1
                 WHERE id = ?3",
                params![ts(now), error, task_id],
            )?;
            tx.execute(
                "DELETE FROM task_queue WHERE task_id = ?1",
                params![task_id],
            )?;
            CycleOutcome::Failed
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<ResearchTask>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM user_task WHERE id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?;
        row.transpose()
    }

    pub async fn get_queue_entry(
        &self,
        task_id: TaskId,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM task_queue WHERE task_id = ?1"),
                params![task_id],
                row_to_queue_entry,
            )
            .optional()?;
        row.transpose()
    }

    /// All tasks for a user, newest first.
    pub async fn list_user_tasks(&self, user_id: UserId) -> Result<Vec<ResearchTask>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM user_task WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    /// User-initiated cancel. Only non-terminal tasks owned by the user are
    /// affected; the queue entry is removed.
    pub async fn cancel_task(&self, user_id: UserId, task_id: TaskId) -> Result<bool, StoreError> {
        let now = ts(Utc::now());
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "UPDATE user_task SET status = 'cancelled', updated_at = ?1
             WHERE id = ?2 AND user_id = ?3
               AND status IN ('queued', 'processing', 'paused')",
            params![now, task_id, user_id],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM task_queue WHERE task_id = ?1",
            params![task_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Pause a queued task. Paused tasks keep their queue entry but are
    /// skipped by dispatch until resumed.
    pub async fn pause_task(&self, user_id: UserId, task_id: TaskId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE user_task SET status = 'paused', updated_at = ?1
             WHERE id = ?2 AND user_id = ?3 AND status = 'queued'",
            params![ts(Utc::now()), task_id, user_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn resume_task(&self, user_id: UserId, task_id: TaskId) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "UPDATE user_task SET status = 'queued', updated_at = ?1
             WHERE id = ?2 AND user_id = ?3 AND status = 'paused'",
            params![ts(Utc::now()), task_id, user_id],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        recompute_queue_positions(&tx)?;
        tx.commit()?;
        Ok(true)
    }

    /// Findings joined with their papers, relevance-descending.
    pub async fn task_results(&self, task_id: TaskId) -> Result<Vec<SelectedResult>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT pa.id, pa.paper_id, pa.task_id, pa.relevance, pa.summary,
                    pa.key_fragments, pa.contextual_reasoning, pa.status,
                    pa.created_at, pa.updated_at,
                    ap.id, ap.source_id, ap.title, ap.summary, ap.categories,
                    ap.published, ap.updated, ap.pdf_url, ap.abs_url,
                    ap.primary_category, ap.created_at
             FROM paper_analysis pa
             JOIN finding f ON f.paper_id = pa.paper_id AND f.task_id = pa.task_id
             JOIN arxiv_paper ap ON ap.id = pa.paper_id
             WHERE pa.task_id = ?1
             ORDER BY pa.relevance DESC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            let analysis = row_to_analysis_at(row, 0)?;
            let paper = super::paper::row_to_paper_at(row, 10)?;
            Ok((analysis, paper))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (analysis, paper) = row?;
            results.push(SelectedResult {
                analysis: analysis?,
                paper: paper?,
            });
        }
        Ok(results)
    }

    // ── Persisted search queries ──────────────────────────────────────

    pub async fn add_search_query(
        &self,
        task_id: TaskId,
        query_text: &str,
        rationale: Option<&str>,
        categories: Option<&[String]>,
    ) -> Result<i64, StoreError> {
        let categories_json = categories
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO search_query (task_id, query_text, rationale, categories, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, query_text, rationale, categories_json, ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Enabled queries for a task, oldest first. Handed to the strategy
    /// stage as user-suggested hints.
    pub async fn active_search_queries(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<SearchQueryRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, query_text, rationale, categories, enabled,
                    success_count, last_run_at, created_at
             FROM search_query
             WHERE task_id = ?1 AND enabled = 1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_search_query)?;
        let mut queries = Vec::new();
        for row in rows {
            queries.push(row??);
        }
        Ok(queries)
    }

    /// Stamp the task's enabled queries after a cycle that produced findings.
    pub async fn record_query_success(&self, task_id: TaskId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE search_query
             SET success_count = success_count + 1, last_run_at = ?1
             WHERE task_id = ?2 AND enabled = 1",
            params![ts(Utc::now()), task_id],
        )?;
        Ok(())
    }
}

/// Recompute monotone positions over queued tasks and refresh the estimated
/// start times: `now + median × (position − 1) / max(workers, 1)`.
pub(super) fn recompute_queue_positions(tx: &Transaction<'_>) -> Result<(), StoreError> {
    let (median, workers): (f64, u32) = tx
        .query_row(
            "SELECT median_processing_time, active_workers FROM task_statistics WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .unwrap_or((300.0, 1));

    let ids: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT tq.id FROM task_queue tq
             JOIN user_task ut ON ut.id = tq.task_id
             WHERE ut.status = 'queued'
             ORDER BY tq.priority ASC, tq.created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let now = Utc::now();
    for (index, id) in ids.iter().enumerate() {
        let position = (index + 1) as i64;
        let wait_secs = median * (position - 1) as f64 / workers.max(1) as f64;
        let eta = now + chrono::Duration::milliseconds((wait_secs * 1000.0) as i64);
        tx.execute(
            "UPDATE task_queue
             SET queue_position = ?1, estimated_start_time = ?2, updated_at = ?3
             WHERE id = ?4",
            params![position, ts(eta), ts(now), id],
        )?;
    }
    Ok(())
}

fn effective_notify_target(
    tx: &Transaction<'_>,
    external_id: &str,
    override_target: Option<&str>,
) -> Result<String, StoreError> {
    if let Some(target) = override_target {
        return Ok(target.to_string());
    }
    let group: Option<i64> = tx
        .query_row(
            "SELECT group_chat_id FROM user_settings WHERE user_external_id = ?1",
            params![external_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    Ok(group
        .map(|g| g.to_string())
        .unwrap_or_else(|| external_id.to_string()))
}

fn truncate_title(description: &str) -> String {
    let chars: Vec<char> = description.chars().collect();
    if chars.len() > 100 {
        let mut title: String = chars[..100].iter().collect();
        title.push_str("...");
        title
    } else {
        description.to_string()
    }
}

fn cycle_limit_message(
    task: &ResearchTask,
    cycles: u32,
    plan: UserPlan,
    had_findings: bool,
) -> String {
    let desc = truncate_title(&task.description);
    if had_findings {
        format!(
            "🎉 Task #{} completed!\n\n\
             ✅ Results found for your query:\n\
             📝 {}\n\n\
             🔄 Cycles completed: {}/{} (Plan: {})\n\n\
             🤖 Hope the results were helpful!\n\n\
             💡 Want to continue research?\n\
             • Create a new task with a refined query\n\
             • Or upgrade to Premium for more search cycles",
            task.id,
            desc,
            cycles,
            task.max_cycles,
            plan.display_name()
        )
    } else {
        format!(
            "🔄 Task #{} completed\n\n\
             📝 {}\n\n\
             🔄 Cycles completed: {}/{} (Plan: {})\n\n\
             ❌ Unfortunately, no results found for this query.\n\n\
             💡 Recommendations:\n\
             • Try reformulating the query more specifically\n\
             • Use different keywords\n\
             • Or upgrade to Premium for more search cycles",
            task.id,
            desc,
            cycles,
            task.max_cycles,
            plan.display_name()
        )
    }
}

pub(super) fn row_to_task(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<ResearchTask, StoreError>> {
    let id: i64 = row.get(0)?;
    let user_id: i64 = row.get(1)?;
    let title: String = row.get(2)?;
    let description: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let cycles_completed: u32 = row.get(5)?;
    let max_cycles: u32 = row.get(6)?;
    let started_str: Option<String> = row.get(7)?;
    let completed_str: Option<String> = row.get(8)?;
    let error_message: Option<String> = row.get(9)?;
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    Ok((|| -> Result<ResearchTask, StoreError> {
        Ok(ResearchTask {
            id,
            user_id,
            title,
            description,
            status: TaskStatus::from_str(&status_str).map_err(StoreError::Serialization)?,
            cycles_completed,
            max_cycles,
            processing_started_at: parse_ts_opt(started_str)?,
            processing_completed_at: parse_ts_opt(completed_str)?,
            error_message,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}

fn row_to_queue_entry(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<QueueEntry, StoreError>> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let priority: i32 = row.get(2)?;
    let queue_position: i32 = row.get(3)?;
    let eta_str: Option<String> = row.get(4)?;
    let worker_id: Option<String> = row.get(5)?;
    let started_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    Ok((|| -> Result<QueueEntry, StoreError> {
        Ok(QueueEntry {
            id,
            task_id,
            priority,
            queue_position,
            estimated_start_time: parse_ts_opt(eta_str)?,
            worker_id,
            started_at: parse_ts_opt(started_str)?,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}

fn row_to_search_query(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<SearchQueryRow, StoreError>> {
    let id: i64 = row.get(0)?;
    let task_id: i64 = row.get(1)?;
    let query_text: String = row.get(2)?;
    let rationale: Option<String> = row.get(3)?;
    let categories_json: Option<String> = row.get(4)?;
    let enabled: i32 = row.get(5)?;
    let success_count: u32 = row.get(6)?;
    let last_run_str: Option<String> = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok((|| -> Result<SearchQueryRow, StoreError> {
        let categories = categories_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(SearchQueryRow {
            id,
            task_id,
            query_text,
            rationale,
            categories,
            enabled: enabled != 0,
            success_count,
            last_run_at: parse_ts_opt(last_run_str)?,
            created_at: parse_ts(&created_str)?,
        })
    })())
}

pub(super) fn row_to_analysis_at(
    row: &rusqlite::Row<'_>,
    base: usize,
) -> rusqlite::Result<Result<Analysis, StoreError>> {
    let id: i64 = row.get(base)?;
    let paper_id: i64 = row.get(base + 1)?;
    let task_id: i64 = row.get(base + 2)?;
    let relevance: f64 = row.get(base + 3)?;
    let summary: Option<String> = row.get(base + 4)?;
    let key_fragments: Option<String> = row.get(base + 5)?;
    let contextual_reasoning: Option<String> = row.get(base + 6)?;
    let status_str: String = row.get(base + 7)?;
    let created_str: String = row.get(base + 8)?;
    let updated_str: String = row.get(base + 9)?;

    Ok((|| -> Result<Analysis, StoreError> {
        Ok(Analysis {
            id,
            paper_id,
            task_id,
            relevance,
            summary,
            key_fragments,
            contextual_reasoning,
            status: AnalysisStatus::from_str(&status_str).map_err(StoreError::Serialization)?,
            created_at: parse_ts(&created_str)?,
            updated_at: parse_ts(&updated_str)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Admission, OutboundKind, UserProfile};

    async fn store_with_user() -> (SqliteStore, crate::types::User) {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store
            .get_or_create_user("100", &UserProfile::default())
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn free_plan_first_task() {
        let (store, user) = store_with_user().await;
        assert!(store.check_admission(user.id).await.unwrap().is_granted());

        let (task, entry) = store
            .create_task_and_enqueue(user.id, "AI for medical imaging")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.max_cycles, 5);
        assert_eq!(entry.priority, 100);
        assert_eq!(entry.queue_position, 1);

        let user = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.daily_tasks_created, 1);
    }

    #[tokio::test]
    async fn concurrent_cap_denies_second_task() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "AI for medical imaging")
            .await
            .unwrap();
        assert!(store.start_processing(task.id, "w1").await.unwrap());

        match store.check_admission(user.id).await.unwrap() {
            Admission::Denied(reason) => {
                assert_eq!(reason, "Concurrent task limit reached (1)");
            }
            Admission::Granted => panic!("second task admitted past the cap"),
        }
    }

    #[tokio::test]
    async fn tasks_are_not_deduplicated() {
        let (store, user) = store_with_user().await;
        // Premium so the concurrent cap does not interfere.
        store
            .upgrade_plan("100", UserPlan::Premium, None)
            .await
            .unwrap();
        let (first, _) = store
            .create_task_and_enqueue(user.id, "same description")
            .await
            .unwrap();
        let (second, _) = store
            .create_task_and_enqueue(user.id, "same description")
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn premium_dispatches_before_free() {
        let store = SqliteStore::open_in_memory().unwrap();
        let free = store
            .get_or_create_user("free", &UserProfile::default())
            .await
            .unwrap();
        let premium = store
            .get_or_create_user("prem", &UserProfile::default())
            .await
            .unwrap();
        store
            .upgrade_plan("prem", UserPlan::Premium, None)
            .await
            .unwrap();

        let (free_task, _) = store
            .create_task_and_enqueue(free.id, "first in, lower priority")
            .await
            .unwrap();
        let (prem_task, entry) = store
            .create_task_and_enqueue(premium.id, "second in, higher priority")
            .await
            .unwrap();
        assert_eq!(entry.priority, 50);
        assert_eq!(entry.queue_position, 1);

        let next = store.next_queued_task().await.unwrap().unwrap();
        assert_eq!(next.id, prem_task.id);

        let free_entry = store.get_queue_entry(free_task.id).await.unwrap().unwrap();
        assert_eq!(free_entry.queue_position, 2);
    }

    #[tokio::test]
    async fn start_processing_is_a_cas() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "graph neural networks")
            .await
            .unwrap();

        assert!(store.start_processing(task.id, "w1").await.unwrap());
        // A second worker loses the race.
        assert!(!store.start_processing(task.id, "w2").await.unwrap());

        let entry = store.get_queue_entry(task.id).await.unwrap().unwrap();
        assert_eq!(entry.worker_id.as_deref(), Some("w1"));
        assert!(entry.started_at.is_some());
    }

    #[tokio::test]
    async fn successful_cycle_requeues_until_limit() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "sparse attention")
            .await
            .unwrap();

        for cycle in 1..5u32 {
            assert!(store.start_processing(task.id, "w1").await.unwrap());
            let outcome = store
                .complete_cycle(task.id, true, None, None)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                CycleOutcome::Requeued {
                    cycles_completed: cycle
                }
            );
            let entry = store.get_queue_entry(task.id).await.unwrap().unwrap();
            assert!(entry.worker_id.is_none());
            assert!(entry.started_at.is_none());
        }

        // Fifth cycle reaches the limit.
        assert!(store.start_processing(task.id, "w1").await.unwrap());
        let outcome = store
            .complete_cycle(task.id, true, None, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                had_findings: false
            }
        );

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.cycles_completed, 5);
        assert!(store.get_queue_entry(task.id).await.unwrap().is_none());

        let pending = store.poll_completed_outbound(0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OutboundKind::CycleLimitNotification);
        assert!(
            pending[0]
                .payload_text
                .starts_with(&format!("🔄 Task #{} completed", task.id)),
            "no-findings body should lead with the refinement variant"
        );
    }

    #[tokio::test]
    async fn cycle_limit_message_congratulates_when_findings_exist() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "protein folding")
            .await
            .unwrap();

        // Complete four quiet cycles, then record a finding before the last.
        for _ in 0..4 {
            store.start_processing(task.id, "w1").await.unwrap();
            store
                .complete_cycle(task.id, true, None, None)
                .await
                .unwrap();
        }
        let paper_id = store
            .upsert_paper(&crate::sources::Candidate::minimal(
                "2401.00001",
                "AlphaFold improvements",
                "protein structure prediction",
            ))
            .await
            .unwrap();
        store
            .create_analysis_if_absent(paper_id, task.id, 88.0, Some("useful"), None, None)
            .await
            .unwrap();
        store
            .create_finding(task.id, paper_id, 88.0, Some("useful"))
            .await
            .unwrap();

        store.start_processing(task.id, "w1").await.unwrap();
        let outcome = store
            .complete_cycle(task.id, true, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Completed { had_findings: true });

        let pending = store.poll_completed_outbound(0).await.unwrap();
        let body = &pending[0].payload_text;
        assert!(
            body.starts_with(&format!("🎉 Task #{} completed!", task.id)),
            "findings body should lead with the congratulatory variant, got: {body}"
        );
    }

    #[tokio::test]
    async fn failed_cycle_is_terminal_and_keeps_credits() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "quantum annealing")
            .await
            .unwrap();
        store.start_processing(task.id, "w1").await.unwrap();

        let outcome = store
            .complete_cycle(task.id, false, Some("store exploded"), None)
            .await
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Failed);

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        // Failed cycles do not consume a cycle credit.
        assert_eq!(task.cycles_completed, 0);
        assert_eq!(task.error_message.as_deref(), Some("store exploded"));
        assert!(store.get_queue_entry(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_cycle_is_idempotent() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "idempotency check")
            .await
            .unwrap();
        store.start_processing(task.id, "w1").await.unwrap();

        let first = store
            .complete_cycle(task.id, true, None, None)
            .await
            .unwrap();
        assert_ne!(first, CycleOutcome::Ignored);

        // The task is queued again; a duplicate completion must not advance it.
        let second = store
            .complete_cycle(task.id, true, None, None)
            .await
            .unwrap();
        assert_eq!(second, CycleOutcome::Ignored);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.cycles_completed, 1);
    }

    #[tokio::test]
    async fn cancel_removes_queue_entry() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "to be cancelled")
            .await
            .unwrap();
        assert!(store.cancel_task(user.id, task.id).await.unwrap());
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(store.get_queue_entry(task.id).await.unwrap().is_none());
        // Terminal tasks cannot be cancelled again.
        assert!(!store.cancel_task(user.id, task.id).await.unwrap());
    }

    #[tokio::test]
    async fn paused_tasks_are_skipped_by_dispatch() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "pausable research")
            .await
            .unwrap();
        assert!(store.pause_task(user.id, task.id).await.unwrap());
        assert!(store.next_queued_task().await.unwrap().is_none());

        assert!(store.resume_task(user.id, task.id).await.unwrap());
        let next = store.next_queued_task().await.unwrap().unwrap();
        assert_eq!(next.id, task.id);
    }

    #[tokio::test]
    async fn search_queries_round_trip() {
        let (store, user) = store_with_user().await;
        let (task, _) = store
            .create_task_and_enqueue(user.id, "retrieval augmentation")
            .await
            .unwrap();
        store
            .add_search_query(
                task.id,
                "RAG survey",
                Some("user hint"),
                Some(&["cs.IR".to_string()]),
            )
            .await
            .unwrap();

        let queries = store.active_search_queries(task.id).await.unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].query_text, "RAG survey");
        assert_eq!(queries[0].categories.as_deref(), Some(&["cs.IR".to_string()][..]));
        assert_eq!(queries[0].success_count, 0);

        store.record_query_success(task.id).await.unwrap();
        let queries = store.active_search_queries(task.id).await.unwrap();
        assert_eq!(queries[0].success_count, 1);
        assert!(queries[0].last_run_at.is_some());
    }

    #[test]
    fn title_truncation() {
        let long = "x".repeat(150);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), 103);
        assert!(title.ends_with("..."));
        assert_eq!(truncate_title("short"), "short");
    }
}
