//! Papers, analyses, and findings.

use chrono::Utc;
use rusqlite::params;

use super::{parse_ts, parse_ts_opt, ts, OptionalExt, SqliteStore};
use crate::sources::Candidate;
use crate::types::{
    Analysis, AnalysisId, AnalysisStatus, Finding, PaperId, PaperRecord, StoreError, TaskId,
};

const PAPER_COLUMNS: &str = "id, source_id, title, summary, categories, published, updated, \
     pdf_url, abs_url, primary_category, created_at";

impl SqliteStore {
    /// Create a paper record for a candidate if none exists for its source
    /// id, returning the row id either way. Existing rows are left untouched
    /// so the first ingested occurrence wins.
    pub async fn upsert_paper(&self, candidate: &Candidate) -> Result<PaperId, StoreError> {
        let categories_json = serde_json::to_string(&candidate.categories)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO arxiv_paper
                 (source_id, title, summary, categories, published, updated,
                  pdf_url, abs_url, primary_category, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                candidate.source_id,
                candidate.title,
                candidate.summary,
                categories_json,
                candidate.published.map(ts),
                candidate.updated.map(ts),
                candidate.pdf_url,
                candidate.abs_url,
                candidate.primary_category,
                ts(Utc::now()),
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM arxiv_paper WHERE source_id = ?1",
            params![candidate.source_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn get_paper_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Option<PaperRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {PAPER_COLUMNS} FROM arxiv_paper WHERE source_id = ?1"),
                params![source_id],
                |row| row_to_paper_at(row, 0),
            )
            .optional()?;
        row.transpose()
    }

    /// Insert an analysis for `(paper, task)` unless one already exists.
    /// Returns `None` on duplicate; the uniqueness constraint makes repeated
    /// cycles skip papers they have already assessed.
    pub async fn create_analysis_if_absent(
        &self,
        paper_id: PaperId,
        task_id: TaskId,
        relevance: f64,
        summary: Option<&str>,
        key_fragments: Option<&str>,
        contextual_reasoning: Option<&str>,
    ) -> Result<Option<AnalysisId>, StoreError> {
        let now = ts(Utc::now());
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO paper_analysis
                 (paper_id, task_id, relevance, summary, key_fragments,
                  contextual_reasoning, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'analyzed', ?7, ?7)",
            params![
                paper_id,
                task_id,
                relevance,
                summary,
                key_fragments,
                contextual_reasoning,
                now,
            ],
        )?;
        if rows == 0 {
            tracing::debug!(
                "Analysis for paper {} and task {} already exists, skipping",
                paper_id,
                task_id
            );
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub async fn get_analysis(
        &self,
        analysis_id: AnalysisId,
    ) -> Result<Option<Analysis>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, paper_id, task_id, relevance, summary, key_fragments,
                        contextual_reasoning, status, created_at, updated_at
                 FROM paper_analysis WHERE id = ?1",
                params![analysis_id],
                |row| super::task::row_to_analysis_at(row, 0),
            )
            .optional()?;
        row.transpose()
    }

    /// analyzed → queued. Guards against duplicate notifications on retry;
    /// returns false if the analysis was not in `analyzed`.
    pub async fn mark_analysis_queued(&self, analysis_id: AnalysisId) -> Result<bool, StoreError> {
        self.advance_analysis(analysis_id, AnalysisStatus::Analyzed, AnalysisStatus::Queued)
            .await
    }

    /// queued → notified, recorded when the delivery component acknowledges.
    pub async fn mark_analysis_notified(
        &self,
        analysis_id: AnalysisId,
    ) -> Result<bool, StoreError> {
        let advanced = self
            .advance_analysis(analysis_id, AnalysisStatus::Queued, AnalysisStatus::Notified)
            .await?;
        if advanced {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE finding SET notified_at = ?1
                 WHERE (task_id, paper_id) IN
                     (SELECT task_id, paper_id FROM paper_analysis WHERE id = ?2)",
                params![ts(Utc::now()), analysis_id],
            )?;
        }
        Ok(advanced)
    }

    async fn advance_analysis(
        &self,
        analysis_id: AnalysisId,
        from: AnalysisStatus,
        to: AnalysisStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE paper_analysis SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![to.as_str(), ts(Utc::now()), analysis_id, from.as_str()],
        )?;
        Ok(rows > 0)
    }

    pub async fn create_finding(
        &self,
        task_id: TaskId,
        paper_id: PaperId,
        relevance: f64,
        summary: Option<&str>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO finding (task_id, paper_id, relevance, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, paper_id, relevance, summary, ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn findings_for_task(&self, task_id: TaskId) -> Result<Vec<Finding>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, paper_id, relevance, summary, notified_at, created_at
             FROM finding WHERE task_id = ?1 ORDER BY relevance DESC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            let id: i64 = row.get(0)?;
            let task_id: i64 = row.get(1)?;
            let paper_id: i64 = row.get(2)?;
            let relevance: f64 = row.get(3)?;
            let summary: Option<String> = row.get(4)?;
            let notified_str: Option<String> = row.get(5)?;
            let created_str: String = row.get(6)?;
            Ok((|| -> Result<Finding, StoreError> {
                Ok(Finding {
                    id,
                    task_id,
                    paper_id,
                    relevance,
                    summary,
                    notified_at: parse_ts_opt(notified_str)?,
                    created_at: parse_ts(&created_str)?,
                })
            })())
        })?;
        let mut findings = Vec::new();
        for row in rows {
            findings.push(row??);
        }
        Ok(findings)
    }
}

pub(super) fn row_to_paper_at(
    row: &rusqlite::Row<'_>,
    base: usize,
) -> rusqlite::Result<Result<PaperRecord, StoreError>> {
    let id: i64 = row.get(base)?;
    let source_id: String = row.get(base + 1)?;
    let title: String = row.get(base + 2)?;
    let summary: String = row.get(base + 3)?;
    let categories_json: String = row.get(base + 4)?;
    let published_str: Option<String> = row.get(base + 5)?;
    let updated_str: Option<String> = row.get(base + 6)?;
    let pdf_url: Option<String> = row.get(base + 7)?;
    let abs_url: Option<String> = row.get(base + 8)?;
    let primary_category: Option<String> = row.get(base + 9)?;
    let created_str: String = row.get(base + 10)?;

    Ok((|| -> Result<PaperRecord, StoreError> {
        let categories = serde_json::from_str(&categories_json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(PaperRecord {
            id,
            source_id,
            title,
            summary,
            categories,
            published: parse_ts_opt(published_str)?,
            updated: parse_ts_opt(updated_str)?,
            pdf_url,
            abs_url,
            primary_category,
            created_at: parse_ts(&created_str)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserProfile;

    async fn store_with_task() -> (SqliteStore, TaskId) {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store
            .get_or_create_user("u", &UserProfile::default())
            .await
            .unwrap();
        let (task, _) = store
            .create_task_and_enqueue(user.id, "test research")
            .await
            .unwrap();
        (store, task.id)
    }

    #[tokio::test]
    async fn same_source_id_yields_one_record() {
        let (store, _) = store_with_task().await;
        let candidate = Candidate::minimal("2401.12345", "Title A", "Abstract A");
        let first = store.upsert_paper(&candidate).await.unwrap();

        // Second ingest with a different title must not replace the row.
        let revised = Candidate::minimal("2401.12345", "Title B", "Abstract B");
        let second = store.upsert_paper(&revised).await.unwrap();
        assert_eq!(first, second);

        let paper = store
            .get_paper_by_source_id("2401.12345")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paper.title, "Title A");
    }

    #[tokio::test]
    async fn duplicate_analysis_is_skipped() {
        let (store, task_id) = store_with_task().await;
        let paper_id = store
            .upsert_paper(&Candidate::minimal("p1", "t", "s"))
            .await
            .unwrap();

        let first = store
            .create_analysis_if_absent(paper_id, task_id, 70.0, Some("summary"), None, None)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .create_analysis_if_absent(paper_id, task_id, 95.0, Some("other"), None, None)
            .await
            .unwrap();
        assert!(second.is_none());

        let analysis = store.get_analysis(first.unwrap()).await.unwrap().unwrap();
        assert_eq!(analysis.relevance, 70.0);
    }

    #[tokio::test]
    async fn analysis_status_only_moves_forward() {
        let (store, task_id) = store_with_task().await;
        let paper_id = store
            .upsert_paper(&Candidate::minimal("p1", "t", "s"))
            .await
            .unwrap();
        let id = store
            .create_analysis_if_absent(paper_id, task_id, 80.0, None, None, None)
            .await
            .unwrap()
            .unwrap();

        // notified before queued is rejected.
        assert!(!store.mark_analysis_notified(id).await.unwrap());

        assert!(store.mark_analysis_queued(id).await.unwrap());
        // Re-queue is rejected.
        assert!(!store.mark_analysis_queued(id).await.unwrap());

        assert!(store.mark_analysis_notified(id).await.unwrap());
        assert!(!store.mark_analysis_notified(id).await.unwrap());

        let analysis = store.get_analysis(id).await.unwrap().unwrap();
        assert_eq!(analysis.status, AnalysisStatus::Notified);
    }

    #[tokio::test]
    async fn notified_analysis_stamps_finding() {
        let (store, task_id) = store_with_task().await;
        let paper_id = store
            .upsert_paper(&Candidate::minimal("p1", "t", "s"))
            .await
            .unwrap();
        let id = store
            .create_analysis_if_absent(paper_id, task_id, 80.0, None, None, None)
            .await
            .unwrap()
            .unwrap();
        store
            .create_finding(task_id, paper_id, 80.0, None)
            .await
            .unwrap();

        store.mark_analysis_queued(id).await.unwrap();
        store.mark_analysis_notified(id).await.unwrap();

        let findings = store.findings_for_task(task_id).await.unwrap();
        assert!(findings[0].notified_at.is_some());
    }

    #[tokio::test]
    async fn task_results_join_analyses_and_papers() {
        let (store, task_id) = store_with_task().await;
        for (sid, relevance) in [("p1", 60.0), ("p2", 90.0)] {
            let paper_id = store
                .upsert_paper(&Candidate::minimal(sid, sid, "abstract"))
                .await
                .unwrap();
            store
                .create_analysis_if_absent(paper_id, task_id, relevance, Some("s"), None, None)
                .await
                .unwrap();
            store
                .create_finding(task_id, paper_id, relevance, Some("s"))
                .await
                .unwrap();
        }

        let results = store.task_results(task_id).await.unwrap();
        assert_eq!(results.len(), 2);
        // Relevance-descending.
        assert_eq!(results[0].paper.source_id, "p2");
        assert_eq!(results[1].paper.source_id, "p1");
    }
}
