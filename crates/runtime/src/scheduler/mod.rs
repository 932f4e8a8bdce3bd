//! The worker loop: drain the task queue, run pipeline cycles, persist
//! results, and hand notifications to the outbound queue.
//!
//! Workers may be replicated across processes; `start_processing` is a
//! compare-and-set, so each task is dispatched to exactly one worker per
//! cycle. Within a worker everything is sequential except the pipeline's
//! internal analysis fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::pipeline::{CancelProbe, Pipeline, PipelineOutput, PipelineTask, ScoredAnalysis};
use crate::store::SqliteStore;
use crate::types::{
    CycleOutcome, OutboundKind, PipelineError, ResearchTask, SchedulerError, TaskId, TaskStatus,
    User,
};

/// Worker-facing slice of the runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Suppress persistence of selected items; notifications still flow.
    pub dry_run: bool,
    /// Retarget all outbound notifications (staging environments).
    pub test_user_override: Option<String>,
}

impl From<&RuntimeConfig> for WorkerConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            poll_interval: config.poll_interval,
            dry_run: config.dry_run,
            test_user_override: config.test_user_override.clone(),
        }
    }
}

/// Probe backed by the durable task row; a user cancel flips the status
/// the pipeline observes at its next stage boundary.
struct TaskCancelProbe {
    store: Arc<SqliteStore>,
    task_id: TaskId,
}

#[async_trait]
impl CancelProbe for TaskCancelProbe {
    async fn is_cancelled(&self) -> bool {
        match self.store.get_task(self.task_id).await {
            Ok(Some(task)) => task.status == TaskStatus::Cancelled,
            Ok(None) => true,
            Err(error) => {
                tracing::warn!(
                    "Cancellation probe failed for task {}: {}",
                    self.task_id,
                    error
                );
                false
            }
        }
    }
}

/// A single long-running worker.
pub struct TaskWorker {
    store: Arc<SqliteStore>,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    /// Minted per process start; distinguishes restarts on the heartbeat.
    session_id: Uuid,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    papers_processed: AtomicU64,
    papers_found: AtomicU64,
}

impl TaskWorker {
    pub fn new(store: Arc<SqliteStore>, pipeline: Arc<Pipeline>, config: WorkerConfig) -> Self {
        Self {
            store,
            pipeline,
            config,
            session_id: Uuid::new_v4(),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(true)),
            papers_processed: AtomicU64::new(0),
            papers_found: AtomicU64::new(0),
        }
    }

    /// Run until `shutdown` is called. One iteration: dequeue, claim, run a
    /// cycle, persist, notify, complete; sleep `poll_interval` when idle.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        let removed = self.store.cleanup_orphaned_queue_entries().await?;
        tracing::info!(
            "Worker {} started (cleaned {} stale queue entries)",
            self.config.worker_id,
            removed
        );

        loop {
            if !*self.is_running.read() {
                break;
            }
            let processed = match self.run_once().await {
                Ok(processed) => processed,
                Err(error) => {
                    tracing::error!("Worker iteration failed: {}", error);
                    false
                }
            };
            if !processed {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.shutdown_notify.notified() => break,
                }
            }
        }

        tracing::info!("Worker {} stopped", self.config.worker_id);
        Ok(())
    }

    /// Graceful stop; the loop exits at its next suspension point.
    pub fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
    }

    /// One scheduler iteration. Returns true when a task was claimed (the
    /// caller should poll again immediately), false when the queue was idle.
    pub async fn run_once(&self) -> Result<bool, SchedulerError> {
        let Some(task) = self.store.next_queued_task().await? else {
            self.heartbeat("idle", "waiting for queued tasks").await;
            return Ok(false);
        };

        if !self
            .store
            .start_processing(task.id, &self.config.worker_id)
            .await?
        {
            tracing::debug!("Task {} was claimed by another worker", task.id);
            return Ok(true);
        }

        self.heartbeat(
            "processing",
            &format!("cycle {}/{} of task {}", task.cycles_completed + 1, task.max_cycles, task.id),
        )
        .await;

        let started = std::time::Instant::now();
        let result = self.run_cycle(&task).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                if outcome != CycleOutcome::Ignored {
                    self.store.record_task_outcome(elapsed, true).await?;
                }
                tracing::info!(
                    "Task {} cycle finished in {:.1}s: {:?}",
                    task.id,
                    elapsed,
                    outcome
                );
            }
            Err(error) => {
                tracing::error!("Task {} cycle failed: {}", task.id, error);
                self.store
                    .complete_cycle(
                        task.id,
                        false,
                        Some(&error.to_string()),
                        self.config.test_user_override.as_deref(),
                    )
                    .await?;
                self.store.record_task_outcome(elapsed, false).await?;
            }
        }

        self.heartbeat("idle", "cycle complete").await;
        Ok(true)
    }

    /// Compose the pipeline task from the durable task, run one cycle,
    /// persist selected items, enqueue the report, and complete the cycle.
    async fn run_cycle(&self, task: &ResearchTask) -> Result<CycleOutcome, SchedulerError> {
        let user = self
            .store
            .get_user(task.user_id)
            .await?
            .ok_or(crate::types::StoreError::NotFound("user", task.user_id))?;
        let settings = self.store.get_user_settings(&user.external_id).await?;

        let suggested: Vec<String> = self
            .store
            .active_search_queries(task.id)
            .await?
            .into_iter()
            .map(|q| q.query_text)
            .collect();

        let mut pipeline_task = PipelineTask::new(task.description.clone());
        pipeline_task.min_relevance = settings.min_relevance;
        if !suggested.is_empty() {
            pipeline_task.queries = Some(suggested);
        }

        let probe = TaskCancelProbe {
            store: self.store.clone(),
            task_id: task.id,
        };
        let output = match self.pipeline.run_with_cancel(&pipeline_task, &probe).await {
            Ok(output) => output,
            Err(PipelineError::Cancelled) => {
                tracing::info!("Task {} was cancelled mid-cycle, abandoning the cycle", task.id);
                return Ok(CycleOutcome::Ignored);
            }
            Err(error) => return Err(SchedulerError::Pipeline(error)),
        };

        self.papers_processed
            .fetch_add(output.analyzed.len() as u64, Ordering::Relaxed);
        self.papers_found
            .fetch_add(output.selected.len() as u64, Ordering::Relaxed);

        // A cancel during the decision stage or after the pipeline returned
        // still wins: discard this cycle's results.
        if probe.is_cancelled().await {
            tracing::info!("Task {} was cancelled mid-cycle, discarding results", task.id);
            return Ok(CycleOutcome::Ignored);
        }

        let analysis_ids = self.persist_selected(task, &output).await?;

        if output.should_notify {
            if let Some(ref report) = output.report_text {
                // Mark analyses queued before the report is enqueued so a
                // retry cannot notify twice.
                for analysis_id in &analysis_ids {
                    self.store.mark_analysis_queued(*analysis_id).await?;
                }
                let target = self.notify_target(&user, settings.group_chat_id);
                self.store
                    .enqueue_outbound(OutboundKind::AgentReport, &target, report)
                    .await?;
                tracing::info!("Enqueued report for task {} to {}", task.id, target);
            }
        }

        let outcome = self
            .store
            .complete_cycle(
                task.id,
                true,
                None,
                self.config.test_user_override.as_deref(),
            )
            .await?;
        Ok(outcome)
    }

    /// Upsert papers, create analyses and findings for the selected items.
    /// Skipped entirely in dry-run mode. Returns the new analysis ids.
    async fn persist_selected(
        &self,
        task: &ResearchTask,
        output: &PipelineOutput,
    ) -> Result<Vec<i64>, SchedulerError> {
        if self.config.dry_run {
            if !output.selected.is_empty() {
                tracing::info!(
                    "DRY_RUN: skipping persistence of {} selected items",
                    output.selected.len()
                );
            }
            return Ok(Vec::new());
        }

        let mut analysis_ids = Vec::new();
        for ScoredAnalysis { result, .. } in &output.selected {
            let paper_id = self.store.upsert_paper(&result.candidate).await?;
            let created = self
                .store
                .create_analysis_if_absent(
                    paper_id,
                    task.id,
                    result.relevance,
                    Some(&result.summary),
                    result.key_fragments.as_deref(),
                    result.contextual_reasoning.as_deref(),
                )
                .await?;
            if let Some(analysis_id) = created {
                self.store
                    .create_finding(task.id, paper_id, result.relevance, Some(&result.summary))
                    .await?;
                analysis_ids.push(analysis_id);
            }
        }

        if !analysis_ids.is_empty() {
            self.store.record_query_success(task.id).await?;
        }
        Ok(analysis_ids)
    }

    fn notify_target(&self, user: &User, group_chat_id: Option<i64>) -> String {
        if let Some(ref target) = self.config.test_user_override {
            return target.clone();
        }
        group_chat_id
            .map(|g| g.to_string())
            .unwrap_or_else(|| user.external_id.clone())
    }

    async fn heartbeat(&self, status: &str, activity: &str) {
        if let Err(error) = self
            .store
            .update_heartbeat(
                &self.config.worker_id,
                self.session_id,
                status,
                activity,
                self.papers_processed.load(Ordering::Relaxed),
                self.papers_found.load(Ordering::Relaxed),
            )
            .await
        {
            tracing::warn!("Failed to update worker heartbeat: {}", error);
        }
    }
}
