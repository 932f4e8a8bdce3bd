//! Core types for the Scout research engine.
//!
//! Durable entities mirror the relational schema owned by the [`crate::store`]
//! module; transient pipeline types live in [`crate::pipeline`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Row identifier aliases. All durable entities use SQLite rowid keys.
pub type UserId = i64;
pub type TaskId = i64;
pub type PaperId = i64;
pub type AnalysisId = i64;
pub type FindingId = i64;
pub type OutboundId = i64;

/// Subscription plan. Determines quotas and queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserPlan {
    #[default]
    Free,
    Premium,
}

impl UserPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserPlan::Free => "free",
            UserPlan::Premium => "premium",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            UserPlan::Free => "Free",
            UserPlan::Premium => "Premium",
        }
    }

    /// Tasks a user may create per day.
    pub fn daily_task_limit(&self) -> u32 {
        match self {
            UserPlan::Free => 5,
            UserPlan::Premium => 100,
        }
    }

    /// Tasks a user may have queued or processing at once.
    pub fn concurrent_task_limit(&self) -> u32 {
        match self {
            UserPlan::Free => 1,
            UserPlan::Premium => 5,
        }
    }

    /// Research cycles a single task runs before completion.
    pub fn max_cycles(&self) -> u32 {
        match self {
            UserPlan::Free => 5,
            UserPlan::Premium => 100,
        }
    }

    /// Queue priority. Lower dispatches earlier.
    pub fn queue_priority(&self) -> i32 {
        match self {
            UserPlan::Free => 100,
            UserPlan::Premium => 50,
        }
    }
}

impl std::str::FromStr for UserPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(UserPlan::Free),
            "premium" => Ok(UserPlan::Premium),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        }
    }

    /// Terminal tasks never re-enter the queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "paused" => Ok(TaskStatus::Paused),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Notification lifecycle of a paper analysis.
///
/// Transitions are monotonic: analyzed → queued → notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Analyzed,
    Queued,
    Notified,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Analyzed => "analyzed",
            AnalysisStatus::Queued => "queued",
            AnalysisStatus::Notified => "notified",
        }
    }

    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_advance_to(&self, next: AnalysisStatus) -> bool {
        matches!(
            (self, next),
            (AnalysisStatus::Analyzed, AnalysisStatus::Queued)
                | (AnalysisStatus::Queued, AnalysisStatus::Notified)
        )
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyzed" => Ok(AnalysisStatus::Analyzed),
            "queued" => Ok(AnalysisStatus::Queued),
            "notified" => Ok(AnalysisStatus::Notified),
            other => Err(format!("unknown analysis status: {other}")),
        }
    }
}

/// Kinds of outbound messages handed to the external chat component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    AgentReport,
    CycleLimitNotification,
    MonitoringStarted,
    StartMonitoring,
    RestartMonitoring,
    AnalysisComplete,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::AgentReport => "agent_report",
            OutboundKind::CycleLimitNotification => "cycle_limit_notification",
            OutboundKind::MonitoringStarted => "monitoring_started",
            OutboundKind::StartMonitoring => "start_monitoring",
            OutboundKind::RestartMonitoring => "restart_monitoring",
            OutboundKind::AnalysisComplete => "analysis_complete",
        }
    }
}

impl std::str::FromStr for OutboundKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_report" => Ok(OutboundKind::AgentReport),
            "cycle_limit_notification" => Ok(OutboundKind::CycleLimitNotification),
            "monitoring_started" => Ok(OutboundKind::MonitoringStarted),
            "start_monitoring" => Ok(OutboundKind::StartMonitoring),
            "restart_monitoring" => Ok(OutboundKind::RestartMonitoring),
            "analysis_complete" => Ok(OutboundKind::AnalysisComplete),
            other => Err(format!("unknown outbound kind: {other}")),
        }
    }
}

/// Delivery state of an outbound message.
///
/// The core writes `completed` rows; the external chat component transitions
/// them to `sent` exactly once, or `failed` with a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundStatus {
    Pending,
    Completed,
    Sent,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::Pending => "pending",
            OutboundStatus::Completed => "completed",
            OutboundStatus::Sent => "sent",
            OutboundStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for OutboundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboundStatus::Pending),
            "completed" => Ok(OutboundStatus::Completed),
            "sent" => Ok(OutboundStatus::Sent),
            "failed" => Ok(OutboundStatus::Failed),
            other => Err(format!("unknown outbound status: {other}")),
        }
    }
}

/// Closed set of search sources. New sources register an adapter under one of
/// these tags; the pipeline dispatches by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Arxiv,
    Scholar,
    Pubmed,
    Github,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Arxiv => "arxiv",
            SourceTag::Scholar => "scholar",
            SourceTag::Pubmed => "pubmed",
            SourceTag::Github => "github",
        }
    }

    pub const ALL: [SourceTag; 4] = [
        SourceTag::Arxiv,
        SourceTag::Scholar,
        SourceTag::Pubmed,
        SourceTag::Github,
    ];
}

impl std::str::FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arxiv" => Ok(SourceTag::Arxiv),
            "scholar" => Ok(SourceTag::Scholar),
            "pubmed" => Ok(SourceTag::Pubmed),
            "github" => Ok(SourceTag::Github),
            other => Err(format!("unknown source tag: {other}")),
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limited action kinds with their per-window caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    TaskCreate,
    Command,
    Message,
}

/// Sliding-window caps for one action kind.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::TaskCreate => "task_create",
            ActionKind::Command => "command",
            ActionKind::Message => "message",
        }
    }

    pub fn limits(&self) -> RateLimits {
        match self {
            ActionKind::TaskCreate => RateLimits {
                per_minute: 2,
                per_hour: 10,
                per_day: 50,
            },
            ActionKind::Command => RateLimits {
                per_minute: 10,
                per_hour: 100,
                per_day: 500,
            },
            ActionKind::Message => RateLimits {
                per_minute: 20,
                per_hour: 200,
                per_day: 1000,
            },
        }
    }
}

/// A registered user of the research assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Stable id assigned by the external chat service.
    pub external_id: String,
    pub display_name: Option<String>,
    pub plan: UserPlan,
    pub daily_task_limit: u32,
    pub concurrent_task_limit: u32,
    pub daily_tasks_created: u32,
    pub last_daily_reset: DateTime<Utc>,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_banned: bool,
    pub ban_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Display fields upserted on every submission without touching counters.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub display_name: Option<String>,
}

/// A user-submitted research task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub cycles_completed: u32,
    pub max_cycles: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue entry, one-to-one with a non-terminal task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub task_id: TaskId,
    /// Lower dispatches earlier. Premium 50, free 100.
    pub priority: i32,
    pub queue_position: i32,
    pub estimated_start_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of a retrieved item, unique by source id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: PaperId,
    pub source_id: String,
    pub title: String,
    pub summary: String,
    pub categories: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub pdf_url: Option<String>,
    pub abs_url: Option<String>,
    pub primary_category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// LLM (or heuristic) relevance assessment of a paper for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: AnalysisId,
    pub paper_id: PaperId,
    pub task_id: TaskId,
    pub relevance: f64,
    pub summary: Option<String>,
    pub key_fragments: Option<String>,
    pub contextual_reasoning: Option<String>,
    pub status: AnalysisStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable link between a task and a paper that passed selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub task_id: TaskId,
    pub paper_id: PaperId,
    pub relevance: f64,
    pub summary: Option<String>,
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Outbound deliverable consumed by the external chat component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: OutboundId,
    pub kind: OutboundKind,
    pub user_external_id: String,
    pub payload_text: String,
    pub status: OutboundStatus,
    pub result_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Singleton global processing statistics used for queue ETA display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total_tasks_processed: u64,
    pub total_processing_time_seconds: u64,
    /// Three-sample midpoint of (min, last, max); an ETA approximation,
    /// not a statistically meaningful median.
    pub median_processing_time: f64,
    pub avg_processing_time: f64,
    pub min_processing_time: f64,
    pub max_processing_time: f64,
    pub current_queue_length: u32,
    pub active_workers: u32,
    pub recent_completed_tasks: u64,
    pub recent_failed_tasks: u64,
    pub recent_avg_time: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for TaskStatistics {
    fn default() -> Self {
        Self {
            total_tasks_processed: 0,
            total_processing_time_seconds: 0,
            median_processing_time: 300.0,
            avg_processing_time: 300.0,
            min_processing_time: 60.0,
            max_processing_time: 1800.0,
            current_queue_length: 0,
            active_workers: 1,
            recent_completed_tasks: 0,
            recent_failed_tasks: 0,
            recent_avg_time: 300.0,
            last_updated: Utc::now(),
        }
    }
}

/// Per-user analysis and notification preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_external_id: String,
    pub min_relevance: f64,
    pub instant_notification_threshold: f64,
    /// Optional group chat that receives notifications instead of the user.
    pub group_chat_id: Option<i64>,
    pub monitoring_enabled: bool,
}

impl UserSettings {
    pub fn defaults_for(external_id: &str) -> Self {
        Self {
            user_external_id: external_id.to_string(),
            min_relevance: 50.0,
            instant_notification_threshold: 80.0,
            group_chat_id: None,
            monitoring_enabled: true,
        }
    }
}

/// Persisted user-suggested query attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQueryRow {
    pub id: i64,
    pub task_id: TaskId,
    pub query_text: String,
    pub rationale: Option<String>,
    pub categories: Option<Vec<String>>,
    pub enabled: bool,
    pub success_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Single-row heartbeat per worker id. `session_id` is minted per process
/// start; a restart under the same worker id begins a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub session_id: Uuid,
    pub status: String,
    pub activity: String,
    pub papers_processed: u64,
    pub papers_found: u64,
    pub last_activity: DateTime<Utc>,
    pub session_start: DateTime<Utc>,
}

/// Outcome of an admission check. Denials carry a human-readable reason and
/// leave no state behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied(String),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited(String),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// What `complete_cycle` did with the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// More cycles remain; the task went back to `queued`.
    Requeued { cycles_completed: u32 },
    /// Cycle limit reached; the task is `completed` and a cycle-limit
    /// notification was enqueued.
    Completed { had_findings: bool },
    /// The cycle failed; the task is `failed` and dequeued.
    Failed,
    /// The task was not `processing` (duplicate call or user cancellation);
    /// nothing changed.
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn plan_quotas() {
        assert_eq!(UserPlan::Free.daily_task_limit(), 5);
        assert_eq!(UserPlan::Free.concurrent_task_limit(), 1);
        assert_eq!(UserPlan::Free.max_cycles(), 5);
        assert_eq!(UserPlan::Premium.daily_task_limit(), 100);
        assert_eq!(UserPlan::Premium.concurrent_task_limit(), 5);
        assert_eq!(UserPlan::Premium.max_cycles(), 100);
    }

    #[test]
    fn plan_priority_orders_premium_first() {
        assert!(UserPlan::Premium.queue_priority() < UserPlan::Free.queue_priority());
    }

    #[test]
    fn task_status_round_trip() {
        for s in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Paused,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn analysis_status_is_monotone() {
        assert!(AnalysisStatus::Analyzed.can_advance_to(AnalysisStatus::Queued));
        assert!(AnalysisStatus::Queued.can_advance_to(AnalysisStatus::Notified));
        // No back-edges or skips.
        assert!(!AnalysisStatus::Queued.can_advance_to(AnalysisStatus::Analyzed));
        assert!(!AnalysisStatus::Notified.can_advance_to(AnalysisStatus::Queued));
        assert!(!AnalysisStatus::Analyzed.can_advance_to(AnalysisStatus::Notified));
    }

    #[test]
    fn action_kind_limits() {
        let l = ActionKind::TaskCreate.limits();
        assert_eq!((l.per_minute, l.per_hour, l.per_day), (2, 10, 50));
        let l = ActionKind::Command.limits();
        assert_eq!((l.per_minute, l.per_hour, l.per_day), (10, 100, 500));
        let l = ActionKind::Message.limits();
        assert_eq!((l.per_minute, l.per_hour, l.per_day), (20, 200, 1000));
    }

    #[test]
    fn source_tag_round_trip() {
        for tag in SourceTag::ALL {
            assert_eq!(SourceTag::from_str(tag.as_str()).unwrap(), tag);
        }
    }
}
