//! Error types for the Scout research engine.

use thiserror::Error;

/// Main runtime error type.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Persistence errors. Any transactional failure leaves the store unchanged.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, i64),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

/// External search source errors. A failing source contributes zero
/// candidates for the cycle; it never fails the cycle.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error from {source_tag}: {message}")]
    Http {
        source_tag: &'static str,
        message: String,
    },

    #[error("malformed response from {source_tag}: {message}")]
    Malformed {
        source_tag: &'static str,
        message: String,
    },
}

/// LLM gateway errors. `is_retryable` drives the backoff loop; everything
/// else surfaces to the caller, which falls back to its heuristic path.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to parse model output: {0}")]
    Parse(String),

    #[error("output did not match the {schema} schema: {message}")]
    SchemaValidation {
        schema: &'static str,
        message: String,
    },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("no API key configured; LLM invocation disabled")]
    Disabled,

    #[error("all {attempts} attempts exhausted: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl LlmError {
    /// Rate limits, timeouts, transient transport failures, and JSON-parse
    /// failures of the response are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Timeout
                | LlmError::Transport(_)
                | LlmError::Parse(_)
                | LlmError::SchemaValidation { .. }
        )
    }
}

/// Pipeline orchestration errors. Only these (and store errors) fail a
/// cycle; recoverable stage errors degrade output instead. `Cancelled` is
/// not a failure: the caller discards the cycle without consuming a cycle
/// credit.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("{stage} stage failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },

    #[error("task was cancelled")]
    Cancelled,
}

/// Worker-loop errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("worker is shutting down")]
    ShuttingDown,
}
