//! Scout Research Runtime
//!
//! The task-processing engine behind the Scout research assistant: a
//! persistent task queue with per-user admission and rate limiting, a cyclic
//! research pipeline (strategy → retrieval → ranking → analysis → decision),
//! and the worker loop that drains the queue and hands findings to the
//! outbound delivery queue.

pub mod api;
pub mod config;
pub mod llm;
pub mod pipeline;
pub mod ranking;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod types;

// Re-export the types most callers need.
pub use config::RuntimeConfig;
pub use llm::{LlmClient, LlmGateway};
pub use pipeline::{Pipeline, PipelineOutput, PipelineTask};
pub use scheduler::{TaskWorker, WorkerConfig};
pub use sources::{Candidate, SearchSource, SourceRegistry};
pub use store::SqliteStore;
pub use types::*;
