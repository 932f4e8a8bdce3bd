//! LLM gateway: provider client, agent schemas, and the bounded-concurrency
//! retrying wrapper the pipeline stages call.

pub mod client;
pub mod gateway;
pub mod schemas;

pub use client::{LlmClient, LlmProvider};
pub use gateway::{AgentSpec, LlmGateway};
pub use schemas::{
    AnalysisAgentOutput, DecisionReport, PlannedQuery, QueryPlan, ANALYST_AGENT, REPORTER_AGENT,
    STRATEGY_AGENT,
};
