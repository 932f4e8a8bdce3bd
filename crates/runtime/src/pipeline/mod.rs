//! The five-stage research pipeline.
//!
//! One invocation = one cycle against one task:
//!
//! 1. Strategy: turn the task into `(query, source)` pairs
//! 2. Retrieval: multi-source merge, deduplicated by source id
//! 3. Ranking: BM25 against the task description
//! 4. Analysis: per-candidate LLM (or heuristic) relevance
//! 5. Decision: score, select top-k, produce the report
//!
//! Recoverable stage errors degrade output (fewer candidates, heuristic
//! analysis) without failing the cycle.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::llm::LlmGateway;
use crate::ranking::rank_candidates;
use crate::sources::{Candidate, SourceRegistry};
use crate::types::{PipelineError, SourceTag};

pub mod analyze;
pub mod decision;
pub mod retrieval;
pub mod strategy;

pub use analyze::AnalysisCache;

/// Cooperative cancellation probe, consulted between pipeline stages.
///
/// A user cancel lands before the next stage spends HTTP or LLM budget
/// instead of waiting for the whole cycle to finish.
#[async_trait]
pub trait CancelProbe: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Probe that never cancels, for callers outside the task queue (the REST
/// facade and the one-shot CLI).
pub struct NeverCancelled;

#[async_trait]
impl CancelProbe for NeverCancelled {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// A validated research task handed to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTask {
    /// Free-text task description.
    pub query: String,
    /// Optional category constraints, e.g. `["cs.AI"]`.
    pub categories: Option<Vec<String>>,
    /// Upper bound on generated search queries.
    pub max_queries: usize,
    /// Candidates kept after BM25 ranking.
    pub bm25_top_k: usize,
    /// Candidates sent to analysis.
    pub max_analyze: usize,
    /// Minimum score for inclusion in the final selection.
    pub min_relevance: f64,
    /// Optional user-suggested queries; the strategy stage still decides
    /// sources for each.
    pub queries: Option<Vec<String>>,
}

impl PipelineTask {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            categories: None,
            max_queries: 5,
            bm25_top_k: 20,
            max_analyze: 10,
            min_relevance: 50.0,
            queries: None,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.query.trim().is_empty() {
            return Err(PipelineError::InvalidTask(
                "query must not be empty".to_string(),
            ));
        }
        if !(1..=20).contains(&self.max_queries) {
            return Err(PipelineError::InvalidTask(format!(
                "max_queries must be in [1, 20], got {}",
                self.max_queries
            )));
        }
        if !(5..=100).contains(&self.bm25_top_k) {
            return Err(PipelineError::InvalidTask(format!(
                "bm25_top_k must be in [5, 100], got {}",
                self.bm25_top_k
            )));
        }
        if self.max_analyze > 50 {
            return Err(PipelineError::InvalidTask(format!(
                "max_analyze must be at most 50, got {}",
                self.max_analyze
            )));
        }
        if !(0.0..=100.0).contains(&self.min_relevance) {
            return Err(PipelineError::InvalidTask(format!(
                "min_relevance must be in [0, 100], got {}",
                self.min_relevance
            )));
        }
        Ok(())
    }
}

/// A query produced by the strategy stage, bound to a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub query_text: String,
    pub source: SourceTag,
    pub rationale: Option<String>,
    pub categories: Option<Vec<String>>,
}

/// Outcome of analyzing one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub candidate: Candidate,
    pub relevance: f64,
    pub summary: String,
    pub key_fragments: Option<String>,
    pub contextual_reasoning: Option<String>,
}

/// Analysis result with the overall score used for selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAnalysis {
    pub result: AnalysisResult,
    pub overall_score: f64,
    pub reasoning: Option<String>,
}

/// Structured output of one pipeline cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub task: PipelineTask,
    pub analyzed: Vec<AnalysisResult>,
    pub generated_queries: Vec<String>,
    pub selected: Vec<ScoredAnalysis>,
    pub should_notify: bool,
    pub report_text: Option<String>,
}

/// The pipeline with its collaborators. Cycle-local candidate lists are
/// owned by each `run` invocation and dropped at its end; only the
/// analysis cache persists across cycles (process-local, bounded).
pub struct Pipeline {
    registry: Arc<SourceRegistry>,
    gateway: Arc<LlmGateway>,
    cache: AnalysisCache,
    use_agent_strategy: bool,
    use_agent_analyze: bool,
    per_query_limit: usize,
}

impl Pipeline {
    pub fn new(
        registry: Arc<SourceRegistry>,
        gateway: Arc<LlmGateway>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            cache: AnalysisCache::default(),
            use_agent_strategy: config.use_agent_strategy,
            use_agent_analyze: config.use_agent_analyze,
            per_query_limit: config.per_query_limit,
        }
    }

    /// Execute one cycle and return structured output.
    pub async fn run(&self, task: &PipelineTask) -> Result<PipelineOutput, PipelineError> {
        self.run_with_cancel(task, &NeverCancelled).await
    }

    /// Execute one cycle, consulting `cancel` at every stage boundary.
    /// Returns [`PipelineError::Cancelled`] as soon as the probe reports a
    /// cancel; work done by earlier stages is discarded.
    pub async fn run_with_cancel(
        &self,
        task: &PipelineTask,
        cancel: &dyn CancelProbe,
    ) -> Result<PipelineOutput, PipelineError> {
        task.validate()?;

        tracing::info!("Stage: strategy -> queries & sources");
        let generated_queries = strategy::generate_query_plan(
            &self.gateway,
            task,
            self.use_agent_strategy && self.gateway.is_enabled(),
        )
        .await;
        tracing::info!("Generated {} queries for task", generated_queries.len());

        if cancel.is_cancelled().await {
            return Err(PipelineError::Cancelled);
        }

        tracing::info!("Stage: retrieval -> multi-source");
        let mut candidates = retrieval::collect_candidates(
            &self.registry,
            task,
            &generated_queries,
            self.per_query_limit,
        )
        .await;
        tracing::info!("Collected {} unique candidates", candidates.len());

        if candidates.is_empty() {
            let broadened = retrieval::broaden_plan(&generated_queries);
            if !broadened.is_empty() {
                tracing::warn!(
                    "No candidates found; retrying with broadened queries (n={})",
                    broadened.len()
                );
                candidates = retrieval::collect_candidates(
                    &self.registry,
                    task,
                    &broadened,
                    self.per_query_limit,
                )
                .await;
                tracing::info!(
                    "Collected {} unique candidates after broadening",
                    candidates.len()
                );
            }
        }

        if cancel.is_cancelled().await {
            return Err(PipelineError::Cancelled);
        }

        tracing::info!("Stage: ranking -> BM25");
        let ranked = rank_candidates(&task.query, candidates, task.bm25_top_k);
        tracing::info!("Ranked and kept top {} candidates", ranked.len());

        if cancel.is_cancelled().await {
            return Err(PipelineError::Cancelled);
        }

        let analysis_inputs: Vec<Candidate> =
            ranked.into_iter().take(task.max_analyze).collect();

        tracing::info!("Stage: analysis -> LLM/heuristic");
        let analyzed = analyze::analyze_candidates(
            &self.gateway,
            &self.cache,
            &task.query,
            analysis_inputs,
            self.use_agent_analyze && self.gateway.is_enabled(),
        )
        .await;
        tracing::info!("Analyzed {} candidates", analyzed.len());

        if cancel.is_cancelled().await {
            return Err(PipelineError::Cancelled);
        }

        let selected = decision::select_top(task, &analyzed);
        let decision = decision::make_decision_and_report(&self.gateway, task, &selected).await;

        Ok(PipelineOutput {
            task: task.clone(),
            generated_queries: generated_queries
                .iter()
                .map(|q| q.query_text.clone())
                .collect(),
            analyzed,
            selected,
            should_notify: decision.should_notify,
            report_text: decision.report_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::StaticSource;
    use std::sync::Arc;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            use_agent_strategy: false,
            use_agent_analyze: false,
            ..RuntimeConfig::default()
        }
    }

    fn pipeline_with(registry: SourceRegistry) -> Pipeline {
        Pipeline::new(
            Arc::new(registry),
            Arc::new(LlmGateway::disabled()),
            &test_config(),
        )
    }

    #[test]
    fn task_validation_bounds() {
        assert!(PipelineTask::new("query").validate().is_ok());
        assert!(PipelineTask::new("  ").validate().is_err());

        let mut task = PipelineTask::new("q");
        task.max_queries = 21;
        assert!(task.validate().is_err());

        let mut task = PipelineTask::new("q");
        task.bm25_top_k = 4;
        assert!(task.validate().is_err());

        let mut task = PipelineTask::new("q");
        task.min_relevance = 101.0;
        assert!(task.validate().is_err());

        // Zero analyses is a legal boundary: no LLM calls, empty output.
        let mut task = PipelineTask::new("q");
        task.max_analyze = 0;
        assert!(task.validate().is_ok());
    }

    #[tokio::test]
    async fn cycle_dedupes_across_sources() {
        // Strategy heuristics route "survey" to scholar and the rest to
        // arxiv; both return a candidate with the same source id.
        let shared = Candidate::minimal("S1", "AI for medical imaging survey", "imaging");
        let arxiv = StaticSource::new(SourceTag::Arxiv)
            .with_results("AI for medical imaging", vec![shared.clone()])
            .with_results("AI for medical imaging NOT theory-only", vec![])
            .with_results(
                "AI for medical imaging AND (benchmark OR dataset OR code)",
                vec![],
            );
        let scholar = StaticSource::new(SourceTag::Scholar).with_results(
            "AI for medical imaging AND (survey OR review)",
            vec![shared.clone()],
        );

        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(arxiv));
        registry.register(Arc::new(scholar));
        let pipeline = pipeline_with(registry);

        let mut task = PipelineTask::new("AI for medical imaging");
        task.min_relevance = 0.0;
        let output = pipeline.run(&task).await.unwrap();

        assert_eq!(output.generated_queries.len(), 4);
        // The merged candidate list contains S1 exactly once.
        assert_eq!(output.analyzed.len(), 1);
        assert_eq!(output.analyzed[0].candidate.source_id, "S1");
    }

    #[tokio::test]
    async fn empty_retrieval_triggers_one_broadening_retry() {
        // Nothing matches the original queries, but the raw token stream
        // variant of the first query does.
        let arxiv = StaticSource::new(SourceTag::Arxiv).with_results(
            "rag evaluation",
            vec![Candidate::minimal("X1", "rag evaluation toolkit", "rag")],
        );
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(arxiv));
        let pipeline = pipeline_with(registry);

        let mut task = PipelineTask::new("rag AND evaluation");
        task.min_relevance = 0.0;
        let output = pipeline.run(&task).await.unwrap();
        assert_eq!(output.analyzed.len(), 1);
        assert_eq!(output.analyzed[0].candidate.source_id, "X1");
    }

    #[tokio::test]
    async fn max_analyze_zero_produces_empty_analysis() {
        let arxiv = StaticSource::new(SourceTag::Arxiv).with_results(
            "topic",
            vec![Candidate::minimal("A", "topic paper", "topic")],
        );
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(arxiv));
        let pipeline = pipeline_with(registry);

        let mut task = PipelineTask::new("topic");
        task.max_analyze = 0;
        let output = pipeline.run(&task).await.unwrap();
        assert!(output.analyzed.is_empty());
        assert!(output.selected.is_empty());
        assert!(!output.should_notify);
        assert!(output.report_text.is_none());
    }

    #[tokio::test]
    async fn min_relevance_zero_selects_all_up_to_cap() {
        let candidates: Vec<Candidate> = (0..5)
            .map(|i| {
                Candidate::minimal(
                    &format!("id-{i}"),
                    "quantum computing hardware",
                    "quantum computing hardware details",
                )
            })
            .collect();
        let arxiv =
            StaticSource::new(SourceTag::Arxiv).with_results("quantum computing hardware", candidates);
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(arxiv));
        let pipeline = pipeline_with(registry);

        let mut task = PipelineTask::new("quantum computing hardware");
        task.min_relevance = 0.0;
        let output = pipeline.run(&task).await.unwrap();
        assert_eq!(output.analyzed.len(), 5);
        // Selection keeps at most the top 3.
        assert_eq!(output.selected.len(), 3);
        assert!(output.should_notify);
        assert!(output.report_text.is_some());
    }

    #[tokio::test]
    async fn cancel_after_strategy_skips_retrieval() {
        struct AlwaysCancelled;

        #[async_trait]
        impl CancelProbe for AlwaysCancelled {
            async fn is_cancelled(&self) -> bool {
                true
            }
        }

        let source = Arc::new(StaticSource::new(SourceTag::Arxiv).with_results(
            "topic",
            vec![Candidate::minimal("A", "topic paper", "topic")],
        ));
        let mut registry = SourceRegistry::new();
        registry.register(source.clone() as Arc<dyn crate::sources::SearchSource>);
        let pipeline = pipeline_with(registry);

        let task = PipelineTask::new("topic");
        let result = pipeline.run_with_cancel(&task, &AlwaysCancelled).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        // Cancelled at the strategy→retrieval boundary: no source spend.
        assert!(source.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_after_retrieval_skips_analysis() {
        use std::sync::atomic::{AtomicU32, Ordering};

        /// Reports cancelled from the nth probe onwards.
        struct CancelFrom {
            nth: u32,
            probes: AtomicU32,
        }

        #[async_trait]
        impl CancelProbe for CancelFrom {
            async fn is_cancelled(&self) -> bool {
                self.probes.fetch_add(1, Ordering::SeqCst) + 1 >= self.nth
            }
        }

        let source = Arc::new(StaticSource::new(SourceTag::Arxiv).with_results(
            "topic",
            vec![Candidate::minimal("A", "topic paper", "topic")],
        ));
        let mut registry = SourceRegistry::new();
        registry.register(source.clone() as Arc<dyn crate::sources::SearchSource>);
        let pipeline = pipeline_with(registry);

        let task = PipelineTask::new("topic");
        let probe = CancelFrom {
            nth: 2,
            probes: AtomicU32::new(0),
        };
        let result = pipeline.run_with_cancel(&task, &probe).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        // Retrieval ran before the cancel landed at the next boundary.
        assert!(!source.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn min_relevance_hundred_selects_none() {
        let arxiv = StaticSource::new(SourceTag::Arxiv).with_results(
            "quantum computing",
            vec![Candidate::minimal("A", "quantum computing", "quantum computing")],
        );
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(arxiv));
        let pipeline = pipeline_with(registry);

        let mut task = PipelineTask::new("quantum computing");
        task.min_relevance = 100.0;
        let output = pipeline.run(&task).await.unwrap();
        assert!(output.selected.is_empty());
        assert!(!output.should_notify);
        assert!(output.report_text.is_none());
    }
}
