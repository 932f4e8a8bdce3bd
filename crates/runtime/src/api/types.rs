//! Request and response types for the HTTP facade.

use serde::{Deserialize, Serialize};

use crate::pipeline::{AnalysisResult, PipelineOutput, PipelineTask, ScoredAnalysis};

/// Body of `POST /v1/run`. Mirrors [`PipelineTask`] with the same defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub query: String,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    #[serde(default = "default_bm25_top_k")]
    pub bm25_top_k: usize,
    #[serde(default = "default_max_analyze")]
    pub max_analyze: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    #[serde(default)]
    pub queries: Option<Vec<String>>,
}

fn default_max_queries() -> usize {
    5
}

fn default_bm25_top_k() -> usize {
    20
}

fn default_max_analyze() -> usize {
    10
}

fn default_min_relevance() -> f64 {
    50.0
}

impl RunRequest {
    pub fn into_task(self) -> PipelineTask {
        PipelineTask {
            query: self.query,
            categories: self.categories,
            max_queries: self.max_queries,
            bm25_top_k: self.bm25_top_k,
            max_analyze: self.max_analyze,
            min_relevance: self.min_relevance,
            queries: self.queries,
        }
    }
}

/// Compact projection of an analyzed paper.
#[derive(Debug, Clone, Serialize)]
pub struct PaperSummary {
    pub source_id: String,
    pub title: String,
    pub relevance: f64,
    pub summary: String,
    pub link: Option<String>,
}

impl From<&AnalysisResult> for PaperSummary {
    fn from(item: &AnalysisResult) -> Self {
        Self {
            source_id: item.candidate.source_id.clone(),
            title: item.candidate.title.clone(),
            relevance: item.relevance,
            summary: item.summary.clone(),
            link: item.candidate.link().map(str::to_string),
        }
    }
}

impl From<&ScoredAnalysis> for PaperSummary {
    fn from(item: &ScoredAnalysis) -> Self {
        Self::from(&item.result)
    }
}

/// Response of `POST /v1/run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub task: PipelineTask,
    pub generated_queries: Vec<String>,
    pub analyzed: Vec<PaperSummary>,
    pub selected: Vec<PaperSummary>,
    pub should_notify: bool,
    pub report_text: Option<String>,
}

impl From<PipelineOutput> for RunResponse {
    fn from(output: PipelineOutput) -> Self {
        Self {
            analyzed: output.analyzed.iter().map(PaperSummary::from).collect(),
            selected: output.selected.iter().map(PaperSummary::from).collect(),
            task: output.task,
            generated_queries: output.generated_queries,
            should_notify: output.should_notify,
            report_text: output.report_text,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}
