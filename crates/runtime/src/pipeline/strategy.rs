//! Strategy stage: turn a free-text task into `(query, source)` pairs.
//!
//! Backed by the strategy agent when enabled; a deterministic heuristic
//! produces four query variants otherwise (or on agent failure), inferring
//! the source per query from keyword cues.

use crate::llm::{LlmGateway, QueryPlan, STRATEGY_AGENT};
use crate::types::SourceTag;

use super::{GeneratedQuery, PipelineTask};

/// Produce an ordered query plan for the task, at most `task.max_queries`
/// entries. Never fails: any agent error falls back to the heuristic.
pub async fn generate_query_plan(
    gateway: &LlmGateway,
    task: &PipelineTask,
    use_agent: bool,
) -> Vec<GeneratedQuery> {
    if !use_agent {
        tracing::info!("Strategy agent disabled; using heuristic queries");
        return heuristic_queries(task);
    }

    let payload = serde_json::json!({
        "task": task.query,
        "categories": task.categories.clone().unwrap_or_default(),
        "max_queries": task.max_queries,
        "suggested_queries": task.queries.clone().unwrap_or_default(),
        "allowed_sources": SourceTag::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
    });

    tracing::debug!(
        "Generating query plan (max={}, categories={:?})",
        task.max_queries,
        task.categories
    );
    match gateway
        .run::<QueryPlan>(&STRATEGY_AGENT, &payload.to_string())
        .await
    {
        Ok(plan) if !plan.queries.is_empty() => {
            let queries: Vec<GeneratedQuery> = plan
                .queries
                .into_iter()
                .take(task.max_queries)
                .map(|q| {
                    let source = q.source.unwrap_or_else(|| infer_source(&q.query_text));
                    GeneratedQuery {
                        query_text: q.query_text,
                        source,
                        rationale: q.rationale,
                        categories: q.categories,
                    }
                })
                .collect();
            tracing::info!("Strategy agent produced {} queries", queries.len());
            queries
        }
        Ok(_) => {
            tracing::warn!("Strategy agent returned an empty plan, using heuristic fallback");
            heuristic_queries(task)
        }
        Err(error) => {
            tracing::warn!("Strategy agent failed, using heuristic fallback: {}", error);
            heuristic_queries(task)
        }
    }
}

/// Four deterministic variants: direct, surveys, practical artifacts, and
/// theory-excluding; sources inferred per variant.
pub fn heuristic_queries(task: &PipelineTask) -> Vec<GeneratedQuery> {
    let base = task.query.trim();
    let variants = [
        (base.to_string(), base.to_string(), "Direct match to task"),
        (
            format!("{base} AND (survey OR review)"),
            format!("{base} survey"),
            "Surveys and reviews",
        ),
        (
            format!("{base} AND (benchmark OR dataset OR code)"),
            format!("{base} code"),
            "Practical artifacts",
        ),
        (
            format!("{base} NOT theory-only"),
            base.to_string(),
            "Exclude purely theoretical work",
        ),
    ];

    let queries: Vec<GeneratedQuery> = variants
        .into_iter()
        .take(task.max_queries)
        .map(|(query_text, source_hint, rationale)| GeneratedQuery {
            query_text,
            source: infer_source(&source_hint),
            rationale: Some(rationale.to_string()),
            categories: task.categories.clone(),
        })
        .collect();
    tracing::info!("Heuristic produced {} queries", queries.len());
    queries
}

/// Keyword routing: clinical/biomedical terms go to PubMed, code terms to
/// GitHub, survey terms to Scholar, everything else to arXiv.
pub fn infer_source(text: &str) -> SourceTag {
    let text = text.to_lowercase();
    const PUBMED: [&str; 6] = ["clinical", "biomedical", "gene", "protein", "cancer", "pubmed"];
    const GITHUB: [&str; 6] = ["github", "code", "implementation", "repo", "repository", "stars:"];
    const SCHOLAR: [&str; 4] = ["survey", "review", "meta-analysis", "literature"];

    if PUBMED.iter().any(|k| text.contains(k)) {
        SourceTag::Pubmed
    } else if GITHUB.iter().any(|k| text.contains(k)) {
        SourceTag::Github
    } else if SCHOLAR.iter().any(|k| text.contains(k)) {
        SourceTag::Scholar
    } else {
        SourceTag::Arxiv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_inference() {
        assert_eq!(infer_source("clinical trial outcomes"), SourceTag::Pubmed);
        assert_eq!(infer_source("protein folding models"), SourceTag::Pubmed);
        assert_eq!(infer_source("transformer implementation"), SourceTag::Github);
        assert_eq!(infer_source("stars:>100 rust parser"), SourceTag::Github);
        assert_eq!(infer_source("deep learning survey"), SourceTag::Scholar);
        assert_eq!(infer_source("sparse attention kernels"), SourceTag::Arxiv);
    }

    #[test]
    fn heuristic_produces_four_variants() {
        let task = PipelineTask::new("AI for medical imaging");
        let queries = heuristic_queries(&task);
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0].query_text, "AI for medical imaging");
        assert_eq!(
            queries[1].query_text,
            "AI for medical imaging AND (survey OR review)"
        );
        assert_eq!(queries[1].source, SourceTag::Scholar);
        assert_eq!(
            queries[2].query_text,
            "AI for medical imaging AND (benchmark OR dataset OR code)"
        );
        assert_eq!(queries[2].source, SourceTag::Github);
        assert_eq!(queries[3].query_text, "AI for medical imaging NOT theory-only");
    }

    #[test]
    fn heuristic_respects_max_queries() {
        let mut task = PipelineTask::new("graph transformers");
        task.max_queries = 2;
        let queries = heuristic_queries(&task);
        assert_eq!(queries.len(), 2);
    }

    #[tokio::test]
    async fn disabled_agent_falls_back() {
        let gateway = LlmGateway::disabled();
        let task = PipelineTask::new("reinforcement learning");
        let queries = generate_query_plan(&gateway, &task, false).await;
        assert_eq!(queries.len(), 4);
    }
}
