//! Retrieval stage: fan out per (query, source), merge, dedupe.

use std::collections::HashSet;

use crate::sources::{ArxivSource, Candidate, SourceRegistry};
use crate::types::SourceTag;

use super::{GeneratedQuery, PipelineTask};

/// Run every `(query, source)` pair against its adapter and merge the pages
/// into one list, deduplicated by source id (first occurrence wins). A
/// failing source contributes zero candidates and is logged; the cycle
/// continues.
pub async fn collect_candidates(
    registry: &SourceRegistry,
    task: &PipelineTask,
    queries: &[GeneratedQuery],
    per_query_limit: usize,
) -> Vec<Candidate> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut collected: Vec<Candidate> = Vec::new();

    for generated in queries {
        let Some(source) = registry.get(generated.source) else {
            tracing::warn!(
                "No adapter registered for source '{}', skipping query",
                generated.source
            );
            continue;
        };

        let query_text = compose_query(task, generated);
        tracing::debug!(
            "Collecting candidates for query '{}' via {}",
            query_text,
            generated.source
        );
        let page = match source.search(&query_text, per_query_limit, 0).await {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!(
                    "Source {} failed for query '{}': {}",
                    generated.source,
                    query_text,
                    error
                );
                Vec::new()
            }
        };

        for candidate in page {
            if seen.insert(candidate.source_id.clone()) {
                collected.push(candidate);
            }
        }
    }

    tracing::info!("Total unique candidates collected: {}", collected.len());
    collected
}

/// Broader variants of every query in a plan, used for the single retry
/// after an empty retrieval.
pub fn broaden_plan(queries: &[GeneratedQuery]) -> Vec<GeneratedQuery> {
    let mut broadened = Vec::new();
    for generated in queries {
        for variant in broaden_query(&generated.query_text) {
            if variant.is_empty() {
                continue;
            }
            broadened.push(GeneratedQuery {
                query_text: variant,
                source: generated.source,
                rationale: None,
                categories: generated.categories.clone(),
            });
        }
    }
    broadened
}

/// Broader variants of one query: drop the last AND-clause, keep only the
/// first two clauses, and fall back to the raw token stream.
pub fn broaden_query(query: &str) -> Vec<String> {
    let parts: Vec<&str> = query
        .split(" AND ")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let mut variants = Vec::new();
    if parts.len() > 1 {
        variants.push(parts[..parts.len() - 1].join(" AND "));
    }
    if parts.len() > 2 {
        variants.push(parts[..2].join(" AND "));
    }
    variants.push(parts.join(" "));
    variants
}

/// Per-source query composition. arXiv gets the OR-joined category filter
/// (query-level categories win over task-level ones); other sources take
/// the query text as-is.
fn compose_query(task: &PipelineTask, generated: &GeneratedQuery) -> String {
    if generated.source == SourceTag::Arxiv {
        let categories = generated
            .categories
            .as_deref()
            .or(task.categories.as_deref())
            .unwrap_or(&[]);
        return ArxivSource::with_categories(&generated.query_text, categories);
    }
    generated.query_text.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::StaticSource;
    use crate::sources::SearchSource;
    use std::sync::Arc;

    fn query(text: &str, source: SourceTag) -> GeneratedQuery {
        GeneratedQuery {
            query_text: text.to_string(),
            source,
            rationale: None,
            categories: None,
        }
    }

    #[tokio::test]
    async fn merge_dedupes_by_source_id_first_wins() {
        let a = StaticSource::new(SourceTag::Arxiv).with_results(
            "q1",
            vec![
                Candidate::minimal("S1", "from arxiv", "a"),
                Candidate::minimal("S2", "only arxiv", "a"),
            ],
        );
        let b = StaticSource::new(SourceTag::Scholar).with_results(
            "q2",
            vec![
                Candidate::minimal("S1", "from scholar", "b"),
                Candidate::minimal("S3", "only scholar", "b"),
            ],
        );
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(a));
        registry.register(Arc::new(b));

        let task = PipelineTask::new("task");
        let merged = collect_candidates(
            &registry,
            &task,
            &[query("q1", SourceTag::Arxiv), query("q2", SourceTag::Scholar)],
            50,
        )
        .await;

        let ids: Vec<&str> = merged.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2", "S3"]);
        // First occurrence wins.
        assert_eq!(merged[0].title, "from arxiv");
    }

    #[tokio::test]
    async fn unions_ids_across_overlapping_pages() {
        let pages: Vec<Vec<&str>> = vec![
            vec!["a", "b", "c"],
            vec!["b", "c", "d"],
            vec!["d", "e"],
        ];
        let mut source = StaticSource::new(SourceTag::Arxiv);
        let mut queries = Vec::new();
        for (i, ids) in pages.iter().enumerate() {
            let q = format!("q{i}");
            source = source.with_results(
                &q,
                ids.iter()
                    .map(|id| Candidate::minimal(id, id, ""))
                    .collect(),
            );
            queries.push(query(&q, SourceTag::Arxiv));
        }
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(source));

        let task = PipelineTask::new("task");
        let merged = collect_candidates(&registry, &task, &queries, 50).await;
        let mut ids: Vec<&str> = merged.iter().map(|c| c.source_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn missing_adapter_contributes_nothing() {
        let registry = SourceRegistry::new();
        let task = PipelineTask::new("task");
        let merged =
            collect_candidates(&registry, &task, &[query("q", SourceTag::Github)], 50).await;
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn arxiv_queries_carry_category_filter() {
        let source = StaticSource::new(SourceTag::Arxiv)
            .with_results("(gnn) AND (cat:cs.LG)", vec![Candidate::minimal("1", "t", "s")]);
        let calls = Arc::new(source);
        let mut registry = SourceRegistry::new();
        registry.register(calls.clone() as Arc<dyn SearchSource>);

        let mut task = PipelineTask::new("task");
        task.categories = Some(vec!["cs.LG".to_string()]);
        let merged =
            collect_candidates(&registry, &task, &[query("gnn", SourceTag::Arxiv)], 50).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(calls.calls.lock()[0], "(gnn) AND (cat:cs.LG)");
    }

    #[test]
    fn broadening_variants() {
        assert_eq!(
            broaden_query("a AND b AND c"),
            vec!["a AND b", "a AND b", "a b c"]
        );
        assert_eq!(broaden_query("a AND b"), vec!["a", "a b"]);
        assert_eq!(broaden_query("plain tokens"), vec!["plain tokens"]);
    }

    #[test]
    fn broaden_plan_keeps_sources() {
        let plan = vec![query("x AND y", SourceTag::Pubmed)];
        let broadened = broaden_plan(&plan);
        assert_eq!(broadened.len(), 2);
        assert!(broadened.iter().all(|q| q.source == SourceTag::Pubmed));
    }
}
