//! Analysis stage: per-candidate LLM relevance with a heuristic fallback.
//!
//! LLM calls fan out concurrently; the gateway's semaphore bounds the
//! actual parallelism. Results are cached per (task description, source id)
//! in a bounded process-local cache with FIFO eviction.

use std::collections::{HashMap, HashSet, VecDeque};

use futures::future;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::llm::{AnalysisAgentOutput, LlmGateway, ANALYST_AGENT};
use crate::sources::Candidate;

use super::AnalysisResult;

const CACHE_CAPACITY: usize = 1000;
const SUMMARY_MAX_CHARS: usize = 800;

/// Bounded analysis cache. Not shared across workers: the key includes the
/// task description and computation cost dominates storage cost.
pub struct AnalysisCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    map: HashMap<String, AnalysisResult>,
    order: VecDeque<String>,
}

impl AnalysisCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(task_query: &str, source_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(task_query.as_bytes());
        hasher.update(b"|");
        hasher.update(source_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn get(&self, task_query: &str, source_id: &str) -> Option<AnalysisResult> {
        let key = Self::key(task_query, source_id);
        self.inner.lock().map.get(&key).cloned()
    }

    fn put(&self, task_query: &str, source_id: &str, result: AnalysisResult) {
        let key = Self::key(task_query, source_id);
        let mut inner = self.inner.lock();
        if inner.map.len() >= self.capacity && !inner.map.contains_key(&key) {
            // Evict the oldest 10% to amortize the cost.
            let to_remove = (self.capacity / 10).max(1);
            for _ in 0..to_remove {
                if let Some(old) = inner.order.pop_front() {
                    inner.map.remove(&old);
                }
            }
        }
        if inner.map.insert(key.clone(), result).is_none() {
            inner.order.push_back(key);
        }
    }
}

impl Default for AnalysisCache {
    fn default() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }
}

/// Analyze candidates, preserving input order. With the agent path enabled
/// every miss costs one gateway call; otherwise the overlap heuristic is
/// used. Agent failures degrade to the heuristic per candidate.
pub async fn analyze_candidates(
    gateway: &LlmGateway,
    cache: &AnalysisCache,
    task_query: &str,
    candidates: Vec<Candidate>,
    use_agent: bool,
) -> Vec<AnalysisResult> {
    tracing::debug!(
        "Analyzing {} candidates (agent={})",
        candidates.len(),
        if use_agent { "on" } else { "off" }
    );

    let analyses = candidates
        .into_iter()
        .map(|candidate| analyze_single(gateway, cache, task_query, candidate, use_agent));
    future::join_all(analyses).await
}

async fn analyze_single(
    gateway: &LlmGateway,
    cache: &AnalysisCache,
    task_query: &str,
    candidate: Candidate,
    use_agent: bool,
) -> AnalysisResult {
    if let Some(cached) = cache.get(task_query, &candidate.source_id) {
        tracing::debug!("Using cached analysis for {}", candidate.source_id);
        return cached;
    }

    let result = if use_agent {
        match gateway
            .run::<AnalysisAgentOutput>(&ANALYST_AGENT, &build_prompt(task_query, &candidate))
            .await
        {
            Ok(output) => AnalysisResult {
                relevance: output.relevance.clamp(0.0, 100.0),
                summary: output.summary.trim().to_string(),
                key_fragments: output.key_fragments,
                contextual_reasoning: output.contextual_reasoning,
                candidate,
            },
            Err(error) => {
                tracing::warn!(
                    "Analyzer agent failed for {}: {}",
                    candidate.source_id,
                    error
                );
                heuristic_result(task_query, candidate)
            }
        }
    } else {
        heuristic_result(task_query, candidate)
    };

    cache.put(task_query, &result.candidate.source_id, result.clone());
    tracing::debug!(
        "Analyzed {} relevance={:.1}",
        result.candidate.source_id,
        result.relevance
    );
    result
}

fn build_prompt(task_query: &str, candidate: &Candidate) -> String {
    format!(
        "Task: {}\n\nTitle: {}\nAbstract: {}",
        task_query, candidate.title, candidate.summary
    )
}

fn heuristic_result(task_query: &str, candidate: Candidate) -> AnalysisResult {
    AnalysisResult {
        relevance: heuristic_relevance(task_query, &candidate),
        summary: truncate_summary(&candidate.summary),
        key_fragments: None,
        contextual_reasoning: None,
        candidate,
    }
}

/// Quick overlap-based relevance in [0, 100]:
/// `0.7 · token-overlap · 100 + 0.3 · clamp(bm25, 0, 100)`.
pub fn heuristic_relevance(task_query: &str, candidate: &Candidate) -> f64 {
    let query_tokens = token_set(task_query);
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens = token_set(&format!("{} {}", candidate.title, candidate.summary));
    let overlap =
        query_tokens.intersection(&doc_tokens).count() as f64 / query_tokens.len() as f64;
    let score = 0.7 * (100.0 * overlap) + 0.3 * candidate.bm25_score.clamp(0.0, 100.0);
    score.clamp(0.0, 100.0)
}

fn token_set(text: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

fn truncate_summary(text: &str) -> String {
    let trimmed = text.trim();
    trimmed.chars().take(SUMMARY_MAX_CHARS).collect()
}
