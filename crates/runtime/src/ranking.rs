//! BM25 ranking of candidates against the task query.
//!
//! Scores title + abstract with standard BM25 (k1 = 1.5, b = 0.75,
//! idf = ln((N − n + 0.5)/(n + 0.5) + 1)). Tokenization is a lowercased
//! split on word characters, no stemming. Ordering is total: score
//! descending, then `updated` descending (missing timestamps rank last
//! among ties), then source id ascending as the stable key.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::sources::Candidate;

const K1: f64 = 1.5;
const B: f64 = 0.75;

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn bm25_scores(query_tokens: &[String], documents: &[Vec<String>]) -> Vec<f64> {
    let n_docs = documents.len();
    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for doc in documents {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for term in unique {
            *doc_freq.entry(term).or_insert(0) += 1;
        }
    }

    let avgdl =
        documents.iter().map(Vec::len).sum::<usize>() as f64 / n_docs.max(1) as f64;

    let mut idf: HashMap<&str, f64> = HashMap::new();
    for term in query_tokens.iter().map(String::as_str).collect::<HashSet<_>>() {
        let n = doc_freq.get(term).copied().unwrap_or(0) as f64;
        idf.insert(
            term,
            ((n_docs as f64 - n + 0.5) / (n + 0.5) + 1.0).ln(),
        );
    }

    documents
        .iter()
        .map(|doc| {
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for term in doc {
                *tf.entry(term.as_str()).or_insert(0) += 1;
            }
            let dl = doc.len() as f64;
            let mut score = 0.0;
            for term in query_tokens {
                let Some(&freq) = tf.get(term.as_str()) else {
                    continue;
                };
                let freq = freq as f64;
                let idf = idf.get(term.as_str()).copied().unwrap_or(0.0);
                let numerator = freq * (K1 + 1.0);
                let denominator = freq + K1 * (1.0 - B + B * (dl / avgdl.max(1e-6)));
                score += idf * (numerator / denominator.max(1e-6));
            }
            score
        })
        .collect()
}

/// Rank candidates against a query, writing `bm25_score` into each, and
/// return the top-k in deterministic order.
pub fn rank_candidates(query: &str, candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
    let mut candidates = candidates;
    let documents: Vec<Vec<String>> = candidates
        .iter()
        .map(|c| tokenize(&format!("{} \n {}", c.title, c.summary)))
        .collect();
    let query_tokens = tokenize(query);
    let scores = bm25_scores(&query_tokens, &documents);
    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.bm25_score = score;
    }

    candidates.sort_by(compare_ranked);
    if let Some(top) = candidates.first() {
        tracing::debug!(
            "Top-1 score={:.3} id={}",
            top.bm25_score,
            top.source_id
        );
    }
    candidates.truncate(top_k);
    candidates
}

fn compare_ranked(a: &Candidate, b: &Candidate) -> Ordering {
    b.bm25_score
        .total_cmp(&a.bm25_score)
        .then_with(|| match (b.updated, a.updated) {
            (Some(b_upd), Some(a_upd)) => b_upd.cmp(&a_upd),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.source_id.cmp(&b.source_id))
}
