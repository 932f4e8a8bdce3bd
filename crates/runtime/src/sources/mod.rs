//! Search source adapters.
//!
//! Each external source implements [`SearchSource`] and registers under one
//! of the closed [`SourceTag`] variants; the pipeline selects adapters by
//! tag at query time. Adapters normalize provider responses into
//! [`Candidate`] records and hide pagination quirks behind a uniform
//! `(query, max_results, start)` interface.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::types::{SourceError, SourceTag};

pub mod arxiv;
pub mod github;
pub mod pubmed;
pub mod scholar;

pub use arxiv::ArxivSource;
pub use github::GithubSource;
pub use pubmed::PubmedSource;
pub use scholar::ScholarSource;

/// A source-agnostic retrieved item, owned by the current cycle.
///
/// `source_id` is the stable identifier used for deduplication and paper
/// persistence: an arXiv id, a PubMed id, a repository id, or a canonical
/// URL. `bm25_score` is populated during ranking and defaults to 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub source_id: String,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub pdf_url: Option<String>,
    pub abs_url: Option<String>,
    pub primary_category: Option<String>,
    #[serde(default)]
    pub bm25_score: f64,
}

impl Candidate {
    /// A candidate with just the fields every source provides.
    pub fn minimal(source_id: &str, title: &str, summary: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            title: title.to_string(),
            summary: summary.to_string(),
            categories: Vec::new(),
            published: None,
            updated: None,
            pdf_url: None,
            abs_url: None,
            primary_category: None,
            bm25_score: 0.0,
        }
    }

    /// Preferred link for user-facing output.
    pub fn link(&self) -> Option<&str> {
        self.abs_url.as_deref().or(self.pdf_url.as_deref())
    }
}

/// Uniform query interface over an external scholarly source.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn tag(&self) -> SourceTag;

    /// Return one page of normalized candidates.
    async fn search(
        &self,
        query: &str,
        max_results: usize,
        start: usize,
    ) -> Result<Vec<Candidate>, SourceError>;

    /// Lazily iterate all results by fetching `chunk_size` pages until the
    /// source reports no further results or `limit` is reached. Restartable
    /// per call; each invocation begins at offset 0.
    fn iter_all<'a>(
        &'a self,
        query: &'a str,
        chunk_size: usize,
        limit: Option<usize>,
    ) -> BoxStream<'a, Result<Candidate, SourceError>> {
        struct PageState {
            start: usize,
            yielded: usize,
            buffer: VecDeque<Candidate>,
            exhausted: bool,
        }
        let state = PageState {
            start: 0,
            yielded: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        stream::try_unfold(state, move |mut st| async move {
            loop {
                if limit.is_some_and(|limit| st.yielded >= limit) {
                    return Ok(None);
                }
                if let Some(item) = st.buffer.pop_front() {
                    st.yielded += 1;
                    return Ok(Some((item, st)));
                }
                if st.exhausted {
                    return Ok(None);
                }
                let page = self.search(query, chunk_size, st.start).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                st.exhausted = page.len() < chunk_size;
                st.start += page.len();
                st.buffer.extend(page);
            }
        })
        .boxed()
    }

    /// Collect `iter_all` into a vector.
    async fn search_all(
        &self,
        query: &str,
        chunk_size: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Candidate>, SourceError> {
        let mut stream = self.iter_all(query, chunk_size, limit);
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

/// Closed registry selecting adapters by tag.
pub struct SourceRegistry {
    sources: HashMap<SourceTag, Arc<dyn SearchSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Registry with all four production adapters.
    pub fn with_defaults(github_token: Option<String>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ArxivSource::new()));
        registry.register(Arc::new(ScholarSource::new()));
        registry.register(Arc::new(PubmedSource::new()));
        registry.register(Arc::new(GithubSource::new(github_token)));
        registry
    }

    pub fn register(&mut self, source: Arc<dyn SearchSource>) {
        self.sources.insert(source.tag(), source);
    }

    pub fn get(&self, tag: SourceTag) -> Option<Arc<dyn SearchSource>> {
        self.sources.get(&tag).cloned()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
