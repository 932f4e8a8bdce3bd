//! GitHub repository adapter over the search API.
//!
//! Results are ordered by stars descending. GitHub paginates with
//! `(page, per_page)`, so the zero-based `start` offset is mapped to a page
//! and trimmed client-side when it is not page-aligned.

use async_trait::async_trait;

use super::{Candidate, SearchSource};
use crate::types::{SourceError, SourceTag};

pub struct GithubSource {
    client: octocrab::Octocrab,
}

impl GithubSource {
    /// A token raises the API rate limits; anonymous access works for
    /// light use.
    pub fn new(token: Option<String>) -> Self {
        let builder = octocrab::Octocrab::builder();
        let client = match token {
            Some(token) => builder.personal_token(token).build(),
            None => builder.build(),
        }
        .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl SearchSource for GithubSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Github
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        start: usize,
    ) -> Result<Vec<Candidate>, SourceError> {
        let per_page = max_results.clamp(1, 100) as u8;
        let page = 1 + (start / per_page as usize) as u32;
        tracing::debug!(
            "github search query='{}' page={} per_page={}",
            query,
            page,
            per_page
        );

        let results = self
            .client
            .search()
            .repositories(query)
            .sort("stars")
            .order("desc")
            .per_page(per_page)
            .page(page)
            .send()
            .await
            .map_err(|e| SourceError::Http {
                source_tag: "github",
                message: e.to_string(),
            })?;

        let mut items: Vec<Candidate> = results
            .items
            .into_iter()
            .map(|repo| {
                let full_name = repo.full_name.unwrap_or_default();
                let stars = repo.stargazers_count;
                let language = repo
                    .language
                    .as_ref()
                    .and_then(|l| l.as_str())
                    .map(str::to_string);

                let mut snippet_parts = Vec::new();
                if let Some(ref description) = repo.description {
                    snippet_parts.push(description.clone());
                }
                if let Some(stars) = stars {
                    snippet_parts.push(format!("★ {stars}"));
                }
                if let Some(ref language) = language {
                    snippet_parts.push(language.clone());
                }

                Candidate {
                    source_id: repo.id.to_string(),
                    title: full_name,
                    summary: snippet_parts.join(" • "),
                    categories: language.into_iter().collect(),
                    published: None,
                    updated: repo.updated_at,
                    pdf_url: None,
                    abs_url: repo.html_url.map(|u| u.to_string()),
                    primary_category: None,
                    bm25_score: 0.0,
                }
            })
            .collect();

        // Trim when start is not aligned to a page boundary.
        let offset = start % per_page as usize;
        if offset > 0 && offset < items.len() {
            items.drain(..offset);
        } else if offset >= items.len() {
            items.clear();
        }
        items.truncate(max_results);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_maps_to_page_and_trim() {
        // start=0, per_page=25 → page 1, no trim.
        assert_eq!(1 + (0 / 25), 1);
        // start=50, per_page=25 → page 3.
        assert_eq!(1 + (50 / 25), 3);
        // start=30, per_page=25 → page 2 with a client-side trim of 5.
        assert_eq!(1 + (30 / 25), 2);
        assert_eq!(30 % 25, 5);
    }

    #[tokio::test]
    async fn anonymous_client_builds() {
        let source = GithubSource::new(None);
        assert_eq!(source.tag(), SourceTag::Github);
    }
}
