//! PubMed adapter over the NCBI E-utilities JSON endpoints.
//!
//! Two-step retrieval: `esearch.fcgi` returns a PMID list for the query,
//! `esummary.fcgi` resolves the PMIDs to titles and publication dates.
//! Pagination is server-side via `retstart`.

use async_trait::async_trait;
use serde_json::Value;

use super::{Candidate, SearchSource};
use crate::types::{SourceError, SourceTag};

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

pub struct PubmedSource {
    client: reqwest::Client,
}

impl PubmedSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn fetch_json(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, SourceError> {
        let response = self
            .client
            .get(format!("{EUTILS_BASE}/{endpoint}"))
            .query(params)
            .send()
            .await
            .map_err(|e| http_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(http_error(format!("HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| malformed(e.to_string()))
    }
}

impl Default for PubmedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchSource for PubmedSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Pubmed
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        start: usize,
    ) -> Result<Vec<Candidate>, SourceError> {
        tracing::debug!("pubmed search query='{}' retstart={}", query, start);

        let retmax = max_results.to_string();
        let retstart = start.to_string();
        let esearch = self
            .fetch_json(
                "esearch.fcgi",
                &[
                    ("db", "pubmed"),
                    ("retmode", "json"),
                    ("retmax", retmax.as_str()),
                    ("retstart", retstart.as_str()),
                    ("term", query),
                ],
            )
            .await?;

        let ids = extract_id_list(&esearch);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let joined = ids.join(",");
        let esummary = self
            .fetch_json(
                "esummary.fcgi",
                &[("db", "pubmed"), ("retmode", "json"), ("id", joined.as_str())],
            )
            .await?;

        Ok(candidates_from_summaries(&ids, &esummary))
    }
}

fn extract_id_list(esearch: &Value) -> Vec<String> {
    esearch
        .get("esearchresult")
        .and_then(|r| r.get("idlist"))
        .and_then(|l| l.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn candidates_from_summaries(ids: &[String], esummary: &Value) -> Vec<Candidate> {
    let result = esummary.get("result");
    ids.iter()
        .map(|pmid| {
            let info = result.and_then(|r| r.get(pmid));
            let title = info
                .and_then(|i| i.get("title"))
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string();
            let pubdate = info
                .and_then(|i| i.get("pubdate"))
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string();
            Candidate {
                source_id: pmid.clone(),
                title,
                summary: pubdate,
                categories: Vec::new(),
                published: None,
                updated: None,
                pdf_url: None,
                abs_url: Some(format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/")),
                primary_category: None,
                bm25_score: 0.0,
            }
        })
        .collect()
}

fn http_error(message: String) -> SourceError {
    SourceError::Http {
        source_tag: "pubmed",
        message,
    }
}

fn malformed(message: String) -> SourceError {
    SourceError::Malformed {
        source_tag: "pubmed",
        message,
    }
}
