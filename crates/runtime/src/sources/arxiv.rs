//! arXiv adapter over the export API Atom feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;

use super::{Candidate, SearchSource};
use crate::types::{SourceError, SourceTag};

const API_URL: &str = "http://export.arxiv.org/api/query";

pub struct ArxivSource {
    client: reqwest::Client,
    near_re: Regex,
    noise_re: Regex,
    empty_parens_re: Regex,
    whitespace_re: Regex,
    id_re: Regex,
}

impl ArxivSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            near_re: Regex::new(r"(?i)\bNEAR/\d+\b").unwrap(),
            noise_re: Regex::new(r"(?i)\b(pdf|document|doc|pdf2text|pdftables)\b").unwrap(),
            empty_parens_re: Regex::new(r"\(\s*\)").unwrap(),
            whitespace_re: Regex::new(r"\s+").unwrap(),
            id_re: Regex::new(r"^(?:https?://arxiv\.org/abs/)?(.+?)(?:v\d+)?$").unwrap(),
        }
    }

    /// Normalize a boolean query to arXiv syntax: drop proximity operators
    /// and ultra-generic tokens that harm recall on abstracts, remove
    /// leftover empty parentheses, collapse whitespace.
    pub fn normalize_query(&self, query: &str) -> String {
        let cleaned = self.near_re.replace_all(query, " ");
        let cleaned = self.noise_re.replace_all(&cleaned, " ");
        let cleaned = self.empty_parens_re.replace_all(&cleaned, " ");
        self.whitespace_re
            .replace_all(&cleaned, " ")
            .trim()
            .to_string()
    }

    /// Append an OR-joined category filter to a query.
    pub fn with_categories(query: &str, categories: &[String]) -> String {
        if categories.is_empty() {
            return query.to_string();
        }
        let cats = categories
            .iter()
            .map(|c| format!("cat:{c}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        format!("({query}) AND ({cats})")
    }

    fn clean_id(&self, raw: &str) -> String {
        self.id_re
            .captures(raw.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| raw.trim().to_string())
    }

    fn parse_feed(&self, xml: &str) -> Result<Vec<Candidate>, SourceError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut candidates = Vec::new();
        let mut entry: Option<EntryFields> = None;
        let mut current_tag: Vec<u8> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = e.name().as_ref().to_vec();
                    if name == b"entry" {
                        entry = Some(EntryFields::default());
                    }
                    current_tag = name;
                }
                Ok(Event::Empty(e)) => {
                    if let Some(ref mut fields) = entry {
                        let name = e.name().as_ref().to_vec();
                        let term = attribute(&e, b"term");
                        match name.as_slice() {
                            b"category" => {
                                if let Some(term) = term {
                                    fields.categories.push(term);
                                }
                            }
                            b"arxiv:primary_category" => fields.primary_category = term,
                            b"link" => {
                                let href = attribute(&e, b"href");
                                let title = attribute(&e, b"title");
                                let rel = attribute(&e, b"rel");
                                if title.as_deref() == Some("pdf") {
                                    fields.pdf_url = href;
                                } else if rel.as_deref() == Some("alternate") {
                                    fields.abs_url = href;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Ok(Event::Text(text)) => {
                    if let Some(ref mut fields) = entry {
                        let value = text
                            .unescape()
                            .map_err(|e| malformed(e.to_string()))?
                            .into_owned();
                        match current_tag.as_slice() {
                            b"id" => fields.id = Some(value),
                            b"title" => fields.title.push_str(&value),
                            b"summary" => fields.summary.push_str(&value),
                            b"published" => fields.published = parse_atom_date(&value),
                            b"updated" => fields.updated = parse_atom_date(&value),
                            _ => {}
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"entry" {
                        if let Some(fields) = entry.take() {
                            if let Some(candidate) = fields.into_candidate(self) {
                                candidates.push(candidate);
                            }
                        }
                    }
                    current_tag.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(malformed(format!("Atom parse error: {e}"))),
                _ => {}
            }
        }
        Ok(candidates)
    }
}

impl Default for ArxivSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchSource for ArxivSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Arxiv
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        start: usize,
    ) -> Result<Vec<Candidate>, SourceError> {
        let normalized = self.normalize_query(query);
        tracing::debug!(
            "arxiv search query='{}' (raw='{}') start={} max_results={}",
            normalized,
            query,
            start,
            max_results
        );

        let response = self
            .client
            .get(API_URL)
            .query(&[
                ("search_query", format!("all:({normalized})")),
                ("start", start.to_string()),
                ("max_results", max_results.to_string()),
                ("sortBy", "submittedDate".to_string()),
                ("sortOrder", "descending".to_string()),
            ])
            .send()
            .await
            .map_err(|e| http_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(format!("HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| http_error(e.to_string()))?;
        let candidates = self.parse_feed(&body)?;
        tracing::debug!("arxiv search got {} candidates", candidates.len());
        Ok(candidates)
    }
}

#[derive(Default)]
struct EntryFields {
    id: Option<String>,
    title: String,
    summary: String,
    categories: Vec<String>,
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    pdf_url: Option<String>,
    abs_url: Option<String>,
    primary_category: Option<String>,
}

impl EntryFields {
    fn into_candidate(self, source: &ArxivSource) -> Option<Candidate> {
        let raw_id = self.id?;
        Some(Candidate {
            source_id: source.clean_id(&raw_id),
            title: collapse_ws(&self.title),
            summary: collapse_ws(&self.summary),
            categories: self.categories,
            published: self.published,
            updated: self.updated,
            pdf_url: self.pdf_url,
            abs_url: self.abs_url.or(Some(raw_id)),
            primary_category: self.primary_category,
            bm25_score: 0.0,
        })
    }
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn parse_atom_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn http_error(message: String) -> SourceError {
    SourceError::Http {
        source_tag: "arxiv",
        message,
    }
}

fn malformed(message: String) -> SourceError {
    SourceError::Malformed {
        source_tag: "arxiv",
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <title>ArXiv Query Results</title>
  <entry>
    <id>http://arxiv.org/abs/2401.12345v2</id>
    <updated>2024-01-20T12:00:00Z</updated>
    <published>2024-01-15T09:30:00Z</published>
    <title>Retrieval-Augmented Generation
        for Small Corpora</title>
    <summary>We study RAG &amp; retrieval quality on small datasets.</summary>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.IR" scheme="http://arxiv.org/schemas/atom"/>
    <arxiv:primary_category term="cs.CL"/>
    <link href="http://arxiv.org/abs/2401.12345v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2401.12345v2" rel="related" type="application/pdf"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2402.00001v1</id>
    <updated>2024-02-01T00:00:00Z</updated>
    <published>2024-02-01T00:00:00Z</published>
    <title>Second Paper</title>
    <summary>Another abstract.</summary>
    <category term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
    <link href="http://arxiv.org/abs/2402.00001v1" rel="alternate" type="text/html"/>
  </entry>
</feed>"#;

    #[test]
    fn normalization_strips_noise() {
        let source = ArxivSource::new();
        assert_eq!(
            source.normalize_query("ligand NEAR/3 binding pdf extraction"),
            "ligand binding extraction"
        );
        assert_eq!(
            source.normalize_query("tables (  ) from document scans"),
            "tables from scans"
        );
        // Case-insensitive noise removal.
        assert_eq!(source.normalize_query("PDF parsing"), "parsing");
    }

    #[test]
    fn category_filter_joins_with_or() {
        let q = ArxivSource::with_categories(
            "graph neural networks",
            &["cs.LG".to_string(), "cs.AI".to_string()],
        );
        assert_eq!(q, "(graph neural networks) AND (cat:cs.LG OR cat:cs.AI)");
        assert_eq!(ArxivSource::with_categories("plain", &[]), "plain");
    }

    #[test]
    fn id_cleaning_strips_url_and_version() {
        let source = ArxivSource::new();
        assert_eq!(
            source.clean_id("http://arxiv.org/abs/2401.12345v2"),
            "2401.12345"
        );
        assert_eq!(source.clean_id("2401.12345"), "2401.12345");
        assert_eq!(source.clean_id("cs/0112017v1"), "cs/0112017");
    }

    #[test]
    fn feed_parsing_extracts_fields() {
        let source = ArxivSource::new();
        let candidates = source.parse_feed(SAMPLE_FEED).unwrap();
        assert_eq!(candidates.len(), 2);

        let first = &candidates[0];
        assert_eq!(first.source_id, "2401.12345");
        assert_eq!(first.title, "Retrieval-Augmented Generation for Small Corpora");
        assert_eq!(
            first.summary,
            "We study RAG & retrieval quality on small datasets."
        );
        assert_eq!(first.categories, vec!["cs.CL", "cs.IR"]);
        assert_eq!(first.primary_category.as_deref(), Some("cs.CL"));
        assert_eq!(
            first.pdf_url.as_deref(),
            Some("http://arxiv.org/pdf/2401.12345v2")
        );
        assert_eq!(
            first.abs_url.as_deref(),
            Some("http://arxiv.org/abs/2401.12345v2")
        );
        assert!(first.published.is_some());
        assert!(first.updated.is_some());

        let second = &candidates[1];
        assert_eq!(second.source_id, "2402.00001");
        assert!(second.pdf_url.is_none());
    }

    #[test]
    fn empty_feed_yields_no_candidates() {
        let source = ArxivSource::new();
        let feed = r#"<?xml version="1.0"?><feed xmlns="http://www.w3.org/2005/Atom"><title>empty</title></feed>"#;
        assert!(source.parse_feed(feed).unwrap().is_empty());
    }
}
