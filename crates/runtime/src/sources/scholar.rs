//! Google Scholar adapter via a DuckDuckGo site-restricted web search.
//!
//! Scholar has no public API and scraping it directly is unreliable, so the
//! adapter issues a `site:scholar.google.com` query against the DuckDuckGo
//! HTML endpoint. Result metadata is limited to title, URL, and snippet;
//! pagination is client-side by over-fetching and slicing.

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use super::{Candidate, SearchSource};
use crate::types::{SourceError, SourceTag};

const HTML_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

pub struct ScholarSource {
    client: reqwest::Client,
    result_re: Regex,
    snippet_re: Regex,
    tag_re: Regex,
}

impl ScholarSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .user_agent("Mozilla/5.0 (compatible; scout/0.3)")
                .build()
                .unwrap_or_default(),
            result_re: Regex::new(
                r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#,
            )
            .unwrap(),
            snippet_re: Regex::new(
                r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#,
            )
            .unwrap(),
            tag_re: Regex::new(r"<[^>]+>").unwrap(),
        }
    }

    fn parse_results(&self, html: &str) -> Vec<Candidate> {
        let snippets: Vec<String> = self
            .snippet_re
            .captures_iter(html)
            .map(|caps| self.strip_markup(&caps[1]))
            .collect();

        self.result_re
            .captures_iter(html)
            .enumerate()
            .filter_map(|(index, caps)| {
                let href = resolve_redirect(&caps[1])?;
                let title = self.strip_markup(&caps[2]);
                if title.is_empty() {
                    return None;
                }
                let snippet = snippets.get(index).cloned().unwrap_or_default();
                Some(Candidate {
                    source_id: href.clone(),
                    title,
                    summary: snippet,
                    categories: Vec::new(),
                    published: None,
                    updated: None,
                    pdf_url: None,
                    abs_url: Some(href),
                    primary_category: None,
                    bm25_score: 0.0,
                })
            })
            .collect()
    }

    fn strip_markup(&self, fragment: &str) -> String {
        let text = self.tag_re.replace_all(fragment, "");
        unescape_entities(&text)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for ScholarSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchSource for ScholarSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Scholar
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        start: usize,
    ) -> Result<Vec<Candidate>, SourceError> {
        let site_query = format!("site:scholar.google.com {query}");
        tracing::debug!("scholar search query='{}' start={}", site_query, start);

        let response = self
            .client
            .post(HTML_ENDPOINT)
            .form(&[("q", site_query.as_str()), ("kl", "wt-wt")])
            .send()
            .await
            .map_err(|e| SourceError::Http {
                source_tag: "scholar",
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                source_tag: "scholar",
                message: format!("HTTP {status}"),
            });
        }
        let html = response.text().await.map_err(|e| SourceError::Http {
            source_tag: "scholar",
            message: e.to_string(),
        })?;

        // The endpoint returns one page; slice client-side for pagination.
        let items = self.parse_results(&html);
        Ok(items.into_iter().skip(start).take(max_results).collect())
    }
}

/// DuckDuckGo wraps result links in a `/l/?uddg=<url>` redirect.
fn resolve_redirect(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;
    if parsed.path().starts_with("/l/") {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, value)| value.into_owned())
    } else {
        Some(absolute)
    }
}

fn unescape_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}
