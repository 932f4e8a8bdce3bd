//! Agent specifications and their structured output schemas.
//!
//! Each agent pairs a role prompt with a `Deserialize` schema; the gateway
//! coerces model output into the schema before returning it.

use serde::{Deserialize, Serialize};

use super::gateway::AgentSpec;
use crate::types::SourceTag;

/// One planned query. `source` may be omitted by the model; the strategy
/// stage fills it in with a keyword heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub query_text: String,
    #[serde(default)]
    pub source: Option<SourceTag>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
}

/// Strategy agent output: an ordered query plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub queries: Vec<PlannedQuery>,
}

/// Analysis agent output for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisAgentOutput {
    pub relevance: f64,
    pub summary: String,
    #[serde(default)]
    pub key_fragments: Option<String>,
    #[serde(default)]
    pub contextual_reasoning: Option<String>,
}

/// Decision agent output controlling whether to notify and the report text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionReport {
    pub should_notify: bool,
    #[serde(default)]
    pub report_text: Option<String>,
}

pub const STRATEGY_AGENT: AgentSpec = AgentSpec {
    name: "Query Strategist",
    schema_name: "QueryPlan",
    model: None,
    instructions: "\
You turn a user research task into a compact set of search queries. For EACH \
query you must also choose the most relevant source among: arxiv, scholar, \
pubmed, github.

- Prefer concise keyword-style queries
- Avoid redundancy between queries
- Provide a short rationale per query
- If source=arxiv, boolean-style AND/OR/NOT is welcome; optional category \
constraints may apply
- If source=pubmed, prefer biomedical terms and common synonyms
- If source=github, qualifiers like language:Python or stars:>100 are welcome
- Keep the set small and high-precision

Return ONLY a JSON object of the form:
{\"notes\": string|null, \"queries\": [{\"query_text\": string, \"source\": \
\"arxiv\"|\"scholar\"|\"pubmed\"|\"github\", \"rationale\": string|null, \
\"categories\": [string]|null}]}",
};

pub const ANALYST_AGENT: AgentSpec = AgentSpec {
    name: "Paper Analyzer",
    schema_name: "AnalysisAgentOutput",
    model: None,
    instructions: "\
You are an expert research assistant. Given a paper's title and abstract, \
assess relevance to the user's task, write a concise summary, and return a \
percentage relevance.

Return ONLY a JSON object of the form:
{\"relevance\": number 0-100, \"summary\": string, \"key_fragments\": \
string|null, \"contextual_reasoning\": string|null}",
};

pub const REPORTER_AGENT: AgentSpec = AgentSpec {
    name: "Decision Reporter",
    schema_name: "DecisionReport",
    model: None,
    instructions: "\
You are a research assistant. Given a user task and a small set of analyzed \
papers with summaries and relevance, decide whether there are truly helpful \
items.

If there are, produce a plain text report focused on the user task:
- Start with one header line: \"Findings for your task: <task>\"
- Then list up to 3 items in this structure (each 1-2 lines):
  - <Title>
    Why useful for this task: <one short sentence tailored to the task>
    Link: <url>
- Be brief and actionable: 6-12 lines total for the whole report
- Keep language clear and human-friendly; no HTML/Markdown, plain text only

IMPORTANT: Strictly fit within 3000 characters.
Return ONLY a JSON object of the form:
{\"should_notify\": boolean, \"report_text\": string|null}
- If there is nothing truly helpful, set should_notify=false and \
report_text=null
- Otherwise set should_notify=true and report_text to the plain text report",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_plan_deserializes_with_missing_optionals() {
        let plan: QueryPlan = serde_json::from_str(
            r#"{"queries": [{"query_text": "rag survey"}, {"query_text": "gene therapy", "source": "pubmed"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.queries.len(), 2);
        assert!(plan.queries[0].source.is_none());
        assert_eq!(plan.queries[1].source, Some(SourceTag::Pubmed));
    }

    #[test]
    fn analysis_output_requires_relevance_and_summary() {
        let ok: AnalysisAgentOutput =
            serde_json::from_str(r#"{"relevance": 72.5, "summary": "useful"}"#).unwrap();
        assert_eq!(ok.relevance, 72.5);

        let missing = serde_json::from_str::<AnalysisAgentOutput>(r#"{"summary": "no score"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn decision_report_allows_null_text() {
        let report: DecisionReport =
            serde_json::from_str(r#"{"should_notify": false, "report_text": null}"#).unwrap();
        assert!(!report.should_notify);
        assert!(report.report_text.is_none());
    }
}
