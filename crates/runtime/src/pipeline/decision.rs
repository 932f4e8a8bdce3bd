//! Decision stage: scoring, selection, and report generation.

use crate::llm::{DecisionReport, LlmGateway, REPORTER_AGENT};

use super::{AnalysisResult, PipelineTask, ScoredAnalysis};

const REPORT_MAX_CHARS: usize = 3000;
const SELECTION_CAP: usize = 3;

/// Overall score in [0, 100]: the relevance, plus a small boost when the
/// summary mentions practical artifacts.
pub fn score_result(result: &AnalysisResult) -> f64 {
    let mut score = result.relevance.clamp(0.0, 100.0);
    let text = result.summary.to_lowercase();
    if ["code", "github", "dataset", "benchmark"]
        .iter()
        .any(|k| text.contains(k))
    {
        score = (score + 5.0).min(100.0);
    }
    score
}

/// Keep items scoring at least `min_relevance`, best first, at most three
/// so reports stay concise.
pub fn select_top(task: &PipelineTask, analyzed: &[AnalysisResult]) -> Vec<ScoredAnalysis> {
    let mut items: Vec<ScoredAnalysis> = analyzed
        .iter()
        .filter_map(|result| {
            let overall_score = score_result(result);
            (overall_score >= task.min_relevance).then(|| ScoredAnalysis {
                result: result.clone(),
                overall_score,
                reasoning: None,
            })
        })
        .collect();
    items.sort_by(|a, b| b.overall_score.total_cmp(&a.overall_score));
    items.truncate(SELECTION_CAP);
    items
}

/// Produce the notify decision and report. An empty selection never
/// notifies; otherwise the reporter agent writes the text, with a local
/// template as fallback.
pub async fn make_decision_and_report(
    gateway: &LlmGateway,
    task: &PipelineTask,
    selected: &[ScoredAnalysis],
) -> DecisionReport {
    if selected.is_empty() {
        return DecisionReport {
            should_notify: false,
            report_text: None,
        };
    }

    if gateway.is_enabled() {
        let payload = serde_json::json!({
            "task": task.query,
            "items": selected.iter().map(|s| {
                serde_json::json!({
                    "title": s.result.candidate.title,
                    "summary": s.result.summary,
                    "score": s.overall_score,
                    "link": s.result.candidate.link(),
                })
            }).collect::<Vec<_>>(),
        });
        match gateway
            .run::<DecisionReport>(&REPORTER_AGENT, &payload.to_string())
            .await
        {
            Ok(report) => {
                return DecisionReport {
                    should_notify: report.should_notify,
                    report_text: report.report_text.as_deref().map(compact_report_text),
                };
            }
            Err(error) => {
                tracing::warn!("Decision reporter failed, fallback to template: {}", error);
            }
        }
    }

    let text = fallback_report(task, selected);
    DecisionReport {
        should_notify: true,
        report_text: Some(compact_report_text(&text)),
    }
}

/// Local template: header line plus per-item title, why-useful line, and
/// link.
fn fallback_report(task: &PipelineTask, selected: &[ScoredAnalysis]) -> String {
    let mut lines = vec![format!("Findings for your task: {}\n", task.query)];
    for item in selected.iter().take(SELECTION_CAP) {
        let title = &item.result.candidate.title;
        let link = item.result.candidate.link().unwrap_or("");
        let why = why_for_task(&task.query, &item.result.summary);
        lines.push(format!(
            "- {title}\n  Why useful for this task: {why}\n  Link: {link}"
        ));
    }
    lines.join("\n")
}

/// Normalize whitespace and cap the report length.
fn compact_report_text(text: &str) -> String {
    let compacted: String = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if compacted.chars().count() > REPORT_MAX_CHARS {
        let truncated: String = compacted.chars().take(REPORT_MAX_CHARS - 3).collect();
        format!("{}...", truncated.trim_end())
    } else {
        compacted
    }
}

/// Heuristic one-liner: prefer overlapping task terms, fall back to the
/// summary's first sentence.
fn why_for_task(task_query: &str, summary: &str) -> String {
    const STOPWORDS: [&str; 8] = ["the", "and", "or", "of", "to", "for", "a", "in"];
    const MAX_LEN: usize = 220;

    let task_terms: Vec<String> = words(task_query)
        .into_iter()
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect();
    let first_sentence = summary.trim().split(". ").next().unwrap_or("").to_string();

    let mut overlaps: Vec<String> = Vec::new();
    for word in words(&first_sentence) {
        if task_terms.contains(&word) && !overlaps.contains(&word) {
            overlaps.push(word);
        }
    }

    let text = if overlaps.is_empty() {
        if first_sentence.is_empty() {
            "directly related methods and findings".to_string()
        } else {
            first_sentence
        }
    } else {
        format!(
            "addresses {} relevant to your task",
            overlaps[..overlaps.len().min(3)].join(", ")
        )
    };

    if text.chars().count() > MAX_LEN {
        let truncated: String = text.chars().take(MAX_LEN - 3).collect();
        format!("{}...", truncated.trim_end())
    } else {
        text
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Candidate;

    fn analysis(id: &str, relevance: f64, summary: &str) -> AnalysisResult {
        let mut candidate = Candidate::minimal(id, &format!("Paper {id}"), summary);
        candidate.abs_url = Some(format!("https://example.org/{id}"));
        AnalysisResult {
            candidate,
            relevance,
            summary: summary.to_string(),
            key_fragments: None,
            contextual_reasoning: None,
        }
    }

    #[test]
    fn artifact_mentions_get_a_boost() {
        let plain = analysis("a", 60.0, "a theoretical treatment");
        assert_eq!(score_result(&plain), 60.0);

        let with_code = analysis("b", 60.0, "includes code and a benchmark");
        assert_eq!(score_result(&with_code), 65.0);

        // Boost clamps at 100.
        let near_max = analysis("c", 98.0, "dataset release");
        assert_eq!(score_result(&near_max), 100.0);
    }

    #[test]
    fn selection_filters_sorts_and_caps() {
        let task = PipelineTask::new("anything");
        let analyzed = vec![
            analysis("low", 30.0, "x"),
            analysis("mid", 60.0, "x"),
            analysis("high", 90.0, "x"),
            analysis("top", 95.0, "x"),
            analysis("ok", 55.0, "x"),
        ];
        let selected = select_top(&task, &analyzed);
        assert_eq!(selected.len(), 3);
        let ids: Vec<&str> = selected
            .iter()
            .map(|s| s.result.candidate.source_id.as_str())
            .collect();
        assert_eq!(ids, vec!["top", "high", "mid"]);
    }

    #[test]
    fn threshold_boundaries() {
        let mut task = PipelineTask::new("anything");
        let analyzed = vec![analysis("a", 50.0, "x"), analysis("b", 49.9, "x")];

        task.min_relevance = 50.0;
        let selected = select_top(&task, &analyzed);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].result.candidate.source_id, "a");

        task.min_relevance = 0.0;
        assert_eq!(select_top(&task, &analyzed).len(), 2);

        task.min_relevance = 100.0;
        assert!(select_top(&task, &analyzed).is_empty());
    }

    #[tokio::test]
    async fn empty_selection_never_notifies() {
        let gateway = LlmGateway::disabled();
        let task = PipelineTask::new("query");
        let report = make_decision_and_report(&gateway, &task, &[]).await;
        assert!(!report.should_notify);
        assert!(report.report_text.is_none());
    }

    #[tokio::test]
    async fn fallback_template_shape() {
        let gateway = LlmGateway::disabled();
        let task = PipelineTask::new("rust async runtimes");
        let selected = select_top(
            &PipelineTask::new("rust async runtimes"),
            &[analysis("a", 80.0, "a rust async scheduler with benchmarks")],
        );
        let report = make_decision_and_report(&gateway, &task, &selected).await;
        assert!(report.should_notify);
        let text = report.report_text.unwrap();
        assert!(text.starts_with("Findings for your task: rust async runtimes"));
        assert!(text.contains("Why useful for this task:"));
        assert!(text.contains("Link: https://example.org/a"));
        assert!(text.chars().count() <= REPORT_MAX_CHARS);
    }

    #[test]
    fn report_compaction_caps_length() {
        let long = "line with content\n\n\n".repeat(400);
        let compacted = compact_report_text(&long);
        assert!(compacted.chars().count() <= REPORT_MAX_CHARS);
        assert!(compacted.ends_with("..."));
        assert!(!compacted.contains("\n\n"));
    }

    #[test]
    fn why_prefers_overlapping_terms() {
        let why = why_for_task(
            "graph neural networks for molecules",
            "We apply graph neural networks to molecules. Details follow.",
        );
        assert_eq!(why, "addresses graph, neural, networks relevant to your task");

        let fallback = why_for_task("quantum chemistry", "An unrelated abstract sentence");
        assert_eq!(fallback, "An unrelated abstract sentence");

        assert_eq!(
            why_for_task("topic", ""),
            "directly related methods and findings"
        );
    }
}
