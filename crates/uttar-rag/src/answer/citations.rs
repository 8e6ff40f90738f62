//! Inline citation parsing and validation.
//!
//! Answers cite sources as markdown links: `[label](https://...)` for web
//! sources and `[label](#doc-N)` or `[label](document-id)` for documents.
//! Every link is checked against the source list the answer was generated
//! from; anything the model invented lands in `invalid_urls` or
//! `invalid_document_ids` instead of being passed to the caller as real.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::types::{Source, SourceType};

static MARKDOWN_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("markdown link regex is valid")
});

static DOC_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#?doc-(\d+)$").expect("doc index regex is valid"));

/// Byte span of a citation inside the answer text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationSpan {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationKind {
    Web,
    Document,
}

/// One inline citation as written by the model.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    /// The link label, what the reader sees.
    pub text: String,
    /// The link target as written.
    pub target: String,
    pub position: CitationSpan,
    pub citation_type: CitationKind,
    /// Title of the matched source, when validation found one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A stretch of answer text, either plain or carrying a citation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSegment {
    pub text: String,
    pub cited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Everything the caller learns about the answer's citations.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationReport {
    pub citations: Vec<Citation>,
    pub matched: usize,
    pub unmatched: usize,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub invalid_urls: Vec<String>,
    pub invalid_document_ids: Vec<String>,
    pub segments: Vec<AnswerSegment>,
}

/// Pull every markdown-link citation out of the answer, unvalidated.
pub fn extract_citations(answer: &str) -> Vec<Citation> {
    MARKDOWN_LINK_RE
        .captures_iter(answer)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let text = cap.get(1)?.as_str().to_string();
            let target = cap.get(2)?.as_str().trim().to_string();
            let citation_type = if target.starts_with("http://") || target.starts_with("https://")
            {
                CitationKind::Web
            } else {
                CitationKind::Document
            };
            Some(Citation {
                text,
                target,
                position: CitationSpan {
                    start: whole.start(),
                    end: whole.end(),
                },
                citation_type,
                source: None,
            })
        })
        .collect()
}

/// Validate the answer's citations against the sources it was given.
pub fn validate_citations(answer: &str, sources: &[Source]) -> CitationReport {
    let mut citations = extract_citations(answer);
    let mut report = CitationReport {
        valid: true,
        ..Default::default()
    };

    if citations.is_empty() {
        report.warnings.push("answer contains no citations".to_string());
        report.segments = build_segments(answer, &citations);
        return report;
    }

    let document_sources: Vec<&Source> = sources
        .iter()
        .filter(|s| s.source_type == SourceType::Document)
        .collect();

    for citation in &mut citations {
        let matched = match citation.citation_type {
            CitationKind::Web => match_web(citation, sources),
            CitationKind::Document => match_document(citation, &document_sources),
        };
        match matched {
            Some(title) => {
                citation.source = Some(title);
                report.matched += 1;
            }
            None => {
                report.unmatched += 1;
                match citation.citation_type {
                    CitationKind::Web => {
                        report.errors.push(format!(
                            "citation '{}' links to a URL not in the source list",
                            citation.target
                        ));
                        if let Some(close) = closest_url(&citation.target, sources) {
                            report.suggestions.push(format!(
                                "'{}' may have meant '{}'",
                                citation.target, close
                            ));
                        }
                        report.invalid_urls.push(citation.target.clone());
                    }
                    CitationKind::Document => {
                        report.errors.push(format!(
                            "citation '{}' references a document not in the source list",
                            citation.target
                        ));
                        report.invalid_document_ids.push(citation.target.clone());
                    }
                }
            }
        }
    }

    report.valid = report.unmatched == 0;
    if !report.valid {
        report.warnings.push(format!(
            "{} of {} citations could not be matched to a source",
            report.unmatched,
            citations.len()
        ));
    }
    report.segments = build_segments(answer, &citations);
    report.citations = citations;
    report
}

fn match_web(citation: &Citation, sources: &[Source]) -> Option<String> {
    let target = citation.target.trim_end_matches('/');
    sources
        .iter()
        .filter(|s| s.source_type == SourceType::Web)
        .find(|s| {
            s.url
                .as_deref()
                .map(|u| u.trim_end_matches('/') == target)
                .unwrap_or(false)
        })
        .map(|s| s.title.clone())
}

fn match_document(citation: &Citation, document_sources: &[&Source]) -> Option<String> {
    let target = citation.target.trim_start_matches('#');

    if let Some(cap) = DOC_INDEX_RE.captures(&citation.target) {
        let index: usize = cap[1].parse().ok()?;
        return document_sources
            .get(index.checked_sub(1)?)
            .map(|s| s.title.clone());
    }

    document_sources
        .iter()
        .find(|s| {
            s.document_id.as_deref() == Some(target)
                || s.title.eq_ignore_ascii_case(target)
                || s.title.eq_ignore_ascii_case(&citation.text)
        })
        .map(|s| s.title.clone())
}

/// A known web URL sharing the invalid target's host, if any.
fn closest_url(target: &str, sources: &[Source]) -> Option<String> {
    let host = host_of(target)?;
    sources
        .iter()
        .filter_map(|s| s.url.as_deref())
        .find(|u| host_of(u).as_deref() == Some(&host))
        .map(|u| u.to_string())
}

fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    Some(
        rest.split(['/', '?'])
            .next()
            .unwrap_or(rest)
            .to_ascii_lowercase(),
    )
}

/// Split the answer into cited and uncited stretches for rendering.
fn build_segments(answer: &str, citations: &[Citation]) -> Vec<AnswerSegment> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    for citation in citations {
        let span = citation.position;
        if span.start > cursor {
            segments.push(AnswerSegment {
                text: answer[cursor..span.start].to_string(),
                cited: false,
                target: None,
            });
        }
        segments.push(AnswerSegment {
            text: citation.text.clone(),
            cited: true,
            target: Some(citation.target.clone()),
        });
        cursor = span.end;
    }

    if cursor < answer.len() {
        segments.push(AnswerSegment {
            text: answer[cursor..].to_string(),
            cited: false,
            target: None,
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn web_source(title: &str, url: &str) -> Source {
        Source {
            source_type: SourceType::Web,
            title: title.to_string(),
            url: Some(url.to_string()),
            document_id: None,
            snippet: "s".to_string(),
            score: 0.7,
            metadata: HashMap::new(),
        }
    }

    fn doc_source(title: &str, document_id: &str) -> Source {
        Source {
            source_type: SourceType::Document,
            title: title.to_string(),
            url: None,
            document_id: Some(document_id.to_string()),
            snippet: "s".to_string(),
            score: 0.9,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_extract_web_and_document_citations() {
        let answer =
            "Backups run nightly [Ops Handbook](#doc-1) and are tested [status page](https://status.example.com).";
        let citations = extract_citations(answer);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].citation_type, CitationKind::Document);
        assert_eq!(citations[0].target, "#doc-1");
        assert_eq!(citations[1].citation_type, CitationKind::Web);
        assert_eq!(citations[1].text, "status page");
    }

    #[test]
    fn test_valid_citations_match() {
        let sources = vec![
            doc_source("Ops Handbook", "doc-abc"),
            web_source("Status", "https://status.example.com"),
        ];
        let answer = "Backups run nightly [Ops Handbook](#doc-1), see also \
                      [status](https://status.example.com/).";
        let report = validate_citations(answer, &sources);
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 0);
        assert!(report.valid);
        assert_eq!(report.citations[0].source.as_deref(), Some("Ops Handbook"));
        assert!(report.invalid_urls.is_empty());
    }

    #[test]
    fn test_unmatched_url_reported() {
        let sources = vec![web_source("Status", "https://status.example.com")];
        let answer = "See [made up page](https://evil.example.org/fake).";
        let report = validate_citations(answer, &sources);
        assert_eq!(report.matched, 0);
        assert_eq!(report.unmatched, 1);
        assert!(!report.valid);
        assert_eq!(report.invalid_urls, vec!["https://evil.example.org/fake"]);
        assert!(!report.errors.is_empty());
    }

    #[test]
    fn test_unmatched_document_reported() {
        let sources = vec![doc_source("Ops Handbook", "doc-abc")];
        let answer = "Per [Security Policy](#doc-9), access is restricted.";
        let report = validate_citations(answer, &sources);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.invalid_document_ids, vec!["#doc-9"]);
    }

    #[test]
    fn test_document_matched_by_id_and_title() {
        let sources = vec![doc_source("Ops Handbook", "d-123")];
        for target in ["d-123", "Ops Handbook"] {
            let answer = format!("Stated in [the handbook]({target}).");
            let report = validate_citations(&answer, &sources);
            assert_eq!(report.matched, 1, "target {target}");
        }
    }

    #[test]
    fn test_no_citations_is_valid_with_warning() {
        let report = validate_citations("Plain answer.", &[]);
        assert!(report.valid);
        assert_eq!(report.matched, 0);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.segments.len(), 1);
        assert!(!report.segments[0].cited);
    }

    #[test]
    fn test_segments_cover_answer_in_order() {
        let sources = vec![web_source("Status", "https://status.example.com")];
        let answer = "Uptime is tracked [here](https://status.example.com) daily.";
        let report = validate_citations(answer, &sources);
        assert_eq!(report.segments.len(), 3);
        assert_eq!(report.segments[0].text, "Uptime is tracked ");
        assert!(report.segments[1].cited);
        assert_eq!(report.segments[1].text, "here");
        assert_eq!(report.segments[2].text, " daily.");
    }

    #[test]
    fn test_suggestion_for_same_host() {
        let sources = vec![web_source("Status", "https://status.example.com/uptime")];
        let answer = "See [status](https://status.example.com/wrong-path).";
        let report = validate_citations(answer, &sources);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.suggestions.len(), 1);
        assert!(report.suggestions[0].contains("https://status.example.com/uptime"));
    }
}
