//! Source prioritization.
//!
//! Scores each context entry and marks the ones the prompt should flag as
//! high priority. Marking is presentation-only: entries are never reordered
//! or dropped here.

use std::collections::HashSet;

use crate::types::RagContext;

const LEAD_CHUNK_BOOST: f32 = 0.05;

/// Entries the formatter should render with a high-priority label.
#[derive(Debug, Default, Clone)]
pub struct PriorityMarks {
    chunk_ids: HashSet<String>,
    urls: HashSet<String>,
}

impl PriorityMarks {
    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty() && self.urls.is_empty()
    }

    pub fn chunk_is_high(&self, chunk_id: &str) -> bool {
        self.chunk_ids.contains(chunk_id)
    }

    pub fn url_is_high(&self, url: &str) -> bool {
        self.urls.contains(url)
    }
}

/// Mark every entry whose priority score reaches `threshold`.
///
/// Document priority is the retrieval score with a small boost for lead
/// chunks, which usually carry definitions and overviews. Web priority is
/// the provider score unmodified. Scores clamp to [0, 1] so the threshold
/// keeps its meaning.
pub fn prioritize(context: &RagContext, threshold: f32) -> PriorityMarks {
    let mut marks = PriorityMarks::default();

    for doc in &context.document_contexts {
        let mut priority = doc.score;
        if doc.chunk_index == 0 {
            priority += LEAD_CHUNK_BOOST;
        }
        if priority.clamp(0.0, 1.0) >= threshold {
            marks.chunk_ids.insert(doc.chunk_id.clone());
        }
    }

    for web in &context.web_search_results {
        if web.score.clamp(0.0, 1.0) >= threshold {
            marks.urls.insert(web.url.clone());
        }
    }

    if !marks.is_empty() {
        tracing::debug!(
            chunks = marks.chunk_ids.len(),
            urls = marks.urls.len(),
            "marked high priority sources"
        );
    }
    marks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentContext, WebResult};
    use chrono::Utc;
    use std::collections::HashMap;

    fn doc(chunk_id: &str, score: f32, chunk_index: usize) -> DocumentContext {
        DocumentContext {
            chunk_id: chunk_id.to_string(),
            document_id: "d".to_string(),
            document_name: "Doc".to_string(),
            content: "content".to_string(),
            score,
            chunk_index,
            metadata: HashMap::new(),
        }
    }

    fn web(url: &str, score: f32) -> WebResult {
        WebResult {
            title: "Title".to_string(),
            url: url.to_string(),
            content: "snippet".to_string(),
            published_date: None,
            author: None,
            score,
            access_date: Utc::now(),
        }
    }

    #[test]
    fn test_marks_entries_at_threshold() {
        let context = RagContext {
            document_contexts: vec![doc("hi", 0.9, 3), doc("lo", 0.4, 3)],
            web_search_results: vec![web("https://a.example", 0.8), web("https://b.example", 0.1)],
            ..Default::default()
        };
        let marks = prioritize(&context, 0.7);
        assert!(marks.chunk_is_high("hi"));
        assert!(!marks.chunk_is_high("lo"));
        assert!(marks.url_is_high("https://a.example"));
        assert!(!marks.url_is_high("https://b.example"));
    }

    #[test]
    fn test_lead_chunk_boost_crosses_threshold() {
        let context = RagContext {
            document_contexts: vec![doc("lead", 0.67, 0), doc("tail", 0.67, 4)],
            ..Default::default()
        };
        let marks = prioritize(&context, 0.7);
        assert!(marks.chunk_is_high("lead"));
        assert!(!marks.chunk_is_high("tail"));
    }

    #[test]
    fn test_empty_context_marks_nothing() {
        let marks = prioritize(&RagContext::default(), 0.7);
        assert!(marks.is_empty());
    }
}
