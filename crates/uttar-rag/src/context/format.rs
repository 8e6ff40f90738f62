//! Rendering retrieved context into prompt text.
//!
//! Pure function of the context and the priority marks. Sections only appear
//! when they have entries, and an empty context renders as an empty string so
//! the prompt builder can skip the context block entirely.

use crate::context::priority::PriorityMarks;
use crate::types::{RagContext, WebResult};

pub const DOCUMENT_SECTION_HEADING: &str = "Relevant Document Excerpts:";
pub const WEB_SECTION_HEADING: &str = "Web Search Results:";

const HIGH_PRIORITY_LABEL: &str = " \u{2b50} [HIGH PRIORITY]";

/// Render the full context block for the system prompt.
pub fn format_context_for_prompt(context: &RagContext, marks: &PriorityMarks) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(2);

    if !context.document_contexts.is_empty() {
        let items: Vec<String> = context
            .document_contexts
            .iter()
            .enumerate()
            .map(|(i, doc)| {
                let label = if marks.chunk_is_high(&doc.chunk_id) {
                    HIGH_PRIORITY_LABEL
                } else {
                    ""
                };
                format!(
                    "[{}]{} {} (relevance: {:.2})\n{}",
                    i + 1,
                    label,
                    doc.document_name,
                    doc.score,
                    doc.content
                )
            })
            .collect();
        sections.push(format!(
            "{}\n\n{}",
            DOCUMENT_SECTION_HEADING,
            items.join("\n\n")
        ));
    }

    if !context.web_search_results.is_empty() {
        let items: Vec<String> = context
            .web_search_results
            .iter()
            .enumerate()
            .map(|(i, web)| {
                let label = if marks.url_is_high(&web.url) {
                    HIGH_PRIORITY_LABEL
                } else {
                    ""
                };
                format!(
                    "[{}]{} {}\nURL: {}\n{}\n{}",
                    i + 1,
                    label,
                    web.title,
                    web.url,
                    citing_line(web),
                    web.content
                )
            })
            .collect();
        sections.push(format!("{}\n\n{}", WEB_SECTION_HEADING, items.join("\n\n")));
    }

    sections.join("\n\n")
}

/// One-line citation record the model can copy into its answer.
fn citing_line(web: &WebResult) -> String {
    let mut line = String::from("CITING: ");
    if let Some(author) = web.author.as_deref().filter(|a| !a.is_empty()) {
        line.push_str(author);
        line.push_str(". ");
    }
    line.push_str(&web.title);
    line.push_str(". ");
    line.push_str(&web.url);
    if let Some(published) = web.published_date.as_deref().filter(|d| !d.is_empty()) {
        line.push_str(". Published ");
        line.push_str(published);
    }
    line.push_str(". Accessed ");
    line.push_str(&web.access_date.format("%Y-%m-%d").to_string());
    line.push('.');
    line
}
