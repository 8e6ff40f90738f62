//! System prompt construction.
//!
//! The prompt changes with the answer mode: document-only answers must stay
//! inside the retrieved excerpts, web-only answers cite pages, combined
//! answers do both, and strict topics refuse anything out of scope. The
//! citation policy and the follow-up output contract are embedded here so
//! the parser downstream sees a predictable shape.

use crate::answer::followup::FOLLOW_UP_MARKER;
use crate::gateway::{ChatMessage, TopicInfo};
use crate::types::QuestionRequest;

/// Which knowledge the model is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    DocumentOnly,
    WebOnly,
    Combined,
    TopicStrict,
}

impl AnswerMode {
    /// Derive the mode from the enabled search arms and the topic scope.
    pub fn derive(request: &QuestionRequest, topic: Option<&TopicInfo>) -> Self {
        if topic.map(|t| t.strict_scope).unwrap_or(false) {
            return Self::TopicStrict;
        }
        let documents = request.enable_document_search || request.enable_keyword_search;
        match (documents, request.enable_web_search) {
            (true, true) => Self::Combined,
            (false, true) => Self::WebOnly,
            _ => Self::DocumentOnly,
        }
    }
}

const DOCUMENT_ONLY_RULES: &str = r#"You are a document question-answering assistant. Answer using ONLY the provided document excerpts.

GROUNDING RULES:
1. Only the numbered excerpts below exist. Your training data and world knowledge are NOT sources for this answer.
2. Before writing any fact, find the exact supporting text in an excerpt. No supporting text, no fact.
3. Never infer or extrapolate beyond what is explicitly written.
4. If the excerpts contain nothing relevant, say exactly: "I could not find relevant information in the available sources." Do not apologize at length and do not invent an answer."#;

const WEB_ONLY_RULES: &str = r#"You are a research assistant. Answer using ONLY the provided web search results.

GROUNDING RULES:
1. Only the numbered web results below exist as sources. Do not add facts from memory.
2. Prefer recent results when results disagree, and say which source you followed.
3. If the results contain nothing relevant, say exactly: "I could not find relevant information in the available sources.""#;

const COMBINED_RULES: &str = r#"You are a research assistant with two kinds of sources: document excerpts and web search results. Answer using ONLY these sources.

GROUNDING RULES:
1. Only the numbered excerpts and web results below exist as sources. Do not add facts from memory.
2. When documents and web results disagree, prefer the documents and note the disagreement in one short clause.
3. If neither contains anything relevant, say exactly: "I could not find relevant information in the available sources.""#;

const CITATION_RULES: &str = r#"CITATION RULES:
5. Every factual sentence carries an inline markdown-link citation.
6. Web sources: [page title](URL), copying the URL exactly from the result's URL line.
7. Document sources: [document name](#doc-N) where N is the excerpt number.
8. Before finalizing, re-check every link: the URL or document must appear in the sources above. Remove any sentence you cannot cite.

EXAMPLE:
Retention is 30 days [Backup Policy](#doc-1), and the outage on May 3rd was resolved in two hours [status page](https://status.example.com/incidents/42)."#;

/// The trailing block contract the follow-up parser expects.
fn follow_up_contract() -> String {
    format!(
        "OUTPUT FORMAT:\n\
         9. After the answer, emit a line containing exactly `{FOLLOW_UP_MARKER}` \
         followed by exactly four short on-topic questions, one per line, each \
         starting with \"- \" and ending with \"?\"."
    )
}

fn mode_rules(mode: AnswerMode, topic: Option<&TopicInfo>) -> String {
    match mode {
        AnswerMode::DocumentOnly => DOCUMENT_ONLY_RULES.to_string(),
        AnswerMode::WebOnly => WEB_ONLY_RULES.to_string(),
        AnswerMode::Combined => COMBINED_RULES.to_string(),
        AnswerMode::TopicStrict => {
            let name = topic.map(|t| t.name.as_str()).unwrap_or("the active topic");
            let description = topic
                .and_then(|t| t.description.as_deref())
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            format!(
                "{COMBINED_RULES}\n\
                 4. SCOPE: you answer questions about \"{name}\"{description} and nothing else. \
                 If the question is outside this scope, refuse in one sentence and do not answer it."
            )
        }
    }
}

/// Assemble the full message list for the completion gateway.
pub fn build_messages(
    mode: AnswerMode,
    topic: Option<&TopicInfo>,
    context_text: &str,
    history_text: &str,
    question: &str,
) -> Vec<ChatMessage> {
    let mut system = mode_rules(mode, topic);
    system.push_str("\n\n");
    system.push_str(CITATION_RULES);
    system.push_str("\n\n");
    system.push_str(&follow_up_contract());

    system.push_str("\n\n===== SOURCES =====\n");
    if context_text.is_empty() {
        system.push_str("No sources were retrieved for this question.\n");
    } else {
        system.push_str(context_text);
        system.push('\n');
    }
    system.push_str("===== END OF SOURCES =====\n");

    if !history_text.is_empty() {
        system.push('\n');
        system.push_str(history_text);
    }

    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("Question: \"{question}\"\n\nAnswer:")),
    ]
}

/// Yes/no classification call for the off-topic pre-check.
pub fn off_topic_check_messages(question: &str, topic: &TopicInfo) -> Vec<ChatMessage> {
    let description = topic
        .description
        .as_deref()
        .map(|d| format!("\nTopic description: {d}"))
        .unwrap_or_default();
    vec![
        ChatMessage::system(
            "You classify whether a question belongs to a topic. \
             Reply with exactly one word: yes or no.",
        ),
        ChatMessage::user(format!(
            "Topic: {}{}\nQuestion: \"{}\"\n\nDoes the question belong to the topic?",
            topic.name, description, question
        )),
    ]
}

/// Canned answer for a question outside a strict topic's scope.
pub fn refusal_answer(topic: &TopicInfo) -> String {
    format!(
        "This question falls outside the scope of \"{}\", so I can't answer it here. \
         I can help with anything related to {}.",
        topic.name, topic.name
    )
}

/// The single meta follow-up attached to a refusal.
pub fn refusal_follow_up(topic: &TopicInfo) -> String {
    format!("What would you like to know about {}?", topic.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(strict: bool) -> TopicInfo {
        TopicInfo {
            id: "t1".to_string(),
            name: "Database Internals".to_string(),
            description: Some("storage engines and query planners".to_string()),
            strict_scope: strict,
            off_topic_check: None,
        }
    }

    #[test]
    fn test_mode_derivation() {
        let mut request = QuestionRequest::new("q", "u");
        assert_eq!(AnswerMode::derive(&request, None), AnswerMode::Combined);

        request.enable_web_search = false;
        assert_eq!(AnswerMode::derive(&request, None), AnswerMode::DocumentOnly);

        request.enable_web_search = true;
        request.enable_document_search = false;
        request.enable_keyword_search = false;
        assert_eq!(AnswerMode::derive(&request, None), AnswerMode::WebOnly);

        let strict = topic(true);
        assert_eq!(
            AnswerMode::derive(&request, Some(&strict)),
            AnswerMode::TopicStrict
        );
        let lax = topic(false);
        assert_eq!(AnswerMode::derive(&request, Some(&lax)), AnswerMode::WebOnly);
    }

    #[test]
    fn test_document_only_prompt_has_refusal_rule() {
        let messages = build_messages(AnswerMode::DocumentOnly, None, "ctx", "", "q");
        let system = &messages[0].content;
        assert!(system.contains("ONLY the provided document excerpts"));
        assert!(system.contains("I could not find relevant information"));
        assert!(system.contains(FOLLOW_UP_MARKER));
        assert!(system.contains("ctx"));
    }

    #[test]
    fn test_strict_prompt_names_topic() {
        let strict = topic(true);
        let messages = build_messages(AnswerMode::TopicStrict, Some(&strict), "ctx", "", "q");
        let system = &messages[0].content;
        assert!(system.contains("Database Internals"));
        assert!(system.contains("refuse"));
    }

    #[test]
    fn test_empty_context_noted() {
        let messages = build_messages(AnswerMode::Combined, None, "", "", "q");
        assert!(messages[0]
            .content
            .contains("No sources were retrieved for this question."));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn test_history_included_when_present() {
        let messages = build_messages(AnswerMode::Combined, None, "ctx", "user: hi\n", "q");
        assert!(messages[0].content.contains("user: hi"));
    }

    #[test]
    fn test_refusal_strings_name_topic() {
        let strict = topic(true);
        assert!(refusal_answer(&strict).contains("Database Internals"));
        assert!(refusal_follow_up(&strict).ends_with('?'));
    }
}
