//! Follow-up question extraction and generation.
//!
//! Every answer ends with follow-up questions. The model is asked to emit a
//! trailing `FOLLOW_UP_QUESTIONS:` block; models being models, the block
//! arrives in many shapes or not at all. A single multi-pass parser handles
//! both the streaming and non-streaming paths: marker block first, then a
//! trailing-bullet heuristic, then a dedicated generation call, then canned
//! questions. The caller always receives the exact count it asked for.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::gateway::{ChatMessage, CompletionGateway, CompletionParams};

/// Follow-ups attached to a normal answer.
pub const FOLLOW_UP_COUNT: usize = 4;

/// Marker the prompt asks the model to emit.
pub const FOLLOW_UP_MARKER: &str = "FOLLOW_UP_QUESTIONS:";

const GENERATION_TIMEOUT: Duration = Duration::from_secs(15);

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\*\*)?follow[\s_-]*up[\s_-]+questions?\s*:?(?:\*\*)?\s*\n?")
        .expect("follow-up marker regex is valid")
});

static BULLET_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*\u{2022}]|\d+[.)])\s*").expect("bullet prefix regex is valid")
});

/// How the follow-ups were obtained from the answer text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpParse {
    /// A marker block was present and contained questions.
    Found(Vec<String>),
    /// No marker; trailing bullet questions were harvested instead.
    Heuristic(Vec<String>),
    /// Nothing usable in the text.
    None,
}

/// Split an answer into body text and parsed follow-ups.
///
/// The marker block, when present, is always removed from the body even if
/// it held no parseable questions.
pub fn split_follow_ups(answer: &str) -> (String, FollowUpParse) {
    if let Some(found) = MARKER_RE.find_iter(answer).last() {
        let body = answer[..found.start()].trim_end_matches(['-', '*', '#', ' ', '\n']);
        let block = &answer[found.end()..];
        let questions = parse_question_lines(block);
        let body = body.trim().to_string();
        if !questions.is_empty() {
            return (body, FollowUpParse::Found(questions));
        }
        return match trailing_bullet_questions(&body) {
            Some((body, questions)) => (body, FollowUpParse::Heuristic(questions)),
            None => (body, FollowUpParse::None),
        };
    }

    match trailing_bullet_questions(answer.trim()) {
        Some((body, questions)) => (body, FollowUpParse::Heuristic(questions)),
        None => (answer.trim().to_string(), FollowUpParse::None),
    }
}

/// Parse question lines out of a marker block.
fn parse_question_lines(block: &str) -> Vec<String> {
    let mut questions = Vec::new();
    for line in block.lines() {
        let stripped = BULLET_PREFIX_RE.replace(line, "");
        let question = stripped.trim().trim_matches('*').trim();
        if question.ends_with('?') && question.len() > 3 {
            questions.push(question.to_string());
            if questions.len() == FOLLOW_UP_COUNT {
                break;
            }
        }
    }
    questions
}

/// Harvest consecutive bullet questions from the end of the body.
///
/// Returns the shortened body plus the harvested questions, or `None` when
/// the tail is not question bullets or stripping them would empty the body.
fn trailing_bullet_questions(body: &str) -> Option<(String, Vec<String>)> {
    let lines: Vec<&str> = body.lines().collect();
    let mut idx = lines.len();
    let mut harvested: Vec<String> = Vec::new();

    while idx > 0 {
        let line = lines[idx - 1].trim();
        if line.is_empty() {
            if harvested.is_empty() {
                idx -= 1;
                continue;
            }
            break;
        }
        if !BULLET_PREFIX_RE.is_match(line) || !line.ends_with('?') {
            break;
        }
        let question = BULLET_PREFIX_RE.replace(line, "").trim().to_string();
        harvested.push(question);
        idx -= 1;
    }

    if harvested.is_empty() {
        return None;
    }
    harvested.reverse();
    harvested.truncate(FOLLOW_UP_COUNT);

    let remaining = lines[..idx].join("\n").trim().to_string();
    if remaining.is_empty() {
        return None;
    }
    Some((remaining, harvested))
}

/// Produce exactly `count` follow-ups through a dedicated completion call,
/// padding with canned questions when the model under-delivers or the call
/// fails. Never returns the wrong count.
pub async fn generate_follow_ups(
    completion: &dyn CompletionGateway,
    model: &str,
    question: &str,
    answer: &str,
    count: usize,
) -> Vec<String> {
    let prompt = format!(
        "A user asked: \"{}\"\n\nThe answer given was:\n{}\n\n\
         Write exactly {} short follow-up questions the user might ask next. \
         One per line, each ending with a question mark. No numbering, no preamble.",
        question,
        answer.chars().take(1500).collect::<String>(),
        count
    );
    let messages = [ChatMessage::user(prompt)];
    let params = CompletionParams::new(model)
        .with_temperature(0.7)
        .with_max_tokens(160);

    let mut questions = match tokio::time::timeout(
        GENERATION_TIMEOUT,
        completion.complete(&messages, &params),
    )
    .await
    {
        Ok(Ok(reply)) => parse_question_lines(&reply.text),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "follow-up generation failed, using canned questions");
            Vec::new()
        }
        Err(_) => {
            tracing::warn!("follow-up generation timed out, using canned questions");
            Vec::new()
        }
    };

    questions.truncate(count);
    let mut fill = fallback_follow_ups(question, count).into_iter();
    while questions.len() < count {
        if let Some(next) = fill.next() {
            if !questions.contains(&next) {
                questions.push(next);
            }
        } else {
            questions.push("What else would you like to know about this?".to_string());
        }
    }
    questions
}

/// Canned follow-ups for paths where another model call is pointless,
/// such as a degraded answer after generation already failed.
pub fn fallback_follow_ups(question: &str, count: usize) -> Vec<String> {
    let topic: String = question
        .trim_end_matches(['?', '.', '!'])
        .chars()
        .take(60)
        .collect();
    let mut questions = vec![
        format!("Can you explain more about {}?", topic.to_lowercase()),
        "What are the key takeaways here?".to_string(),
        "Are there related topics worth exploring?".to_string(),
        "Where can I find more detail on this?".to_string(),
    ];
    questions.truncate(count);
    questions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Completion, TokenStream};
    use async_trait::async_trait;

    struct ScriptedCompletion {
        reply: Option<String>,
    }

    #[async_trait]
    impl CompletionGateway for ScriptedCompletion {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> anyhow::Result<Completion> {
            match &self.reply {
                Some(text) => Ok(Completion {
                    text: text.clone(),
                    usage: Default::default(),
                }),
                None => anyhow::bail!("model offline"),
            }
        }

        async fn complete_stream(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> anyhow::Result<TokenStream> {
            anyhow::bail!("model offline")
        }
    }

    #[test]
    fn test_marker_block_parsed() {
        let answer = "Rust is a systems language.\n\nFOLLOW_UP_QUESTIONS:\n\
                      - What is ownership?\n- How does borrowing work?\n\
                      - What are lifetimes?\n- Is Rust memory safe?";
        let (body, parsed) = split_follow_ups(answer);
        assert_eq!(body, "Rust is a systems language.");
        match parsed {
            FollowUpParse::Found(questions) => {
                assert_eq!(questions.len(), 4);
                assert_eq!(questions[0], "What is ownership?");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[test]
    fn test_marker_variations_tolerated() {
        for marker in [
            "FOLLOW_UP_QUESTIONS:",
            "Follow-up Questions:",
            "**Follow up questions**",
            "FOLLOW UP QUESTIONS",
        ] {
            let answer = format!("Body text.\n\n{marker}\n1. First one?\n2) Second one?");
            let (body, parsed) = split_follow_ups(&answer);
            assert_eq!(body, "Body text.", "marker variant {marker}");
            match parsed {
                FollowUpParse::Found(questions) => assert_eq!(questions.len(), 2),
                other => panic!("expected Found for {marker}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_trailing_bullets_heuristic() {
        let answer = "The service retries failed calls.\n\n\
                      - Should retries be capped?\n- What backoff is used?";
        let (body, parsed) = split_follow_ups(answer);
        assert_eq!(body, "The service retries failed calls.");
        match parsed {
            FollowUpParse::Heuristic(questions) => {
                assert_eq!(questions.len(), 2);
                assert_eq!(questions[1], "What backoff is used?");
            }
            other => panic!("expected Heuristic, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_answer_yields_none() {
        let (body, parsed) = split_follow_ups("Just an answer with no questions.");
        assert_eq!(body, "Just an answer with no questions.");
        assert_eq!(parsed, FollowUpParse::None);
    }

    #[test]
    fn test_all_bullet_answer_not_emptied() {
        let answer = "- Is this a question?\n- Is this another?";
        let (body, parsed) = split_follow_ups(answer);
        assert_eq!(parsed, FollowUpParse::None);
        assert_eq!(body, answer);
    }

    #[test]
    fn test_marker_block_caps_at_four() {
        let answer = "Body.\n\nFOLLOW_UP_QUESTIONS:\n- One?\n- Two?\n- Three?\n- Four?\n- Five?";
        let (_, parsed) = split_follow_ups(answer);
        match parsed {
            FollowUpParse::Found(questions) => assert_eq!(questions.len(), 4),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generation_returns_exact_count() {
        let gateway = ScriptedCompletion {
            reply: Some("How does it scale?\nWhat does it cost?".to_string()),
        };
        let questions = generate_follow_ups(&gateway, "m", "what is this?", "an answer", 4).await;
        assert_eq!(questions.len(), 4);
        assert_eq!(questions[0], "How does it scale?");
    }

    #[tokio::test]
    async fn test_generation_failure_uses_canned() {
        let gateway = ScriptedCompletion { reply: None };
        let questions = generate_follow_ups(&gateway, "m", "what is rust?", "an answer", 4).await;
        assert_eq!(questions.len(), 4);
        assert!(questions.iter().all(|q| q.ends_with('?')));
    }

    #[tokio::test]
    async fn test_generation_single_for_refusal() {
        let gateway = ScriptedCompletion { reply: None };
        let questions = generate_follow_ups(&gateway, "m", "off topic?", "refusal", 1).await;
        assert_eq!(questions.len(), 1);
    }
}
