//! Conversation-history compression.
//!
//! Long conversations do not fit the history token slice, so older turns are
//! collapsed into a rule-based rolling summary (question topics plus named
//! entities) while the most recent turns stay verbatim. No model call is
//! involved; history is continuity context, not a source of facts.

use crate::gateway::ChatMessage;

/// Turns kept verbatim at the end of the history.
pub const RECENT_TURNS: usize = 5;

const MAX_TOPICS: usize = 5;
const MAX_ENTITIES: usize = 15;
const TOPIC_CHARS: usize = 80;

/// Older turns squeezed into a summary, recent turns untouched.
#[derive(Debug, Clone)]
pub struct CompressedHistory {
    pub summary: Option<String>,
    pub recent: Vec<ChatMessage>,
}

/// Compress a conversation to a summary plus the last `max_recent` turns.
pub fn compress_history(messages: &[ChatMessage], max_recent: usize) -> CompressedHistory {
    if messages.len() <= max_recent {
        return CompressedHistory {
            summary: None,
            recent: messages.to_vec(),
        };
    }

    let split_at = messages.len() - max_recent;
    let (older, recent) = messages.split_at(split_at);

    let mut topics: Vec<String> = Vec::new();
    let mut entities: Vec<String> = Vec::new();

    for message in older {
        if message.role.eq_ignore_ascii_case("user") && topics.len() < MAX_TOPICS {
            let topic: String = message.content.chars().take(TOPIC_CHARS).collect();
            let topic = topic.trim().to_string();
            if !topic.is_empty() {
                topics.push(topic);
            }
        }

        for word in message.content.split_whitespace() {
            let clean = word.trim_matches(|c: char| !c.is_alphanumeric());
            if clean.len() > 2
                && clean.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
                && !clean.chars().all(|c| c.is_uppercase())
                && !entities.contains(&clean.to_string())
            {
                entities.push(clean.to_string());
            }
        }
    }

    entities.sort();
    entities.dedup();
    entities.truncate(MAX_ENTITIES);

    let mut parts = Vec::new();
    if !topics.is_empty() {
        parts.push(format!("Earlier questions: {}", topics.join("; ")));
    }
    if !entities.is_empty() {
        parts.push(format!("Names mentioned: {}", entities.join(", ")));
    }

    CompressedHistory {
        summary: if parts.is_empty() {
            None
        } else {
            Some(parts.join(". ") + ".")
        },
        recent: recent.to_vec(),
    }
}

/// Render compressed history for the prompt. Empty history renders empty.
pub fn format_history(history: &CompressedHistory) -> String {
    if history.summary.is_none() && history.recent.is_empty() {
        return String::new();
    }

    let mut text =
        String::from("Conversation history (topic continuity only, never a source of facts):\n");
    if let Some(summary) = &history.summary {
        text.push_str("Summary: ");
        text.push_str(summary);
        text.push_str("\n\nRecent turns:\n");
    }
    for message in &history.recent {
        text.push_str(&message.role);
        text.push_str(": ");
        text.push_str(&message.content);
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .flat_map(|i| {
                vec![
                    ChatMessage::user(format!("Question {i} about Kubernetes?")),
                    ChatMessage::assistant(format!("Answer {i}.")),
                ]
            })
            .collect()
    }

    #[test]
    fn test_short_history_kept_verbatim() {
        let messages = turns(2);
        let compressed = compress_history(&messages, RECENT_TURNS);
        assert!(compressed.summary.is_none());
        assert_eq!(compressed.recent.len(), 4);
    }

    #[test]
    fn test_long_history_summarized() {
        let messages = turns(8);
        let compressed = compress_history(&messages, RECENT_TURNS);
        assert_eq!(compressed.recent.len(), RECENT_TURNS);
        let summary = compressed.summary.unwrap();
        assert!(summary.contains("Earlier questions:"));
        assert!(summary.contains("Kubernetes"));
        assert_eq!(compressed.recent.last().unwrap().content, "Answer 7.");
    }

    #[test]
    fn test_format_empty_history() {
        let compressed = compress_history(&[], RECENT_TURNS);
        assert_eq!(format_history(&compressed), "");
    }

    #[test]
    fn test_format_includes_roles() {
        let messages = vec![
            ChatMessage::user("How do pods restart?"),
            ChatMessage::assistant("Via the kubelet."),
        ];
        let compressed = compress_history(&messages, RECENT_TURNS);
        let text = format_history(&compressed);
        assert!(text.contains("user: How do pods restart?"));
        assert!(text.contains("assistant: Via the kubelet."));
        assert!(text.starts_with("Conversation history"));
    }
}
