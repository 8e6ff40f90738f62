//! Answer composition: prompt assembly, generation, follow-up extraction,
//! and citation validation against the retrieved sources.

pub mod citations;
pub mod engine;
pub mod followup;
pub mod history;
pub mod prompts;

pub use citations::{
    extract_citations, validate_citations, AnswerSegment, Citation, CitationKind, CitationReport,
};
pub use engine::{AnswerEngine, AnswerStream, GeneratedAnswer};
pub use followup::{
    fallback_follow_ups, generate_follow_ups, split_follow_ups, FollowUpParse, FOLLOW_UP_COUNT,
};
pub use history::{compress_history, format_history, CompressedHistory};
pub use prompts::AnswerMode;
