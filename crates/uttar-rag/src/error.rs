//! Error taxonomy for the question-answering core.
//!
//! Only four failure classes leave this crate: bad caller input, an upstream
//! gateway that stayed down through retry and fallback, a missing collaborator
//! configuration, and a terminal generation failure. Optional pipeline stages
//! never surface errors; they log and pass their input through unchanged.

use thiserror::Error;

use crate::health::ServiceKind;

/// Result type for pipeline operations.
pub type RagResult<T> = std::result::Result<T, RagError>;

/// Errors surfaced to callers of the pipeline.
#[derive(Error, Debug)]
pub enum RagError {
    /// Bad caller input. Surfaced immediately, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An external gateway failed after retry and fallback were exhausted.
    #[error("{service} request failed: {message}")]
    Upstream {
        service: ServiceKind,
        message: String,
    },

    /// A collaborator the request needs is not configured.
    #[error("not configured: {0}")]
    Configuration(String),

    /// The completion gateway produced nothing and no fallback content existed.
    #[error("answer generation failed: {0}")]
    Generation(String),
}

impl RagError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn upstream(service: ServiceKind, message: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Machine-readable code for API error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Upstream { .. } => "UPSTREAM_SERVICE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Generation(_) => "GENERATION_FAILED",
        }
    }

    /// Whether retrying the same call could ever succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Generation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RagError::validation("question is empty").code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            RagError::upstream(ServiceKind::Completion, "timeout").code(),
            "UPSTREAM_SERVICE_ERROR"
        );
        assert_eq!(
            RagError::configuration("vector index missing").code(),
            "CONFIGURATION_ERROR"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(RagError::upstream(ServiceKind::Embedding, "503").is_retryable());
        assert!(!RagError::validation("too long").is_retryable());
        assert!(!RagError::configuration("no index").is_retryable());
    }

    #[test]
    fn test_display_includes_service() {
        let err = RagError::upstream(ServiceKind::WebSearch, "connection refused");
        let text = err.to_string();
        assert!(text.contains("web-search"));
        assert!(text.contains("connection refused"));
    }
}
