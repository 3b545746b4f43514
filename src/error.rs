//! Pipeline error taxonomy
//!
//! Every stage failure is classified as either transient (the delivery is
//! negatively acknowledged and the bus redelivers) or permanent (the
//! delivery is acknowledged to stop redelivery and logged as a permanent
//! failure). The classification lives on the error itself so the
//! subscriber-loop boundary can make the ack decision mechanically.

use thiserror::Error;
use uuid::Uuid;

/// How a stage failure maps onto the acknowledgment protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Redelivery may succeed: negatively acknowledge.
    Transient,
    /// Redelivery can never succeed: acknowledge and surface the failure.
    Permanent,
}

/// Main error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid envelope: {message}")]
    InvalidEnvelope { message: String },

    #[error("Conversation {conversation_id} does not belong to user {user_id}")]
    OwnershipViolation {
        conversation_id: Uuid,
        user_id: String,
    },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(Uuid),

    #[error("Persistence error: {message}")]
    StoreError { message: String },

    #[error("Bus error: {0}")]
    BusError(#[from] crate::bus::BusError),

    #[error("Completion provider error: {0}")]
    CompletionError(#[from] crate::llm::provider::CompletionError),

    #[error("Delivery transport error: {0}")]
    TransportError(#[from] crate::transport::SendError),

    #[error("Auth service error: {0}")]
    AuthError(#[from] crate::auth::AuthError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl PipelineError {
    /// Classify the failure for the ack/nack decision at the subscriber
    /// boundary. Unclassified failures are treated conservatively as
    /// transient so messages are never silently lost.
    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::InvalidEnvelope { .. }
            | PipelineError::OwnershipViolation { .. }
            | PipelineError::ConversationNotFound(_) => Severity::Permanent,
            PipelineError::StoreError { .. }
            | PipelineError::BusError(_)
            | PipelineError::CompletionError(_)
            | PipelineError::TransportError(_)
            | PipelineError::AuthError(_)
            | PipelineError::ConfigError(_)
            | PipelineError::InternalError { .. } => Severity::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.severity() == Severity::Permanent
    }

    /// Create an invalid-envelope error
    pub fn invalid_envelope<S: Into<String>>(message: S) -> Self {
        Self::InvalidEnvelope {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn store_error<S: Into<String>>(message: S) -> Self {
        Self::StoreError {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

/// Sanitize error messages before they reach logs to avoid leaking secrets
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Redact common secret patterns
    sanitized = regex::Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+")
        .unwrap()
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        // Back off to a char boundary so multibyte content cannot panic
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_failures_are_permanent() {
        let error = PipelineError::invalid_envelope("missing field `message_id`");
        assert_eq!(error.severity(), Severity::Permanent);
        assert!(error.is_permanent());

        let error = PipelineError::OwnershipViolation {
            conversation_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
        };
        assert!(error.is_permanent());
    }

    #[test]
    fn test_infrastructure_failures_are_transient() {
        let error = PipelineError::store_error("connection refused");
        assert_eq!(error.severity(), Severity::Transient);

        let error = PipelineError::internal_error("unexpected state");
        assert_eq!(error.severity(), Severity::Transient);
    }

    #[test]
    fn test_error_message_sanitization() {
        let sanitized = sanitize_error_message("auth failed: password=secret123 token=abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "x".repeat(600);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_multibyte_boundaries() {
        let message = format!("a{}", "€".repeat(200));
        let sanitized = sanitize_error_message(&message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let message = "x".repeat(500);
        let sanitized = sanitize_error_message(&message);
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }

    #[test]
    fn test_ownership_violation_display() {
        let conversation_id = Uuid::new_v4();
        let error = PipelineError::OwnershipViolation {
            conversation_id,
            user_id: "user-9".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains(&conversation_id.to_string()));
        assert!(text.contains("user-9"));
    }
}
