//! Completion provider abstraction
//!
//! The understanding stage renders replies through this seam so tests can
//! substitute a deterministic provider. Provider failures are transient
//! from the pipeline's point of view (the envelope is nacked and retried).

use async_trait::async_trait;
use thiserror::Error;

/// Completion provider errors
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Completion timed out after {0} seconds")]
    Timeout(u64),
}

/// Completion provider trait for dependency injection and testing
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name (e.g., "openai")
    fn name(&self) -> &str;

    /// Generate a reply to the user's message.
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_error_display() {
        let errors = vec![
            CompletionError::NotConfigured("test".to_string()),
            CompletionError::AuthenticationFailed("test".to_string()),
            CompletionError::RequestFailed("test".to_string()),
            CompletionError::InvalidResponse("test".to_string()),
            CompletionError::NetworkError("test".to_string()),
            CompletionError::ApiError("test".to_string()),
            CompletionError::Timeout(30),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
