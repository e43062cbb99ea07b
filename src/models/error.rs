//! Error types for github-audit.
//!
//! Taxonomy:
//! - Expected failures: bad input, unknown target type, undecodable payloads
//! - Infrastructure failures: network, timeout, rate limits, file I/O
//! - Invariant violations: bugs that should never surface

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for github-audit.
#[derive(Debug, Error)]
pub enum AuditError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED: the input or environment was not what we assumed
    // ═══════════════════════════════════════════════════════════════════

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown target type: {0}")]
    UnknownTargetType(String),

    #[error("Unsupported repository type: {0}")]
    UnsupportedRepoType(String),

    #[error("No task could be configured")]
    NoTaskConfigured,

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE: remote systems or the filesystem failed us
    // ═══════════════════════════════════════════════════════════════════

    #[error("Source provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Publish to {target} failed: {message}")]
    Publish { target: String, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INVARIANT: should not happen
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Source provider (GitHub API) specific errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed for user '{0}'")]
    AuthenticationFailed(String),

    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuditError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a publish error for a named target.
    pub fn publish(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::Network(_)
                | Self::Provider(ProviderError::ApiError { status: 500..=599, .. })
        )
    }
}

/// Result type alias for github-audit.
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AuditError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(
            AuditError::Provider(ProviderError::ApiError {
                status: 502,
                message: "bad gateway".to_string(),
            })
            .is_retryable()
        );
        assert!(
            !AuditError::Provider(ProviderError::ApiError {
                status: 404,
                message: "missing".to_string(),
            })
            .is_retryable()
        );
        assert!(!AuditError::UnknownTargetType("redis".to_string()).is_retryable());
    }
}
