//! Error types for paperpipe.
//!
//! Taxonomy follows the pipeline's failure contract:
//! - Backend failures are absorbed inside the fallback chain and never
//!   escape as errors.
//! - Checkpoint errors carry their own type so callers can distinguish
//!   "absent" from "corrupt" from "write failed".
//! - Everything else is fatal for the current run but leaves the last
//!   valid checkpoint intact.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for paperpipe.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Operator-recoverable (bad input, bad config) ─────────────────────

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ── Checkpoint and resume ────────────────────────────────────────────

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    /// An external interrupt stopped the run after a forced checkpoint.
    /// The session is resumable.
    #[error("Run interrupted; progress saved, resume with the same session id")]
    Interrupted,

    // ── Infrastructure (network, HTTP backends) ──────────────────────────

    #[error("Vision API error: {0}")]
    VisionApi(#[from] VisionApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ── Invariant violations (bugs) ──────────────────────────────────────

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from a cloud vision extraction endpoint.
#[derive(Debug, Error)]
pub enum VisionApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Document not accepted by endpoint: {0}")]
    DocumentRejected(String),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl PipelineError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is worth retrying at the transport level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Network(_)
                | Self::VisionApi(VisionApiError::RateLimited { .. })
                | Self::VisionApi(VisionApiError::ApiError {
                    status: 500..=599,
                    ..
                })
        )
    }

    /// Get retry delay hint in seconds, if the server provided one.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::VisionApi(VisionApiError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

/// Result type alias for paperpipe.
pub type Result<T> = std::result::Result<T, PipelineError>;
