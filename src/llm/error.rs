//! Typed errors for model backend requests
//!
//! Lets the driver tell a missing model apart from an unreachable server
//! without string matching.

use thiserror::Error;

/// Model backend errors with typed variants
#[derive(Debug, Error)]
pub enum LlmError {
    /// The requested model is not installed on the backend (HTTP 404)
    ///
    /// Ollama answers 404 until the model has been pulled.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Malformed request (HTTP 400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Server-side error (HTTP 5xx)
    #[error("Service error: {0}")]
    ServiceError(String),

    /// The request did not finish within the configured timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection refused, DNS failure and friends
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with something we could not decode
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Other errors not fitting the above categories
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Check if retrying the same request later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ServiceError(_) | LlmError::Timeout(_) | LlmError::Unreachable(_)
        )
    }

    /// Convert HTTP status code and error text into typed LlmError
    pub fn from_http_status(status: reqwest::StatusCode, error_text: String) -> Self {
        match status.as_u16() {
            404 => LlmError::ModelNotFound(error_text),
            400 => LlmError::BadRequest(error_text),
            500..=599 => LlmError::ServiceError(error_text),
            _ => LlmError::Other(anyhow::anyhow!("HTTP {}: {}", status, error_text)),
        }
    }

    /// Convert network/connection errors into typed LlmError
    pub fn from_network_error(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(e.to_string())
        } else if e.is_connect() {
            LlmError::Unreachable(e.to_string())
        } else if e.is_decode() {
            LlmError::InvalidResponse(e.to_string())
        } else if let Some(status) = e.status() {
            Self::from_http_status(status, e.to_string())
        } else {
            LlmError::Other(e.into())
        }
    }
}
