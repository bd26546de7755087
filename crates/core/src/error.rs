//! Error types for the Sleuth domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] is what the agent
//! loop surfaces to callers once every retry, fallback, and compaction option
//! is exhausted.

use thiserror::Error;

/// The top-level error type for all Sleuth operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("All providers failed after {attempts} attempt(s); last error: {last}")]
    ChainExhausted {
        attempts: u32,
        failures: Vec<String>,
        last: ProviderError,
    },

    #[error("Context window overflow: {0}")]
    ContextOverflow(String),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Schema / parameter validation ---
    #[error("Validation error: {0}")]
    Validation(String),

    // --- Caller cancellation ---
    #[error("Request cancelled")]
    Cancelled,

    // --- Delegation ---
    #[error("Delegation scheduler saturated: {0}")]
    SchedulerSaturated(String),

    #[error("Invalid sub-agent output: {0}")]
    InvalidSubagentOutput(String),

    // --- Storage ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this failure means the prompt no longer fits the model's window.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Provider(e) => e.is_context_overflow(),
            Error::ChainExhausted { last, .. } => last.is_context_overflow(),
            _ => false,
        }
    }

    /// Whether this failure was caused by caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Provider(ProviderError::Cancelled))
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Context length exceeded: {0}")]
    ContextOverflow(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Transient failures are retried against the same provider and, once
    /// retries run out, move the chain to the next provider.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::StreamInterrupted(_) => true,
            ProviderError::ApiError { status_code, .. } => {
                *status_code >= 500 || *status_code == 408 || *status_code == 429
            }
            _ => false,
        }
    }

    pub fn is_context_overflow(&self) -> bool {
        matches!(self, ProviderError::ContextOverflow(_))
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name} — {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O failed: {0}")]
    Io(String),

    #[error("Corrupt history record: {0}")]
    Corrupt(String),
}
