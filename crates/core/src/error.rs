//! Error types for the Knowledge Hub gateway.

use thiserror::Error;

use crate::types::{ProviderAttempt, RejectionReason};

/// Result type alias using the gateway's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the gateway.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Authentication / Authorization
    // =========================================================================
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // =========================================================================
    // Admission (validation + quota)
    // =========================================================================
    #[error("Validation failed: {reason} ({detail})")]
    ValidationFailed {
        reason: RejectionReason,
        detail: String,
    },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        requests_remaining: u32,
        retry_after_secs: u64,
    },

    #[error("Budget exceeded: used {used}, limit {limit}")]
    BudgetExceeded { used: u64, limit: u64 },

    // =========================================================================
    // Model Gateway
    // =========================================================================
    #[error("Model provider error: {0}")]
    ModelProvider(String),

    #[error("All providers failed after {} attempt(s)", .attempts.len())]
    AllProvidersFailed { attempts: Vec<ProviderAttempt> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    // =========================================================================
    // Lookup / Storage
    // =========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an unauthorized error.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a forbidden error.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a provider error.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::ModelProvider(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Coarse category safe to show to callers.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::ValidationFailed { .. } => "validation_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ModelProvider(_) | Self::AllProvidersFailed { .. } => "provider_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound(_) => "not_found",
            _ => "internal_server_error",
        }
    }

    /// Whether a failover loop should move on to the next provider.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
