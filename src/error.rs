//! Centralized error types for the activator

use thiserror::Error;

/// Activator error types
#[derive(Debug, Error)]
pub enum ActivatorError {
    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// No revision is known under the requested key
    #[error("Revision not found: {0}")]
    RevisionNotFound(String),

    /// The revision was deleted while the request was queued or routed
    #[error("Revision is gone: {0}")]
    RevisionGone(String),

    /// The activator received the drain signal and refuses new work
    #[error("Activator is draining")]
    Draining,

    /// The per-revision waiter queue is full
    #[error("Request queue overflow for revision {0}")]
    Overload(String),

    /// The selected pod refused or reset the connection before any
    /// response bytes were observed. Eligible for a fresh-pod retry.
    #[error("Pod unavailable: {0}")]
    PodUnavailable(String),

    /// HTTP request or response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// The stat sink is disconnected or shut down
    #[error("Stat sink unavailable: {0}")]
    SinkUnavailable(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ActivatorError {
    /// Whether the throttler may release the slot and retry the request
    /// against a freshly selected pod.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::PodUnavailable(_))
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, ActivatorError>;
