//! Error types for snep-exchange.

use thiserror::Error;

/// Main error type for all exchange engine operations.
#[derive(Debug, Error)]
pub enum SnepError {
    /// The handle does not name a live registration or connection.
    #[error("Invalid handle")]
    InvalidHandle,

    /// The handle is live but the call is not legal for its role or lifecycle.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// Every connection record in the fixed pool is in use.
    #[error("No free connection record")]
    ResourceExhausted,

    /// A connect was attempted before the link was activated.
    #[error("Link is not active")]
    LinkInactive,

    /// Argument rejected before anything was posted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The data link refused an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error (malformed header, illegal opcode, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration could not be parsed or is out of range.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON deserialization error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The engine task has shut down.
    #[error("Engine closed")]
    EngineClosed,
}

/// Result type alias using SnepError.
pub type Result<T> = std::result::Result<T, SnepError>;
