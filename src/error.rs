//! Error types for sensor ingestion.
//!
//! Every failure kind is a strongly typed `thiserror` enum so callers can
//! decide on policy (fatal, retry, drop) by matching instead of string parsing.

use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid topic template '{template}': {reason}")]
    InvalidTemplate {
        template: String,
        reason: String,
    },

    #[error("No topic templates configured")]
    NoTemplates,

    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting {
        field: String,
        reason: String,
    },

    #[error("Failed to read config file '{path}': {message}")]
    Read {
        path: String,
        message: String,
    },

    #[error("Failed to parse config: {message}")]
    Parse {
        message: String,
    },
}

/// Payload parse errors. Logged and dropped, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Payload is not valid JSON: {message}")]
    InvalidJson {
        message: String,
    },

    #[error("Payload must be a JSON object")]
    NotAnObject,

    #[error("Payload has no 'time' field")]
    MissingTime,

    #[error("'time' value '{value}' is not an integer")]
    NonNumericTime {
        value: String,
    },

    #[error("'time' value '{value}' has {digits} digits, expected 10 (seconds) or 13 (milliseconds)")]
    UnsupportedTimePrecision {
        value: String,
        digits: usize,
    },

    #[error("'time' value '{value}' is out of range")]
    TimeOutOfRange {
        value: String,
    },

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Transport errors for the broker connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Subscribe to '{filter}' failed: {message}")]
    SubscribeFailed {
        filter: String,
        message: String,
    },

    #[error("Acknowledge failed: {message}")]
    AckFailed {
        message: String,
    },

    #[error("Disconnect failed: {message}")]
    DisconnectFailed {
        message: String,
    },

    #[error("Transport is closed")]
    Closed,
}

/// Errors raised by a sensor store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Connection failed.
    #[error("Storage connection error: {0}")]
    Connection(String),

    /// The change feed ended or broke.
    #[error("Change feed interrupted: {0}")]
    FeedInterrupted(String),
}

/// Top-level error type for sensor ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task failed: {message}")]
    Task {
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl IngestError {
    /// Creates a task error (a dispatched sub-task panicked or was aborted).
    #[must_use]
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if the operation stopped because of a stop signal.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Parse(_) | Self::Cancelled => false,
            Self::Transport(e) => !matches!(e, TransportError::Closed),
            Self::Store(_) | Self::Task { .. } => true,
        }
    }
}

/// Result type alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;
