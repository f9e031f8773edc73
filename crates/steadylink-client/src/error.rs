/*
[INPUT]:  Error sources (queue capacity, classified failures, config, URL, IO)
[OUTPUT]: Structured error types with retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or improving error messages
*/

use thiserror::Error;

use crate::types::{ConnectionState, FailureCategory, FailureKind, FailureRecord};

/// Main error type for the connection client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Outbound queue is at capacity; the caller must back off
    #[error("Outbound queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Opening the transport failed
    #[error("Connect failed: {0}")]
    ConnectFailed(FailureRecord),

    /// An established connection failed
    #[error("Transport fault: {0}")]
    TransportFault(FailureRecord),

    /// Reconnection gave up after using the whole attempt budget
    #[error("Retries exhausted: {0}")]
    RetriesExhausted(FailureRecord),

    /// Event has no transition defined for the current state
    #[error("No transition for {event} in state {state}")]
    InvalidTransition {
        state: ConnectionState,
        event: &'static str,
    },

    /// Client was terminated and accepts no more work
    #[error("Client terminated")]
    Terminated,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connect target is not a valid URL
    #[error("Invalid target: {0}")]
    InvalidTarget(#[from] url::ParseError),

    /// Reading configuration failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ClientError {
    /// Check if the client will recover from this on its own
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::ConnectFailed(record) | ClientError::TransportFault(record) => {
                record.category.should_retry()
            }
            ClientError::QueueFull { .. } => true,
            _ => false,
        }
    }

    /// Failure category, for errors that carry a classified record
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            ClientError::ConnectFailed(record) | ClientError::TransportFault(record) => {
                Some(record.category)
            }
            ClientError::RetriesExhausted(_) => Some(FailureCategory::Fatal),
            _ => None,
        }
    }

    /// True when the caller has to act (reconnect, fix config) before progress resumes
    pub fn needs_caller_action(&self) -> bool {
        matches!(
            self,
            ClientError::RetriesExhausted(_)
                | ClientError::Terminated
                | ClientError::Config(_)
                | ClientError::InvalidTarget(_)
        ) || self.category() == Some(FailureCategory::Fatal)
    }
}

impl From<FailureRecord> for ClientError {
    fn from(record: FailureRecord) -> Self {
        match record.kind {
            FailureKind::ConnectFailed => ClientError::ConnectFailed(record),
            FailureKind::TransportFault => ClientError::TransportFault(record),
            FailureKind::RetriesExhausted => ClientError::RetriesExhausted(record),
        }
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
