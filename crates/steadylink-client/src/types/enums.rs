/*
[INPUT]:  Lifecycle and failure taxonomy definitions
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - closed sets used by machine, classifier and callers
[UPDATE]: When a state or failure category is added
*/

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state. Exactly one is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    /// Absorbing: nothing leaves this state.
    Terminated,
}

impl ConnectionState {
    /// States in which a socket handle must be present.
    pub fn holds_socket(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Terminated
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a failure should drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Never retried.
    Fatal,
    /// Retried with backoff until the attempt budget runs out.
    Recoverable,
    /// Retried immediately without consuming budget.
    Transient,
}

impl FailureCategory {
    pub fn should_retry(self) -> bool {
        !matches!(self, FailureCategory::Fatal)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCategory::Fatal => "fatal",
            FailureCategory::Recoverable => "recoverable",
            FailureCategory::Transient => "transient",
        };
        f.write_str(name)
    }
}

/// Which failure path produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The transport failed before the open completed.
    ConnectFailed,
    /// An established episode ended abnormally.
    TransportFault,
    /// The reconnect loop ran out of attempts.
    RetriesExhausted,
}

/// What a caller-initiated disconnect does with queued messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    #[default]
    Preserve,
    Discard,
}
