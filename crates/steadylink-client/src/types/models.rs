/*
[INPUT]:  Payloads from callers, failure details from the transport boundary
[OUTPUT]: FailureRecord, Payload, OutboundMessage and SocketHandle models
[POS]:    Data layer - value types carried between components
[UPDATE]: When record fields or payload variants change
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::enums::{ConnectionState, FailureCategory, FailureKind};

/// Opaque message body. The client never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(value)
    }
}

/// A payload accepted by `send`, stamped with its delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub payload: Payload,
    pub enqueued_at: DateTime<Utc>,
    pub sequence: u64,
}

/// Classified failure surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Close code, or 0 when the transport gave none.
    pub code: i32,
    pub category: FailureCategory,
    pub kind: FailureKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        code: i32,
        category: FailureCategory,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            category,
            kind,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} ({}, code {}): {}",
            self.kind, self.category, self.code, self.message
        )
    }
}

/// Point-in-time counters for one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub state: ConnectionState,
    /// Messages held, including writes the transport has not confirmed.
    pub queue_depth: usize,
    pub in_flight: usize,
    pub attempt_count: u32,
    pub last_error: Option<FailureRecord>,
    pub messages_accepted: u64,
    /// Writes confirmed by the transport.
    pub messages_written: u64,
    /// Unconfirmed writes put back in line when an episode ended.
    pub messages_requeued: u64,
    pub messages_received: u64,
    pub reconnect_attempts: u64,
    pub episodes: u64,
    pub failures: u64,
}

/// Identifies one open attempt and the episode that follows it.
///
/// Allocated fresh for every open, so callbacks from a previous episode can be
/// told apart and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketHandle(pub u64);

impl fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}
