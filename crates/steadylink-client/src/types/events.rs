/*
[INPUT]:  State machine transitions, inbound payloads, send acceptance, failures
[OUTPUT]: ClientEvent values delivered to subscribers
[POS]:    Data layer - caller-facing event contract
[UPDATE]: When subscribers need a new notification
*/

use serde::{Deserialize, Serialize};

use super::enums::ConnectionState;
use super::models::{FailureRecord, Payload};

/// Notification delivered to every subscriber, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    MessageReceived {
        payload: Payload,
    },
    SendAccepted {
        sequence: u64,
    },
    Error {
        record: FailureRecord,
    },
}

impl ClientEvent {
    /// Target state if this is a transition.
    pub fn entered_state(&self) -> Option<ConnectionState> {
        match self {
            ClientEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        }
    }
}
