/*
[INPUT]:  Mutations issued by the state machine on every transition
[OUTPUT]: Session state snapshot (attempts, last error, timestamps, socket handle)
[POS]:    Core - mutable session record owned by exactly one machine
[UPDATE]: When session bookkeeping fields change
*/

use chrono::{DateTime, Utc};

use crate::types::{ConnectionState, FailureRecord, SocketHandle};

#[derive(Debug, Clone, Default)]
pub struct Context {
    pub state: ConnectionState,
    /// Consecutive reconnect attempts since the last successful open.
    pub attempt_count: u32,
    pub last_error: Option<FailureRecord>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub socket_handle: Option<SocketHandle>,
    pub pending_close_reason: Option<String>,
    /// Target of the most recent caller `Connect`, reused by reconnects.
    pub target: Option<String>,
    /// Set while the pending retry was caused by a transient failure and is
    /// not charged against the attempt budget.
    pub free_retry: bool,
    /// The last failure was transient and no open has succeeded since.
    pub transient_streak: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bookkeeping for a successful open.
    pub fn mark_connected(&mut self) {
        self.attempt_count = 0;
        self.last_error = None;
        self.connected_at = Some(Utc::now());
        self.free_retry = false;
        self.transient_streak = false;
    }

    /// Bookkeeping for the end of an episode or a failed open.
    pub fn mark_disconnected(&mut self) {
        self.socket_handle = None;
        self.disconnected_at = Some(Utc::now());
    }

    pub fn record_error(&mut self, record: FailureRecord) {
        self.last_error = Some(record);
    }

    /// True when `handle` belongs to the current episode.
    pub fn owns(&self, handle: SocketHandle) -> bool {
        self.socket_handle == Some(handle)
    }

    /// Check the structural invariants. Returns a description of the first
    /// violation found.
    pub fn check_invariants(&self, max_attempts: u32) -> Result<(), String> {
        if self.socket_handle.is_some() != self.state.holds_socket() {
            return Err(format!(
                "socket handle {:?} inconsistent with state {}",
                self.socket_handle, self.state
            ));
        }
        if self.attempt_count > max_attempts {
            return Err(format!(
                "attempt_count {} exceeds max_attempts {}",
                self.attempt_count, max_attempts
            ));
        }
        Ok(())
    }
}
