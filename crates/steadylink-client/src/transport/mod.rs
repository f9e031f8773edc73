/*
[INPUT]:  Open requests from the driver, outbound link commands
[OUTPUT]: Transport callbacks (opened, written, message, closed, failed) tagged by socket handle
[POS]:    Transport seam - decouples the machine from any concrete socket
[UPDATE]: When adding a transport or changing the callback contract
*/

pub mod mock;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::classifier::{INTERNAL_ERROR, POLICY_VIOLATION, PROTOCOL_ERROR};
use crate::machine::MachineEvent;
use crate::types::{Payload, SocketHandle};

pub use mock::{MockConnection, MockController, MockTransport};
pub use ws::WsTransport;

/// Callback from a transport, always tagged with the episode it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Every write up to and including `sequence` reached the socket.
    Written {
        handle: SocketHandle,
        sequence: u64,
    },
    Message {
        handle: SocketHandle,
        payload: Payload,
    },
    Closed {
        handle: SocketHandle,
        code: Option<i32>,
        reason: Option<String>,
    },
    Failed {
        handle: SocketHandle,
        message: String,
    },
}

impl From<TransportEvent> for MachineEvent {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Written { handle, sequence } => {
                MachineEvent::TransportWritten { handle, sequence }
            }
            TransportEvent::Message { handle, payload } => {
                MachineEvent::TransportMessage { handle, payload }
            }
            TransportEvent::Closed {
                handle,
                code,
                reason,
            } => MachineEvent::TransportClosed {
                handle,
                code,
                reason,
            },
            TransportEvent::Failed { handle, message } => {
                MachineEvent::TransportFailed { handle, message }
            }
        }
    }
}

/// Instruction for an open link, processed in the order sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Write one payload, then report `TransportEvent::Written`.
    Write { sequence: u64, payload: Payload },
    Close { code: i32, reason: Option<String> },
}

/// Channels a transport is handed for one episode.
#[derive(Debug)]
pub struct LinkIo {
    /// Bounded; the driver never has more unacknowledged writes than slots.
    pub commands: mpsc::Receiver<LinkCommand>,
    pub events: mpsc::Sender<TransportEvent>,
}

/// Driver-side end of one open episode.
///
/// Dropping the link closes the command channel; the transport then closes
/// the socket without reporting back.
#[derive(Debug)]
pub struct TransportLink {
    commands: mpsc::Sender<LinkCommand>,
    task: Option<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(commands: mpsc::Sender<LinkCommand>, task: Option<JoinHandle<()>>) -> Self {
        Self { commands, task }
    }

    /// Queue a command without waiting. Returns false if the channel is full
    /// or the transport side is gone.
    pub fn command(&self, command: LinkCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    /// Free command slots.
    pub fn capacity(&self) -> usize {
        self.commands.capacity()
    }

    /// Stop the I/O task right away instead of letting it wind down.
    pub fn abort(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Failure while opening a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("handshake rejected with HTTP status {status}")]
    Rejected { status: u16 },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("socket error: {0}")]
    Socket(String),
}

impl TransportError {
    /// Translate into the callback the machine classifies.
    pub fn into_event(self, handle: SocketHandle) -> TransportEvent {
        let message = self.to_string();
        let code = match self {
            TransportError::Timeout { .. } | TransportError::Io(_) => None,
            TransportError::Rejected { status } if status >= 500 => Some(INTERNAL_ERROR),
            // Throttled: unknown code, retried with backoff.
            TransportError::Rejected { status: 429 } => Some(1013),
            TransportError::Rejected { .. } => Some(POLICY_VIOLATION),
            TransportError::InvalidTarget(_) | TransportError::Protocol(_) => Some(PROTOCOL_ERROR),
            TransportError::Socket(_) => {
                return TransportEvent::Failed { handle, message };
            }
        };
        TransportEvent::Closed {
            handle,
            code,
            reason: Some(message),
        }
    }
}

/// A way of opening duplex connections.
///
/// `open` resolves once the handshake completes, returning the episode's I/O
/// task if it spawned one. Afterwards the transport takes commands from
/// `io.commands` in order, confirms each write, and reports inbound messages
/// and the end of the episode through `io.events`, tagging everything with
/// `handle`. A closed command channel means the driver released the link.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(
        &self,
        handle: SocketHandle,
        target: &str,
        io: LinkIo,
    ) -> Result<Option<JoinHandle<()>>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify_signal;
    use crate::classifier::FailureSignal;
    use crate::types::FailureCategory;

    fn category_of(err: TransportError) -> FailureCategory {
        match err.into_event(SocketHandle(1)) {
            TransportEvent::Closed { code, .. } => classify_signal(FailureSignal::Close { code }),
            TransportEvent::Failed { .. } => classify_signal(FailureSignal::SocketError),
            TransportEvent::Written { .. } | TransportEvent::Message { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_open_errors_map_to_categories() {
        assert_eq!(category_of(TransportError::Timeout { ms: 500 }), FailureCategory::Recoverable);
        assert_eq!(category_of(TransportError::Io("refused".into())), FailureCategory::Recoverable);
        assert_eq!(category_of(TransportError::Rejected { status: 503 }), FailureCategory::Recoverable);
        assert_eq!(category_of(TransportError::Rejected { status: 429 }), FailureCategory::Recoverable);
        assert_eq!(category_of(TransportError::Rejected { status: 401 }), FailureCategory::Fatal);
        assert_eq!(category_of(TransportError::Protocol("bad".into())), FailureCategory::Fatal);
        assert_eq!(category_of(TransportError::Socket("reset".into())), FailureCategory::Transient);
    }

    fn write(sequence: u64) -> LinkCommand {
        LinkCommand::Write {
            sequence,
            payload: Payload::from("x"),
        }
    }

    #[test]
    fn test_link_command_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let link = TransportLink::new(tx, None);
        assert!(link.command(write(1)));
        drop(rx);
        assert!(!link.command(write(2)));
    }

    #[test]
    fn test_link_command_never_blocks_when_full() {
        let (tx, mut rx) = mpsc::channel(2);
        let link = TransportLink::new(tx, None);
        assert!(link.command(write(1)));
        assert!(link.command(write(2)));
        assert_eq!(link.capacity(), 0);
        assert!(!link.command(write(3)));

        assert_eq!(rx.try_recv().ok(), Some(write(1)));
        assert_eq!(link.capacity(), 1);
    }
}
