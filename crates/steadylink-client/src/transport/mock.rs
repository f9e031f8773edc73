/*
[INPUT]:  Open requests from the driver, test decisions (accept/reject/close/fail)
[OUTPUT]: Scripted transport episodes fully controlled by the caller
[POS]:    Transport layer - in-memory transport for tests and demos
[UPDATE]: When the Transport contract changes
*/

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{LinkCommand, LinkIo, Transport, TransportError, TransportEvent};
use crate::types::{Payload, SocketHandle};

/// Transport whose every open attempt is handed to a [`MockController`].
#[derive(Debug, Clone)]
pub struct MockTransport {
    opens: mpsc::UnboundedSender<MockConnection>,
}

/// Receives open attempts made through the paired [`MockTransport`].
#[derive(Debug)]
pub struct MockController {
    opens: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockTransport {
    pub fn new() -> (Self, MockController) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { opens: tx }, MockController { opens: rx })
    }
}

impl MockController {
    /// Next open attempt, in the order the driver issued them.
    pub async fn next_open(&mut self) -> Option<MockConnection> {
        self.opens.recv().await
    }

    /// Open attempt already issued, if any.
    pub fn try_next_open(&mut self) -> Option<MockConnection> {
        self.opens.try_recv().ok()
    }
}

/// One open attempt and, once accepted, the episode behind it.
///
/// A write counts as delivered only when the test takes it with
/// [`next_command`](Self::next_command) or [`next_write`](Self::next_write);
/// a connection nobody reads from behaves like a peer that stopped reading.
#[derive(Debug)]
pub struct MockConnection {
    pub handle: SocketHandle,
    pub target: String,
    events: mpsc::Sender<TransportEvent>,
    commands: mpsc::Receiver<LinkCommand>,
    decision: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl MockConnection {
    /// Complete the handshake.
    pub fn accept(&mut self) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(Ok(()));
        }
    }

    /// Fail the handshake.
    pub fn reject(&mut self, error: TransportError) {
        if let Some(decision) = self.decision.take() {
            let _ = decision.send(Err(error));
        }
    }

    /// Next command the driver sent over this link. Writes are acknowledged.
    pub async fn next_command(&mut self) -> Option<LinkCommand> {
        let command = self.commands.recv().await?;
        if let LinkCommand::Write { sequence, .. } = &command {
            let _ = self
                .events
                .send(TransportEvent::Written {
                    handle: self.handle,
                    sequence: *sequence,
                })
                .await;
        }
        Some(command)
    }

    /// Next written payload, skipping close commands.
    pub async fn next_write(&mut self) -> Option<Payload> {
        loop {
            match self.next_command().await? {
                LinkCommand::Write { payload, .. } => return Some(payload),
                LinkCommand::Close { .. } => continue,
            }
        }
    }

    /// Commands sent but not yet taken.
    pub fn backlog(&self) -> usize {
        self.commands.len()
    }

    /// Inbound message from the peer.
    pub async fn deliver(&self, payload: impl Into<Payload>) {
        let _ = self
            .events
            .send(TransportEvent::Message {
                handle: self.handle,
                payload: payload.into(),
            })
            .await;
    }

    /// Peer closed the connection.
    pub async fn close(&self, code: Option<i32>, reason: Option<&str>) {
        let _ = self
            .events
            .send(TransportEvent::Closed {
                handle: self.handle,
                code,
                reason: reason.map(str::to_string),
            })
            .await;
    }

    /// One-off socket error.
    pub async fn fail(&self, message: &str) {
        let _ = self
            .events
            .send(TransportEvent::Failed {
                handle: self.handle,
                message: message.to_string(),
            })
            .await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        handle: SocketHandle,
        target: &str,
        io: LinkIo,
    ) -> Result<Option<JoinHandle<()>>, TransportError> {
        let (decision_tx, decision_rx) = oneshot::channel();

        self.opens
            .send(MockConnection {
                handle,
                target: target.to_string(),
                events: io.events,
                commands: io.commands,
                decision: Some(decision_tx),
            })
            .map_err(|_| TransportError::Io("mock controller dropped".to_string()))?;

        match decision_rx.await {
            Ok(Ok(())) => Ok(None),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Io("mock connection dropped".to_string())),
        }
    }
}
