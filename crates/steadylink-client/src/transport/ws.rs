/*
[INPUT]:  WebSocket URL, outbound link commands, optional heartbeat interval
[OUTPUT]: Text/binary messages and close codes reported as TransportEvents
[POS]:    Transport layer - tokio-tungstenite WebSocket adapter
[UPDATE]: When changing socket handling, close mapping or heartbeats
*/

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info};

use super::{LinkCommand, LinkIo, Transport, TransportError, TransportEvent};
use crate::classifier::{MESSAGE_TOO_BIG, PROTOCOL_ERROR};
use crate::types::{Payload, SocketHandle};

const RAW_LOG_MAX_BYTES: usize = 256;

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    heartbeat: Option<Duration>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a ping every `interval` while an episode is open.
    pub fn with_heartbeat(heartbeat: Option<Duration>) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        handle: SocketHandle,
        target: &str,
        io: LinkIo,
    ) -> Result<Option<JoinHandle<()>>, TransportError> {
        let (ws_stream, _response) = connect_async(target).await.map_err(open_error)?;
        info!(%handle, %target, "websocket handshake complete");

        let (mut write, mut read) = ws_stream.split();
        let LinkIo {
            commands: mut command_rx,
            events,
        } = io;
        let mut heartbeat = self.heartbeat.map(heartbeat_interval);

        let task = tokio::spawn(async move {
            let outcome = loop {
                tokio::select! {
                    command = command_rx.recv() => {
                        match command {
                            Some(LinkCommand::Write { sequence, payload }) => {
                                // Resolves once the frame is flushed; stalls while the peer is not reading.
                                if let Err(err) = write.send(to_ws_message(payload)).await {
                                    break Some(read_error_event(handle, err));
                                }
                                if events.send(TransportEvent::Written { handle, sequence }).await.is_err() {
                                    break None;
                                }
                            }
                            Some(LinkCommand::Close { code, reason }) => {
                                let frame = CloseFrame {
                                    code: CloseCode::from(u16::try_from(code).unwrap_or(1000)),
                                    reason: reason.unwrap_or_default().into(),
                                };
                                debug!(%handle, code, "sending close frame");
                                if let Err(err) = write.send(WsMessage::Close(Some(frame))).await {
                                    break Some(read_error_event(handle, err));
                                }
                            }
                            None => {
                                // Released by the driver: close quietly.
                                let _ = write.send(WsMessage::Close(None)).await;
                                break None;
                            }
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Close(frame))) => {
                                let (code, reason) = match frame {
                                    Some(frame) => (
                                        Some(i32::from(u16::from(frame.code))),
                                        Some(frame.reason.to_string()),
                                    ),
                                    None => (None, None),
                                };
                                let _ = write.send(WsMessage::Close(None)).await;
                                break Some(TransportEvent::Closed { handle, code, reason });
                            }
                            Some(Ok(WsMessage::Text(text))) => {
                                let payload = Payload::Text(text.to_string());
                                if events.send(TransportEvent::Message { handle, payload }).await.is_err() {
                                    break None;
                                }
                            }
                            Some(Ok(WsMessage::Binary(bytes))) => {
                                let payload = Payload::Binary(bytes.to_vec());
                                if events.send(TransportEvent::Message { handle, payload }).await.is_err() {
                                    break None;
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                break Some(read_error_event(handle, err));
                            }
                            None => {
                                break Some(TransportEvent::Closed {
                                    handle,
                                    code: None,
                                    reason: Some("stream ended".to_string()),
                                });
                            }
                        }
                    }
                    _ = next_tick(&mut heartbeat) => {
                        if let Err(err) = write.send(WsMessage::Ping(Default::default())).await {
                            break Some(read_error_event(handle, err));
                        }
                    }
                }
            };

            if let Some(event) = outcome {
                debug!(%handle, ?event, "websocket episode ended");
                let _ = events.send(event).await;
            }
        });

        Ok(Some(task))
    }
}

fn heartbeat_interval(period: Duration) -> Interval {
    tokio::time::interval_at(Instant::now() + period, period)
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn to_ws_message(payload: Payload) -> WsMessage {
    match payload {
        Payload::Text(text) => WsMessage::Text(text.into()),
        Payload::Binary(bytes) => WsMessage::Binary(bytes.into()),
    }
}

fn open_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => TransportError::Rejected {
            status: response.status().as_u16(),
        },
        WsError::Url(err) => TransportError::InvalidTarget(err.to_string()),
        WsError::Io(err) => TransportError::Io(err.to_string()),
        WsError::Protocol(err) => TransportError::Protocol(err.to_string()),
        other => TransportError::Io(other.to_string()),
    }
}

/// Map a mid-episode socket error to the callback the machine classifies.
fn read_error_event(handle: SocketHandle, err: WsError) -> TransportEvent {
    let message = truncate_for_log(&err.to_string(), RAW_LOG_MAX_BYTES);
    let code = match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => None,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => None,
        WsError::Protocol(_) => Some(PROTOCOL_ERROR),
        WsError::Capacity(_) => Some(MESSAGE_TOO_BIG),
        WsError::Io(_) => {
            return TransportEvent::Failed { handle, message };
        }
        _ => None,
    };
    TransportEvent::Closed {
        handle,
        code,
        reason: Some(message),
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}
