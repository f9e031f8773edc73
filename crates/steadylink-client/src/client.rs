/*
[INPUT]:  Caller commands (connect/send/disconnect/terminate) and transport callbacks
[OUTPUT]: Lifecycle events via broadcast, current state and stats via watch
[POS]:    Client layer - async driver executing state machine effects
[UPDATE]: When changing the caller API, timer handling or effect execution
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::machine::{ConnectionMachine, Effect, MachineEvent};
use crate::transport::{
    LinkCommand, LinkIo, Transport, TransportError, TransportEvent, TransportLink, WsTransport,
};
use crate::types::{ClientEvent, ClientStats, ConnectionState, FailureRecord, Payload, SocketHandle};

const TRANSPORT_EVENT_BUFFER: usize = 1024;

#[derive(Debug)]
enum Command {
    Connect {
        target: String,
    },
    Send {
        payload: Payload,
        reply: oneshot::Sender<Result<u64>>,
    },
    Disconnect {
        reason: Option<String>,
    },
    Terminate {
        done: oneshot::Sender<()>,
    },
}

/// Handle to one resilient connection.
///
/// All work happens on a background task that owns the state machine, so
/// every method only exchanges messages with it. Dropping the handle
/// terminates the connection.
#[derive(Debug)]
pub struct SteadyClient {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    stats: watch::Receiver<ClientStats>,
    events: broadcast::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl SteadyClient {
    /// Start a client over `transport`. Must be called inside a Tokio runtime.
    pub fn spawn<T: Transport>(config: ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ClientError::Config(
                "SteadyClient requires a running Tokio runtime".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stats_tx, stats_rx) = watch::channel(ClientStats::default());
        let (events_tx, _) = broadcast::channel(config.event_buffer);
        let shutdown = CancellationToken::new();

        let driver = Driver::new(
            config,
            Arc::new(transport),
            command_rx,
            state_tx,
            stats_tx,
            events_tx.clone(),
            shutdown.clone(),
        );
        let span = info_span!("steadylink", client_id = %id);
        tokio::spawn(driver.run().instrument(span));

        Ok(Self {
            id,
            commands: command_tx,
            state: state_rx,
            stats: stats_rx,
            events: events_tx,
            shutdown,
        })
    }

    /// Start a client over WebSocket.
    pub fn websocket(config: ClientConfig) -> Result<Self> {
        let transport = WsTransport::with_heartbeat(config.heartbeat_interval());
        Self::spawn(config, transport)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask for a connection to `target`.
    ///
    /// Outcomes are reported as state changes and events, not as errors here;
    /// the only errors are a malformed target and a terminated client.
    pub fn connect(&self, target: impl Into<String>) -> Result<()> {
        let target = target.into();
        Url::parse(&target)?;
        self.command(Command::Connect { target })
    }

    /// Accept a payload for ordered delivery. Returns its sequence number, or
    /// `QueueFull` when the outbound queue is at capacity.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            payload: payload.into(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Terminated)?
    }

    /// Close the connection, or stop reconnecting. Queued messages stay queued
    /// unless the disconnect policy says otherwise.
    pub fn disconnect(&self, reason: Option<String>) -> Result<()> {
        self.command(Command::Disconnect { reason })
    }

    /// Stop everything and drop the queue. Calling it again is a no-op.
    pub async fn terminate(&self) {
        let (done, rx) = oneshot::channel();
        if self.command(Command::Terminate { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Lifecycle events from now on. Subscribe before `connect` to see all of them.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.borrow().clone()
    }

    /// Most recent failure since the last successful open, as a typed error.
    pub fn last_error(&self) -> Option<ClientError> {
        self.stats.borrow().last_error.clone().map(ClientError::from)
    }

    /// Wait until `state` is current. Returns false on timeout.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await,
            Ok(Ok(_))
        )
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.state.borrow().is_terminal() {
            return Err(ClientError::Terminated);
        }
        self.commands
            .send(command)
            .map_err(|_| ClientError::Terminated)
    }
}

impl Drop for SteadyClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type OpenResult = (SocketHandle, std::result::Result<TransportLink, TransportError>);

struct Driver<T: Transport> {
    machine: ConnectionMachine,
    transport: Arc<T>,
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    opened_tx: mpsc::UnboundedSender<OpenResult>,
    opened_rx: mpsc::UnboundedReceiver<OpenResult>,
    links: HashMap<SocketHandle, TransportLink>,
    pending_open: Option<(SocketHandle, JoinHandle<()>)>,
    /// Callbacks that raced ahead of their own open result.
    early_events: Vec<TransportEvent>,
    retry_at: Option<Instant>,
    close_deadline: Option<(SocketHandle, Instant)>,
    state_tx: watch::Sender<ConnectionState>,
    stats_tx: watch::Sender<ClientStats>,
    events: broadcast::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl<T: Transport> Driver<T> {
    fn new(
        config: ClientConfig,
        transport: Arc<T>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        stats_tx: watch::Sender<ClientStats>,
        events: broadcast::Sender<ClientEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            machine: ConnectionMachine::new(&config),
            transport,
            config,
            commands,
            transport_tx,
            transport_rx,
            opened_tx,
            opened_rx,
            links: HashMap::new(),
            pending_open: None,
            early_events: Vec::new(),
            retry_at: None,
            close_deadline: None,
            state_tx,
            stats_tx,
            events,
            shutdown,
        }
    }

    async fn run(mut self) {
        info!("connection driver started");

        while !self.machine.state().is_terminal() {
            let retry_at = self.retry_at;
            let close_at = self.close_deadline.map(|(_, at)| at);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("client handle dropped");
                    self.apply(MachineEvent::Terminate);
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command),
                        None => self.apply(MachineEvent::Terminate),
                    }
                }
                Some((handle, result)) = self.opened_rx.recv() => {
                    self.on_open_result(handle, result);
                }
                Some(event) = self.transport_rx.recv() => {
                    self.on_transport_event(event);
                }
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.apply(MachineEvent::RetryTimerFired);
                }
                _ = sleep_until_opt(close_at) => {
                    if let Some((handle, _)) = self.close_deadline.take() {
                        warn!(%handle, timeout_ms = self.config.close_timeout_ms, "close handshake timed out");
                        self.apply(MachineEvent::TransportClosed {
                            handle,
                            code: None,
                            reason: Some("close handshake timed out".to_string()),
                        });
                    }
                }
            }
        }

        if let Some((_, task)) = self.pending_open.take() {
            task.abort();
        }
        for (_, link) in self.links.drain() {
            link.abort();
        }
        info!("connection driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { target } => self.apply(MachineEvent::Connect { target }),
            Command::Send { payload, reply } => {
                let result = self.machine.send(payload);
                self.execute_effects();
                let _ = reply.send(result);
            }
            Command::Disconnect { reason } => self.apply(MachineEvent::Disconnect { reason }),
            Command::Terminate { done } => {
                self.apply(MachineEvent::Terminate);
                let _ = done.send(());
            }
        }
    }

    fn on_open_result(
        &mut self,
        handle: SocketHandle,
        result: std::result::Result<TransportLink, TransportError>,
    ) {
        if matches!(&self.pending_open, Some((pending, _)) if *pending == handle) {
            self.pending_open = None;
        }
        let (early, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.early_events)
            .into_iter()
            .partition(|event| event_handle(event) == handle);
        self.early_events = rest;

        match result {
            Ok(link) => {
                if !self.machine.context().owns(handle) {
                    debug!(%handle, "dropping link for abandoned open");
                    return;
                }
                self.links.insert(handle, link);
                self.apply(MachineEvent::TransportOpened { handle });
                for event in early {
                    self.apply(event.into());
                }
            }
            Err(err) => {
                warn!(%handle, error = %err, "transport open failed");
                self.apply(err.into_event(handle).into());
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let handle = event_handle(&event);
        if matches!(&self.pending_open, Some((pending, _)) if *pending == handle) {
            self.early_events.push(event);
            return;
        }
        self.apply(event.into());
    }

    fn apply(&mut self, event: MachineEvent) {
        if let Err(err) = self.machine.handle(event) {
            debug!(error = %err, "event not applied");
        }
        self.execute_effects();
    }

    fn execute_effects(&mut self) {
        for effect in self.machine.take_effects() {
            match effect {
                Effect::Open { handle, target } => self.start_open(handle, target),
                Effect::Write { handle, message } => {
                    let sequence = message.sequence;
                    let command = LinkCommand::Write {
                        sequence,
                        payload: message.payload,
                    };
                    // A write that does not reach the link stays unconfirmed and
                    // is sent again on the next episode.
                    match self.links.get(&handle) {
                        Some(link) => {
                            if !link.command(command) {
                                warn!(%handle, sequence, "link not accepting writes");
                            }
                        }
                        None => {
                            warn!(%handle, sequence, "no link for write");
                        }
                    }
                }
                Effect::Close {
                    handle,
                    code,
                    reason,
                } => {
                    if let Some(link) = self.links.get(&handle)
                        && !link.command(LinkCommand::Close { code, reason })
                    {
                        debug!(%handle, "close frame not queued; waiting for deadline");
                    }
                    self.close_deadline = Some((handle, Instant::now() + self.config.close_timeout()));
                }
                Effect::Release { handle } => self.release(handle),
                Effect::ScheduleRetry { delay } => {
                    self.retry_at = Some(Instant::now() + delay);
                }
                Effect::CancelRetry => {
                    self.retry_at = None;
                }
                Effect::Emit(event) => {
                    match &event {
                        ClientEvent::StateChanged { to, .. } => {
                            self.state_tx.send_replace(*to);
                        }
                        ClientEvent::Error { record } => log_failure(record),
                        _ => {}
                    }
                    // Subscribers reading stats on an event see at least that event's effects.
                    self.stats_tx.send_replace(self.machine.stats());
                    let _ = self.events.send(event);
                }
            }
        }
        self.stats_tx.send_replace(self.machine.stats());
    }

    fn start_open(&mut self, handle: SocketHandle, target: String) {
        let transport = Arc::clone(&self.transport);
        let (command_tx, command_rx) = mpsc::channel(self.config.link_buffer());
        let io = LinkIo {
            commands: command_rx,
            events: self.transport_tx.clone(),
        };
        let opened = self.opened_tx.clone();
        let timeout = self.config.connect_timeout();
        let timeout_ms = self.config.connect_timeout_ms;

        debug!(%handle, %target, "opening transport");
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.open(handle, &target, io)).await {
                Ok(result) => result.map(|task| TransportLink::new(command_tx, task)),
                Err(_) => Err(TransportError::Timeout { ms: timeout_ms }),
            };
            let _ = opened.send((handle, result));
        });

        if let Some((_, previous)) = self.pending_open.replace((handle, task)) {
            previous.abort();
        }
    }

    fn release(&mut self, handle: SocketHandle) {
        if matches!(&self.pending_open, Some((pending, _)) if *pending == handle)
            && let Some((_, task)) = self.pending_open.take()
        {
            task.abort();
        }
        // Dropping the link closes its command channel; the transport closes
        // the socket on its own.
        self.links.remove(&handle);
        if matches!(self.close_deadline, Some((pending, _)) if pending == handle) {
            self.close_deadline = None;
        }
        self.early_events.retain(|event| event_handle(event) != handle);
    }
}

fn log_failure(record: &FailureRecord) {
    let err = ClientError::from(record.clone());
    if err.needs_caller_action() {
        warn!(error = %err, code = record.code, "failure needs caller action");
    } else {
        debug!(error = %err, retryable = err.is_retryable(), "failure handled by retry loop");
    }
}

fn event_handle(event: &TransportEvent) -> SocketHandle {
    match event {
        TransportEvent::Written { handle, .. }
        | TransportEvent::Message { handle, .. }
        | TransportEvent::Closed { handle, .. }
        | TransportEvent::Failed { handle, .. } => *handle,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
