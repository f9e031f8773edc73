/*
[INPUT]:  Caller commands and transport callbacks, one event at a time
[OUTPUT]: State transitions plus an ordered list of effects for the driver
[POS]:    Core - single authority over ConnectionState, owns Context and queue
[UPDATE]: When the transition table, retry rules or effect set change
*/

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::classifier::{self, FailureSignal};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{ClientError, Result};
use crate::queue::OutboundQueue;
use crate::retry::RetryPolicy;
use crate::types::{
    ClientEvent, ClientStats, ConnectionState, DisconnectPolicy, FailureCategory, FailureKind,
    FailureRecord, OutboundMessage, Payload, SocketHandle,
};

/// Input to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    Connect {
        target: String,
    },
    Disconnect {
        reason: Option<String>,
    },
    Terminate,
    TransportOpened {
        handle: SocketHandle,
    },
    TransportWritten {
        handle: SocketHandle,
        sequence: u64,
    },
    TransportMessage {
        handle: SocketHandle,
        payload: Payload,
    },
    TransportClosed {
        handle: SocketHandle,
        code: Option<i32>,
        reason: Option<String>,
    },
    TransportFailed {
        handle: SocketHandle,
        message: String,
    },
    RetryTimerFired,
}

impl MachineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MachineEvent::Connect { .. } => "connect",
            MachineEvent::Disconnect { .. } => "disconnect",
            MachineEvent::Terminate => "terminate",
            MachineEvent::TransportOpened { .. } => "transport_opened",
            MachineEvent::TransportWritten { .. } => "transport_written",
            MachineEvent::TransportMessage { .. } => "transport_message",
            MachineEvent::TransportClosed { .. } => "transport_closed",
            MachineEvent::TransportFailed { .. } => "transport_failed",
            MachineEvent::RetryTimerFired => "retry_timer_fired",
        }
    }

    fn handle(&self) -> Option<SocketHandle> {
        match self {
            MachineEvent::TransportOpened { handle }
            | MachineEvent::TransportWritten { handle, .. }
            | MachineEvent::TransportMessage { handle, .. }
            | MachineEvent::TransportClosed { handle, .. }
            | MachineEvent::TransportFailed { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}

/// Work the driver performs on the machine's behalf, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start opening a transport for `handle`.
    Open { handle: SocketHandle, target: String },
    /// Hand one message to the transport. It stays queued until the
    /// transport confirms it with `TransportWritten`.
    Write {
        handle: SocketHandle,
        message: OutboundMessage,
    },
    /// Start a close handshake. The transport answers with `TransportClosed`.
    Close {
        handle: SocketHandle,
        code: i32,
        reason: Option<String>,
    },
    /// Drop the transport for `handle` now. No further callbacks are expected.
    Release { handle: SocketHandle },
    ScheduleRetry { delay: Duration },
    CancelRetry,
    Emit(ClientEvent),
}

#[derive(Debug)]
pub struct ConnectionMachine {
    ctx: Context,
    queue: OutboundQueue,
    retry: RetryPolicy,
    write_window: usize,
    disconnect_policy: DisconnectPolicy,
    reconnect_on_normal_close: bool,
    next_handle: u64,
    retry_pending: bool,
    effects: Vec<Effect>,
    stats: ClientStats,
}

impl ConnectionMachine {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            ctx: Context::new(),
            queue: OutboundQueue::new(config.max_queue_size),
            retry: config.retry_policy(),
            write_window: config.flush_batch_size.max(1),
            disconnect_policy: config.disconnect_policy,
            reconnect_on_normal_close: config.reconnect_on_normal_close,
            next_handle: 0,
            retry_pending: false,
            effects: Vec::new(),
            stats: ClientStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.state
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Messages held, including writes not yet confirmed.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Writes handed to the transport and not yet confirmed.
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            state: self.ctx.state,
            queue_depth: self.queue.len(),
            in_flight: self.queue.in_flight(),
            attempt_count: self.ctx.attempt_count,
            last_error: self.ctx.last_error.clone(),
            ..self.stats.clone()
        }
    }

    /// Effects produced since the last call, in execution order.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.ctx.check_invariants(self.retry.max_attempts)?;
        if self.queue.len() > self.queue.capacity() {
            return Err(format!(
                "queue length {} exceeds capacity {}",
                self.queue.len(),
                self.queue.capacity()
            ));
        }
        if self.queue.in_flight() > self.write_window {
            return Err(format!(
                "{} writes in flight exceed window {}",
                self.queue.in_flight(),
                self.write_window
            ));
        }
        if self.queue.in_flight() > 0 && self.ctx.socket_handle.is_none() {
            return Err(format!(
                "{} writes in flight without a socket",
                self.queue.in_flight()
            ));
        }
        Ok(())
    }

    /// Accept a payload for delivery. Returns its sequence number.
    ///
    /// Accepted in every state except `Terminated`; written right away only
    /// while `Connected`, otherwise held until the next episode.
    pub fn send(&mut self, payload: Payload) -> Result<u64> {
        if self.ctx.state.is_terminal() {
            return Err(ClientError::Terminated);
        }

        let sequence = match self.queue.enqueue(payload) {
            Ok(sequence) => sequence,
            Err(err) => {
                warn!(
                    state = %self.ctx.state,
                    capacity = self.queue.capacity(),
                    "outbound queue full; send rejected"
                );
                return Err(err);
            }
        };

        self.stats.messages_accepted += 1;
        self.emit(ClientEvent::SendAccepted { sequence });
        if self.ctx.state == ConnectionState::Connected {
            self.flush();
        } else {
            debug!(sequence, state = %self.ctx.state, "message queued until connected");
        }
        self.debug_check();
        Ok(sequence)
    }

    /// Apply one event. Events with no defined transition return
    /// `InvalidTransition` and leave the machine untouched.
    pub fn handle(&mut self, event: MachineEvent) -> Result<()> {
        let result = self.apply(event);
        self.debug_check();
        result
    }

    fn debug_check(&self) {
        debug_assert!(
            self.check_invariants().is_ok(),
            "machine invariant violated: {:?}",
            self.check_invariants()
        );
    }

    fn apply(&mut self, event: MachineEvent) -> Result<()> {
        if let Some(handle) = event.handle()
            && !self.ctx.owns(handle)
        {
            debug!(%handle, event = event.name(), state = %self.ctx.state, "dropping stale transport callback");
            return Ok(());
        }

        let state = self.ctx.state;
        match (state, event) {
            (ConnectionState::Terminated, MachineEvent::Terminate) => Ok(()),
            (ConnectionState::Terminated, MachineEvent::Connect { .. })
            | (ConnectionState::Terminated, MachineEvent::Disconnect { .. }) => {
                Err(ClientError::Terminated)
            }
            (_, MachineEvent::Terminate) => {
                self.terminate();
                Ok(())
            }

            (ConnectionState::Disconnected, MachineEvent::Connect { target }) => {
                self.begin_connect(target);
                Ok(())
            }

            (ConnectionState::Connecting, MachineEvent::TransportOpened { .. }) => {
                self.on_open();
                Ok(())
            }

            (
                ConnectionState::Connecting | ConnectionState::Connected,
                MachineEvent::TransportClosed { code, reason, .. },
            ) => {
                let message = reason.unwrap_or_else(|| "connection closed".to_string());
                self.on_failure(FailureSignal::Close { code }, message);
                Ok(())
            }
            (
                ConnectionState::Connecting | ConnectionState::Connected,
                MachineEvent::TransportFailed { message, .. },
            ) => {
                self.on_failure(FailureSignal::SocketError, message);
                Ok(())
            }

            (
                ConnectionState::Connected | ConnectionState::Disconnecting,
                MachineEvent::TransportWritten { sequence, .. },
            ) => {
                self.on_written(sequence);
                Ok(())
            }

            (
                ConnectionState::Connected | ConnectionState::Disconnecting,
                MachineEvent::TransportMessage { payload, .. },
            ) => {
                self.stats.messages_received += 1;
                self.emit(ClientEvent::MessageReceived { payload });
                Ok(())
            }

            (ConnectionState::Connected, MachineEvent::Disconnect { reason }) => {
                self.begin_disconnect(reason);
                Ok(())
            }
            (ConnectionState::Connecting, MachineEvent::Disconnect { reason }) => {
                self.abandon_connect(reason);
                Ok(())
            }
            (ConnectionState::Reconnecting, MachineEvent::Disconnect { reason }) => {
                self.abandon_reconnect(reason);
                Ok(())
            }

            (
                ConnectionState::Disconnecting,
                MachineEvent::TransportClosed { .. } | MachineEvent::TransportFailed { .. },
            ) => {
                self.finish_disconnect();
                Ok(())
            }

            (ConnectionState::Reconnecting, MachineEvent::RetryTimerFired) => {
                self.on_retry_timer();
                Ok(())
            }

            (state, event) => {
                let err = ClientError::InvalidTransition {
                    state,
                    event: event.name(),
                };
                warn!(%state, event = event.name(), "ignoring event with no transition");
                Err(err)
            }
        }
    }

    fn begin_connect(&mut self, target: String) {
        info!(%target, "connect requested");
        self.ctx.target = Some(target);
        self.ctx.attempt_count = 0;
        self.ctx.free_retry = false;
        self.ctx.transient_streak = false;
        self.open_socket();
        self.transition(ConnectionState::Connecting);
    }

    fn open_socket(&mut self) {
        self.next_handle += 1;
        let handle = SocketHandle(self.next_handle);
        self.ctx.socket_handle = Some(handle);
        self.ctx.pending_close_reason = None;
        let target = self.ctx.target.clone().unwrap_or_default();
        self.effects.push(Effect::Open { handle, target });
    }

    fn on_open(&mut self) {
        self.ctx.mark_connected();
        self.stats.episodes += 1;
        // Queued messages go out before anyone observes `Connected`.
        self.flush();
        self.transition(ConnectionState::Connected);
    }

    /// Hand waiting messages to the transport, keeping at most
    /// `write_window` unconfirmed writes outstanding.
    fn flush(&mut self) {
        let Some(handle) = self.ctx.socket_handle else {
            return;
        };

        let room = self.write_window.saturating_sub(self.queue.in_flight());
        if room == 0 {
            if self.queue.pending() > 0 {
                debug!(%handle, pending = self.queue.pending(), "write window full");
            }
            return;
        }

        for message in self.queue.dispatch_batch(room) {
            debug!(%handle, sequence = message.sequence, "writing message");
            self.effects.push(Effect::Write { handle, message });
        }
    }

    fn on_written(&mut self, sequence: u64) {
        let acked = self.queue.acknowledge(sequence);
        self.stats.messages_written += acked as u64;
        if self.ctx.state == ConnectionState::Connected {
            self.flush();
        }
    }

    fn on_failure(&mut self, signal: FailureSignal, message: String) {
        let from = self.ctx.state;
        let code = signal.record_code();
        let category = classifier::classify_signal(signal);
        let kind = if from == ConnectionState::Connecting {
            FailureKind::ConnectFailed
        } else {
            FailureKind::TransportFault
        };
        let record = FailureRecord::new(
            code,
            category,
            kind,
            format!("{}: {}", classifier::close_code_name(code), message),
        );

        warn!(
            state = %from,
            code,
            category = %category,
            attempt = self.ctx.attempt_count,
            error = %record.message,
            "connection failure"
        );

        self.release_socket();
        self.report(record);

        let peer_closed_normally = from == ConnectionState::Connected
            && code == classifier::NORMAL_CLOSURE
            && !self.reconnect_on_normal_close;

        if category == FailureCategory::Fatal || peer_closed_normally {
            self.transition(ConnectionState::Disconnected);
            return;
        }

        self.enter_reconnecting(category);
    }

    fn enter_reconnecting(&mut self, category: FailureCategory) {
        // A lone transient failure retries for free; a second one in a row
        // without a successful open in between is charged like any other.
        let free = category == FailureCategory::Transient && !self.ctx.transient_streak;
        self.ctx.transient_streak = category == FailureCategory::Transient;
        self.transition(ConnectionState::Reconnecting);

        if free {
            self.ctx.free_retry = true;
            self.schedule_retry(Duration::ZERO);
            return;
        }

        self.ctx.free_retry = false;
        if !self.retry.has_budget(self.ctx.attempt_count) {
            self.exhaust();
            return;
        }

        let next_attempt = self.ctx.attempt_count + 1;
        let delay = if next_attempt == 1 {
            Duration::ZERO
        } else {
            self.retry.next_delay(next_attempt)
        };
        self.schedule_retry(delay);
    }

    fn schedule_retry(&mut self, delay: Duration) {
        info!(
            attempt = self.ctx.attempt_count,
            max_attempts = self.retry.max_attempts,
            ?delay,
            free = self.ctx.free_retry,
            "reconnect scheduled"
        );
        self.retry_pending = true;
        self.effects.push(Effect::ScheduleRetry { delay });
    }

    fn on_retry_timer(&mut self) {
        self.retry_pending = false;

        if self.ctx.free_retry {
            self.ctx.free_retry = false;
        } else {
            if !self.retry.has_budget(self.ctx.attempt_count) {
                self.exhaust();
                return;
            }
            self.ctx.attempt_count += 1;
        }

        self.stats.reconnect_attempts += 1;
        info!(
            attempt = self.ctx.attempt_count,
            max_attempts = self.retry.max_attempts,
            "reconnecting"
        );
        self.open_socket();
        self.transition(ConnectionState::Connecting);
    }

    fn exhaust(&mut self) {
        let attempts = self.ctx.attempt_count;
        let code = self
            .ctx
            .last_error
            .as_ref()
            .map(|record| record.code)
            .unwrap_or(classifier::NO_CODE);
        let record = FailureRecord::new(
            code,
            FailureCategory::Fatal,
            FailureKind::RetriesExhausted,
            format!("gave up after {attempts} reconnect attempts"),
        );
        warn!(
            attempts,
            max_attempts = self.retry.max_attempts,
            "retries exhausted; waiting for caller to connect again"
        );
        self.report(record);
        self.transition(ConnectionState::Disconnected);
    }

    fn begin_disconnect(&mut self, reason: Option<String>) {
        let Some(handle) = self.ctx.socket_handle else {
            return;
        };
        info!(%handle, reason = reason.as_deref().unwrap_or(""), "disconnect requested");
        self.ctx.pending_close_reason = reason.clone();
        self.effects.push(Effect::Close {
            handle,
            code: classifier::NORMAL_CLOSURE,
            reason,
        });
        self.transition(ConnectionState::Disconnecting);
        self.apply_disconnect_policy();
    }

    fn finish_disconnect(&mut self) {
        self.release_socket();
        self.ctx.pending_close_reason = None;
        self.transition(ConnectionState::Disconnected);
    }

    fn abandon_connect(&mut self, reason: Option<String>) {
        info!(reason = reason.as_deref().unwrap_or(""), "disconnect requested while connecting");
        self.release_socket();
        self.transition(ConnectionState::Disconnected);
        self.apply_disconnect_policy();
    }

    fn abandon_reconnect(&mut self, reason: Option<String>) {
        info!(reason = reason.as_deref().unwrap_or(""), "disconnect requested while reconnecting");
        self.cancel_retry();
        self.ctx.free_retry = false;
        self.transition(ConnectionState::Disconnected);
        self.apply_disconnect_policy();
    }

    fn apply_disconnect_policy(&mut self) {
        if self.disconnect_policy == DisconnectPolicy::Discard {
            let dropped = self.queue.clear();
            if dropped > 0 {
                info!(dropped, "discarded queued messages on disconnect");
            }
        }
    }

    fn terminate(&mut self) {
        self.cancel_retry();
        self.release_socket();
        let dropped = self.queue.clear();
        self.ctx.target = None;
        self.ctx.free_retry = false;
        info!(dropped, "client terminated");
        self.transition(ConnectionState::Terminated);
    }

    fn cancel_retry(&mut self) {
        if self.retry_pending {
            self.retry_pending = false;
            self.effects.push(Effect::CancelRetry);
        }
    }

    fn release_socket(&mut self) {
        if let Some(handle) = self.ctx.socket_handle {
            self.effects.push(Effect::Release { handle });
            self.ctx.mark_disconnected();
        }
        // Unconfirmed writes may not have reached the peer; send them again
        // on the next episode.
        let requeued = self.queue.rewind();
        if requeued > 0 {
            self.stats.messages_requeued += requeued as u64;
            info!(requeued, "unconfirmed writes requeued");
        }
    }

    fn report(&mut self, record: FailureRecord) {
        self.stats.failures += 1;
        self.ctx.record_error(record.clone());
        self.emit(ClientEvent::Error { record });
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.ctx.state;
        if from == to {
            return;
        }
        self.ctx.state = to;
        info!(%from, %to, "connection state changed");
        self.emit(ClientEvent::StateChanged { from, to });
    }

    fn emit(&mut self, event: ClientEvent) {
        self.effects.push(Effect::Emit(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "ws://127.0.0.1:9/feed";

    fn machine_with(max_attempts: u32, max_queue_size: usize) -> ConnectionMachine {
        let config = ClientConfig {
            max_attempts,
            max_queue_size,
            base_retry_interval_ms: 100,
            max_retry_interval_ms: 1000,
            ..ClientConfig::default()
        };
        ConnectionMachine::new(&config)
    }

    fn emitted(effects: &[Effect]) -> Vec<ClientEvent> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Emit(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn state_changes(effects: &[Effect]) -> Vec<(ConnectionState, ConnectionState)> {
        emitted(effects)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    fn opened_handle(effects: &[Effect]) -> SocketHandle {
        effects
            .iter()
            .find_map(|effect| match effect {
                Effect::Open { handle, .. } => Some(*handle),
                _ => None,
            })
            .expect("open effect")
    }

    fn connected(machine: &mut ConnectionMachine) -> SocketHandle {
        machine
            .handle(MachineEvent::Connect {
                target: TARGET.to_string(),
            })
            .unwrap();
        let handle = opened_handle(&machine.take_effects());
        machine
            .handle(MachineEvent::TransportOpened { handle })
            .unwrap();
        machine.take_effects();
        handle
    }

    fn fail_with(machine: &mut ConnectionMachine, handle: SocketHandle, code: i32) -> Vec<Effect> {
        machine
            .handle(MachineEvent::TransportClosed {
                handle,
                code: Some(code),
                reason: None,
            })
            .unwrap();
        machine.take_effects()
    }

    #[test]
    fn connect_then_open_reaches_connected() {
        let mut machine = machine_with(5, 10);
        machine
            .handle(MachineEvent::Connect {
                target: TARGET.to_string(),
            })
            .unwrap();
        let effects = machine.take_effects();
        assert_eq!(
            state_changes(&effects),
            vec![(ConnectionState::Disconnected, ConnectionState::Connecting)]
        );
        assert!(machine.context().socket_handle.is_some());

        let handle = opened_handle(&effects);
        machine
            .handle(MachineEvent::TransportOpened { handle })
            .unwrap();
        let effects = machine.take_effects();
        assert_eq!(
            state_changes(&effects),
            vec![(ConnectionState::Connecting, ConnectionState::Connected)]
        );
        assert_eq!(machine.context().attempt_count, 0);
        assert!(machine.check_invariants().is_ok());
    }

    #[test]
    fn fatal_close_disconnects_without_retry() {
        let mut machine = machine_with(5, 10);
        let handle = connected(&mut machine);

        let effects = fail_with(&mut machine, handle, 1002);
        assert_eq!(
            state_changes(&effects),
            vec![(ConnectionState::Connected, ConnectionState::Disconnected)]
        );
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, Effect::ScheduleRetry { .. })));
        let last_error = machine.context().last_error.as_ref().unwrap();
        assert_eq!(last_error.category, FailureCategory::Fatal);
        assert_eq!(last_error.code, 1002);
        assert!(machine.check_invariants().is_ok());
    }

    #[test]
    fn recoverable_failures_exhaust_budget() {
        let mut machine = machine_with(3, 10);
        let handle = connected(&mut machine);

        let effects = fail_with(&mut machine, handle, 1006);
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert!(effects.contains(&Effect::ScheduleRetry {
            delay: Duration::ZERO
        }));

        let mut opens = 0;
        let mut last = Vec::new();
        for attempt in 1..=3 {
            machine.handle(MachineEvent::RetryTimerFired).unwrap();
            let effects = machine.take_effects();
            let handle = opened_handle(&effects);
            opens += 1;
            assert_eq!(machine.context().attempt_count, attempt);
            assert!(machine.check_invariants().is_ok());
            last = fail_with(&mut machine, handle, 1006);
        }

        assert_eq!(opens, 3);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(state_changes(&last)
            .contains(&(ConnectionState::Reconnecting, ConnectionState::Disconnected)));
        assert!(emitted(&last).iter().any(|event| matches!(
            event,
            ClientEvent::Error { record } if record.kind == FailureKind::RetriesExhausted
        )));
        assert!(!last
            .iter()
            .any(|effect| matches!(effect, Effect::ScheduleRetry { .. } | Effect::Open { .. })));
        assert!(machine.context().attempt_count <= 3);
    }

    #[test]
    fn backoff_after_first_immediate_retry() {
        let mut machine = machine_with(5, 10);
        let handle = connected(&mut machine);
        fail_with(&mut machine, handle, 1001);

        machine.handle(MachineEvent::RetryTimerFired).unwrap();
        let handle = opened_handle(&machine.take_effects());
        let effects = fail_with(&mut machine, handle, 1001);
        assert!(effects.contains(&Effect::ScheduleRetry {
            delay: Duration::from_millis(200)
        }));
    }

    #[test]
    fn sends_while_reconnecting_flush_in_order() {
        let mut machine = machine_with(5, 2);
        let handle = connected(&mut machine);
        fail_with(&mut machine, handle, 1006);

        assert_eq!(machine.send(Payload::from("a")).unwrap(), 1);
        assert_eq!(machine.send(Payload::from("b")).unwrap(), 2);
        let err = machine.send(Payload::from("c")).unwrap_err();
        assert!(matches!(err, ClientError::QueueFull { capacity: 2 }));
        assert_eq!(machine.queue_len(), 2);
        machine.take_effects();

        machine.handle(MachineEvent::RetryTimerFired).unwrap();
        let handle = opened_handle(&machine.take_effects());
        machine
            .handle(MachineEvent::TransportOpened { handle })
            .unwrap();
        let effects = machine.take_effects();

        let written: Vec<u64> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Write { message, .. } => Some(message.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(written, vec![1, 2]);

        let write_pos = effects
            .iter()
            .position(|effect| matches!(effect, Effect::Write { .. }))
            .unwrap();
        let connected_pos = effects
            .iter()
            .position(|effect| {
                matches!(
                    effect,
                    Effect::Emit(ClientEvent::StateChanged {
                        to: ConnectionState::Connected,
                        ..
                    })
                )
            })
            .unwrap();
        assert!(write_pos < connected_pos);
        assert_eq!(machine.in_flight(), 2);

        machine
            .handle(MachineEvent::TransportWritten { handle, sequence: 2 })
            .unwrap();
        assert_eq!(machine.queue_len(), 0);
        assert_eq!(machine.stats().messages_written, 2);
    }

    #[test]
    fn transient_error_retries_without_charging_budget() {
        let mut machine = machine_with(2, 10);
        let handle = connected(&mut machine);

        machine
            .handle(MachineEvent::TransportFailed {
                handle,
                message: "reset".to_string(),
            })
            .unwrap();
        let effects = machine.take_effects();
        assert!(effects.contains(&Effect::ScheduleRetry {
            delay: Duration::ZERO
        }));
        assert_eq!(
            machine.context().last_error.as_ref().unwrap().category,
            FailureCategory::Transient
        );

        machine.handle(MachineEvent::RetryTimerFired).unwrap();
        assert_eq!(machine.context().attempt_count, 0);
        let handle = opened_handle(&machine.take_effects());

        // A second transient failure in a row is charged.
        machine
            .handle(MachineEvent::TransportFailed {
                handle,
                message: "reset again".to_string(),
            })
            .unwrap();
        machine.take_effects();
        machine.handle(MachineEvent::RetryTimerFired).unwrap();
        assert_eq!(machine.context().attempt_count, 1);
    }

    #[test]
    fn disconnect_while_reconnecting_cancels_retry_and_keeps_queue() {
        let mut machine = machine_with(5, 10);
        let handle = connected(&mut machine);
        fail_with(&mut machine, handle, 1006);
        machine.send(Payload::from("kept")).unwrap();
        machine.take_effects();

        machine
            .handle(MachineEvent::Disconnect { reason: None })
            .unwrap();
        let effects = machine.take_effects();
        assert!(effects.contains(&Effect::CancelRetry));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.queue_len(), 1);
    }

    #[test]
    fn discard_policy_clears_queue_on_disconnect() {
        let config = ClientConfig {
            disconnect_policy: DisconnectPolicy::Discard,
            ..ClientConfig::default()
        };
        let mut machine = ConnectionMachine::new(&config);
        machine
            .handle(MachineEvent::Connect {
                target: TARGET.to_string(),
            })
            .unwrap();
        machine.send(Payload::from("pending")).unwrap();
        machine
            .handle(MachineEvent::Disconnect { reason: None })
            .unwrap();
        assert_eq!(machine.queue_len(), 0);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.check_invariants().is_ok());
    }

    #[test]
    fn caller_disconnect_wins_over_peer_close() {
        let mut machine = machine_with(5, 10);
        let handle = connected(&mut machine);

        machine
            .handle(MachineEvent::Disconnect {
                reason: Some("bye".to_string()),
            })
            .unwrap();
        let effects = machine.take_effects();
        assert!(effects.contains(&Effect::Close {
            handle,
            code: 1000,
            reason: Some("bye".to_string()),
        }));
        assert_eq!(machine.state(), ConnectionState::Disconnecting);
        assert_eq!(machine.context().pending_close_reason.as_deref(), Some("bye"));

        let effects = fail_with(&mut machine, handle, 1006);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, Effect::ScheduleRetry { .. })));
        assert!(machine.context().socket_handle.is_none());
    }

    #[test]
    fn normal_closure_from_peer_does_not_reconnect() {
        let mut machine = machine_with(5, 10);
        let handle = connected(&mut machine);
        fail_with(&mut machine, handle, 1000);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(
            machine.context().last_error.as_ref().unwrap().category,
            FailureCategory::Recoverable
        );
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut machine = machine_with(5, 10);
        let handle = connected(&mut machine);
        machine.send(Payload::from("x")).unwrap();
        fail_with(&mut machine, handle, 1006);
        machine.send(Payload::from("queued")).unwrap();
        machine.take_effects();

        machine.handle(MachineEvent::Terminate).unwrap();
        let effects = machine.take_effects();
        assert!(effects.contains(&Effect::CancelRetry));
        assert_eq!(
            state_changes(&effects),
            vec![(ConnectionState::Reconnecting, ConnectionState::Terminated)]
        );
        assert_eq!(machine.queue_len(), 0);

        machine.handle(MachineEvent::Terminate).unwrap();
        assert!(machine.take_effects().is_empty());
        assert!(matches!(
            machine.send(Payload::from("late")),
            Err(ClientError::Terminated)
        ));
        assert!(matches!(
            machine.handle(MachineEvent::Connect {
                target: TARGET.to_string()
            }),
            Err(ClientError::Terminated)
        ));
    }

    #[test]
    fn stale_callbacks_are_ignored() {
        let mut machine = machine_with(5, 10);
        let old = connected(&mut machine);
        fail_with(&mut machine, old, 1006);
        machine.handle(MachineEvent::RetryTimerFired).unwrap();
        machine.take_effects();

        machine
            .handle(MachineEvent::TransportOpened { handle: old })
            .unwrap();
        assert!(machine.take_effects().is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn undefined_events_are_rejected_without_state_change() {
        let mut machine = machine_with(5, 10);
        let err = machine
            .handle(MachineEvent::Disconnect { reason: None })
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidTransition {
                state: ConnectionState::Disconnected,
                event: "disconnect"
            }
        ));

        connected(&mut machine);
        assert!(machine
            .handle(MachineEvent::Connect {
                target: TARGET.to_string()
            })
            .is_err());
        assert!(machine.handle(MachineEvent::RetryTimerFired).is_err());
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(machine.take_effects().is_empty());
    }

    #[test]
    fn connected_send_writes_immediately() {
        let mut machine = machine_with(5, 10);
        let handle = connected(&mut machine);
        let seq = machine.send(Payload::from("now")).unwrap();
        let effects = machine.take_effects();
        assert_eq!(
            effects[0],
            Effect::Emit(ClientEvent::SendAccepted { sequence: seq })
        );
        assert!(matches!(
            &effects[1],
            Effect::Write { handle: h, message } if *h == handle && message.sequence == seq
        ));
        let stats = machine.stats();
        assert_eq!(stats.messages_accepted, 1);
        assert_eq!(stats.messages_written, 0);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.episodes, 1);

        machine
            .handle(MachineEvent::TransportWritten { handle, sequence: seq })
            .unwrap();
        let stats = machine.stats();
        assert_eq!(stats.messages_written, 1);
        assert_eq!(stats.queue_depth, 0);
    }

    fn writes(effects: &[Effect]) -> Vec<u64> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Write { message, .. } => Some(message.sequence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn write_window_limits_unconfirmed_writes() {
        let config = ClientConfig {
            flush_batch_size: 2,
            ..ClientConfig::default()
        };
        let mut machine = ConnectionMachine::new(&config);
        let handle = connected(&mut machine);

        for i in 0..5 {
            machine.send(Payload::Text(format!("m{i}"))).unwrap();
        }
        assert_eq!(writes(&machine.take_effects()), vec![1, 2]);
        assert_eq!(machine.in_flight(), 2);
        assert_eq!(machine.queue_len(), 5);

        machine
            .handle(MachineEvent::TransportWritten { handle, sequence: 1 })
            .unwrap();
        assert_eq!(writes(&machine.take_effects()), vec![3]);

        machine
            .handle(MachineEvent::TransportWritten { handle, sequence: 3 })
            .unwrap();
        assert_eq!(writes(&machine.take_effects()), vec![4, 5]);
        assert_eq!(machine.stats().messages_written, 3);
        assert!(machine.check_invariants().is_ok());
    }

    #[test]
    fn stalled_peer_fills_queue_and_writes_resume_after_reconnect() {
        let mut machine = machine_with(5, 2);
        let handle = connected(&mut machine);

        machine.send(Payload::from("a")).unwrap();
        machine.send(Payload::from("b")).unwrap();
        assert!(matches!(
            machine.send(Payload::from("c")),
            Err(ClientError::QueueFull { capacity: 2 })
        ));
        assert_eq!(machine.queue_len(), 2);
        machine.take_effects();

        fail_with(&mut machine, handle, 1006);
        assert_eq!(machine.in_flight(), 0);
        assert_eq!(machine.queue_len(), 2);
        assert_eq!(machine.stats().messages_requeued, 2);

        machine.handle(MachineEvent::RetryTimerFired).unwrap();
        let next = opened_handle(&machine.take_effects());
        machine
            .handle(MachineEvent::TransportOpened { handle: next })
            .unwrap();
        let effects = machine.take_effects();
        assert!(effects.iter().all(|effect| match effect {
            Effect::Write { handle, .. } => *handle == next,
            _ => true,
        }));
        assert_eq!(writes(&effects), vec![1, 2]);

        // Confirmation from the old episode is stale.
        machine
            .handle(MachineEvent::TransportWritten { handle, sequence: 2 })
            .unwrap();
        assert_eq!(machine.in_flight(), 2);
        assert!(machine.check_invariants().is_ok());
    }

    #[test]
    fn fatal_failure_while_connecting_disconnects_without_retry() {
        let mut machine = machine_with(5, 10);
        machine
            .handle(MachineEvent::Connect {
                target: TARGET.to_string(),
            })
            .unwrap();
        let handle = opened_handle(&machine.take_effects());

        // A 401 handshake rejection arrives as policy violation.
        let effects = fail_with(&mut machine, handle, 1008);
        assert_eq!(
            state_changes(&effects),
            vec![(ConnectionState::Connecting, ConnectionState::Disconnected)]
        );
        assert!(!effects.iter().any(|effect| matches!(
            effect,
            Effect::ScheduleRetry { .. } | Effect::Open { .. }
        )));
        let record = machine.context().last_error.as_ref().unwrap();
        assert_eq!(record.kind, FailureKind::ConnectFailed);
        assert_eq!(record.category, FailureCategory::Fatal);
        assert!(machine.context().socket_handle.is_none());
        assert!(machine.handle(MachineEvent::RetryTimerFired).is_err());
    }

    #[test]
    fn invariants_hold_across_a_scripted_session() {
        let mut machine = machine_with(2, 4);
        let mut handle = connected(&mut machine);
        let script = [1006, 1011, 1001];
        for code in script {
            fail_with(&mut machine, handle, code);
            assert!(machine.check_invariants().is_ok());
            if machine.state() != ConnectionState::Reconnecting {
                break;
            }
            machine.handle(MachineEvent::RetryTimerFired).unwrap();
            handle = opened_handle(&machine.take_effects());
            assert!(machine.check_invariants().is_ok());
        }
        machine.handle(MachineEvent::Terminate).unwrap();
        assert!(machine.check_invariants().is_ok());
    }
}
