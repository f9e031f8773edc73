/*
[INPUT]:  Input lines, client lifecycle events, shutdown token
[OUTPUT]: Outbound sends and one JSON line per client event
[POS]:    Relay loop - bridges a line stream and a SteadyClient
[UPDATE]: When changing relay output format or shutdown order
*/

use anyhow::{Context, Result};
use std::time::Duration;
use steadylink_client::{ClientError, ClientEvent, ConnectionState, SteadyClient};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters reported when the relay loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub lines_sent: u64,
    pub lines_rejected: u64,
    pub events_written: u64,
    pub events_lagged: u64,
    /// Failures the client will not recover from on its own.
    pub fatal_errors: u64,
}

/// Relay `input` lines to `client` and write its events to `output`.
///
/// Returns when the input ends, the shutdown token fires, or the client is
/// terminated. Blank lines are skipped.
pub async fn run_relay<R, W>(
    client: &SteadyClient,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> Result<RelaySummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut events = client.subscribe();
    let mut lines = input.lines();
    let mut summary = RelaySummary::default();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("relay stopping on shutdown signal");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let ClientEvent::Error { record } = &event {
                            let err = ClientError::from(record.clone());
                            if err.needs_caller_action() {
                                warn!(error = %err, "connection gave up, reconnect needs an operator");
                                summary.fatal_errors += 1;
                            }
                        }
                        write_event(&mut output, &event).await?;
                        summary.events_written += 1;
                        if event.entered_state() == Some(ConnectionState::Terminated) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay fell behind client events");
                        summary.events_lagged += skipped;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("read input line")? else {
                    info!("input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match client.send(line).await {
                    Ok(sequence) => {
                        debug!(sequence, "line accepted");
                        summary.lines_sent += 1;
                    }
                    Err(ClientError::Terminated) => break,
                    Err(err) => {
                        warn!(error = %err, "line rejected");
                        summary.lines_rejected += 1;
                    }
                }
            }
        }
    }

    output.flush().await.context("flush output")?;
    Ok(summary)
}

/// Close gracefully, then terminate whatever is left.
pub async fn shutdown_client(client: &SteadyClient, timeout: Duration) {
    let state = client.current_state();
    if state.holds_socket() || state == ConnectionState::Reconnecting {
        if let Err(err) = client.disconnect(Some("relay shutting down".to_string())) {
            debug!(error = %err, "disconnect skipped");
        } else if !client
            .wait_for_state(ConnectionState::Disconnected, timeout)
            .await
        {
            warn!(timeout_ms = timeout.as_millis() as u64, "graceful disconnect timed out");
        }
    }
    client.terminate().await;
    info!(stats = ?client.stats(), "client terminated");
}

async fn write_event<W: AsyncWrite + Unpin>(output: &mut W, event: &ClientEvent) -> Result<()> {
    let mut line = serde_json::to_string(event).context("serialize client event")?;
    line.push('\n');
    output
        .write_all(line.as_bytes())
        .await
        .context("write client event")?;
    output.flush().await.context("flush client event")?;
    Ok(())
}
