/*
[INPUT]:  Test configuration and mock transport requirements
[OUTPUT]: Shared test utilities, fixtures, and event helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for steadylink-client tests

#![allow(dead_code)]

use std::time::Duration;

use steadylink_client::{
    ClientConfig, ClientEvent, ClientStats, MockConnection, MockController, SteadyClient,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const MOCK_TARGET: &str = "mock://peer/stream";
pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Config with short timers so retry loops finish quickly
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        base_retry_interval_ms: 10,
        max_retry_interval_ms: 40,
        connect_timeout_ms: 200,
        close_timeout_ms: 200,
        ..ClientConfig::default()
    }
}

/// Next event, failing the test if none arrives in time
pub async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(STEP_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `pred`
pub async fn events_until(
    rx: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Events that arrive within `window`
pub async fn drain_for(
    rx: &mut broadcast::Receiver<ClientEvent>,
    window: Duration,
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(Ok(event)) = timeout(window, rx.recv()).await {
        seen.push(event);
    }
    seen
}

/// Next open attempt issued by the client
pub async fn expect_open(controller: &mut MockController) -> MockConnection {
    timeout(STEP_TIMEOUT, controller.next_open())
        .await
        .expect("timed out waiting for open attempt")
        .expect("mock transport dropped")
}

/// Poll stats until `pred` holds; transport confirmations land asynchronously
pub async fn wait_for_stats(
    client: &SteadyClient,
    pred: impl Fn(&ClientStats) -> bool,
) -> ClientStats {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        let stats = client.stats();
        if pred(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for stats, last seen {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
