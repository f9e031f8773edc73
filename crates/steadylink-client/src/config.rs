/*
[INPUT]:  YAML configuration or programmatic overrides
[OUTPUT]: Validated client configuration with defaults
[POS]:    Configuration layer - retry budget, queue size, timeouts
[UPDATE]: When adding new configuration options
*/

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::types::DisconnectPolicy;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Reconnect attempts allowed per outage
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff base interval
    #[serde(default = "default_base_retry_interval_ms")]
    pub base_retry_interval_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_max_retry_interval_ms")]
    pub max_retry_interval_ms: u64,
    /// Outbound queue capacity
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Time allowed for the transport open/handshake
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Time allowed for the close handshake before the socket is dropped
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Writes handed to the transport and not yet confirmed, per connection
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    /// Per-subscriber event buffer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Queue handling on caller-initiated disconnect
    #[serde(default)]
    pub disconnect_policy: DisconnectPolicy,
    /// Reconnect automatically after the peer closes with 1000
    #[serde(default)]
    pub reconnect_on_normal_close: bool,
    /// Ping interval for transports that support heartbeats
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_retry_interval_ms: default_base_retry_interval_ms(),
            max_retry_interval_ms: default_max_retry_interval_ms(),
            max_queue_size: default_max_queue_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            flush_batch_size: default_flush_batch_size(),
            event_buffer: default_event_buffer(),
            disconnect_policy: DisconnectPolicy::default(),
            reconnect_on_normal_close: false,
            heartbeat_interval_ms: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_retry_interval_ms() -> u64 {
    1000
}

fn default_max_retry_interval_ms() -> u64 {
    30_000
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_close_timeout_ms() -> u64 {
    1000
}

fn default_flush_batch_size() -> usize {
    64
}

fn default_event_buffer() -> usize {
    1024
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate YAML configuration
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ClientError::Config("max_attempts must be at least 1".into()));
        }
        if self.max_queue_size == 0 {
            return Err(ClientError::Config("max_queue_size must be at least 1".into()));
        }
        if self.flush_batch_size == 0 {
            return Err(ClientError::Config("flush_batch_size must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(ClientError::Config("event_buffer must be at least 1".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ClientError::Config("connect_timeout_ms must be positive".into()));
        }
        if self.base_retry_interval_ms > self.max_retry_interval_ms {
            return Err(ClientError::Config(format!(
                "base_retry_interval_ms ({}) exceeds max_retry_interval_ms ({})",
                self.base_retry_interval_ms, self.max_retry_interval_ms
            )));
        }
        if self.heartbeat_interval_ms == Some(0) {
            return Err(ClientError::Config("heartbeat_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_retry_interval_ms),
            Duration::from_millis(self.max_retry_interval_ms),
            self.max_attempts,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    /// Slots in a link's command channel: the full write window plus one
    /// for the close frame.
    pub fn link_buffer(&self) -> usize {
        self.flush_batch_size + 1
    }
}
