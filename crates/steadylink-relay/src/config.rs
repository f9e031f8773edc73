/*
[INPUT]:  YAML configuration file, CLI overrides
[OUTPUT]: Parsed relay configuration wrapping the client settings
[POS]:    Configuration layer - relay setup
[UPDATE]: When adding new configuration options
*/

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use steadylink_client::ClientConfig;

/// Top-level configuration for the relay
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RelayConfig {
    /// WebSocket endpoint (e.g., "wss://feed.example.com/stream")
    #[serde(default)]
    pub url: Option<String>,
    /// Connection behavior
    #[serde(default)]
    pub client: ClientConfig,
    /// Extra time on top of the close timeout before shutdown gives up
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: None,
            client: ClientConfig::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

impl RelayConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("parse relay config")?;
        config.client.validate().context("invalid client settings")?;
        Ok(config)
    }

    /// CLI flags win over file values.
    pub fn with_url_override(mut self, url: Option<String>) -> Self {
        if url.is_some() {
            self.url = url;
        }
        self
    }

    pub fn target(&self) -> Result<&str> {
        match self.url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => bail!("no target url; set `url` in the config or pass --url"),
        }
    }

    /// How long shutdown waits for the close handshake.
    pub fn shutdown_timeout(&self) -> Duration {
        self.client.close_timeout() + Duration::from_millis(self.shutdown_grace_ms)
    }
}
