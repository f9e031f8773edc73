/*
[INPUT]:  CLI arguments, YAML configuration file, stdin lines, OS shutdown signals
[OUTPUT]: Client events as JSON lines on stdout, graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use steadylink_client::SteadyClient;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use steadylink_relay::{RelayConfig, run_relay, shutdown_client};

#[derive(Parser, Debug)]
#[command(name = "steadylink-relay", version, about = "Relay stdin lines over a self-healing WebSocket")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
    #[arg(long = "url", value_name = "URL")]
    url: Option<String>,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "log-file", value_name = "PATH")]
    log_file: Option<PathBuf>,
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let _log_guard = init_tracing(&args.log_level, args.log_file.as_ref())?;

    info!(
        config_path = ?args.config_path,
        dry_run = args.dry_run,
        "starting steadylink-relay"
    );

    let config = load_config(args.config_path.as_ref())?.with_url_override(args.url);
    let target = config.target()?.to_string();
    info!(%target, max_attempts = config.client.max_attempts, "configuration loaded");

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let client = SteadyClient::websocket(config.client.clone()).context("start client")?;
    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    client.connect(target.as_str()).context("connect")?;

    let stdin = BufReader::new(tokio::io::stdin());
    let summary = run_relay(&client, stdin, tokio::io::stdout(), shutdown)
        .await
        .context("relay")?;
    info!(?summary, "relay finished");

    shutdown_client(&client, config.shutdown_timeout()).await;
    info!("shutdown complete");

    Ok(())
}

fn init_tracing(log_level: &str, log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;

    // Logs go to stderr or a file; stdout carries the event stream.
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|err| anyhow!(err))
                .context("initialize tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|err| anyhow!(err))
                .context("initialize tracing subscriber")?;
            Ok(None)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::from_file(path).context("load config"),
        None => Ok(RelayConfig::default()),
    }
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
