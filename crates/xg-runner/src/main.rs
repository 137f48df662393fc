//! # xg-runner
//!
//! Entry point for the exchange gateway.
//!
//! Loads a JSON configuration file, probes the REST API, opens one combined
//! stream and subscribes to every configured channel. Pushes are logged until
//! Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! xg-runner config.json --log-level debug
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xg_rest::RestClient;
use xg_stream::{PushHandler, Stream};

/// Exchange gateway: REST probe plus combined stream subscriber.
#[derive(Parser)]
#[command(name = "xg-runner", about = "Exchange REST and combined stream gateway")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Optional log directory for file output. Overrides the config file.
    #[arg(long)]
    log_dir: Option<String>,
}

/// Logs the size of every push on one channel.
struct LogHandler {
    channel: String,
}

#[async_trait]
impl PushHandler for LogHandler {
    async fn event(&self, payload: Vec<u8>) {
        info!(channel = %self.channel, bytes = payload.len(), "push");
    }

    async fn done(&self) {
        info!(channel = %self.channel, "subscription ended");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration, with CLI overrides applied before logging starts
    let mut config = xg_core::config::load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(dir) = cli.log_dir {
        config.log.dir = Some(dir);
    }

    // 2. Logging
    xg_core::logging::init_logging(&config.log)?;
    info!(
        "xg-runner starting: config={}, {} channel(s)",
        cli.config.display(),
        config.channels.len()
    );

    let shutdown = CancellationToken::new();

    // 3. REST probe
    let rest = RestClient::new(&config.rest)?;
    match rest.ping(&shutdown).await {
        Ok(()) => match rest.server_time(&shutdown).await {
            Ok(ms) => info!(server_time_ms = ms, "REST reachable"),
            Err(e) => warn!("server time: {e}"),
        },
        Err(e) => warn!("REST ping failed: {e}"),
    }

    // 4. Combined stream
    let stream = Stream::connect(&config.stream, &shutdown).await?;
    for channel in &config.channels {
        let handler = Arc::new(LogHandler {
            channel: channel.clone(),
        });
        if let Err(e) = stream.subscribe(channel, handler).await {
            error!(%channel, "subscribe failed: {e}");
        }
    }
    info!(
        "{} subscription(s) active, press Ctrl+C to stop",
        stream.subscriptions().len()
    );

    // 5. Run until Ctrl+C or the stream dies on its own
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
        }
        _ = stream.closed() => warn!("stream closed unexpectedly"),
    }

    shutdown.cancel();
    stream.close().await;
    info!("stopped");
    Ok(())
}
