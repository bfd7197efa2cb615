//! Command-line market data streamer
//!
//! Subscribes the given streams under one id and prints every payload.
//!
//! ```text
//! rust-fstream btcusdt@aggTrade ethusdt@aggTrade
//! rust-fstream --raw --seconds 30 btcusdt@bookTicker
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rust_fstream::infrastructure::logging::init_logging;
use rust_fstream::{ClientEvent, Config, StreamClient, StreamMode};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Streams market data from a Binance-style WebSocket endpoint", long_about = None)]
struct Args {
    /// Configuration file (defaults to $CONFIG_PATH or config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connect to the raw single-stream endpoint instead of the combined one
    #[arg(long)]
    raw: bool,

    /// Subscription id to use
    #[arg(long, default_value_t = 1)]
    id: u64,

    /// Stop after this many seconds (runs until Ctrl-C when omitted)
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Stream names, e.g. btcusdt@aggTrade
    #[arg(required = true)]
    streams: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path.clone()),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    if args.raw {
        config.stream.mode = StreamMode::Raw;
    }

    let _guards = init_logging(&config.logging).context("Failed to initialize logging")?;

    let client = StreamClient::new(config.stream.clone()).context("Invalid stream configuration")?;
    let mut events = client.events();

    client
        .subscribe(args.id, args.streams.clone(), |payload| match payload.stream() {
            Some(stream) => println!("{} {}", stream, payload.as_str()),
            None => println!("{}", payload.as_str()),
        })
        .context("Failed to subscribe")?;
    client.start()?;

    tracing::info!(id = args.id, streams = ?args.streams, "streaming");

    let deadline = async {
        match args.seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down");
                break;
            }
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(ClientEvent::Error(e)) => tracing::warn!(error = %e, "stream error"),
                Ok(ClientEvent::ConnectionLost(reason)) => tracing::warn!(reason = %reason, "reconnecting"),
                Ok(ClientEvent::StateChanged(state)) => tracing::debug!(state = %state, "state changed"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event receiver lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.stop().await?;

    let metrics = client.metrics();
    tracing::info!(
        frames = metrics.frames_received,
        deliveries = metrics.deliveries,
        dropped = metrics.dropped_deliveries,
        reconnects = metrics.reconnects,
        "done"
    );

    Ok(())
}
