//! Partial book depth
//!
//! Subscribes to the top 10 levels of two order books on one combined
//! connection, prints best bid/ask for a while, then drops one book and
//! shuts down.
//!
//! ```text
//! cargo run --example partial_book_depth
//! ```

use rust_fstream::{Payload, StreamClient, StreamConfig};
use serde::Deserialize;
use std::time::Duration;

/// Fields of a depth update this demo looks at
#[derive(Debug, Deserialize)]
struct DepthUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

fn print_top(payload: Payload) {
    match payload.parse::<DepthUpdate>() {
        Ok(depth) => {
            let bid = depth.bids.first().map(|level| level[0].as_str()).unwrap_or("-");
            let ask = depth.asks.first().map(|level| level[0].as_str()).unwrap_or("-");
            println!("{:<10} bid {:>12} ask {:>12}", depth.symbol, bid, ask);
        }
        Err(e) => eprintln!("unexpected payload on {:?}: {}", payload.stream(), e),
    }
}

#[tokio::main]
async fn main() -> rust_fstream::Result<()> {
    tracing_subscriber::fmt::init();

    let client = StreamClient::new(StreamConfig::default())?;
    client.start()?;

    client.subscribe(1, ["btcusdt@depth10@100ms"], print_top)?;
    client.subscribe(2, ["ethusdt@depth10@100ms"], print_top)?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    client.unsubscribe(2)?;

    tokio::time::sleep(Duration::from_secs(3)).await;
    client.stop().await?;

    let metrics = client.metrics();
    println!(
        "frames {} deliveries {} reconnects {}",
        metrics.frames_received, metrics.deliveries, metrics.reconnects
    );
    Ok(())
}
