/*
[INPUT]:  Instrument ids on the command line (e.g., "BTC-USDT ETH-USDT")
[OUTPUT]: Logged top-of-book changes and connection events
[POS]:    Examples - public order book streaming
[UPDATE]: When the connector surface changes
*/

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use venue_stream::*;

/// Example: stream checksum-verified order books (no authentication required)
#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let mut symbols: Vec<String> = std::env::args().skip(1).collect();
    if symbols.is_empty() {
        symbols.push("BTC-USDT".to_string());
    }

    let config = StreamConfig {
        private_url: None,
        ..StreamConfig::default()
    };
    let (sink, mut events) = DataSink::channel(config.sink_capacity);
    let connector = Arc::new(StreamConnector::new(config, sink)?);

    let subs = symbols
        .iter()
        .map(|symbol| {
            let instrument = Instrument::new(symbol.as_str(), AssetClass::guess_from_inst_id(symbol));
            Subscription::for_instrument("books", &instrument)
        })
        .collect();
    connector.subscribe(subs).await?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        ctrl_c.cancel();
    });

    let runner = {
        let connector = Arc::clone(&connector);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { connector.run(shutdown).await })
    };

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        match event {
            DataEvent::OrderBook(update) => info!(
                book = %update.key,
                bid = ?update.best_bid.map(|level| level.price),
                ask = ?update.best_ask.map(|level| level.price),
                checksum = update.checksum,
                "book"
            ),
            DataEvent::Connection { kind, connected, reason } => {
                info!(%kind, connected, reason = reason.as_deref().unwrap_or(""), "connection")
            }
            DataEvent::Error(err) => warn!(error = %err, "stream error"),
            _ => {}
        }
    }

    match runner.await {
        Ok(result) => result,
        Err(err) => Err(StreamError::Config(format!("connector task failed: {err}"))),
    }
}
