//! Streams spot tickers and trades from the public push channel.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,kucoin_ws_engine=debug cargo run --example spot_ticker
//! ```
//!
//! Stop with Ctrl-C.

use std::sync::Arc;

use futures_util::StreamExt as _;
use kucoin_ws_engine::rest::HttpTransport;
use kucoin_ws_engine::types::{Channel, Domain};
use kucoin_ws_engine::ws::spot::{KlineInterval, SpotPublic};
use kucoin_ws_engine::ws::{BulletTokenProvider, Config, Event, WsService};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let provider = BulletTokenProvider::new(HttpTransport::default(), Domain::Spot, Channel::Public);
    let service = Arc::new(WsService::new(provider, Config::default()));

    service.add_listener(|event: &Event| match event {
        Event::RawMessage(_) => {}
        Event::Error { kind, message } => warn!(?kind, %message, "transport error"),
        other => info!(event = ?other, "lifecycle"),
    });
    service.start()?;

    let spot = SpotPublic::new(Arc::clone(&service));
    spot.ticker(&["BTC-USDT", "ETH-USDT"], |topic, ticker| {
        info!(%topic, price = %ticker.price, bid = %ticker.best_bid, ask = %ticker.best_ask, "ticker");
        Ok(())
    })
    .await?;
    spot.klines("BTC-USDT", KlineInterval::OneMinute, |topic, kline| {
        info!(%topic, candles = ?kline.candles, "kline");
        Ok(())
    })
    .await?;

    let (_, mut trades) = service
        .subscribe_stream("/market/match", vec!["BTC-USDT".to_owned()])
        .await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = trades.next() => {
                info!(topic = %event.topic, data = %event.data, "trade");
            }
        }
    }

    service.stop().await;
    Ok(())
}
