//! Spot public market-data topics.
//!
//! [`SpotPublic`] is written against the [`Subscriber`] capability only, so it works with
//! a [`super::WsService`] or any other implementation (including test doubles).

#![expect(
    clippy::module_name_repetitions,
    reason = "Adapter names carry their domain when imported elsewhere"
)]

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use strum_macros::Display;

use super::subscription::SubscriptionId;
use super::traits::{MessageCallback, Subscriber};
use super::types::TopicEvent;
use crate::Result;

const TICKER: &str = "/market/ticker";
const TRADE: &str = "/market/match";
const LEVEL5: &str = "/spotMarket/level2Depth5";
const CANDLES: &str = "/market/candles";

/// Candle width for [`SpotPublic::klines`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum KlineInterval {
    #[strum(serialize = "1min")]
    OneMinute,
    #[strum(serialize = "3min")]
    ThreeMinutes,
    #[strum(serialize = "5min")]
    FiveMinutes,
    #[strum(serialize = "15min")]
    FifteenMinutes,
    #[strum(serialize = "30min")]
    ThirtyMinutes,
    #[strum(serialize = "1hour")]
    OneHour,
    #[strum(serialize = "2hour")]
    TwoHours,
    #[strum(serialize = "4hour")]
    FourHours,
    #[strum(serialize = "6hour")]
    SixHours,
    #[strum(serialize = "8hour")]
    EightHours,
    #[strum(serialize = "12hour")]
    TwelveHours,
    #[strum(serialize = "1day")]
    OneDay,
    #[strum(serialize = "1week")]
    OneWeek,
    #[strum(serialize = "1month")]
    OneMonth,
}

/// Best bid/ask and last trade.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub sequence: String,
    pub price: String,
    pub size: String,
    pub best_ask: String,
    pub best_ask_size: String,
    pub best_bid: String,
    pub best_bid_size: String,
    pub time: i64,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub symbol: String,
    pub sequence: String,
    pub side: String,
    pub price: String,
    pub size: String,
    pub trade_id: String,
    pub maker_order_id: String,
    pub taker_order_id: String,
    /// Nanoseconds
    pub time: String,
    #[serde(rename = "type")]
    pub trade_type: String,
}

/// Top five price levels, each `[price, size]`.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Level5 {
    pub asks: Vec<[String; 2]>,
    pub bids: Vec<[String; 2]>,
    pub timestamp: i64,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Kline {
    pub symbol: String,
    /// Start time, open, close, high, low, volume, turnover
    pub candles: Vec<String>,
    /// Nanoseconds
    pub time: i64,
}

/// Spot public push channels.
#[derive(Clone, Debug)]
pub struct SpotPublic<S> {
    subscriber: S,
}

impl<S: Subscriber> SpotPublic<S> {
    #[must_use]
    pub fn new(subscriber: S) -> Self {
        Self { subscriber }
    }

    /// Ticker updates for `symbols`.
    pub async fn ticker<F>(&self, symbols: &[&str], callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, Ticker) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(TICKER, owned(symbols), callback).await
    }

    /// Ticker updates for every symbol. The subject of each event is the symbol.
    pub async fn all_tickers<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, Ticker) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(TICKER, vec!["all".to_owned()], callback).await
    }

    pub async fn trade<F>(&self, symbols: &[&str], callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, Trade) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(TRADE, owned(symbols), callback).await
    }

    pub async fn level5<F>(&self, symbols: &[&str], callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&str, Level5) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(LEVEL5, owned(symbols), callback).await
    }

    /// Candles of `interval` for `symbol`.
    pub async fn klines<F>(
        &self,
        symbol: &str,
        interval: KlineInterval,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&str, Kline) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(CANDLES, vec![format!("{symbol}_{interval}")], callback)
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.subscriber.remove_subscription(id).await
    }

    async fn subscribe<T, F>(
        &self,
        prefix: &str,
        args: Vec<String>,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&str, T) -> Result<()> + Send + Sync + 'static,
    {
        let callback = Typed {
            callback,
            _model: PhantomData,
        };
        self.subscriber
            .subscribe_topic(prefix, args, Arc::new(callback))
            .await
    }
}

fn owned(symbols: &[&str]) -> Vec<String> {
    symbols.iter().map(|s| (*s).to_owned()).collect()
}

/// Parses the payload before handing it to the caller.
struct Typed<T, F> {
    callback: F,
    _model: PhantomData<fn() -> T>,
}

impl<T, F> MessageCallback for Typed<T, F>
where
    T: DeserializeOwned + 'static,
    F: Fn(&str, T) -> Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, event: &TopicEvent) -> Result<()> {
        let data = event.parse::<T>()?;
        (self.callback)(&event.topic, data)
    }
}
