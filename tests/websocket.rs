#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{MockWsServer, refused_endpoint};
use futures_util::StreamExt as _;
use httpmock::Method::POST;
use httpmock::MockServer;
use kucoin_ws_engine::Result;
use kucoin_ws_engine::error::{Error, Kind};
use kucoin_ws_engine::rest::{Endpoints, HttpTransport};
use kucoin_ws_engine::types::{Channel, Domain};
use kucoin_ws_engine::ws::{
    BulletTokenProvider, CancelReason, Config, ConnectionState, Event, OutboundFrame,
    StaticTokenProvider,
    SubscriptionStatus, SubscriptionStream, Token, TokenProvider, TopicEvent, WsError, WsService,
};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn token(endpoint: &str) -> Token {
    Token::new(
        endpoint,
        "test-token",
        Duration::from_secs(30),
        Duration::from_secs(10),
    )
}

fn config() -> Config {
    let mut config = Config::default();
    config.reconnect.initial_backoff = Duration::from_millis(50);
    config.reconnect.max_backoff = Duration::from_millis(200);
    config
}

fn service(server: &MockWsServer, config: Config) -> WsService<StaticTokenProvider> {
    let provider = StaticTokenProvider::new(vec![token(&server.endpoint())]);
    WsService::new(provider, config)
}

async fn connected(server: &MockWsServer, config: Config) -> WsService<StaticTokenProvider> {
    let service = service(server, config);
    service.start().unwrap();
    service.wait_until_connected(WAIT).await.unwrap();
    service
}

async fn wait_for<F>(events: &mut broadcast::Receiver<Event>, pred: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap()
}

async fn next_event(stream: &mut SubscriptionStream) -> TopicEvent {
    timeout(WAIT, stream.next()).await.unwrap().unwrap()
}

fn push(server: &MockWsServer, topic: &str, subject: &str) {
    server.push(&json!({
        "type": "message",
        "topic": topic,
        "subject": subject,
        "data": { "price": "1.5" }
    }));
}

fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

fn cancel_reason(err: &Error) -> Option<CancelReason> {
    match err.downcast_ref::<WsError>() {
        Some(WsError::Cancelled(reason)) => Some(*reason),
        _ => None,
    }
}

#[tokio::test]
async fn multiplexed_args_share_one_subscribe_frame() {
    let mut server = MockWsServer::start().await;
    let service = connected(&server, config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    service
        .subscribe(
            "trade",
            symbols(&["BTC-USDT", "ETH-USDT"]),
            move |event: &TopicEvent| -> Result<()> {
                drop(tx.send(event.clone()));
                Ok(())
            },
        )
        .await
        .unwrap();

    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["topic"], "trade:BTC-USDT,ETH-USDT");
    assert_eq!(frame["response"], true);
    assert_eq!(frame["privateChannel"], false);

    push(&server, "trade:ETH-USDT", "trade.l3match");
    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.topic, "trade:ETH-USDT");
    assert_eq!(event.subject, "trade.l3match");

    service.stop().await;
}

#[tokio::test]
async fn private_channel_is_flagged_on_subscribe() {
    let mut server = MockWsServer::start().await;
    let mut config = config();
    config.channel = Channel::Private;
    let service = connected(&server, config).await;

    service
        .subscribe_stream("/spotMarket/tradeOrders", Vec::new())
        .await
        .unwrap();

    let frame = server.next_frame().await;
    assert_eq!(frame["topic"], "/spotMarket/tradeOrders");
    assert_eq!(frame["privateChannel"], true);

    service.stop().await;
}

#[tokio::test]
async fn second_token_is_used_when_first_refuses() {
    let server = MockWsServer::start().await;
    let provider = StaticTokenProvider::new(vec![
        token(&refused_endpoint().await),
        token(&server.endpoint()),
    ]);
    let service = WsService::new(provider, config());
    let mut events = service.events();

    service.start().unwrap();
    service.wait_until_connected(WAIT).await.unwrap();

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, Event::Connected { .. })).await,
        Event::Connected { generation: 1 }
    );
    assert_eq!(server.connections(), 1);

    service.stop().await;
}

#[tokio::test]
async fn write_timeout_leaves_connection_usable() {
    let mut server = MockWsServer::start().await;
    server.silence("/market/slow:X");
    let service = connected(&server, config()).await;

    let slow = OutboundFrame::subscribe("/market/slow:X".to_owned(), false);
    let err = service
        .write(&slow, Duration::from_millis(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::WriteTimeout);

    let fast = OutboundFrame::subscribe("/market/ticker:BTC-USDT".to_owned(), false);
    service.write(&fast, Duration::from_secs(2)).await.unwrap();

    assert_eq!(server.next_frame().await["topic"], "/market/slow:X");
    assert_eq!(server.next_frame().await["topic"], "/market/ticker:BTC-USDT");
    assert_eq!(server.connections(), 1, "a write timeout never reconnects");

    service.stop().await;
}

#[tokio::test]
async fn forced_close_replays_subscriptions_in_order() {
    let mut server = MockWsServer::start().await;
    let service = connected(&server, config()).await;
    let mut events = service.events();

    let mut streams = Vec::new();
    for (prefix, symbol) in [
        ("/market/ticker", "BTC-USDT"),
        ("/market/match", "ETH-USDT"),
        ("/spotMarket/level2Depth5", "XRP-USDT"),
    ] {
        let (_, stream) = service
            .subscribe_stream(prefix, symbols(&[symbol]))
            .await
            .unwrap();
        streams.push((format!("{prefix}:{symbol}"), stream));
    }
    let first: Vec<_> = [
        server.next_frame().await,
        server.next_frame().await,
        server.next_frame().await,
    ]
    .iter()
    .map(|f| f["topic"].as_str().unwrap().to_owned())
    .collect();

    server.disconnect_all();
    wait_for(&mut events, |e| matches!(e, Event::Reconnected { generation: 2 })).await;

    let replayed: Vec<_> = [
        server.next_frame().await,
        server.next_frame().await,
        server.next_frame().await,
    ]
    .iter()
    .map(|f| f["topic"].as_str().unwrap().to_owned())
    .collect();
    assert_eq!(replayed, first, "replay follows creation order");
    assert!(
        service
            .subscriptions()
            .iter()
            .all(|s| s.status == SubscriptionStatus::Active),
        "every subscription is active again"
    );

    for (topic, stream) in &mut streams {
        push(&server, topic, "resumed");
        let event = next_event(stream).await;
        assert_eq!(&event.topic, topic);
    }

    service.stop().await;
}

#[tokio::test]
async fn missed_pongs_force_reconnect() {
    let server = MockWsServer::start().await;
    server.mute_pongs(true);

    let mut config = config();
    config.heartbeat_interval = Some(Duration::from_millis(50));
    config.heartbeat_timeout = Some(Duration::from_millis(50));
    let service = service(&server, config);
    let mut events = service.events();
    service.start().unwrap();

    let event = wait_for(&mut events, |e| matches!(e, Event::Disconnected { .. })).await;
    assert!(
        matches!(event, Event::Disconnected { generation: 1, .. }),
        "unexpected event: {event:?}"
    );

    server.mute_pongs(false);
    wait_for(&mut events, |e| matches!(e, Event::Reconnected { .. })).await;
    assert!(server.connections() >= 2, "heartbeat timeout reconnects");

    service.stop().await;
}

#[tokio::test]
async fn pong_tolerance_counts_consecutive_misses() {
    let server = MockWsServer::start().await;
    server.mute_pongs(true);

    let mut config = config();
    config.heartbeat_interval = Some(Duration::from_millis(40));
    config.heartbeat_timeout = Some(Duration::from_millis(20));
    config.missed_pong_tolerance = 2;
    let service = service(&server, config);
    let mut events = service.events();
    service.start().unwrap();

    let event = wait_for(&mut events, |e| matches!(e, Event::Disconnected { .. })).await;
    assert_eq!(
        event,
        Event::Disconnected {
            generation: 1,
            reason: "Heartbeat timeout: 2 consecutive pings without PONG".to_owned(),
        }
    );
    assert!(server.pings() >= 2, "one missed pong is tolerated");

    service.stop().await;
}

#[tokio::test]
async fn answered_pings_keep_connection() {
    let server = MockWsServer::start().await;
    let mut config = config();
    config.heartbeat_interval = Some(Duration::from_millis(30));
    config.heartbeat_timeout = Some(Duration::from_millis(100));
    let service = connected(&server, config).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(server.pings() >= 3, "pings are sent on the interval");
    assert_eq!(server.connections(), 1);
    assert!(service.state().is_connected(), "still connected");

    service.stop().await;
}

#[tokio::test]
async fn rejected_subscribe_is_surfaced_and_not_kept() {
    let server = MockWsServer::start().await;
    server.reject("/market/nope:BTC-USDT");
    let service = connected(&server, config()).await;

    let err = service
        .subscribe_stream("/market/nope", symbols(&["BTC-USDT"]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Kind::Subscription);
    assert!(
        matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::SubscriptionFailed { code: Some(code), .. }) if code == "404"
        ),
        "unexpected error: {err}"
    );
    assert!(service.subscriptions().is_empty(), "rejected entries are evicted");

    service.stop().await;
}

#[tokio::test]
async fn unsubscribe_spares_args_still_in_use() {
    let mut server = MockWsServer::start().await;
    let service = connected(&server, config()).await;

    let (both, _s1) = service
        .subscribe_stream("/market/ticker", symbols(&["BTC-USDT", "ETH-USDT"]))
        .await
        .unwrap();
    let (btc, _s2) = service
        .subscribe_stream("/market/ticker", symbols(&["BTC-USDT"]))
        .await
        .unwrap();
    server.next_frame().await;
    server.next_frame().await;

    service.unsubscribe(both).await.unwrap();
    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "unsubscribe");
    assert_eq!(frame["topic"], "/market/ticker:ETH-USDT");

    service.unsubscribe(btc).await.unwrap();
    assert_eq!(server.next_frame().await["topic"], "/market/ticker:BTC-USDT");
    assert!(service.subscriptions().is_empty());

    let err = service.unsubscribe(btc).await.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<WsError>(), Some(WsError::UnknownSubscription(_))),
        "unexpected error: {err}"
    );

    service.stop().await;
}

#[tokio::test]
async fn duplicate_subscriptions_are_independent() {
    let server = MockWsServer::start().await;
    let service = connected(&server, config()).await;

    let (a, mut first) = service
        .subscribe_stream("/market/match", symbols(&["BTC-USDT"]))
        .await
        .unwrap();
    let (b, mut second) = service
        .subscribe_stream("/market/match", symbols(&["BTC-USDT"]))
        .await
        .unwrap();
    assert_ne!(a, b);

    push(&server, "/market/match:BTC-USDT", "trade.l3match");
    assert_eq!(next_event(&mut first).await.subject, "trade.l3match");
    assert_eq!(next_event(&mut second).await.subject, "trade.l3match");

    service.stop().await;
}

#[tokio::test]
async fn subscribe_before_start_is_sent_on_connect() {
    let mut server = MockWsServer::start().await;
    let service = service(&server, config());

    let (id, mut stream) = service
        .subscribe_stream("/market/ticker", symbols(&["BTC-USDT"]))
        .await
        .unwrap();
    assert_eq!(service.subscriptions()[0].status, SubscriptionStatus::Pending);

    service.start().unwrap();
    service.wait_until_connected(WAIT).await.unwrap();

    assert_eq!(server.next_frame().await["topic"], "/market/ticker:BTC-USDT");
    let info = &service.subscriptions()[0];
    assert_eq!(info.id, id);
    assert_eq!(info.status, SubscriptionStatus::Active);

    push(&server, "/market/ticker:BTC-USDT", "trade.ticker");
    assert_eq!(next_event(&mut stream).await.subject, "trade.ticker");

    service.stop().await;
}

#[tokio::test]
async fn callback_errors_are_reported() {
    let server = MockWsServer::start().await;
    let service = connected(&server, config()).await;
    let mut events = service.events();

    let id = service
        .subscribe("/market/ticker", symbols(&["BTC-USDT"]), |_: &TopicEvent| {
            Err(Error::validation("bad payload"))
        })
        .await
        .unwrap();

    push(&server, "/market/ticker:BTC-USDT", "trade.ticker");
    let event = wait_for(&mut events, |e| matches!(e, Event::CallbackError { .. })).await;
    assert!(
        matches!(event, Event::CallbackError { id: failed, .. } if failed == id),
        "unexpected event: {event:?}"
    );
    assert!(service.state().is_connected(), "callback errors are not fatal");

    service.stop().await;
}

#[tokio::test]
async fn stop_is_terminal() {
    let server = MockWsServer::start().await;
    let service = connected(&server, config()).await;
    let mut events = service.events();

    service.stop().await;
    service.stop().await;

    assert_eq!(service.state(), ConnectionState::Closed);
    wait_for(&mut events, |e| *e == Event::ClientShutdown).await;

    let frame = OutboundFrame::ping();
    let err = service.write(&frame, WAIT).await.unwrap_err();
    assert_eq!(err.kind(), Kind::Cancelled);

    let err = service
        .subscribe_stream("/market/ticker", symbols(&["BTC-USDT"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Kind::Cancelled);

    assert!(service.start().is_err(), "a stopped service cannot restart");
}

#[tokio::test]
async fn stop_cancels_inflight_requests() {
    let mut server = MockWsServer::start().await;
    server.silence("/market/slow:X");
    server.silence("/market/slow:Y");
    let service = connected(&server, config()).await;

    let subscribing = tokio::spawn({
        let service = service.clone();
        async move {
            service
                .subscribe_stream("/market/slow", symbols(&["X"]))
                .await
                .map(|(id, _)| id)
        }
    });
    assert_eq!(server.next_frame().await["topic"], "/market/slow:X");

    let writing = tokio::spawn({
        let service = service.clone();
        async move {
            let frame = OutboundFrame::subscribe("/market/slow:Y".to_owned(), false);
            service.write(&frame, WAIT).await
        }
    });
    assert_eq!(server.next_frame().await["topic"], "/market/slow:Y");

    service.stop().await;

    let err = subscribing.await.unwrap().unwrap_err();
    assert_eq!(cancel_reason(&err), Some(CancelReason::Stopped), "subscribe: {err}");
    let err = writing.await.unwrap().unwrap_err();
    assert_eq!(cancel_reason(&err), Some(CancelReason::Stopped), "write: {err}");

    assert_eq!(service.state(), ConnectionState::Closed);
    assert!(service.subscriptions().is_empty(), "nothing is left pending");
}

#[tokio::test]
async fn connection_loss_cancels_inflight_write() {
    let mut server = MockWsServer::start().await;
    server.silence("/market/slow:X");
    let service = connected(&server, config()).await;
    let mut events = service.events();

    let writing = tokio::spawn({
        let service = service.clone();
        async move {
            let frame = OutboundFrame::subscribe("/market/slow:X".to_owned(), false);
            service.write(&frame, WAIT).await
        }
    });
    assert_eq!(server.next_frame().await["topic"], "/market/slow:X");

    server.disconnect_all();

    let err = writing.await.unwrap().unwrap_err();
    assert_eq!(cancel_reason(&err), Some(CancelReason::ConnectionLost), "{err}");

    wait_for(&mut events, |e| matches!(e, Event::Reconnected { generation: 2 })).await;
    assert!(service.state().is_connected(), "the service recovers");

    service.stop().await;
}

#[tokio::test]
async fn stop_ends_subscription_streams() {
    let server = MockWsServer::start().await;
    let service = connected(&server, config()).await;
    let (_, mut stream) = service
        .subscribe_stream("/market/ticker", symbols(&["BTC-USDT"]))
        .await
        .unwrap();

    service.stop().await;

    assert!(
        timeout(WAIT, stream.next()).await.unwrap().is_none(),
        "the stream ends once the service stops"
    );
}

#[tokio::test]
async fn subscribe_during_replay_waits_for_the_pass() {
    let mut server = MockWsServer::start().await;
    let mut config = config();
    config.write_timeout = Duration::from_millis(300);
    let service = connected(&server, config).await;
    let mut events = service.events();

    let (slow, _slow_stream) = service
        .subscribe_stream("/market/ticker", symbols(&["A"]))
        .await
        .unwrap();
    assert_eq!(server.next_frame().await["topic"], "/market/ticker:A");

    // The replayed subscribe is never answered, holding the pass open until it times out
    server.silence("/market/ticker:A");
    server.disconnect_all();
    assert_eq!(server.next_frame().await["topic"], "/market/ticker:A");

    let (late, _late_stream) = service
        .subscribe_stream("/market/ticker", symbols(&["B"]))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(
        seen.iter()
            .any(|e| matches!(e, Event::ResubscribeError { id, .. } if *id == slow)),
        "the replay pass finished before the new subscribe went out: {seen:?}"
    );
    assert_eq!(server.next_frame().await["topic"], "/market/ticker:B");

    let statuses: Vec<_> = service
        .subscriptions()
        .iter()
        .map(|s| (s.id, s.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (slow, SubscriptionStatus::Pending),
            (late, SubscriptionStatus::Active)
        ]
    );

    service.stop().await;
}

#[tokio::test]
async fn unsubscribe_before_ack_still_unsubscribes() {
    let mut server = MockWsServer::start().await;
    server.silence("/market/slow:X");
    let mut config = config();
    config.write_timeout = Duration::from_millis(300);
    let service = connected(&server, config).await;

    let subscribing = tokio::spawn({
        let service = service.clone();
        async move {
            service
                .subscribe_stream("/market/slow", symbols(&["X"]))
                .await
                .map(|(id, _)| id)
        }
    });
    assert_eq!(server.next_frame().await["type"], "subscribe");

    let pending = service.subscriptions()[0].clone();
    assert_eq!(pending.status, SubscriptionStatus::Pending);
    service.unsubscribe(pending.id).await.unwrap();

    let frame = server.next_frame().await;
    assert_eq!(frame["type"], "unsubscribe");
    assert_eq!(frame["topic"], "/market/slow:X");
    assert!(service.subscriptions().is_empty());

    let err = subscribing.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), Kind::WriteTimeout);

    service.stop().await;
}

/// Fails the first `failures` fetches.
struct FlakyProvider {
    endpoint: String,
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl TokenProvider for FlakyProvider {
    async fn tokens(&self) -> Result<Vec<Token>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(WsError::TokenFetch("bullet endpoint unavailable".to_owned()).into());
        }
        Ok(vec![token(&self.endpoint)])
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn token_fetch_failures_are_retried() {
    let server = MockWsServer::start().await;
    let provider = Arc::new(FlakyProvider {
        endpoint: server.endpoint(),
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let service = WsService::new(Arc::clone(&provider), config());
    let mut events = service.events();
    service.start().unwrap();

    let event = wait_for(&mut events, |e| matches!(e, Event::Error { .. })).await;
    assert!(
        matches!(event, Event::Error { kind: Kind::TokenFetch, .. }),
        "unexpected event: {event:?}"
    );
    service.wait_until_connected(WAIT).await.unwrap();
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    service.stop().await;
}

#[tokio::test]
async fn reconnect_limit_closes_service() {
    let mut config = config();
    config.reconnect.max_attempts = Some(2);
    let provider = StaticTokenProvider::new(vec![token(&refused_endpoint().await)]);
    let service = WsService::new(provider, config);
    let mut events = service.events();
    service.start().unwrap();

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, Event::ClientFail { .. })).await,
        Event::ClientFail { attempts: 2 }
    );
    let err = service.wait_until_connected(WAIT).await.unwrap_err();
    assert_eq!(err.kind(), Kind::Cancelled);
}

#[tokio::test]
async fn bullet_bootstrap_end_to_end() {
    let ws = MockWsServer::start().await;
    let rest = MockServer::start();
    let mock = rest.mock(|when, then| {
        when.method(POST).path("/api/v1/bullet-public");
        then.status(200).json_body(json!({
            "code": "200000",
            "data": {
                "token": "bullet-token",
                "instanceServers": [{
                    "endpoint": ws.endpoint(),
                    "encrypt": false,
                    "protocol": "websocket",
                    "pingInterval": 18000,
                    "pingTimeout": 10000
                }]
            }
        }));
    });

    let transport = HttpTransport::new(Endpoints::uniform(&rest.base_url()));
    let provider = BulletTokenProvider::new(transport, Domain::Spot, Channel::Public);
    let service = WsService::new(provider, config());
    service.start().unwrap();
    service.wait_until_connected(WAIT).await.unwrap();

    mock.assert();
    assert_eq!(ws.last_query().as_deref().map(|q| q.contains("token=bullet-token")), Some(true));

    service.stop().await;
}

#[tokio::test]
async fn listener_sees_lifecycle() {
    let server = MockWsServer::start().await;
    let service = service(&server, config());
    let connected = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&connected);
    service.add_listener(move |event: &Event| {
        if matches!(event, Event::Connected { .. }) {
            flag.store(true, Ordering::SeqCst);
        }
    });
    service.start().unwrap();
    service.wait_until_connected(WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(connected.load(Ordering::SeqCst), "listener was notified");

    service.stop().await;
}
