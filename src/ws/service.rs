#![expect(
    clippy::module_name_repetitions,
    reason = "The service facade is named after what it serves"
)]

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{broadcast, watch};

use super::config::Config;
use super::connection::{ConnectionManager, ConnectionState};
use super::error::{CancelReason, WsError};
use super::event::{Event, EventSink, Listener};
use super::queue::WriteQueue;
use super::subscription::{SubscriptionId, SubscriptionInfo, SubscriptionRegistry};
use super::token::TokenProvider;
use super::traits::{EventRouter, MessageCallback, SessionHandler, Subscriber};
use super::types::{OutboundFrame, TopicEvent};
use crate::Result;

/// WebSocket push-data client.
///
/// Holds one [`ConnectionManager`] and one [`SubscriptionRegistry`]. Subscriptions
/// outlive individual connections: after every reconnect they are replayed in the
/// order they were created, before the connection is reported as
/// [`ConnectionState::Connected`].
///
/// # Example
///
/// ```rust, no_run
/// use kucoin_ws_engine::rest::HttpTransport;
/// use kucoin_ws_engine::types::{Channel, Domain};
/// use kucoin_ws_engine::ws::{BulletTokenProvider, Config, TopicEvent, WsService};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let provider = BulletTokenProvider::new(HttpTransport::default(), Domain::Spot, Channel::Public);
///     let service = WsService::new(provider, Config::default());
///     service.start()?;
///
///     service
///         .subscribe("/market/ticker", vec!["BTC-USDT".to_owned()], |event: &TopicEvent| -> kucoin_ws_engine::Result<()> {
///             println!("{}: {}", event.topic, event.data);
///             Ok(())
///         })
///         .await?;
///
///     tokio::signal::ctrl_c().await?;
///     service.stop().await;
///     Ok(())
/// }
/// ```
pub struct WsService<P> {
    connection: ConnectionManager<P>,
    registry: Arc<SubscriptionRegistry>,
    events: EventSink,
}

impl<P> Clone for WsService<P> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
        }
    }
}

impl<P> fmt::Debug for WsService<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsService")
            .field("connection", &self.connection)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<P: TokenProvider> WsService<P> {
    /// Build a service. Nothing connects until [`Self::start`].
    #[must_use]
    pub fn new(provider: P, config: Config) -> Self {
        let events = EventSink::default();
        let registry = Arc::new(SubscriptionRegistry::new(&config, events.clone()));
        let queue = WriteQueue::new(config.write_buffer);
        let connection = ConnectionManager::new(
            provider,
            config,
            queue,
            Arc::clone(&registry) as Arc<dyn EventRouter>,
            Arc::clone(&registry) as Arc<dyn SessionHandler>,
            events.clone(),
        );

        Self {
            connection,
            registry,
            events,
        }
    }

    /// Start connecting in the background.
    pub fn start(&self) -> Result<()> {
        self.connection.start()
    }

    /// Stop for good. Pending writes and subscribe calls fail with
    /// [`CancelReason::Stopped`], every subscription is dropped, and subscription streams
    /// and listeners end after [`Event::ClientShutdown`]. Idempotent.
    pub async fn stop(&self) {
        self.connection.stop().await;
        self.registry.shutdown().await;
        self.events.close();
    }

    /// Subscribe to `prefix` for `args`; `callback` receives every matching event.
    ///
    /// `args` are comma-joined into as few wire subscriptions as the batch limit allows.
    /// Each call creates an independent subscription, even for a topic that is already
    /// subscribed.
    pub async fn subscribe<C: MessageCallback>(
        &self,
        prefix: &str,
        args: Vec<String>,
        callback: C,
    ) -> Result<SubscriptionId> {
        self.ensure_running()?;
        self.registry.add(prefix, args, Arc::new(callback)).await
    }

    /// Like [`Self::subscribe`], with events delivered as a stream.
    ///
    /// Dropping the stream stops delivery but keeps the server-side subscription until
    /// [`Self::unsubscribe`] is called.
    pub async fn subscribe_stream(
        &self,
        prefix: &str,
        args: Vec<String>,
    ) -> Result<(SubscriptionId, SubscriptionStream)> {
        self.ensure_running()?;
        let (id, mut rx) = self.registry.add_channel(prefix, args).await?;

        let events = stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        };

        Ok((
            id,
            SubscriptionStream {
                inner: Box::pin(events),
            },
        ))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.registry.remove(id).await
    }

    /// Send an arbitrary frame and wait until it is written and, if it asks for a
    /// reply, answered.
    pub async fn write(&self, frame: &OutboundFrame, timeout: Duration) -> Result<()> {
        self.ensure_running()?;
        self.registry.write(frame, timeout).await
    }

    /// Lifecycle events from now on. A receiver that falls behind misses the oldest
    /// events; [`Self::add_listener`] never drops lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Deliver lifecycle events to `listener` from a background task.
    ///
    /// [`Event::RawMessage`] frames are dropped while the listener is behind the feed;
    /// every other event is delivered, in order.
    pub fn add_listener<L: Listener>(&self, listener: L) {
        self.events.forward_to(listener);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_receiver()
    }

    /// Wait until the connection is ready for traffic.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut state_rx = self.connection.state_receiver();
        let state = *tokio::time::timeout(
            timeout,
            state_rx.wait_for(|s| s.is_connected() || s.is_closed()),
        )
        .await
        .map_err(|_elapsed| WsError::Handshake(format!("not connected within {timeout:?}")))?
        .map_err(|_closed| WsError::ConnectionClosed)?;

        if state.is_closed() {
            return Err(WsError::Cancelled(CancelReason::Stopped).into());
        }
        Ok(())
    }

    /// Every registered subscription, in creation order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.subscriptions()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.connection.is_stopped() {
            return Err(WsError::Cancelled(CancelReason::Stopped).into());
        }
        Ok(())
    }
}

#[async_trait]
impl<P: TokenProvider> Subscriber for WsService<P> {
    async fn subscribe_topic(
        &self,
        prefix: &str,
        args: Vec<String>,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<SubscriptionId> {
        self.ensure_running()?;
        self.registry.add(prefix, args, callback).await
    }

    async fn remove_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.registry.remove(id).await
    }
}

/// Events of one subscription, as returned by [`WsService::subscribe_stream`].
pub struct SubscriptionStream {
    inner: Pin<Box<dyn Stream<Item = TopicEvent> + Send>>,
}

impl fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStream").finish_non_exhaustive()
    }
}

impl Stream for SubscriptionStream {
    type Item = TopicEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}
