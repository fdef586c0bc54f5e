#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, sleep};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::dispatcher::{Dispatched, MessageDispatcher};
use super::error::{CancelReason, WsError};
use super::event::{Event, EventSink};
use super::queue::{WriteHandle, WriteQueue};
use super::token::{Token, TokenProvider};
use super::traits::{EventRouter, SessionHandler};
use super::types::request::new_id;
use super::types::{InboundMessage, MessageType, OutboundFrame};
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on sending the close frame when a session is torn down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started
    Disconnected,
    /// First connect in progress
    Connecting,
    /// Handshake done and subscriptions replayed
    Connected {
        /// When the connection became ready
        since: Instant,
        /// Generation of the live socket
        generation: u64,
    },
    /// Reconnecting after failure
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Stopped, or gave up after the configured number of attempts. Terminal.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// One connection generation, as seen by a [`SessionHandler`].
#[derive(Debug, Clone)]
pub struct Session {
    generation: u64,
    queue: WriteQueue,
    state_tx: watch::Sender<ConnectionState>,
    closed: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        generation: u64,
        queue: WriteQueue,
        state_tx: watch::Sender<ConnectionState>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            generation,
            queue,
            state_tx,
            closed,
        }
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame on this generation's socket.
    pub async fn send(&self, frame: &OutboundFrame, timeout: Duration) -> Result<WriteHandle> {
        self.queue.enqueue(frame, timeout, self.generation).await
    }

    /// Whether the socket of this generation has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the socket of this generation has gone away.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Report the connection as ready for application traffic.
    pub fn mark_ready(&self) {
        let generation = self.generation;
        let closed = &self.closed;
        self.state_tx.send_if_modified(|state| {
            if state.is_closed() || closed.is_cancelled() {
                return false;
            }
            *state = ConnectionState::Connected {
                since: Instant::now(),
                generation,
            };
            true
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    tolerance: u32,
}

/// Owns the physical socket: connects, runs the read and write loops of each
/// generation, detects dead connections through PING/PONG, and reconnects with
/// exponential backoff until stopped.
pub struct ConnectionManager<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for ConnectionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> fmt::Debug for ConnectionManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.inner.state_tx.borrow())
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct Inner<P> {
    provider: P,
    config: Config,
    queue: WriteQueue,
    dispatcher: Arc<MessageDispatcher>,
    handler: Arc<dyn SessionHandler>,
    events: EventSink,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    stopped: AtomicBool,
}

impl<P: TokenProvider> ConnectionManager<P> {
    pub(crate) fn new(
        provider: P,
        config: Config,
        queue: WriteQueue,
        router: Arc<dyn EventRouter>,
        handler: Arc<dyn SessionHandler>,
        events: EventSink,
    ) -> Self {
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(queue.pending()),
            router,
            events.clone(),
        ));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                provider,
                config,
                queue,
                dispatcher,
                handler,
                events,
                state_tx,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
                generation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the connection loop. Returns immediately.
    pub fn start(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(WsError::Cancelled(CancelReason::Stopped).into());
        }

        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(Error::validation("connection already started"));
        }

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.run()));
        Ok(())
    }

    /// Stop for good: cancel the loops, fail every pending request with
    /// [`CancelReason::Stopped`], close the socket, and move to [`ConnectionState::Closed`].
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "Connection task failed");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        self.inner.queue.pending().fail_all(CancelReason::Stopped);
        self.inner.state_tx.send_replace(ConnectionState::Closed);
        self.inner.provider.close().await;
        self.inner.events.emit(Event::ClientShutdown);

        #[cfg(feature = "tracing")]
        tracing::info!("WebSocket transport stopped");
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst) || self.state().is_closed()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Generation of the most recent socket; 0 before the first connect.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }
}

impl<P: TokenProvider> Inner<P> {
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Main connection loop with automatic reconnection.
    async fn run(self: Arc<Self>) {
        let mut backoff: backoff::ExponentialBackoff = self.config.reconnect.clone().into();
        let mut failures = 0_u32;

        loop {
            if self.generation.load(Ordering::SeqCst) == 0 && failures == 0 {
                self.set_state(ConnectionState::Connecting);
            } else {
                let attempt = failures.saturating_add(1);
                self.set_state(ConnectionState::Reconnecting { attempt });
                self.events.emit(Event::TryReconnect { attempt });

                #[cfg(feature = "tracing")]
                tracing::info!(attempt, "Reconnecting");
            }

            let established = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.establish() => result,
            };

            match established {
                Ok((socket, token)) => {
                    failures = 0;
                    backoff.reset();
                    self.run_session(socket, &token).await;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);

                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt = failures, error = %e, "Unable to connect");

                    self.events.emit(Event::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            // Check if we should stop reconnecting
            if let Some(max) = self.config.reconnect.max_attempts
                && failures >= max
            {
                #[cfg(feature = "tracing")]
                tracing::error!(attempts = failures, "Giving up on reconnection");

                self.queue.pending().fail_all(CancelReason::Stopped);
                self.state_tx.send_replace(ConnectionState::Closed);
                self.events.emit(Event::ClientFail { attempts: failures });
                break;
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect.max_backoff);

            #[cfg(feature = "tracing")]
            tracing::debug!(?delay, "Waiting before reconnect");

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = sleep(delay) => {}
            }
        }
    }

    /// Fetch fresh tokens and try each endpoint in order.
    async fn establish(&self) -> Result<(WsStream, Token)> {
        let tokens = self.provider.tokens().await?;

        let mut last_error = None;
        for token in tokens {
            match self.dial(&token).await {
                Ok(socket) => return Ok((socket, token)),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(endpoint = %token.endpoint, error = %e, "Endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| WsError::TokenFetch("provider returned no tokens".to_owned()).into()))
    }

    async fn dial(&self, token: &Token) -> Result<WsStream> {
        let url = token.connect_url(&new_id())?;
        let dial_timeout = self.config.dial_timeout;

        time::timeout(dial_timeout, async {
            let (mut socket, _) = connect_async(url.as_str()).await?;
            await_welcome(&mut socket).await?;
            Ok::<_, Error>(socket)
        })
        .await
        .map_err(|_elapsed| WsError::Handshake(format!("no welcome within {dial_timeout:?}")))?
    }

    async fn run_session(&self, socket: WsStream, token: &Token) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let closed = self.cancel.child_token();
        let heartbeat = Heartbeat {
            interval: self.config.heartbeat_interval.unwrap_or(token.ping_interval),
            timeout: self.config.heartbeat_timeout.unwrap_or(token.ping_timeout),
            tolerance: self.config.missed_pong_tolerance.max(1),
        };

        let (sink, stream) = socket.split();
        // Channel to notify the write loop when PONG is received
        let (pong_tx, pong_rx) = watch::channel(Instant::now());

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&self.dispatcher),
            pong_tx,
            closed.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            sink,
            self.queue.clone(),
            generation,
            heartbeat,
            pong_rx,
            closed.clone(),
        ));

        #[cfg(feature = "tracing")]
        tracing::info!(generation, endpoint = %token.endpoint, "WebSocket connected");
        self.events.emit(Event::Connected { generation });

        let session = Session::new(
            generation,
            self.queue.clone(),
            self.state_tx.clone(),
            closed.clone(),
        );
        tokio::select! {
            result = self.handler.on_session(&session) => match result {
                Ok(()) if generation > 1 => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(generation, "WebSocket reconnected");
                    self.events.emit(Event::Reconnected { generation });
                }
                Ok(()) => {}
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(generation, error = %e, "Session setup failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            },
            () = closed.cancelled() => {}
        }

        let (read_result, write_result) = tokio::join!(reader, writer);
        let reason = end_reason(write_result, read_result);
        if self.cancel.is_cancelled() {
            self.queue.pending().fail_all(CancelReason::Stopped);
        } else {
            self.queue.pending().fail_generation(generation);
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(generation, %reason, "WebSocket disconnected");
        self.events.emit(Event::Disconnected { generation, reason });
    }
}

/// The first frame after the upgrade must be a welcome.
async fn await_welcome(socket: &mut WsStream) -> Result<()> {
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => {
                let frame: InboundMessage = serde_json::from_str(text.as_str())
                    .map_err(|e| WsError::Handshake(format!("malformed first frame: {e}")))?;
                return match frame.message_type {
                    MessageType::Welcome => Ok(()),
                    MessageType::Error => Err(WsError::Handshake(format!(
                        "server refused connection: {}",
                        frame.error_message()
                    ))
                    .into()),
                    other => Err(WsError::Handshake(format!("expected welcome, got {other:?}")).into()),
                };
            }
            Message::Close(_) => break,
            _ => {
                // Control frames before the welcome are fine
            }
        }
    }

    Err(WsError::Handshake("connection closed before welcome".to_owned()).into())
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    dispatcher: Arc<MessageDispatcher>,
    pong_tx: watch::Sender<Instant>,
    closed: CancellationToken,
) -> std::result::Result<(), WsError> {
    let _closing = closed.clone().drop_guard();

    loop {
        let message = tokio::select! {
            () = closed.cancelled() => return Ok(()),
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if dispatcher.dispatch(text.as_str()) == Dispatched::Pong {
                    pong_tx.send_replace(Instant::now());
                }
            }
            Some(Ok(Message::Close(_))) | None => return Err(WsError::ConnectionClosed),
            Some(Ok(_)) => {
                // Binary frames and protocol-level ping/pong carry nothing for us
            }
            Some(Err(e)) => return Err(WsError::Connection(e)),
        }
    }
}

/// Drains the write queue and drives the heartbeat for one generation.
///
/// A ping goes out every `interval`, measured from the previous ping. A ping with no
/// PONG within `timeout` counts as missed; `tolerance` consecutive misses end the
/// session. Pings are written straight to the socket, ahead of queued frames.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    queue: WriteQueue,
    generation: u64,
    heartbeat: Heartbeat,
    mut pong_rx: watch::Receiver<Instant>,
    closed: CancellationToken,
) -> std::result::Result<(), WsError> {
    let _closing = closed.clone().drop_guard();

    let mut outbound = tokio::select! {
        () = closed.cancelled() => return Ok(()),
        rx = queue.receiver() => rx,
    };
    let pending = Arc::clone(queue.pending());

    let mut next_ping = time::Instant::now() + heartbeat.interval;
    let mut pong_deadline: Option<time::Instant> = None;
    let mut missed = 0_u32;

    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                _ = time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
                return Ok(());
            }
            changed = pong_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                pong_deadline = None;
                missed = 0;
            }
            () = sleep_until(pong_deadline) => {
                missed += 1;
                pong_deadline = None;

                #[cfg(feature = "tracing")]
                tracing::warn!(missed, timeout = ?heartbeat.timeout, "No PONG received");

                if missed >= heartbeat.tolerance {
                    return Err(WsError::HeartbeatTimeout { missed });
                }
            }
            () = time::sleep_until(next_ping) => {
                let text = serde_json::to_string(&OutboundFrame::ping()).map_err(WsError::MessageParse)?;
                sink.send(Message::Text(text.into()))
                    .await
                    .map_err(WsError::Connection)?;

                let sent_at = time::Instant::now();
                next_ping = sent_at + heartbeat.interval;
                pong_deadline.get_or_insert(sent_at + heartbeat.timeout);

                #[cfg(feature = "tracing")]
                tracing::trace!(generation, "PING sent");
            }
            Some(frame) = outbound.recv() => {
                if frame.generation != generation {
                    pending.resolve(&frame.id, Err(WsError::Cancelled(CancelReason::NotSent).into()));
                    continue;
                }
                if !pending.mark_sent(&frame.id) {
                    // Timed out or withdrawn while queued
                    continue;
                }

                #[cfg(feature = "tracing")]
                tracing::trace!(text = %frame.text, "Sending frame");

                if let Err(e) = sink.send(Message::Text(frame.text.into())).await {
                    pending.resolve(
                        &frame.id,
                        Err(WsError::Cancelled(CancelReason::ConnectionLost).into()),
                    );
                    return Err(WsError::Connection(e));
                }
                if !frame.expects_reply {
                    pending.resolve(&frame.id, Ok(()));
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

type TaskResult = std::result::Result<std::result::Result<(), WsError>, JoinError>;

fn end_reason(write: TaskResult, read: TaskResult) -> String {
    for result in [write, read] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e.to_string(),
            Err(e) => return format!("connection task failed: {e}"),
        }
    }
    "closed locally".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal_for_set_state() {
        let (state_tx, _rx) = watch::channel(ConnectionState::Closed);
        let session = Session::new(1, WriteQueue::new(1), state_tx.clone(), CancellationToken::new());

        session.mark_ready();
        assert_eq!(*state_tx.borrow(), ConnectionState::Closed, "ready must not reopen");
    }

    #[test]
    fn closed_session_is_never_ready() {
        let (state_tx, _rx) = watch::channel(ConnectionState::Connecting);
        let token = CancellationToken::new();
        let session = Session::new(2, WriteQueue::new(1), state_tx.clone(), token.clone());

        token.cancel();
        session.mark_ready();
        assert!(session.is_closed());
        assert_eq!(*state_tx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn writer_reason_takes_precedence() {
        let reason = end_reason(
            Ok(Err(WsError::HeartbeatTimeout { missed: 2 })),
            Ok(Err(WsError::ConnectionClosed)),
        );
        assert_eq!(reason, "Heartbeat timeout: 2 consecutive pings without PONG");
        assert_eq!(end_reason(Ok(Ok(())), Ok(Ok(()))), "closed locally");
    }
}
