//! Lifecycle notifications.
//!
//! Every [`Listener`] is fed from its own channels: lifecycle events travel on an
//! unbounded channel and are never dropped, while [`Event::RawMessage`] frames go through
//! a bounded buffer and are dropped when the listener falls behind the feed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

use super::subscription::SubscriptionId;
use crate::error::Kind;

/// Broadcast channel capacity for [`EventSink::subscribe`] receivers.
const EVENT_CAPACITY: usize = 1024;

/// Raw frames buffered per listener.
const RAW_CAPACITY: usize = 1024;

/// Transport-wide events delivered to listeners.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A socket completed the welcome handshake
    Connected { generation: u64 },
    /// The socket of `generation` went away
    Disconnected { generation: u64, reason: String },
    /// A connect round is about to start
    TryReconnect { attempt: u32 },
    /// A new generation finished replaying subscriptions
    Reconnected { generation: u64 },
    /// Every inbound text frame, verbatim
    RawMessage(String),
    /// A transport-wide failure that no caller is waiting on
    Error { kind: Kind, message: String },
    /// A subscription callback returned an error
    CallbackError { id: SubscriptionId, message: String },
    ResubscribeOk { id: SubscriptionId },
    ResubscribeError { id: SubscriptionId, message: String },
    /// An event was dropped because the subscription's delivery buffer was full
    ReadBufferFull { id: SubscriptionId },
    /// The configured reconnect limit was exhausted; the transport is closed
    ClientFail { attempts: u32 },
    /// `stop()` completed
    ClientShutdown,
}

/// Receiver of lifecycle [`Event`]s.
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Sending halves feeding one listener task.
#[derive(Debug)]
struct ListenerTx {
    lifecycle: mpsc::UnboundedSender<Event>,
    raw: mpsc::Sender<Event>,
}

impl ListenerTx {
    /// Returns `false` once the listener task is gone.
    fn deliver(&self, event: &Event) -> bool {
        if !matches!(event, Event::RawMessage(_)) {
            return self.lifecycle.send(event.clone()).is_ok();
        }

        match self.raw.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Listener behind the feed, dropping raw message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug)]
struct Shared {
    tx: broadcast::Sender<Event>,
    /// `None` once closed
    listeners: Mutex<Option<Vec<ListenerTx>>>,
}

/// Fan-out point for lifecycle events.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    shared: Arc<Shared>,
}

impl Default for EventSink {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                tx,
                listeners: Mutex::new(Some(Vec::new())),
            }),
        }
    }
}

impl EventSink {
    // Only ever pushed to or cleared, so a poisoned lock is safe to reuse.
    fn listeners(&self) -> MutexGuard<'_, Option<Vec<ListenerTx>>> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(listeners) = self.listeners().as_mut() {
            listeners.retain(|listener| listener.deliver(&event));
        }
        // No receivers is fine
        _ = self.shared.tx.send(event);
    }

    /// Receiver of every future event. Slow receivers may lag and miss events.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.tx.subscribe()
    }

    /// Deliver every future event to `listener` from a background task.
    ///
    /// Does nothing once the sink is closed.
    pub(crate) fn forward_to<L: Listener>(&self, listener: L) {
        let (lifecycle_tx, mut lifecycle) = mpsc::unbounded_channel();
        let (raw_tx, mut raw) = mpsc::channel(RAW_CAPACITY);
        {
            let mut listeners = self.listeners();
            let Some(listeners) = listeners.as_mut() else {
                return;
            };
            listeners.push(ListenerTx {
                lifecycle: lifecycle_tx,
                raw: raw_tx,
            });
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    event = lifecycle.recv() => match event {
                        Some(event) => listener.on_event(&event),
                        None => break,
                    },
                    Some(event) = raw.recv() => listener.on_event(&event),
                }
            }
        });
    }

    /// Stop feeding listeners. Their tasks finish once the events already queued
    /// have been delivered.
    pub(crate) fn close(&self) {
        self.listeners().take();
    }
}
