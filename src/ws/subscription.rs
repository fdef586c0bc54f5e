#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};

use super::config::Config;
use super::connection::Session;
use super::error::{CancelReason, WsError};
use super::event::{Event, EventSink};
use super::queue::WriteHandle;
use super::traits::{EventRouter, MessageCallback, SessionHandler};
use super::types::{OutboundFrame, TopicEvent, topic};
use crate::Result;
use crate::error::Error;

/// Identifier of one logical subscription. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Where a subscription stands relative to the current connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Recorded, not yet acknowledged on the current connection
    Pending,
    /// Acknowledged by the server on the current connection
    Active,
    /// Unsubscribe in progress; no longer receives events
    Cancelling,
}

/// Information about a registered subscription.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub prefix: String,
    pub args: Vec<String>,
    pub status: SubscriptionStatus,
    /// When the subscription was created.
    pub created_at: Instant,
}

#[derive(Debug)]
struct Entry {
    prefix: String,
    args: Vec<String>,
    status: SubscriptionStatus,
    created_at: Instant,
    tx: mpsc::Sender<TopicEvent>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.status != SubscriptionStatus::Cancelling
    }

    /// Keys under which the entry is found in the routing index.
    fn keys(&self) -> Vec<String> {
        if self.args.is_empty() {
            vec![self.prefix.clone()]
        } else {
            self.args
                .iter()
                .map(|arg| routing_key(&self.prefix, arg))
                .collect()
        }
    }
}

fn routing_key(prefix: &str, arg: &str) -> String {
    format!("{prefix}:{arg}")
}

/// Wire topics for `args`, at most `max_args` per topic.
fn wire_topics(prefix: &str, args: &[String], max_args: usize) -> Vec<String> {
    if args.is_empty() {
        return vec![prefix.to_owned()];
    }
    args.chunks(max_args.max(1))
        .map(|chunk| topic(prefix, chunk))
        .collect()
}

#[derive(Debug, Default)]
struct Table {
    next_id: u64,
    /// Ordered by id, which is creation order
    entries: BTreeMap<SubscriptionId, Entry>,
    index: HashMap<String, Vec<SubscriptionId>>,
}

impl Table {
    fn insert(&mut self, prefix: String, args: Vec<String>, tx: mpsc::Sender<TopicEvent>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let entry = Entry {
            prefix,
            args,
            status: SubscriptionStatus::Pending,
            created_at: Instant::now(),
            tx,
        };
        for key in entry.keys() {
            self.index.entry(key).or_default().push(id);
        }
        self.entries.insert(id, entry);
        id
    }

    fn evict(&mut self, id: SubscriptionId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        for key in entry.keys() {
            if let Some(ids) = self.index.get_mut(&key) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
        Some(entry)
    }

    fn set_status(&mut self, id: SubscriptionId, status: SubscriptionStatus) {
        if let Some(entry) = self.entries.get_mut(&id)
            && entry.is_live()
        {
            entry.status = status;
        }
    }

    /// Live subscriptions an event is addressed to, each listed once.
    ///
    /// The topic is matched exactly first. A multiplexed topic (`prefix:a,b`) is split
    /// into its arguments; when neither finds a subscriber, the subject is tried as the
    /// argument.
    fn matching(&self, event: &TopicEvent) -> Vec<(SubscriptionId, mpsc::Sender<TopicEvent>)> {
        let mut ids: Vec<SubscriptionId> = Vec::new();
        self.collect(&event.topic, &mut ids);
        if let Some((prefix, args)) = event.topic.split_once(':') {
            if args.contains(',') {
                for arg in args.split(',') {
                    self.collect(&routing_key(prefix, arg), &mut ids);
                }
            }
            if ids.is_empty() && !event.subject.is_empty() {
                self.collect(&routing_key(prefix, &event.subject), &mut ids);
            }
        }

        ids.into_iter()
            .filter_map(|id| {
                let entry = self.entries.get(&id)?;
                entry.is_live().then(|| (id, entry.tx.clone()))
            })
            .collect()
    }

    fn collect(&self, key: &str, ids: &mut Vec<SubscriptionId>) {
        if let Some(found) = self.index.get(key) {
            for id in found {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
        }
    }

    /// Wire topics to unsubscribe when `id` goes away: only the arguments no other live
    /// subscription of the same prefix still needs.
    fn orphaned_topics(&self, id: SubscriptionId, max_args: usize) -> Vec<String> {
        let Some(entry) = self.entries.get(&id) else {
            return Vec::new();
        };

        let still_needed: HashSet<String> = self
            .entries
            .iter()
            .filter(|(other, e)| **other != id && e.is_live() && e.prefix == entry.prefix)
            .flat_map(|(_, e)| e.keys())
            .collect();

        if entry.args.is_empty() {
            return if still_needed.contains(&entry.prefix) {
                Vec::new()
            } else {
                vec![entry.prefix.clone()]
            };
        }

        let orphaned: Vec<String> = entry
            .args
            .iter()
            .filter(|arg| !still_needed.contains(&routing_key(&entry.prefix, arg)))
            .cloned()
            .collect();

        if orphaned.is_empty() {
            Vec::new()
        } else {
            wire_topics(&entry.prefix, &orphaned, max_args)
        }
    }

    fn info(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .iter()
            .map(|(id, e)| SubscriptionInfo {
                id: *id,
                prefix: e.prefix.clone(),
                args: e.args.clone(),
                status: e.status,
                created_at: e.created_at,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Settings {
    write_timeout: Duration,
    read_buffer: usize,
    max_topic_args: usize,
    private_channel: bool,
}

/// Source of truth for what should be subscribed.
///
/// Entries survive reconnects. Every mutation and every replay pass runs under one
/// async gate, which also holds the session subscriptions are sent on; an `add` or
/// `remove` issued while a replay is running waits for the pass to finish.
pub struct SubscriptionRegistry {
    table: Mutex<Table>,
    session: AsyncMutex<Option<Session>>,
    settings: Settings,
    events: EventSink,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    pub(crate) fn new(config: &Config, events: EventSink) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            session: AsyncMutex::new(None),
            settings: Settings {
                write_timeout: config.write_timeout,
                read_buffer: config.read_buffer.max(1),
                max_topic_args: config.max_topic_args.max(1),
                private_channel: config.channel.is_private(),
            },
            events,
        }
    }

    // The table is always left consistent, so a poisoned lock is safe to reuse.
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscription whose events are handed to `callback`.
    ///
    /// When connected, waits for the server to acknowledge every wire topic. When not,
    /// the subscription is recorded as pending and sent on the next connection.
    pub async fn add(
        &self,
        prefix: &str,
        args: Vec<String>,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<SubscriptionId> {
        let (tx, rx) = mpsc::channel(self.settings.read_buffer);
        let gate = self.session.lock().await;
        let id = self.register(prefix, args, tx)?;
        self.spawn_delivery(id, rx, callback);
        self.send_subscribe(id, gate).await
    }

    /// Like [`Self::add`], but events are delivered through the returned receiver.
    pub async fn add_channel(
        &self,
        prefix: &str,
        args: Vec<String>,
    ) -> Result<(SubscriptionId, mpsc::Receiver<TopicEvent>)> {
        let (tx, rx) = mpsc::channel(self.settings.read_buffer);
        let gate = self.session.lock().await;
        let id = self.register(prefix, args, tx)?;
        let id = self.send_subscribe(id, gate).await?;
        Ok((id, rx))
    }

    fn register(
        &self,
        prefix: &str,
        args: Vec<String>,
        tx: mpsc::Sender<TopicEvent>,
    ) -> Result<SubscriptionId> {
        if prefix.is_empty() {
            return Err(Error::validation("topic prefix cannot be empty"));
        }
        if let Some(bad) = args.iter().find(|a| a.is_empty() || a.contains(',')) {
            return Err(Error::validation(format!(
                "invalid topic argument {bad:?}: arguments must be non-empty and comma-free"
            )));
        }

        let id = self.table().insert(prefix.to_owned(), args, tx);

        #[cfg(feature = "tracing")]
        tracing::debug!(%id, prefix, "Subscription registered");

        Ok(id)
    }

    fn spawn_delivery(
        &self,
        id: SubscriptionId,
        mut rx: mpsc::Receiver<TopicEvent>,
        callback: Arc<dyn MessageCallback>,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = callback.on_message(&event) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%id, error = %e, "Subscription callback failed");
                    events.emit(Event::CallbackError {
                        id,
                        message: e.to_string(),
                    });
                }
            }
        });
    }

    async fn send_subscribe(
        &self,
        id: SubscriptionId,
        gate: AsyncMutexGuard<'_, Option<Session>>,
    ) -> Result<SubscriptionId> {
        let Some(session) = ready(gate.as_ref()) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(%id, "Not connected, subscription will be sent on connect");
            return Ok(id);
        };

        let topics = self.topics_of(id);
        let mut handles = Vec::with_capacity(topics.len());
        for topic in topics {
            let frame = OutboundFrame::subscribe(topic.clone(), self.settings.private_channel);
            match session.send(&frame, self.settings.write_timeout).await {
                Ok(handle) => handles.push((topic, handle)),
                Err(e) => {
                    self.table().evict(id);
                    return Err(e);
                }
            }
        }
        drop(gate);

        for (topic, handle) in handles {
            if let Err(e) = handle.wait().await {
                return self.subscribe_failed(id, topic, e);
            }
        }

        self.table().set_status(id, SubscriptionStatus::Active);

        #[cfg(feature = "tracing")]
        tracing::debug!(%id, "Subscription active");

        Ok(id)
    }

    fn subscribe_failed(&self, id: SubscriptionId, topic: String, e: Error) -> Result<SubscriptionId> {
        match e.downcast_ref::<WsError>() {
            Some(WsError::Cancelled(CancelReason::NotSent | CancelReason::ConnectionLost)) => {
                // Stays desired; the next session replays it.
                #[cfg(feature = "tracing")]
                tracing::debug!(%id, "Connection lost before subscribe ack");
                Ok(id)
            }
            Some(WsError::Rejected { code, message }) => {
                self.table().evict(id);
                #[cfg(feature = "tracing")]
                tracing::warn!(%id, %topic, ?code, %message, "Subscription rejected");
                Err(WsError::SubscriptionFailed {
                    topic,
                    code: code.clone(),
                    message: message.clone(),
                }
                .into())
            }
            _ => {
                self.table().evict(id);
                #[cfg(feature = "tracing")]
                tracing::warn!(%id, %topic, error = %e, "Subscribe failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &topic;
                Err(e)
            }
        }
    }

    fn topics_of(&self, id: SubscriptionId) -> Vec<String> {
        let table = self.table();
        table.entries.get(&id).map_or_else(Vec::new, |e| {
            wire_topics(&e.prefix, &e.args, self.settings.max_topic_args)
        })
    }

    /// Cancel a subscription.
    ///
    /// Stops delivery immediately. When connected, unsubscribes the topics no other
    /// subscription still needs and evicts the entry once the server answers; otherwise
    /// evicts it right away. A subscription whose subscribe is still awaiting its ack is
    /// unsubscribed as well, since the server may yet accept it; failures of that
    /// unsubscribe are not reported.
    pub async fn remove(&self, id: SubscriptionId) -> Result<()> {
        let gate = self.session.lock().await;

        let (topics, was_active) = {
            let mut table = self.table();
            let Some(entry) = table.entries.get_mut(&id) else {
                return Err(WsError::UnknownSubscription(id.to_string()).into());
            };
            if !entry.is_live() {
                return Ok(());
            }
            let was_active = entry.status == SubscriptionStatus::Active;
            entry.status = SubscriptionStatus::Cancelling;
            (
                table.orphaned_topics(id, self.settings.max_topic_args),
                was_active,
            )
        };

        let session = ready(gate.as_ref());
        let Some(session) = session.filter(|_| !topics.is_empty()) else {
            self.table().evict(id);
            #[cfg(feature = "tracing")]
            tracing::debug!(%id, "Subscription removed without unsubscribe");
            return Ok(());
        };

        let mut handles: Vec<(String, WriteHandle)> = Vec::with_capacity(topics.len());
        for topic in topics {
            let frame = OutboundFrame::unsubscribe(topic.clone(), self.settings.private_channel);
            match session.send(&frame, self.settings.write_timeout).await {
                Ok(handle) => handles.push((topic, handle)),
                Err(e) => {
                    self.table().evict(id);
                    return Err(e);
                }
            }
        }
        drop(gate);

        let mut result = Ok(());
        for (topic, handle) in handles {
            let Err(e) = handle.wait().await else {
                continue;
            };
            if !was_active {
                #[cfg(feature = "tracing")]
                tracing::debug!(%id, %topic, error = %e, "Unsubscribe of unacknowledged subscription failed");
                continue;
            }
            match e.downcast_ref::<WsError>() {
                Some(WsError::Cancelled(_)) => {}
                Some(WsError::Rejected { code, message }) => {
                    result = Err(WsError::SubscriptionFailed {
                        topic,
                        code: code.clone(),
                        message: message.clone(),
                    }
                    .into());
                    break;
                }
                _ => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.table().evict(id);

        #[cfg(feature = "tracing")]
        tracing::debug!(%id, ok = result.is_ok(), "Subscription removed");

        result
    }

    /// Send `frame` on the ready connection and wait for it to complete.
    ///
    /// Fails with [`CancelReason::NotSent`] when there is no ready connection.
    pub async fn write(&self, frame: &OutboundFrame, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || WsError::WriteTimeout {
            id: frame.id.clone(),
            timeout,
        };

        let gate = tokio::time::timeout_at(deadline, self.session.lock())
            .await
            .map_err(|_elapsed| timed_out())?;
        let Some(session) = ready(gate.as_ref()) else {
            return Err(WsError::Cancelled(CancelReason::NotSent).into());
        };

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(timed_out().into());
        }
        let handle = session.send(frame, remaining).await?;
        drop(gate);

        handle.wait().await
    }

    /// Drop every subscription and forget the session. Delivery tasks and subscription
    /// streams end once their buffered events are consumed.
    pub(crate) async fn shutdown(&self) {
        let mut gate = self.session.lock().await;
        gate.take();

        let mut table = self.table();
        table.entries.clear();
        table.index.clear();

        #[cfg(feature = "tracing")]
        tracing::debug!("Subscriptions cleared");
    }

    /// Snapshot of every registered subscription, in creation order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.table().info()
    }

    /// Re-issue every live subscription on `session`, in creation order, one at a time.
    async fn replay(&self, session: &Session) -> Result<()> {
        let mut gate = self.session.lock().await;
        *gate = Some(session.clone());

        let snapshot: Vec<(SubscriptionId, Vec<String>)> = {
            let mut table = self.table();
            table
                .entries
                .iter_mut()
                .filter(|(_, e)| e.is_live())
                .map(|(id, e)| {
                    e.status = SubscriptionStatus::Pending;
                    (
                        *id,
                        wire_topics(&e.prefix, &e.args, self.settings.max_topic_args),
                    )
                })
                .collect()
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            generation = session.generation(),
            count = snapshot.len(),
            "Replaying subscriptions"
        );

        for (id, topics) in snapshot {
            match self.replay_one(session, topics).await {
                Ok(()) => {
                    self.table().set_status(id, SubscriptionStatus::Active);
                    self.events.emit(Event::ResubscribeOk { id });
                }
                Err(e) => {
                    let message = e.to_string();
                    match e.downcast_ref::<WsError>() {
                        Some(WsError::Cancelled(_)) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(%id, error = %e, "Replay aborted");
                            self.events.emit(Event::ResubscribeError { id, message });
                            return Err(e);
                        }
                        Some(WsError::Rejected { .. }) => {
                            self.table().evict(id);
                        }
                        _ => {}
                    }

                    #[cfg(feature = "tracing")]
                    tracing::warn!(%id, error = %e, "Resubscribe failed");
                    self.events.emit(Event::ResubscribeError { id, message });
                }
            }
        }

        session.mark_ready();
        drop(gate);
        Ok(())
    }

    async fn replay_one(&self, session: &Session, topics: Vec<String>) -> Result<()> {
        for topic in topics {
            let frame = OutboundFrame::subscribe(topic, self.settings.private_channel);
            session
                .send(&frame, self.settings.write_timeout)
                .await?
                .wait()
                .await?;
        }
        Ok(())
    }
}

fn ready(session: Option<&Session>) -> Option<Session> {
    session.filter(|s| !s.is_closed()).cloned()
}

impl EventRouter for SubscriptionRegistry {
    fn route(&self, event: TopicEvent) {
        let targets = self.table().matching(&event);

        if targets.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::trace!(topic = %event.topic, "No subscriber for event");
            return;
        }

        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%id, topic = %event.topic, "Delivery buffer full, dropping event");
                    self.events.emit(Event::ReadBufferFull { id });
                }
                Err(TrySendError::Closed(_)) => {
                    // Receiver gone: the stream was dropped or the entry is being evicted
                }
            }
        }
    }
}

#[async_trait]
impl SessionHandler for SubscriptionRegistry {
    async fn on_session(&self, session: &Session) -> Result<()> {
        self.replay(session).await
    }
}
