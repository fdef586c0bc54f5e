//! Outbound frame queue and the table of requests awaiting a reply.
//!
//! Every enqueued frame gets a [`WriteHandle`] that resolves exactly once: whoever
//! removes the frame's entry from [`PendingRequests`] decides the outcome, whether that
//! is the writer, the dispatcher matching a reply, the deadline, or a connection
//! teardown.

#![expect(
    clippy::module_name_repetitions,
    reason = "WriteQueue is re-exported and used outside this module"
)]

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, Entry};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout_at};

use super::error::{CancelReason, WsError};
use super::types::OutboundFrame;
use crate::Result;
use crate::error::Error;

/// A serialized frame waiting for the writer of its generation.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) generation: u64,
    pub(crate) id: String,
    pub(crate) text: String,
    pub(crate) expects_reply: bool,
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    sent: bool,
    tx: oneshot::Sender<Result<()>>,
}

/// Requests that have been enqueued and not yet resolved, keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    entries: DashMap<String, Pending>,
}

impl PendingRequests {
    fn insert(&self, id: &str, generation: u64) -> Result<oneshot::Receiver<Result<()>>> {
        match self.entries.entry(id.to_owned()) {
            Entry::Occupied(_) => Err(Error::validation(format!(
                "frame id {id} is already awaiting a reply"
            ))),
            Entry::Vacant(v) => {
                let (tx, rx) = oneshot::channel();
                v.insert(Pending {
                    generation,
                    sent: false,
                    tx,
                });
                Ok(rx)
            }
        }
    }

    /// Resolve a request. Returns `false` when the id was already resolved or unknown.
    pub(crate) fn resolve(&self, id: &str, result: Result<()>) -> bool {
        match self.entries.remove(id) {
            Some((_, pending)) => {
                _ = pending.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Record that the frame is about to hit the socket.
    ///
    /// Returns `false` when the request has already been resolved (timed out or its
    /// handle dropped) and the frame must not be sent.
    pub(crate) fn mark_sent(&self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(mut pending) => {
                pending.sent = true;
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Cancel every request belonging to `generation` or an older one.
    ///
    /// Frames already written resolve with [`CancelReason::ConnectionLost`], the rest
    /// with [`CancelReason::NotSent`].
    pub(crate) fn fail_generation(&self, generation: u64) {
        let ids: Vec<(String, bool)> = self
            .entries
            .iter()
            .filter(|e| e.generation <= generation)
            .map(|e| (e.key().clone(), e.sent))
            .collect();

        for (id, sent) in ids {
            let reason = if sent {
                CancelReason::ConnectionLost
            } else {
                CancelReason::NotSent
            };
            self.resolve(&id, Err(WsError::Cancelled(reason).into()));
        }
    }

    /// Cancel everything, regardless of generation.
    pub(crate) fn fail_all(&self, reason: CancelReason) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve(&id, Err(WsError::Cancelled(reason).into()));
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Bounded FIFO of outbound frames shared by every connection generation.
///
/// Writers of successive generations take turns owning the receiving half; frames
/// tagged with an older generation are resolved as never sent instead of being written.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Outbound>,
    rx: Arc<Mutex<mpsc::Receiver<Outbound>>>,
    pending: Arc<PendingRequests>,
}

impl WriteQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            pending: Arc::new(PendingRequests::default()),
        }
    }

    /// Queue `frame` for the writer of `generation`.
    ///
    /// Suspends while the queue is full. The returned handle fails with
    /// [`WsError::WriteTimeout`] if the frame is not written, and for frames that expect a
    /// reply, answered, within `timeout`.
    pub(crate) async fn enqueue(
        &self,
        frame: &OutboundFrame,
        timeout: Duration,
        generation: u64,
    ) -> Result<WriteHandle> {
        let text = serde_json::to_string(frame)?;
        let deadline = Instant::now() + timeout;
        let rx = self.pending.insert(&frame.id, generation)?;

        let handle = WriteHandle {
            id: frame.id.clone(),
            rx,
            deadline,
            timeout,
            pending: Arc::clone(&self.pending),
        };

        let outbound = Outbound {
            generation,
            id: frame.id.clone(),
            text,
            expects_reply: frame.expects_reply(),
        };

        match timeout_at(deadline, self.tx.send(outbound)).await {
            Ok(Ok(())) => {}
            Ok(Err(_closed)) => {
                self.pending
                    .resolve(&frame.id, Err(WsError::Cancelled(CancelReason::Stopped).into()));
            }
            Err(_elapsed) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(id = %frame.id, "Write queue full until deadline");
            }
        }

        Ok(handle)
    }

    /// Take exclusive ownership of the receiving half for one writer.
    pub(crate) async fn receiver(&self) -> OwnedMutexGuard<mpsc::Receiver<Outbound>> {
        Arc::clone(&self.rx).lock_owned().await
    }

    pub(crate) fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }
}

/// Completion handle for one enqueued frame.
///
/// Dropping the handle before the frame is written withdraws the frame.
#[must_use = "dropping a WriteHandle withdraws the frame if it has not been written yet"]
#[derive(Debug)]
pub struct WriteHandle {
    id: String,
    rx: oneshot::Receiver<Result<()>>,
    deadline: Instant,
    timeout: Duration,
    pending: Arc<PendingRequests>,
}

impl WriteHandle {
    /// Correlation id of the frame.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the frame to be written and, when a reply is expected, answered.
    pub async fn wait(mut self) -> Result<()> {
        tokio::select! {
            biased;

            result = &mut self.rx => flatten(result),
            () = sleep_until(self.deadline) => {
                if self.pending.remove(&self.id) {
                    Err(WsError::WriteTimeout {
                        id: self.id.clone(),
                        timeout: self.timeout,
                    }
                    .into())
                } else {
                    // Resolved concurrently; the outcome is already in flight.
                    flatten((&mut self.rx).await)
                }
            }
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn flatten(result: std::result::Result<Result<()>, oneshot::error::RecvError>) -> Result<()> {
    result.unwrap_or_else(|_closed| Err(WsError::Cancelled(CancelReason::Stopped).into()))
}
