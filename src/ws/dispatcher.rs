use std::sync::Arc;

use super::error::WsError;
use super::event::{Event, EventSink};
use super::queue::PendingRequests;
use super::traits::EventRouter;
use super::types::{InboundMessage, MessageType};
use crate::error::Kind;

/// What the dispatcher did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    /// Resolved a pending request
    Reply,
    /// Heartbeat reply
    Pong,
    /// Handed to the subscription router
    Event,
    /// Understood but not actionable
    Ignored,
    /// Could not be parsed; dropped
    Malformed,
}

/// Routes inbound frames to pending requests, subscriptions, and the lifecycle listener.
pub(crate) struct MessageDispatcher {
    pending: Arc<PendingRequests>,
    router: Arc<dyn EventRouter>,
    events: EventSink,
}

impl MessageDispatcher {
    pub(crate) fn new(
        pending: Arc<PendingRequests>,
        router: Arc<dyn EventRouter>,
        events: EventSink,
    ) -> Self {
        Self {
            pending,
            router,
            events,
        }
    }

    pub(crate) fn dispatch(&self, text: &str) -> Dispatched {
        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Received WebSocket text message");

        self.events.emit(Event::RawMessage(text.to_owned()));

        let message: InboundMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                self.events.emit(Event::Error {
                    kind: Kind::Protocol,
                    message: WsError::MessageParse(e).to_string(),
                });
                return Dispatched::Malformed;
            }
        };

        match message.message_type {
            MessageType::Pong => {
                if let Some(id) = &message.id {
                    self.pending.resolve(id, Ok(()));
                }
                Dispatched::Pong
            }
            MessageType::Ack => match &message.id {
                Some(id) if self.pending.resolve(id, Ok(())) => Dispatched::Reply,
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(id = ?message.id, "Ack for unknown or expired request");
                    Dispatched::Ignored
                }
            },
            MessageType::Error => self.dispatch_error(&message),
            MessageType::Message => match message.into_topic_event() {
                Some(event) => {
                    self.router.route(event);
                    Dispatched::Event
                }
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%text, "Event frame without topic");
                    self.events.emit(Event::Error {
                        kind: Kind::Protocol,
                        message: WsError::InvalidMessage("event frame without topic".to_owned())
                            .to_string(),
                    });
                    Dispatched::Malformed
                }
            },
            MessageType::Notice | MessageType::Command | MessageType::Welcome => {
                #[cfg(feature = "tracing")]
                tracing::debug!(kind = ?message.message_type, "Control frame");
                Dispatched::Ignored
            }
            MessageType::Unknown => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, "Unknown frame type");
                Dispatched::Ignored
            }
        }
    }

    fn dispatch_error(&self, message: &InboundMessage) -> Dispatched {
        if let Some(id) = &message.id
            && self.pending.resolve(id, Err(rejection(message).into()))
        {
            return Dispatched::Reply;
        }

        let rejected = rejection(message);
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %rejected, "Server error frame");
        self.events.emit(Event::Error {
            kind: Kind::Rejected,
            message: rejected.to_string(),
        });
        Dispatched::Ignored
    }
}

fn rejection(message: &InboundMessage) -> WsError {
    WsError::Rejected {
        code: message.code(),
        message: message.error_message(),
    }
}
