use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;

/// Type tag of an inbound frame.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Welcome,
    Ack,
    Error,
    Message,
    Pong,
    Notice,
    Command,
    #[serde(other)]
    Unknown,
}

/// Any frame received from the WebSocket server.
///
/// Only `type` is mandatory; which other members are present depends on it.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sn: Option<u64>,
    /// Error code; the server sends both numbers and strings here.
    #[serde(default)]
    pub code: Option<Value>,
    #[serde(default)]
    pub data: Value,
}

impl InboundMessage {
    /// The error code rendered as a string, whatever its JSON type.
    #[must_use]
    pub fn code(&self) -> Option<String> {
        match self.code.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Human-readable detail of an error frame.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => "no detail provided".to_owned(),
            other => other.to_string(),
        }
    }

    /// Convert a `message` frame into the event handed to subscribers.
    ///
    /// Returns `None` for other frame types or when the frame carries no topic.
    #[must_use]
    pub fn into_topic_event(self) -> Option<TopicEvent> {
        if self.message_type != MessageType::Message {
            return None;
        }
        Some(TopicEvent {
            topic: self.topic?,
            subject: self.subject.unwrap_or_default(),
            sn: self.sn,
            data: self.data,
        })
    }
}

/// Topic-tagged push event delivered to subscription callbacks.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub struct TopicEvent {
    pub topic: String,
    pub subject: String,
    /// Sequence number, when the channel provides one
    pub sn: Option<u64>,
    pub data: Value,
}

impl TopicEvent {
    /// Deserialize the payload into a typed model.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.data)?)
    }
}
