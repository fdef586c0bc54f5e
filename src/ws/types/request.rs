use bon::Builder;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;
use uuid::Uuid;

/// Type tag of an outbound frame.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FrameType {
    Ping,
    Subscribe,
    Unsubscribe,
}

/// Frame sent to the WebSocket server.
///
/// `id` doubles as the correlation id: the server echoes it in the `ack`, `error` or
/// `pong` reply.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    #[builder(default = new_id())]
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_channel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OutboundFrame {
    /// Heartbeat ping; answered by a `pong` carrying the same id.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            id: new_id(),
            frame_type: FrameType::Ping,
            topic: None,
            private_channel: None,
            response: None,
            data: None,
        }
    }

    /// Subscribe request for a fully built topic (`prefix:arg1,arg2`).
    #[must_use]
    pub fn subscribe(topic: String, private_channel: bool) -> Self {
        Self::request(FrameType::Subscribe, topic, private_channel)
    }

    /// Unsubscribe request for a fully built topic.
    #[must_use]
    pub fn unsubscribe(topic: String, private_channel: bool) -> Self {
        Self::request(FrameType::Unsubscribe, topic, private_channel)
    }

    fn request(frame_type: FrameType, topic: String, private_channel: bool) -> Self {
        Self {
            id: new_id(),
            frame_type,
            topic: Some(topic),
            private_channel: Some(private_channel),
            response: Some(true),
            data: None,
        }
    }

    /// Whether the server is expected to answer this frame by id.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.frame_type == FrameType::Ping || self.response == Some(true)
    }
}

/// Build the wire topic for a prefix and its arguments.
///
/// Arguments are comma-joined behind a single `:`; no arguments yields the bare prefix.
#[must_use]
pub fn topic(prefix: &str, args: &[String]) -> String {
    if args.is_empty() {
        prefix.to_owned()
    } else {
        format!("{prefix}:{}", args.join(","))
    }
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
