#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Kind};

/// Why an in-flight write or request was cancelled.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The frame never reached the socket (no live connection, or it was queued on a
    /// connection generation that has since been superseded)
    NotSent,
    /// The frame was sent but the connection dropped before the reply arrived
    ConnectionLost,
    /// The service was stopped
    Stopped,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSent => f.write_str("never sent"),
            Self::ConnectionLost => f.write_str("connection closed"),
            Self::Stopped => f.write_str("service stopped"),
        }
    }
}

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The server did not complete the welcome handshake
    Handshake(String),
    /// The token provider could not produce a usable token
    TokenFetch(String),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// Received an invalid or unexpected message
    InvalidMessage(String),
    /// The server rejected a subscribe or unsubscribe request
    SubscriptionFailed {
        /// Topic that was rejected
        topic: String,
        /// Server error code, when provided
        code: Option<String>,
        /// Server error detail
        message: String,
    },
    /// The server answered a request with an error frame
    Rejected {
        /// Server error code, when provided
        code: Option<String>,
        /// Server error detail
        message: String,
    },
    /// The write was not completed before its deadline
    WriteTimeout {
        /// Correlation id of the frame
        id: String,
        /// The timeout the caller supplied
        timeout: Duration,
    },
    /// No PONG arrived within the heartbeat timeout
    HeartbeatTimeout {
        /// Number of consecutive pings without a matching pong
        missed: u32,
    },
    /// WebSocket connection was closed
    ConnectionClosed,
    /// The operation was cancelled before it could complete
    Cancelled(CancelReason),
    /// No subscription is registered under this id
    UnknownSubscription(String),
}

impl WsError {
    /// The crate-wide [`Kind`] this error is reported under.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Connection(_)
            | Self::Handshake(_)
            | Self::ConnectionClosed
            | Self::HeartbeatTimeout { .. } => Kind::Connect,
            Self::TokenFetch(_) => Kind::TokenFetch,
            Self::MessageParse(_) | Self::InvalidMessage(_) => Kind::Protocol,
            Self::SubscriptionFailed { .. } => Kind::Subscription,
            Self::Rejected { .. } => Kind::Rejected,
            Self::WriteTimeout { .. } => Kind::WriteTimeout,
            Self::Cancelled(_) => Kind::Cancelled,
            Self::UnknownSubscription(_) => Kind::Validation,
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Handshake(reason) => write!(f, "WebSocket handshake failed: {reason}"),
            Self::TokenFetch(reason) => write!(f, "Failed to obtain connection token: {reason}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket message: {msg}"),
            Self::SubscriptionFailed {
                topic,
                code,
                message,
            } => match code {
                Some(code) => write!(f, "Subscription to {topic} failed ({code}): {message}"),
                None => write!(f, "Subscription to {topic} failed: {message}"),
            },
            Self::Rejected { code, message } => match code {
                Some(code) => write!(f, "Request rejected ({code}): {message}"),
                None => write!(f, "Request rejected: {message}"),
            },
            Self::WriteTimeout { id, timeout } => {
                write!(f, "Write {id} not acknowledged within {timeout:?}")
            }
            Self::HeartbeatTimeout { missed } => {
                write!(f, "Heartbeat timeout: {missed} consecutive pings without PONG")
            }
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Cancelled(reason) => write!(f, "Operation cancelled: {reason}"),
            Self::UnknownSubscription(id) => write!(f, "Unknown subscription {id}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(e.kind(), e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::Connection(e).into()
    }
}
