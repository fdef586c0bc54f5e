//! WebSocket push-data engine.
//!
//! # Architecture
//!
//! - [`TokenProvider`]: fetches connection tokens and endpoints (bullet bootstrap)
//! - [`ConnectionManager`]: dials, runs the welcome handshake, heartbeats, reconnects
//!   with backoff and owns the read and write loops
//! - [`WriteQueue`]: bounded outbound queue; callers wait on a [`WriteHandle`] for the
//!   frame to be written and, when requested, acknowledged
//! - `MessageDispatcher`: routes inbound frames to pending requests or subscriptions
//! - [`SubscriptionRegistry`]: logical subscriptions, topic routing and replay after
//!   every reconnect
//! - [`WsService`]: the facade that wires all of the above
//!
//! Per-domain adapters such as [`spot::SpotPublic`] only depend on the
//! [`Subscriber`] trait.

pub mod config;
pub mod connection;
pub(crate) mod dispatcher;
pub mod error;
pub mod event;
pub mod queue;
pub mod service;
pub mod spot;
pub mod subscription;
pub mod token;
pub mod traits;
pub mod types;

pub use config::{Config, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, Session};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use error::CancelReason;
pub use event::{Event, Listener};
pub use queue::{WriteHandle, WriteQueue};
pub use service::{SubscriptionStream, WsService};
pub use subscription::{SubscriptionId, SubscriptionInfo, SubscriptionRegistry, SubscriptionStatus};
pub use token::{BulletTokenProvider, StaticTokenProvider, Token, TokenProvider};
pub use traits::*;
pub use types::{FrameType, InboundMessage, MessageType, OutboundFrame, TopicEvent};
