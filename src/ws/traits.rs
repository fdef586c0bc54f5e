//! Seams between the transport pieces and their users.

use std::sync::Arc;

use async_trait::async_trait;

use super::connection::Session;
use super::subscription::SubscriptionId;
use super::types::TopicEvent;
use crate::Result;

/// Per-subscription message handler.
///
/// Invoked from the subscription's own delivery task, so calls for one subscription
/// never overlap. Returned errors are reported as [`super::Event::CallbackError`].
///
/// # Example
///
/// ```ignore
/// let id = service
///     .subscribe("/market/ticker", vec!["BTC-USDT".to_owned()], |event: &TopicEvent| -> Result<()> {
///         println!("{} {}", event.subject, event.data);
///         Ok(())
///     })
///     .await?;
/// ```
pub trait MessageCallback: Send + Sync + 'static {
    fn on_message(&self, event: &TopicEvent) -> Result<()>;
}

impl<F> MessageCallback for F
where
    F: Fn(&TopicEvent) -> Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, event: &TopicEvent) -> Result<()> {
        self(event)
    }
}

/// Receives topic events parsed by the dispatcher.
pub trait EventRouter: Send + Sync + 'static {
    /// Must not block: it runs on the read loop.
    fn route(&self, event: TopicEvent);
}

/// Notified once per connection generation, after the handshake.
///
/// The connection is reported as connected only once the handler calls
/// [`Session::mark_ready`].
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_session(&self, session: &Session) -> Result<()>;
}

/// Subscribe capability that per-domain adapters are written against.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe_topic(
        &self,
        prefix: &str,
        args: Vec<String>,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<SubscriptionId>;

    async fn remove_subscription(&self, id: SubscriptionId) -> Result<()>;
}

#[async_trait]
impl<S: Subscriber + ?Sized> Subscriber for Arc<S> {
    async fn subscribe_topic(
        &self,
        prefix: &str,
        args: Vec<String>,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<SubscriptionId> {
        (**self).subscribe_topic(prefix, args, callback).await
    }

    async fn remove_subscription(&self, id: SubscriptionId) -> Result<()> {
        (**self).remove_subscription(id).await
    }
}
