//! In-app notification feed
//!
//! Delivers notifications to connected clients over a broadcast channel.
//! Each connected session subscribes and filters for its own user id; a
//! send succeeds as long as the feed accepts it, even with no listeners,
//! since clients also pull missed notifications on reconnect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mnemo_core::channel::{ChannelSender, SendOutcome};
use mnemo_core::clock::SharedClock;
use mnemo_core::content::NotificationContent;
use mnemo_core::error::Result;
use mnemo_core::types::{Channel, Priority};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// One notification as seen by a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InAppNotification {
    /// Feed-assigned id
    pub id: String,
    /// Recipient
    pub user_id: String,
    /// Short title
    pub title: String,
    /// Body text
    pub message: String,
    /// Where a tap/click should land
    pub action_url: String,
    /// Delivery priority
    pub priority: Priority,
    /// When the feed accepted it
    pub created_at: DateTime<Utc>,
}

/// Broadcast-backed in-app sender.
pub struct InAppSender {
    feed: broadcast::Sender<InAppNotification>,
    clock: SharedClock,
}

impl InAppSender {
    /// Create a sender with room for `capacity` undelivered notifications
    /// per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        Self { feed, clock }
    }

    /// Subscribe to the feed. Sessions filter on `user_id` themselves.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InAppNotification> {
        self.feed.subscribe()
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, user_id: &str, content: &NotificationContent) -> Result<SendOutcome> {
        let notification = InAppNotification {
            id: format!("inapp_{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            title: content.title.clone(),
            message: content.message.clone(),
            action_url: content.action_url.clone(),
            priority: content.priority,
            created_at: self.clock.now(),
        };
        let id = notification.id.clone();

        // send only errs with zero receivers, which is fine here.
        let listeners = self.feed.send(notification).unwrap_or(0);
        debug!(user_id, listeners, "in-app notification published");
        Ok(SendOutcome {
            provider_id: Some(id),
        })
    }
}
