//! Broadcast-based event bus for notification lifecycle events.
//!
//! The composition root constructs one [`EventBus`] and hands clones to the
//! orchestrator and any UI/telemetry subscribers (countdown widgets, debug
//! overlays). Slow subscribers miss events (lagged) rather than blocking
//! the publisher.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{Channel, NotificationType};

/// Events emitted by the notification core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// An exact-time schedule was armed
    Scheduled {
        /// Schedule id
        schedule_id: String,
        /// User the notification targets
        user_id: String,
        /// When it will fire
        scheduled_for: DateTime<Utc>,
    },
    /// An in-app countdown should start (item due within the hour)
    CountdownStarted {
        /// User the countdown belongs to
        user_id: String,
        /// Item coming due
        item_id: String,
        /// Due time the countdown targets
        due_at: DateTime<Utc>,
    },
    /// A previously armed schedule was cancelled
    ScheduleCancelled {
        /// Schedule id
        schedule_id: String,
        /// User the notification targeted
        user_id: String,
    },
    /// A notification was dispatched to its channels
    Delivered {
        /// Target user
        user_id: String,
        /// Notification kind
        notification_type: NotificationType,
        /// Channels that accepted the send
        channels: Vec<Channel>,
    },
    /// Delivery was deferred (quiet hours)
    Deferred {
        /// Target user
        user_id: String,
        /// When delivery becomes allowed again
        until: DateTime<Utc>,
    },
    /// Delivery was denied by the rate limiter
    RateLimited {
        /// Target user
        user_id: String,
        /// Scope key that denied
        scope: String,
        /// Seconds until a retry may succeed
        retry_after_secs: u64,
    },
    /// The user hit a streak milestone
    StreakMilestone {
        /// User
        user_id: String,
        /// Streak length in days
        streak: u32,
    },
}

impl NotificationEvent {
    /// The user this event concerns.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::Scheduled { user_id, .. }
            | Self::CountdownStarted { user_id, .. }
            | Self::ScheduleCancelled { user_id, .. }
            | Self::Delivered { user_id, .. }
            | Self::Deferred { user_id, .. }
            | Self::RateLimited { user_id, .. }
            | Self::StreakMilestone { user_id, .. } => user_id,
        }
    }
}

/// Broadcast-based event bus for notification events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NotificationEvent>,
}

impl EventBus {
    /// Create a new bus with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that received it;
    /// with no subscribers the event is silently dropped.
    pub fn publish(&self, event: NotificationEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let delivered = bus.publish(NotificationEvent::StreakMilestone {
            user_id: "u1".to_string(),
            streak: 10,
        });
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id(), "u1");
        match event {
            NotificationEvent::StreakMilestone { streak, .. } => assert_eq!(streak, 10),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::default();
        let delivered = bus.publish(NotificationEvent::ScheduleCancelled {
            schedule_id: "s1".to_string(),
            user_id: "u1".to_string(),
        });
        assert_eq!(delivered, 0);
    }
}
