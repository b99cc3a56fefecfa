//! Channel-agnostic notification content
//!
//! One template per [`NotificationType`]. The scheduler renders content when
//! a timer fires; the queue re-renders when a batch grows so the message
//! always reflects the current item count.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{NotificationType, Priority};

/// Rendered, channel-agnostic notification content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    /// Short title
    pub title: String,
    /// Body text
    pub message: String,
    /// Where a tap/click should land
    pub action_url: String,
    /// Delivery priority
    pub priority: Priority,
    /// Free-form extra data carried to the channel sender
    #[serde(default)]
    pub metadata: Value,
}

/// Inputs for template rendering.
#[derive(Debug, Clone, Default)]
pub struct ContentContext {
    /// Number of items covered by this notification
    pub review_count: usize,
    /// Item ids covered (carried into metadata)
    pub item_ids: Vec<String>,
    /// Current streak, for streak templates
    pub streak: Option<u32>,
    /// Achievement label, for achievement templates
    pub achievement: Option<String>,
    /// Caller-supplied override for the message body
    pub message_override: Option<String>,
}

impl ContentContext {
    /// Context for a review batch of `count` items.
    #[must_use]
    pub fn reviews(count: usize, item_ids: Vec<String>) -> Self {
        Self {
            review_count: count,
            item_ids,
            ..Self::default()
        }
    }
}

/// Render content for a notification type.
#[must_use]
pub fn render(kind: NotificationType, ctx: &ContentContext) -> NotificationContent {
    let (title, message, action_url, priority) = match kind {
        NotificationType::ReviewDue => (
            "Time to review".to_string(),
            review_message(ctx.review_count, "ready for review"),
            "/review".to_string(),
            Priority::Normal,
        ),
        NotificationType::ReviewOverdue => (
            "Reviews overdue".to_string(),
            review_message(ctx.review_count.max(1), "overdue"),
            "/review".to_string(),
            Priority::High,
        ),
        NotificationType::DailySummary => (
            "Your daily review".to_string(),
            review_message(ctx.review_count, "waiting for you today"),
            "/review".to_string(),
            Priority::Normal,
        ),
        NotificationType::Achievement => (
            "Achievement unlocked".to_string(),
            ctx.achievement
                .clone()
                .unwrap_or_else(|| "You reached a new milestone!".to_string()),
            "/progress".to_string(),
            Priority::Normal,
        ),
        NotificationType::StreakReminder => (
            "Keep your streak going".to_string(),
            match ctx.streak {
                Some(days) => format!("You're on a {days}-day streak. Don't break it now!"),
                None => "A quick review keeps your streak alive.".to_string(),
            },
            "/review".to_string(),
            Priority::Low,
        ),
        NotificationType::Other => (
            "Mnemo".to_string(),
            "You have a new notification.".to_string(),
            "/".to_string(),
            Priority::Normal,
        ),
    };

    let message = ctx.message_override.clone().unwrap_or(message);

    NotificationContent {
        title,
        message,
        action_url,
        priority,
        metadata: serde_json::json!({
            "item_ids": ctx.item_ids,
            "review_count": ctx.review_count,
        }),
    }
}

fn review_message(count: usize, state: &str) -> String {
    match count {
        0 => format!("No items are {state}."),
        1 => format!("1 item is {state}."),
        n => format!("{n} items are {state}."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_due_pluralizes() {
        let one = render(
            NotificationType::ReviewDue,
            &ContentContext::reviews(1, vec!["a".into()]),
        );
        assert_eq!(one.message, "1 item is ready for review.");

        let two = render(
            NotificationType::ReviewDue,
            &ContentContext::reviews(2, vec!["a".into(), "b".into()]),
        );
        assert_eq!(two.message, "2 items are ready for review.");
        assert_eq!(two.action_url, "/review");

        // An empty batch never claims to have an item.
        let none = render(NotificationType::DailySummary, &ContentContext::default());
        assert_eq!(none.message, "No items are waiting for you today.");
    }

    #[test]
    fn test_streak_reminder_uses_streak() {
        let ctx = ContentContext {
            streak: Some(12),
            ..ContentContext::default()
        };
        let content = render(NotificationType::StreakReminder, &ctx);
        assert!(content.message.contains("12-day"));
        assert_eq!(content.priority, Priority::Low);
    }

    #[test]
    fn test_overdue_is_high_priority() {
        let content = render(NotificationType::ReviewOverdue, &ContentContext::default());
        assert_eq!(content.priority, Priority::High);
    }

    #[test]
    fn test_message_override_wins() {
        let ctx = ContentContext {
            message_override: Some("custom".to_string()),
            ..ContentContext::default()
        };
        let content = render(NotificationType::Other, &ctx);
        assert_eq!(content.message, "custom");
    }

    #[test]
    fn test_metadata_carries_item_ids() {
        let content = render(
            NotificationType::ReviewDue,
            &ContentContext::reviews(2, vec!["x".into(), "y".into()]),
        );
        assert_eq!(content.metadata["item_ids"][1], "y");
        assert_eq!(content.metadata["review_count"], 2);
    }
}
