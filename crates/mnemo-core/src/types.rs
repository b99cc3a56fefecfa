//! Shared domain types
//!
//! Channels, notification kinds, and priorities used across the scheduler,
//! queue, and orchestrator.

use serde::{Deserialize, Serialize};

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Native browser notification
    Browser,
    /// In-app notification feed
    InApp,
    /// Mobile/web push
    Push,
    /// Email
    Email,
}

impl Channel {
    /// All channels, in dispatch order.
    pub const ALL: [Channel; 4] = [
        Channel::Browser,
        Channel::InApp,
        Channel::Push,
        Channel::Email,
    ];

    /// Stable string name, used in rate-limit scope keys and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Browser => "browser",
            Channel::InApp => "in_app",
            Channel::Push => "push",
            Channel::Email => "email",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of notification, which selects the content template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// One or more items are due for review
    ReviewDue,
    /// Items are past due
    ReviewOverdue,
    /// Once-per-day aggregated summary
    DailySummary,
    /// Achievement unlocked
    Achievement,
    /// Streak encouragement
    StreakReminder,
    /// Anything else; rendered with the default template
    Other,
}

impl NotificationType {
    /// Stable string name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::ReviewDue => "review_due",
            NotificationType::ReviewOverdue => "review_overdue",
            NotificationType::DailySummary => "daily_summary",
            NotificationType::Achievement => "achievement",
            NotificationType::StreakReminder => "streak_reminder",
            NotificationType::Other => "other",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification priority.
///
/// High priority bypasses quiet hours and (configurably) rate-limit scopes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Deferred freely
    Low,
    /// Default
    #[default]
    Normal,
    /// Delivered even during quiet hours
    High,
}
