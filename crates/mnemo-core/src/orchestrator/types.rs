//! Orchestrator domain events and dispatch reporting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Channel;

/// Events from the review engine the orchestrator reacts to. Arrives on an
/// injected channel wired up by the composition root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReviewEvent {
    /// The user answered an item; its next due time changed
    ItemAnswered {
        /// User
        user_id: String,
        /// Item that was answered
        item_id: String,
        /// When the item comes due again
        next_due: DateTime<Utc>,
    },
    /// The user finished a review session
    SessionCompleted {
        /// User
        user_id: String,
    },
    /// Progress stats changed
    ProgressUpdated {
        /// User
        user_id: String,
        /// Current streak in days
        streak: u32,
    },
}

/// Inputs for scheduling a review notification.
#[derive(Debug, Clone)]
pub struct ReviewScheduleParams {
    /// Target user
    pub user_id: String,
    /// Item coming due
    pub item_id: String,
    /// When the item is due
    pub due_at: DateTime<Utc>,
}

/// What `schedule_review_notification` decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Already due; sent right away
    SentImmediately,
    /// Armed an exact-time schedule
    Scheduled(String),
    /// Merged into the daily digest
    DailyBatch(String),
    /// No channel enabled or no timing preference allows it
    Skipped,
}

/// Result of one channel's dispatch attempt.
#[derive(Debug, Clone)]
pub struct ChannelOutcome {
    /// Channel attempted
    pub channel: Channel,
    /// Whether the send succeeded
    pub success: bool,
    /// Error text for failures, rate-limit denials, or missing senders
    pub error: Option<String>,
    /// Provider-side message id, when the channel reports one
    pub provider_id: Option<String>,
}

/// Per-channel results of a send, or why nothing was sent.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// One entry per attempted channel
    pub outcomes: Vec<ChannelOutcome>,
    /// Set when delivery was deferred for quiet hours
    pub deferred_until: Option<DateTime<Utc>>,
}

impl DispatchReport {
    /// Channels that accepted the send.
    #[must_use]
    pub fn delivered_channels(&self) -> Vec<Channel> {
        self.outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.channel)
            .collect()
    }

    /// Whether at least one channel accepted the send.
    #[must_use]
    pub fn any_delivered(&self) -> bool {
        self.outcomes.iter().any(|o| o.success)
    }
}
