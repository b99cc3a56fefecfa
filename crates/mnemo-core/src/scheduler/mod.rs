//! Exact-time notification scheduling
//!
//! Arms a one-shot timer for each near-term notification and mirrors it
//! into a durable store so a restart can re-arm it. Far-future schedules
//! beyond the armable horizon are persisted without a live timer and picked
//! up by [`NotificationScheduler::restore_scheduled_notifications`].
//!
//! Delivery goes through the narrow [`NotificationSink`] seam; the
//! scheduler never sees the orchestrator type.

mod store;
mod types;

pub use store::{ScheduleStore, SqliteScheduleStore};
pub use types::{schedule_id, DeliveryRequest, NotificationSink, ScheduledNotification};

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::content::{self, ContentContext};
use crate::error::Result;
use crate::event_bus::{EventBus, NotificationEvent};
use crate::timers::{callback, TimerManager};
use crate::types::{Channel, NotificationType, Priority};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest delay an in-memory timer is armed for. Anything further out
    /// is persisted only and re-armed by restoration.
    pub max_armed_delay: StdDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // The armable range of a 32-bit millisecond timer, ~24.8 days.
            max_armed_delay: StdDuration::from_millis(i32::MAX as u64),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the armable horizon
    #[must_use]
    pub fn with_max_armed_delay(mut self, horizon: StdDuration) -> Self {
        self.max_armed_delay = horizon;
        self
    }
}

/// What to schedule.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Target user
    pub user_id: String,
    /// Items the notification covers
    pub item_ids: Vec<String>,
    /// Template kind
    pub kind: NotificationType,
    /// When it should fire
    pub scheduled_for: DateTime<Utc>,
    /// Delivery priority
    pub priority: Priority,
    /// Channels to dispatch to; empty means the user's enabled set
    pub channels: Vec<Channel>,
    /// Free-form extra data persisted with the schedule
    pub metadata: Value,
}

impl ScheduleOptions {
    /// A review-due notification for one item.
    #[must_use]
    pub fn review_due(user_id: &str, item_id: &str, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            item_ids: vec![item_id.to_string()],
            kind: NotificationType::ReviewDue,
            scheduled_for,
            priority: Priority::Normal,
            channels: Vec::new(),
            metadata: Value::Null,
        }
    }
}

/// Outcome of a restoration pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Overdue schedules fired immediately
    pub fired: usize,
    /// Future schedules re-armed
    pub rearmed: usize,
}

/// Crash-recoverable exact-time scheduler.
pub struct NotificationScheduler {
    timers: Arc<TimerManager>,
    store: Arc<dyn ScheduleStore>,
    sink: Arc<dyn NotificationSink>,
    clock: SharedClock,
    events: EventBus,
    config: SchedulerConfig,
}

impl NotificationScheduler {
    /// Create a scheduler.
    pub fn new(
        timers: Arc<TimerManager>,
        store: Arc<dyn ScheduleStore>,
        sink: Arc<dyn NotificationSink>,
        clock: SharedClock,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            timers,
            store,
            sink,
            clock,
            events,
            config,
        }
    }

    /// Schedule a notification. Past times fire immediately; near-term times
    /// arm a timer plus a durable mirror; far-future times are persisted
    /// only. Returns the deterministic schedule id.
    pub async fn schedule_notification(&self, options: ScheduleOptions) -> Result<String> {
        let now = self.clock.now();
        let notification = ScheduledNotification {
            id: schedule_id(&options.user_id, &options.item_ids, options.scheduled_for),
            user_id: options.user_id,
            item_ids: options.item_ids,
            kind: options.kind,
            scheduled_for: options.scheduled_for,
            priority: options.priority,
            channels: options.channels,
            metadata: options.metadata,
            created_at: now,
        };
        let id = notification.id.clone();

        let delay = (notification.scheduled_for - now)
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        if delay.is_zero() {
            debug!(schedule = %id, "schedule already due, firing immediately");
            fire(self.sink.clone(), self.store.clone(), notification, false).await?;
            return Ok(id);
        }

        // Persistence is best-effort: a failed durable write only risks
        // losing recovery after a restart, not the in-memory delivery.
        if let Err(err) = self.store.put(&notification).await {
            warn!(schedule = %id, error = %err, "failed to persist schedule, timer only");
        }

        if delay <= self.config.max_armed_delay {
            self.arm(&notification, delay).await?;
            self.events.publish(NotificationEvent::Scheduled {
                schedule_id: id.clone(),
                user_id: notification.user_id.clone(),
                scheduled_for: notification.scheduled_for,
            });
        } else {
            debug!(
                schedule = %id,
                delay_secs = delay.as_secs(),
                "beyond armable horizon, persisted without a timer"
            );
        }
        Ok(id)
    }

    /// Cancel one schedule by id. Returns whether a live timer was cleared.
    pub async fn cancel(&self, id: &str, user_id: &str) -> Result<bool> {
        let had_timer = self.timers.clear_timer(id).await;
        self.store.delete(id).await?;
        self.events.publish(NotificationEvent::ScheduleCancelled {
            schedule_id: id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(had_timer)
    }

    /// Cancel every schedule referencing one item, used when the item's next
    /// due time changes. Returns the number cancelled.
    pub async fn cancel_for_item(&self, user_id: &str, item_id: &str) -> Result<usize> {
        let user = user_id.to_string();
        let item = item_id.to_string();
        let timers_cleared = self
            .timers
            .clear_by_metadata(move |meta| {
                meta["user_id"] == user.as_str()
                    && meta["item_ids"]
                        .as_array()
                        .is_some_and(|ids| ids.iter().any(|v| v == item.as_str()))
            })
            .await;

        let schedules = self.store.get_for_item(user_id, item_id).await?;
        for schedule in &schedules {
            self.store.delete(&schedule.id).await?;
            self.events.publish(NotificationEvent::ScheduleCancelled {
                schedule_id: schedule.id.clone(),
                user_id: user_id.to_string(),
            });
        }
        let cancelled = schedules.len().max(timers_cleared);
        if cancelled > 0 {
            debug!(user_id, item_id, cancelled, "cancelled schedules for item");
        }
        Ok(cancelled)
    }

    /// Re-arm persisted schedules after a restart: overdue ones fire
    /// immediately, future ones get a fresh timer (when within the horizon).
    pub async fn restore_scheduled_notifications(&self, user_id: &str) -> Result<RestoreSummary> {
        let now = self.clock.now();
        let mut summary = RestoreSummary::default();

        for notification in self.store.get_for_user(user_id).await? {
            let delay = (notification.scheduled_for - now)
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            if delay.is_zero() {
                let id = notification.id.clone();
                if let Err(err) =
                    fire(self.sink.clone(), self.store.clone(), notification, true).await
                {
                    warn!(schedule = %id, error = %err, "restored schedule failed to deliver");
                } else {
                    summary.fired += 1;
                }
            } else if delay <= self.config.max_armed_delay {
                self.arm(&notification, delay).await?;
                summary.rearmed += 1;
            }
        }

        if summary != RestoreSummary::default() {
            info!(
                user_id,
                fired = summary.fired,
                rearmed = summary.rearmed,
                "restored persisted schedules"
            );
        }
        Ok(summary)
    }

    /// Live timers currently armed.
    pub async fn armed_count(&self) -> usize {
        self.timers.active_count().await
    }

    async fn arm(&self, notification: &ScheduledNotification, delay: StdDuration) -> Result<()> {
        let metadata = serde_json::json!({
            "user_id": notification.user_id,
            "item_ids": notification.item_ids,
        });
        let id = notification.id.clone();
        let sink = self.sink.clone();
        let store = self.store.clone();
        let notification = notification.clone();
        let cb = callback(move || {
            let sink = sink.clone();
            let store = store.clone();
            let notification = notification.clone();
            async move { fire(sink, store, notification, true).await }
        });
        self.timers.set_timeout(cb, delay, Some(id), metadata).await?;
        Ok(())
    }
}

/// Render content for a due schedule and push it through the sink, then
/// remove the durable mirror.
async fn fire(
    sink: Arc<dyn NotificationSink>,
    store: Arc<dyn ScheduleStore>,
    notification: ScheduledNotification,
    delete_record: bool,
) -> Result<()> {
    let ctx = ContentContext::reviews(
        notification.item_ids.len(),
        notification.item_ids.clone(),
    );
    let mut content = content::render(notification.kind, &ctx);
    // The schedule's priority wins over the template default.
    content.priority = notification.priority;

    sink.deliver(DeliveryRequest {
        user_id: notification.user_id.clone(),
        kind: notification.kind,
        content,
        channels: notification.channels.clone(),
    })
    .await?;

    if delete_record {
        if let Err(err) = store.delete(&notification.id).await {
            warn!(schedule = %notification.id, error = %err, "failed to delete fired schedule");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
