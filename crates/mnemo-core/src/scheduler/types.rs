//! Scheduler types and the delivery sink seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::content::NotificationContent;
use crate::error::{Error, Result};
use crate::types::{Channel, NotificationType, Priority};

/// A persisted exact-time schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    /// Deterministic id: `notif_<user>_<items>_<timestamp>`
    pub id: String,
    /// Target user
    pub user_id: String,
    /// Items this notification covers
    pub item_ids: Vec<String>,
    /// Template kind
    pub kind: NotificationType,
    /// When it fires
    pub scheduled_for: DateTime<Utc>,
    /// Delivery priority
    pub priority: Priority,
    /// Channels to dispatch to; empty means the user's enabled set
    pub channels: Vec<Channel>,
    /// Free-form extra data
    pub metadata: Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Deterministic schedule id for a user, item set, and fire time. The same
/// inputs always produce the same id, so re-scheduling overwrites instead of
/// duplicating. Item ids are sorted before joining, so the order they arrive
/// in does not matter.
#[must_use]
pub fn schedule_id(user_id: &str, item_ids: &[String], scheduled_for: DateTime<Utc>) -> String {
    let items = match item_ids {
        [] => "batch".to_string(),
        [only] => only.clone(),
        many => {
            let mut sorted: Vec<&str> = many.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.join("+")
        }
    };
    format!("notif_{user_id}_{items}_{}", scheduled_for.timestamp())
}

/// What the scheduler asks for when a schedule comes due.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Target user
    pub user_id: String,
    /// Template kind
    pub kind: NotificationType,
    /// Rendered content; `content.priority` carries the schedule's priority
    pub content: NotificationContent,
    /// Requested channels; empty means the user's enabled set
    pub channels: Vec<Channel>,
}

/// Delivery seam between the scheduler and whatever sends notifications.
///
/// The orchestrator implements this; the scheduler only ever sees the trait,
/// so the two can be constructed independently.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a due notification.
    async fn deliver(&self, request: DeliveryRequest) -> Result<()>;
}

/// Internal row type for database queries
#[derive(FromRow)]
pub(super) struct ScheduleRow {
    pub id: String,
    pub user_id: String,
    pub item_ids_json: String,
    pub kind: String,
    pub scheduled_for: DateTime<Utc>,
    pub priority: String,
    pub channels_json: String,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for ScheduledNotification {
    type Error = Error;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        Ok(ScheduledNotification {
            id: row.id,
            user_id: row.user_id,
            item_ids: serde_json::from_str(&row.item_ids_json)?,
            kind: serde_json::from_value(Value::String(row.kind))?,
            scheduled_for: row.scheduled_for,
            priority: serde_json::from_value(Value::String(row.priority))?,
            channels: serde_json::from_str(&row.channels_json)?,
            metadata: serde_json::from_str(&row.metadata_json)?,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_schedule_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();
        let a = schedule_id("u1", &["item_7".to_string()], at);
        let b = schedule_id("u1", &["item_7".to_string()], at);
        assert_eq!(a, b);
        assert_eq!(a, format!("notif_u1_item_7_{}", at.timestamp()));

        let other_time = schedule_id("u1", &["item_7".to_string()], at + chrono::Duration::seconds(1));
        assert_ne!(a, other_time);

        let no_items = schedule_id("u1", &[], at);
        assert_eq!(no_items, format!("notif_u1_batch_{}", at.timestamp()));
    }

    #[test]
    fn test_schedule_id_covers_the_whole_item_set() {
        let at = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();

        // Different multi-item sets for the same user and time must not
        // collide, or the later schedule would silently overwrite the first.
        let ab = schedule_id("u1", &["a".to_string(), "b".to_string()], at);
        let ac = schedule_id("u1", &["a".to_string(), "c".to_string()], at);
        assert_ne!(ab, ac);

        // The same set in a different order is still the same schedule.
        let ba = schedule_id("u1", &["b".to_string(), "a".to_string()], at);
        assert_eq!(ab, ba);
        assert_eq!(ab, format!("notif_u1_a+b_{}", at.timestamp()));
    }
}
