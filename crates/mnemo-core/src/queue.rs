//! Durable notification queue with batch merging
//!
//! Queue records live in the document store and survive restarts. Due
//! review notifications for the same user and channel merge into one record
//! when they land within the batching window; daily digests converge onto a
//! deterministic per-day record id so concurrent additions cannot fork the
//! batch. Timestamps are stored as whole-second RFC 3339 strings so the
//! store's lexicographic range filters order them chronologically.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::content::{self, ContentContext};
use crate::error::{Error, Result};
use crate::store::{DocumentStore, Filter, FilterOp, Order};
use crate::types::{Channel, NotificationType, Priority};

const COLLECTION: &str = "notification_queue";

/// Delivery state of a queue record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be delivered
    Pending,
    /// Delivered
    Sent,
    /// Gave up after exhausting retries
    Failed,
    /// Explicitly withdrawn
    Cancelled,
}

impl QueueStatus {
    /// Stable string name, matching the serialized form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the record will never be delivered again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Pending)
    }
}

/// What gets delivered when the record comes due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QueuePayload {
    /// Items covered by this notification
    pub item_ids: Vec<String>,
    /// Count reflected in the rendered message
    pub review_count: usize,
    /// Rendered title
    pub title: String,
    /// Rendered body
    pub message: String,
    /// Tap/click target
    pub action_url: String,
    /// Delivery priority
    pub priority: Priority,
    /// Extra data carried to the channel sender
    #[serde(default)]
    pub metadata: Value,
}

/// One durable queue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotificationQueueItem {
    /// Record id (also the store key)
    pub id: String,
    /// Owner
    pub user_id: String,
    /// Template kind
    pub kind: NotificationType,
    /// Target channel
    pub channel: Channel,
    /// When the record comes due
    #[serde(with = "rfc3339_secs")]
    pub scheduled_for: DateTime<Utc>,
    /// Rendered content and covered items
    pub payload: QueuePayload,
    /// Delivery state
    pub status: QueueStatus,
    /// Delivery attempts so far
    pub attempts: u32,
    /// Creation time
    #[serde(with = "rfc3339_secs")]
    pub created_at: DateTime<Utc>,
    /// Delivery time, once sent
    #[serde(default, with = "rfc3339_secs_opt", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Last delivery error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct NotificationQueueConfig {
    /// Most items one record may cover
    pub max_batch_size: usize,
    /// Local hour daily digests are anchored to
    pub daily_hour: u32,
    /// Attempts before a record goes terminal `failed`
    pub max_attempts: u32,
    /// How long terminal records are kept before the sweep deletes them
    pub retention: ChronoDuration,
}

impl Default for NotificationQueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            daily_hour: 9,
            max_attempts: 3,
            retention: ChronoDuration::days(7),
        }
    }
}

/// Durable, batch-merging notification queue.
pub struct NotificationQueue {
    store: Arc<dyn DocumentStore>,
    clock: SharedClock,
    config: NotificationQueueConfig,
}

impl NotificationQueue {
    /// Create a queue over a document store.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: SharedClock,
        config: NotificationQueueConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Enqueue a notification. For `review_due` records with a batching
    /// window, an existing pending record for the same user and channel
    /// within the window absorbs the new items (up to the batch cap) and
    /// its message is re-rendered for the new count.
    pub async fn add_to_queue(
        &self,
        user_id: &str,
        kind: NotificationType,
        channel: Channel,
        scheduled_for: DateTime<Utc>,
        item_ids: Vec<String>,
        batch_window: Option<ChronoDuration>,
    ) -> Result<NotificationQueueItem> {
        if kind == NotificationType::ReviewDue {
            if let Some(window) = batch_window {
                if let Some(existing) = self
                    .find_batchable(user_id, channel, scheduled_for, window)
                    .await?
                {
                    if existing.payload.item_ids.len() + item_ids.len() <= self.config.max_batch_size
                    {
                        return self.merge_into(existing, item_ids).await;
                    }
                    debug!(
                        record = %existing.id,
                        "batch cap reached, starting a new queue record"
                    );
                }
            }
        }

        let item = self.build_record(
            format!("queue_{}", Uuid::new_v4()),
            user_id,
            kind,
            channel,
            scheduled_for,
            item_ids,
        );
        self.persist(&item).await?;
        debug!(record = %item.id, user_id, kind = %kind, "queued notification");
        Ok(item)
    }

    /// Add items to the user's daily digest. The digest is anchored to the
    /// configured local hour in `tz`, rolling to the next day once that hour
    /// has passed, and keyed deterministically so concurrent additions for
    /// the same day converge onto one record.
    pub async fn add_to_daily(
        &self,
        user_id: &str,
        channel: Channel,
        item_ids: Vec<String>,
        tz: Tz,
    ) -> Result<NotificationQueueItem> {
        let batch_time = self.next_daily_time(tz);
        let id = format!("daily_{user_id}_{}", batch_time.timestamp());

        if let Some(value) = self.store.get(COLLECTION, &id).await? {
            let existing: NotificationQueueItem = serde_json::from_value(value)?;
            if existing.status == QueueStatus::Pending {
                return self.merge_into(existing, item_ids).await;
            }
        }

        let mut item = self.build_record(
            id,
            user_id,
            NotificationType::DailySummary,
            channel,
            batch_time,
            item_ids,
        );
        // Daily digests render with the summary template.
        let ctx = ContentContext::reviews(
            item.payload.item_ids.len(),
            item.payload.item_ids.clone(),
        );
        apply_content(&mut item.payload, NotificationType::DailySummary, &ctx);
        self.persist(&item).await?;
        info!(record = %item.id, user_id, "created daily digest record");
        Ok(item)
    }

    /// Due, still-pending records for a user, ordered by scheduled time.
    pub async fn pending_notifications(&self, user_id: &str) -> Result<Vec<NotificationQueueItem>> {
        let now = fmt_ts(self.clock.now());
        let docs = self
            .store
            .query(
                COLLECTION,
                &[
                    Filter::eq("user_id", user_id),
                    Filter::eq("status", QueueStatus::Pending.as_str()),
                    Filter::cmp("scheduled_for", FilterOp::Lte, now),
                ],
                Some(Order::Asc("scheduled_for".to_string())),
                None,
            )
            .await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc.value).map_err(Error::from))
            .collect()
    }

    /// Mark a record delivered.
    pub async fn mark_sent(&self, id: &str) -> Result<()> {
        let mut item = self.load(id).await?;
        item.status = QueueStatus::Sent;
        item.sent_at = Some(self.clock.now());
        item.error = None;
        self.persist(&item).await?;
        Ok(())
    }

    /// Record a delivery failure. The record stays pending until the retry
    /// cap is reached, then goes terminal `failed`.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut item = self.load(id).await?;
        item.attempts += 1;
        item.error = Some(error.to_string());
        if item.attempts >= self.config.max_attempts {
            item.status = QueueStatus::Failed;
            warn!(record = %id, attempts = item.attempts, "queue record failed permanently");
        }
        self.persist(&item).await?;
        Ok(())
    }

    /// Withdraw a pending record.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut item = self.load(id).await?;
        item.status = QueueStatus::Cancelled;
        self.persist(&item).await?;
        Ok(())
    }

    /// Delete terminal records older than the retention window. Returns the
    /// number deleted.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let cutoff = fmt_ts(self.clock.now() - self.config.retention);
        let mut removed = 0;
        for status in [QueueStatus::Sent, QueueStatus::Failed, QueueStatus::Cancelled] {
            let docs = self
                .store
                .query(
                    COLLECTION,
                    &[
                        Filter::eq("status", status.as_str()),
                        Filter::cmp("created_at", FilterOp::Lt, cutoff.clone()),
                    ],
                    None,
                    None,
                )
                .await?;
            for doc in docs {
                self.store.delete(COLLECTION, &doc.key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired queue records");
        }
        Ok(removed)
    }

    async fn load(&self, id: &str) -> Result<NotificationQueueItem> {
        let value = self
            .store
            .get(COLLECTION, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue record {id}")))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn persist(&self, item: &NotificationQueueItem) -> Result<()> {
        self.store
            .set(COLLECTION, &item.id, serde_json::to_value(item)?, false)
            .await
    }

    async fn find_batchable(
        &self,
        user_id: &str,
        channel: Channel,
        scheduled_for: DateTime<Utc>,
        window: ChronoDuration,
    ) -> Result<Option<NotificationQueueItem>> {
        let docs = self
            .store
            .query(
                COLLECTION,
                &[
                    Filter::eq("user_id", user_id),
                    Filter::eq("channel", channel.as_str()),
                    Filter::eq("kind", NotificationType::ReviewDue.as_str()),
                    Filter::eq("status", QueueStatus::Pending.as_str()),
                    Filter::cmp("scheduled_for", FilterOp::Gte, fmt_ts(scheduled_for - window)),
                    Filter::cmp("scheduled_for", FilterOp::Lte, fmt_ts(scheduled_for + window)),
                ],
                Some(Order::Asc("scheduled_for".to_string())),
                Some(1),
            )
            .await?;
        match docs.into_iter().next() {
            Some(doc) => Ok(Some(serde_json::from_value(doc.value)?)),
            None => Ok(None),
        }
    }

    async fn merge_into(
        &self,
        mut item: NotificationQueueItem,
        new_ids: Vec<String>,
    ) -> Result<NotificationQueueItem> {
        for id in new_ids {
            if !item.payload.item_ids.contains(&id) {
                item.payload.item_ids.push(id);
            }
        }
        // The stored id list is capped, but the count and message keep
        // reporting everything that is actually due.
        let total = item.payload.item_ids.len();
        item.payload.item_ids.truncate(self.config.max_batch_size);
        let dropped = total - item.payload.item_ids.len();
        if dropped > 0 {
            warn!(
                record = %item.id,
                dropped,
                cap = self.config.max_batch_size,
                "batch cap trimmed merged item ids"
            );
        }
        let ctx = ContentContext::reviews(total, item.payload.item_ids.clone());
        apply_content(&mut item.payload, item.kind, &ctx);
        self.persist(&item).await?;
        debug!(
            record = %item.id,
            items = item.payload.item_ids.len(),
            "merged into existing queue record"
        );
        Ok(item)
    }

    fn build_record(
        &self,
        id: String,
        user_id: &str,
        kind: NotificationType,
        channel: Channel,
        scheduled_for: DateTime<Utc>,
        item_ids: Vec<String>,
    ) -> NotificationQueueItem {
        let ctx = ContentContext::reviews(item_ids.len(), item_ids.clone());
        let content = content::render(kind, &ctx);
        NotificationQueueItem {
            id,
            user_id: user_id.to_string(),
            kind,
            channel,
            scheduled_for,
            payload: QueuePayload {
                item_ids,
                review_count: ctx.review_count,
                title: content.title,
                message: content.message,
                action_url: content.action_url,
                priority: content.priority,
                metadata: content.metadata,
            },
            status: QueueStatus::Pending,
            attempts: 0,
            created_at: self.clock.now(),
            sent_at: None,
            error: None,
        }
    }

    /// The next daily digest instant: today at the configured local hour,
    /// or tomorrow if that hour has already passed.
    fn next_daily_time(&self, tz: Tz) -> DateTime<Utc> {
        let hour = self.config.daily_hour.min(23);
        let local = self.clock.now().with_timezone(&tz);
        let mut date = local.date_naive();
        if local.hour() >= hour {
            date += ChronoDuration::days(1);
        }
        let naive = date
            .and_hms_opt(hour, 0, 0)
            .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
        crate::quiet_hours::resolve_local(&tz, naive)
    }
}

fn apply_content(payload: &mut QueuePayload, kind: NotificationType, ctx: &ContentContext) {
    let content = content::render(kind, ctx);
    payload.review_count = ctx.review_count;
    payload.title = content.title;
    payload.message = content.message;
    payload.action_url = content.action_url;
    payload.metadata = content.metadata;
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

mod rfc3339_secs {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::fmt_ts(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

mod rfc3339_secs_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_some(&super::fmt_ts(*ts)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests;
