//! Durable schedule storage using SQLite
//!
//! Mirrors armed schedules so they survive restarts and can be re-armed by
//! [`super::NotificationScheduler::restore_scheduled_notifications`].

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

use super::types::{ScheduleRow, ScheduledNotification};
use crate::error::{Error, Result};

/// Durable mirror of armed schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace a schedule.
    async fn put(&self, schedule: &ScheduledNotification) -> Result<()>;

    /// Delete a schedule. Deleting an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// All schedules for a user, soonest first.
    async fn get_for_user(&self, user_id: &str) -> Result<Vec<ScheduledNotification>>;

    /// All of a user's schedules that reference one item.
    async fn get_for_item(&self, user_id: &str, item_id: &str)
        -> Result<Vec<ScheduledNotification>>;
}

/// SQLite-backed schedule store
pub struct SqliteScheduleStore {
    pool: Pool<Sqlite>,
}

impl SqliteScheduleStore {
    /// Create a new store from database path
    pub async fn from_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("failed to create directory: {e}"))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                item_ids_json TEXT NOT NULL,
                kind TEXT NOT NULL,
                scheduled_for TIMESTAMP NOT NULL,
                priority TEXT NOT NULL,
                channels_json TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_schedules_user ON scheduled_notifications(user_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_schedules_time ON scheduled_notifications(scheduled_for)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn put(&self, schedule: &ScheduledNotification) -> Result<()> {
        let item_ids_json = serde_json::to_string(&schedule.item_ids)?;
        let kind = serde_json::to_value(schedule.kind)?;
        let priority = serde_json::to_value(schedule.priority)?;
        let channels_json = serde_json::to_string(&schedule.channels)?;
        let metadata_json = serde_json::to_string(&schedule.metadata)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO scheduled_notifications (
                id, user_id, item_ids_json, kind, scheduled_for,
                priority, channels_json, metadata_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.user_id)
        .bind(item_ids_json)
        .bind(kind.as_str().unwrap_or_default())
        .bind(schedule.scheduled_for)
        .bind(priority.as_str().unwrap_or_default())
        .bind(channels_json)
        .bind(metadata_json)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_notifications WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_for_user(&self, user_id: &str) -> Result<Vec<ScheduledNotification>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT * FROM scheduled_notifications
            WHERE user_id = ?
            ORDER BY scheduled_for ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_for_item(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<Vec<ScheduledNotification>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT * FROM scheduled_notifications
            WHERE user_id = ?
              AND EXISTS (
                SELECT 1 FROM json_each(scheduled_notifications.item_ids_json)
                WHERE json_each.value = ?
              )
            ORDER BY scheduled_for ASC
            "#,
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
