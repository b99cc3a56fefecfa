use super::*;
use crate::clock::{Clock, ManualClock};
use crate::error::Error;
use crate::timers::TimerManagerConfig;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone};
use std::collections::HashMap;
use tokio::sync::Mutex;

struct RecordingSink {
    delivered: Mutex<Vec<DeliveryRequest>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }

    async fn count(&self) -> usize {
        self.delivered.lock().await.len()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, request: DeliveryRequest) -> Result<()> {
        self.delivered.lock().await.push(request);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryScheduleStore {
    schedules: Mutex<HashMap<String, ScheduledNotification>>,
}

impl MemoryScheduleStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn len(&self) -> usize {
        self.schedules.lock().await.len()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn put(&self, schedule: &ScheduledNotification) -> Result<()> {
        self.schedules
            .lock()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.schedules.lock().await.remove(id);
        Ok(())
    }

    async fn get_for_user(&self, user_id: &str) -> Result<Vec<ScheduledNotification>> {
        let mut found: Vec<_> = self
            .schedules
            .lock()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.scheduled_for);
        Ok(found)
    }

    async fn get_for_item(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<Vec<ScheduledNotification>> {
        let all = self.get_for_user(user_id).await?;
        Ok(all
            .into_iter()
            .filter(|s| s.item_ids.iter().any(|i| i == item_id))
            .collect())
    }
}

/// Store whose writes always fail, for the best-effort persistence path.
struct BrokenScheduleStore;

#[async_trait]
impl ScheduleStore for BrokenScheduleStore {
    async fn put(&self, _schedule: &ScheduledNotification) -> Result<()> {
        Err(Error::Storage("disk full".to_string()))
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Err(Error::Storage("disk full".to_string()))
    }

    async fn get_for_user(&self, _user_id: &str) -> Result<Vec<ScheduledNotification>> {
        Err(Error::Storage("disk full".to_string()))
    }

    async fn get_for_item(
        &self,
        _user_id: &str,
        _item_id: &str,
    ) -> Result<Vec<ScheduledNotification>> {
        Err(Error::Storage("disk full".to_string()))
    }
}

struct TestContext {
    scheduler: NotificationScheduler,
    sink: Arc<RecordingSink>,
    store: Arc<MemoryScheduleStore>,
    clock: ManualClock,
    events: EventBus,
}

fn create_test_context() -> TestContext {
    create_test_context_with(SchedulerConfig::default())
}

fn create_test_context_with(config: SchedulerConfig) -> TestContext {
    let sink = RecordingSink::new();
    let store = MemoryScheduleStore::new();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap());
    let events = EventBus::default();
    let scheduler = NotificationScheduler::new(
        Arc::new(TimerManager::new(TimerManagerConfig::default())),
        store.clone(),
        sink.clone(),
        Arc::new(clock.clone()),
        events.clone(),
        config,
    );
    TestContext {
        scheduler,
        sink,
        store,
        clock,
        events,
    }
}

async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

/// Advance both the tokio clock (timers) and the wall clock together.
async fn advance(ctx: &TestContext, by: ChronoDuration) {
    ctx.clock.advance(by);
    tokio::time::advance(by.to_std().unwrap()).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_past_due_fires_immediately_without_persisting() {
    let ctx = create_test_context();

    let mut options =
        ScheduleOptions::review_due("u1", "item_1", ctx.clock.now() - ChronoDuration::minutes(5));
    options.priority = Priority::High;
    ctx.scheduler.schedule_notification(options).await.unwrap();

    assert_eq!(ctx.sink.count().await, 1);
    let delivered = ctx.sink.delivered.lock().await;
    assert_eq!(delivered[0].user_id, "u1");
    assert_eq!(delivered[0].kind, NotificationType::ReviewDue);
    // The schedule's priority overrides the template default.
    assert_eq!(delivered[0].content.priority, Priority::High);
    drop(delivered);

    assert_eq!(ctx.store.len().await, 0);
    assert_eq!(ctx.scheduler.armed_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_near_term_arms_timer_and_persists() {
    let ctx = create_test_context();
    let mut events = ctx.events.subscribe();
    let due = ctx.clock.now() + ChronoDuration::minutes(30);

    let id = ctx
        .scheduler
        .schedule_notification(ScheduleOptions::review_due("u1", "item_1", due))
        .await
        .unwrap();

    assert_eq!(id, schedule_id("u1", &["item_1".to_string()], due));
    assert_eq!(ctx.scheduler.armed_count().await, 1);
    assert_eq!(ctx.store.len().await, 1);

    let event = events.recv().await.unwrap();
    assert!(matches!(
        event,
        NotificationEvent::Scheduled { scheduled_for, .. } if scheduled_for == due
    ));

    // Not yet.
    advance(&ctx, ChronoDuration::minutes(29)).await;
    assert_eq!(ctx.sink.count().await, 0);

    advance(&ctx, ChronoDuration::minutes(1)).await;
    assert_eq!(ctx.sink.count().await, 1);
    // Fired schedules clean up their mirror and timer.
    assert_eq!(ctx.store.len().await, 0);
    assert_eq!(ctx.scheduler.armed_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_far_future_is_persisted_without_a_timer() {
    let ctx = create_test_context_with(
        SchedulerConfig::new().with_max_armed_delay(StdDuration::from_secs(3600)),
    );

    ctx.scheduler
        .schedule_notification(ScheduleOptions::review_due(
            "u1",
            "item_1",
            ctx.clock.now() + ChronoDuration::hours(2),
        ))
        .await
        .unwrap();

    assert_eq!(ctx.store.len().await, 1);
    assert_eq!(ctx.scheduler.armed_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rescheduling_same_item_and_time_is_idempotent() {
    let ctx = create_test_context();
    let due = ctx.clock.now() + ChronoDuration::minutes(30);

    let a = ctx
        .scheduler
        .schedule_notification(ScheduleOptions::review_due("u1", "item_1", due))
        .await
        .unwrap();
    let b = ctx
        .scheduler
        .schedule_notification(ScheduleOptions::review_due("u1", "item_1", due))
        .await
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(ctx.scheduler.armed_count().await, 1);
    assert_eq!(ctx.store.len().await, 1);

    advance(&ctx, ChronoDuration::minutes(31)).await;
    // Last-write-wins: one delivery, not two.
    assert_eq!(ctx.sink.count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_for_item_clears_timer_and_record() {
    let ctx = create_test_context();
    let now = ctx.clock.now();

    ctx.scheduler
        .schedule_notification(ScheduleOptions::review_due(
            "u1",
            "item_1",
            now + ChronoDuration::minutes(10),
        ))
        .await
        .unwrap();
    ctx.scheduler
        .schedule_notification(ScheduleOptions::review_due(
            "u1",
            "item_2",
            now + ChronoDuration::minutes(20),
        ))
        .await
        .unwrap();

    let cancelled = ctx.scheduler.cancel_for_item("u1", "item_1").await.unwrap();
    assert_eq!(cancelled, 1);
    assert_eq!(ctx.scheduler.armed_count().await, 1);
    assert_eq!(ctx.store.len().await, 1);

    advance(&ctx, ChronoDuration::minutes(30)).await;
    // Only item_2's notification went out.
    let delivered = ctx.sink.delivered.lock().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].content.metadata["item_ids"][0], "item_2");
}

#[tokio::test(start_paused = true)]
async fn test_restore_fires_overdue_and_rearms_future() {
    let ctx = create_test_context();
    let now = ctx.clock.now();

    // Simulate schedules persisted by a previous process run.
    let overdue = ScheduledNotification {
        id: schedule_id("u1", &["item_old".to_string()], now - ChronoDuration::hours(1)),
        user_id: "u1".to_string(),
        item_ids: vec!["item_old".to_string()],
        kind: NotificationType::ReviewOverdue,
        scheduled_for: now - ChronoDuration::hours(1),
        priority: Priority::High,
        channels: Vec::new(),
        metadata: serde_json::Value::Null,
        created_at: now - ChronoDuration::hours(2),
    };
    let future = ScheduledNotification {
        id: schedule_id("u1", &["item_new".to_string()], now + ChronoDuration::minutes(15)),
        scheduled_for: now + ChronoDuration::minutes(15),
        item_ids: vec!["item_new".to_string()],
        kind: NotificationType::ReviewDue,
        priority: Priority::Normal,
        ..overdue.clone()
    };
    ctx.store.put(&overdue).await.unwrap();
    ctx.store.put(&future).await.unwrap();

    let summary = ctx
        .scheduler
        .restore_scheduled_notifications("u1")
        .await
        .unwrap();
    assert_eq!(summary, RestoreSummary { fired: 1, rearmed: 1 });
    assert_eq!(ctx.sink.count().await, 1);
    assert_eq!(ctx.scheduler.armed_count().await, 1);
    // The fired schedule's mirror is gone, the re-armed one remains.
    assert_eq!(ctx.store.len().await, 1);

    advance(&ctx, ChronoDuration::minutes(16)).await;
    assert_eq!(ctx.sink.count().await, 2);
    assert_eq!(ctx.store.len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_still_arms_the_timer() {
    let sink = RecordingSink::new();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap());
    let scheduler = NotificationScheduler::new(
        Arc::new(TimerManager::new(TimerManagerConfig::default())),
        Arc::new(BrokenScheduleStore),
        sink.clone(),
        Arc::new(clock.clone()),
        EventBus::default(),
        SchedulerConfig::default(),
    );

    scheduler
        .schedule_notification(ScheduleOptions::review_due(
            "u1",
            "item_1",
            clock.now() + ChronoDuration::minutes(5),
        ))
        .await
        .unwrap();
    assert_eq!(scheduler.armed_count().await, 1);

    clock.advance(ChronoDuration::minutes(5));
    tokio::time::advance(StdDuration::from_secs(300)).await;
    settle().await;
    // Delivery happens even though both the put and the post-fire delete
    // failed.
    assert_eq!(sink.count().await, 1);
}
