use super::*;
use crate::clock::{Clock, ManualClock};
use crate::store::MemoryDocumentStore;
use chrono::TimeZone;

fn setup() -> (Arc<MemoryDocumentStore>, ManualClock, NotificationQueue) {
    setup_with(NotificationQueueConfig::default())
}

fn setup_with(
    config: NotificationQueueConfig,
) -> (Arc<MemoryDocumentStore>, ManualClock, NotificationQueue) {
    let store = Arc::new(MemoryDocumentStore::new());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap());
    let queue = NotificationQueue::new(store.clone(), Arc::new(clock.clone()), config);
    (store, clock, queue)
}

fn window() -> Option<ChronoDuration> {
    Some(ChronoDuration::minutes(30))
}

#[tokio::test]
async fn test_nearby_review_notifications_merge() {
    let (_, clock, queue) = setup();
    let due = clock.now() + ChronoDuration::minutes(20);

    let first = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            due,
            vec!["item_a".to_string()],
            window(),
        )
        .await
        .unwrap();
    assert_eq!(first.payload.message, "1 item is ready for review.");

    let merged = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            due + ChronoDuration::minutes(10),
            vec!["item_b".to_string()],
            window(),
        )
        .await
        .unwrap();

    assert_eq!(merged.id, first.id);
    assert_eq!(merged.payload.item_ids.len(), 2);
    assert_eq!(merged.payload.review_count, 2);
    assert_eq!(merged.payload.message, "2 items are ready for review.");
}

#[tokio::test]
async fn test_records_outside_window_stay_separate() {
    let (_, clock, queue) = setup();
    let due = clock.now() + ChronoDuration::minutes(20);

    let first = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            due,
            vec!["item_a".to_string()],
            window(),
        )
        .await
        .unwrap();
    let second = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            due + ChronoDuration::minutes(45),
            vec!["item_b".to_string()],
            window(),
        )
        .await
        .unwrap();

    assert_ne!(first.id, second.id);

    // A different channel never merges either.
    let other_channel = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::Email,
            due,
            vec!["item_c".to_string()],
            window(),
        )
        .await
        .unwrap();
    assert_ne!(other_channel.id, first.id);

    // No window, no merging.
    let unbatched = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            due,
            vec!["item_d".to_string()],
            None,
        )
        .await
        .unwrap();
    assert_ne!(unbatched.id, first.id);
}

#[tokio::test]
async fn test_batch_cap_starts_a_new_record() {
    let (_, clock, queue) = setup_with(NotificationQueueConfig {
        max_batch_size: 2,
        ..NotificationQueueConfig::default()
    });
    let due = clock.now() + ChronoDuration::minutes(20);

    let first = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            due,
            vec!["a".to_string(), "b".to_string()],
            window(),
        )
        .await
        .unwrap();
    assert_eq!(first.payload.item_ids.len(), 2);

    let overflow = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            due,
            vec!["c".to_string()],
            window(),
        )
        .await
        .unwrap();
    assert_ne!(overflow.id, first.id);
    assert_eq!(overflow.payload.item_ids, vec!["c".to_string()]);
}

#[tokio::test]
async fn test_daily_batch_rolls_to_next_day_and_converges() {
    let (_, clock, queue) = setup();

    // 12:00 is past the 09:00 anchor; the digest lands tomorrow.
    let first = queue
        .add_to_daily("u1", Channel::Email, vec!["a".to_string()], chrono_tz::UTC)
        .await
        .unwrap();
    assert_eq!(
        first.scheduled_for,
        Utc.with_ymd_and_hms(2025, 6, 11, 9, 0, 0).unwrap()
    );
    assert_eq!(first.kind, NotificationType::DailySummary);
    assert_eq!(
        first.id,
        format!("daily_u1_{}", first.scheduled_for.timestamp())
    );

    // A concurrent addition for the same day merges by id.
    let second = queue
        .add_to_daily("u1", Channel::Email, vec!["b".to_string()], chrono_tz::UTC)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.payload.item_ids.len(), 2);

    // Before the anchor hour the digest stays on the same day.
    clock.set(Utc.with_ymd_and_hms(2025, 6, 12, 7, 0, 0).unwrap());
    let early = queue
        .add_to_daily("u1", Channel::Email, vec!["c".to_string()], chrono_tz::UTC)
        .await
        .unwrap();
    assert_eq!(
        early.scheduled_for,
        Utc.with_ymd_and_hms(2025, 6, 12, 9, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_daily_digest_cap_keeps_the_full_count() {
    let (_, _, queue) = setup_with(NotificationQueueConfig {
        max_batch_size: 3,
        ..NotificationQueueConfig::default()
    });

    queue
        .add_to_daily(
            "u1",
            Channel::Email,
            vec!["a".to_string(), "b".to_string()],
            chrono_tz::UTC,
        )
        .await
        .unwrap();
    let merged = queue
        .add_to_daily(
            "u1",
            Channel::Email,
            vec!["c".to_string(), "d".to_string(), "e".to_string()],
            chrono_tz::UTC,
        )
        .await
        .unwrap();

    // The stored id list honors the cap, but the digest still reports
    // everything that is due.
    assert_eq!(merged.payload.item_ids, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(merged.payload.review_count, 5);
    assert_eq!(merged.payload.message, "5 items are waiting for you today.");
}

#[tokio::test]
async fn test_daily_batch_uses_local_hour() {
    let (_, _, queue) = setup();

    // 12:00 UTC is 08:00 in New York: still before the anchor.
    let item = queue
        .add_to_daily(
            "u1",
            Channel::Email,
            vec!["a".to_string()],
            chrono_tz::America::New_York,
        )
        .await
        .unwrap();
    // 09:00 EDT = 13:00 UTC, same day.
    assert_eq!(
        item.scheduled_for,
        Utc.with_ymd_and_hms(2025, 6, 10, 13, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_pending_notifications_due_and_ordered() {
    let (_, clock, queue) = setup();
    let now = clock.now();

    for (minutes, id) in [(-10i64, "a"), (30, "b"), (-5, "c")] {
        queue
            .add_to_queue(
                "u1",
                NotificationType::ReviewDue,
                Channel::InApp,
                now + ChronoDuration::minutes(minutes),
                vec![id.to_string()],
                None,
            )
            .await
            .unwrap();
    }
    // Another user's records never leak in.
    queue
        .add_to_queue(
            "u2",
            NotificationType::ReviewDue,
            Channel::InApp,
            now - ChronoDuration::minutes(1),
            vec!["x".to_string()],
            None,
        )
        .await
        .unwrap();

    let pending = queue.pending_notifications("u1").await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].payload.item_ids, vec!["a".to_string()]);
    assert_eq!(pending[1].payload.item_ids, vec!["c".to_string()]);
}

#[tokio::test]
async fn test_mark_sent_and_failed_lifecycle() {
    let (_, clock, queue) = setup();
    let item = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            clock.now(),
            vec!["a".to_string()],
            None,
        )
        .await
        .unwrap();

    // Two failures keep it pending and retryable.
    queue.mark_failed(&item.id, "relay unreachable").await.unwrap();
    queue.mark_failed(&item.id, "relay unreachable").await.unwrap();
    let pending = queue.pending_notifications("u1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 2);

    // The third hits the cap and goes terminal.
    queue.mark_failed(&item.id, "relay unreachable").await.unwrap();
    assert!(queue.pending_notifications("u1").await.unwrap().is_empty());

    let sent = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            clock.now(),
            vec!["b".to_string()],
            None,
        )
        .await
        .unwrap();
    queue.mark_sent(&sent.id).await.unwrap();
    assert!(queue.pending_notifications("u1").await.unwrap().is_empty());

    let missing = queue.mark_sent("queue_nope").await;
    assert!(matches!(missing, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_sweep_deletes_old_terminal_records_only() {
    let (_, clock, queue) = setup();
    let sent = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            clock.now(),
            vec!["a".to_string()],
            None,
        )
        .await
        .unwrap();
    queue.mark_sent(&sent.id).await.unwrap();

    let still_pending = queue
        .add_to_queue(
            "u1",
            NotificationType::ReviewDue,
            Channel::InApp,
            clock.now() + ChronoDuration::days(30),
            vec!["b".to_string()],
            None,
        )
        .await
        .unwrap();

    // Inside retention nothing is touched.
    assert_eq!(queue.sweep_expired().await.unwrap(), 0);

    clock.advance(ChronoDuration::days(8));
    assert_eq!(queue.sweep_expired().await.unwrap(), 1);

    // The pending record survives regardless of age.
    clock.advance(ChronoDuration::days(30));
    let pending = queue.pending_notifications("u1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, still_pending.id);
}
