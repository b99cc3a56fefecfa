//! Notification orchestration
//!
//! The orchestrator reacts to review-engine events and decides how each
//! notification reaches the user: already-due items send immediately, items
//! due within the hour get an exact-time schedule, and everything further
//! out folds into the daily digest. Actual sending happens through the
//! [`DeliveryPipeline`], which the scheduler also reaches via the
//! [`crate::scheduler::NotificationSink`] seam.

mod pipeline;
mod types;

pub use pipeline::DeliveryPipeline;
pub use types::{
    ChannelOutcome, DispatchReport, ReviewEvent, ReviewScheduleParams, ScheduleDecision,
};

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::content::{self, ContentContext, NotificationContent};
use crate::error::Result;
use crate::event_bus::{EventBus, NotificationEvent};
use crate::preferences::PreferenceManager;
use crate::queue::{NotificationQueue, NotificationQueueItem};
use crate::scheduler::{DeliveryRequest, NotificationScheduler, ScheduleOptions};
use crate::types::NotificationType;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Items due within this window get an exact-time schedule instead of
    /// the daily digest
    pub immediate_window: ChronoDuration,
    /// Streak lengths at multiples of this emit a milestone notification
    pub streak_milestone: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            immediate_window: ChronoDuration::hours(1),
            streak_milestone: 10,
        }
    }
}

/// Top-level coordinator between the review engine and the delivery stack.
pub struct NotificationOrchestrator {
    prefs: Arc<PreferenceManager>,
    scheduler: Arc<NotificationScheduler>,
    queue: Arc<NotificationQueue>,
    pipeline: Arc<DeliveryPipeline>,
    events: EventBus,
    clock: SharedClock,
    config: OrchestratorConfig,
}

impl NotificationOrchestrator {
    /// Create an orchestrator. The pipeline passed here should be the same
    /// instance the scheduler was given as its sink.
    pub fn new(
        prefs: Arc<PreferenceManager>,
        scheduler: Arc<NotificationScheduler>,
        queue: Arc<NotificationQueue>,
        pipeline: Arc<DeliveryPipeline>,
        events: EventBus,
        clock: SharedClock,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            prefs,
            scheduler,
            queue,
            pipeline,
            events,
            clock,
            config,
        }
    }

    /// Consume review-engine events until the channel closes or `shutdown`
    /// fires.
    pub async fn run(&self, mut events: mpsc::Receiver<ReviewEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            warn!(error = %err, "failed to handle review event");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("orchestrator event loop stopped");
    }

    /// React to one review-engine event.
    pub async fn handle_event(&self, event: ReviewEvent) -> Result<()> {
        match event {
            ReviewEvent::ItemAnswered {
                user_id,
                item_id,
                next_due,
            } => {
                self.schedule_review_notification(ReviewScheduleParams {
                    user_id,
                    item_id,
                    due_at: next_due,
                })
                .await?;
            }
            ReviewEvent::SessionCompleted { user_id } => {
                self.replay_due_queue(&user_id).await?;
            }
            ReviewEvent::ProgressUpdated { user_id, streak } => {
                self.handle_progress(&user_id, streak).await?;
            }
        }
        Ok(())
    }

    /// Decide how a review notification for one item reaches the user.
    /// Any earlier schedule for the item is cancelled first, so answering an
    /// item always supersedes its previous reminder.
    pub async fn schedule_review_notification(
        &self,
        params: ReviewScheduleParams,
    ) -> Result<ScheduleDecision> {
        let prefs = self.prefs.get_preferences(&params.user_id).await?;
        let enabled = prefs.channels.enabled();
        if enabled.is_empty() {
            debug!(user_id = %params.user_id, "all channels disabled, skipping");
            return Ok(ScheduleDecision::Skipped);
        }

        self.scheduler
            .cancel_for_item(&params.user_id, &params.item_id)
            .await?;

        let delay = params.due_at - self.clock.now();
        if delay <= ChronoDuration::zero() {
            // The scheduler fires past-due schedules straight through the
            // pipeline.
            self.scheduler
                .schedule_notification(ScheduleOptions::review_due(
                    &params.user_id,
                    &params.item_id,
                    params.due_at,
                ))
                .await?;
            return Ok(ScheduleDecision::SentImmediately);
        }

        if delay < self.config.immediate_window && prefs.timing.immediate {
            let id = self
                .scheduler
                .schedule_notification(ScheduleOptions::review_due(
                    &params.user_id,
                    &params.item_id,
                    params.due_at,
                ))
                .await?;
            self.events.publish(NotificationEvent::CountdownStarted {
                user_id: params.user_id.clone(),
                item_id: params.item_id.clone(),
                due_at: params.due_at,
            });
            return Ok(ScheduleDecision::Scheduled(id));
        }

        if prefs.timing.daily {
            let tz: Tz = prefs.quiet_hours.timezone.parse().unwrap_or(chrono_tz::UTC);
            let channel = enabled[0];
            let record = self
                .queue
                .add_to_daily(&params.user_id, channel, vec![params.item_id.clone()], tz)
                .await?;
            return Ok(ScheduleDecision::DailyBatch(record.id));
        }

        debug!(user_id = %params.user_id, "no timing preference allows this notification");
        Ok(ScheduleDecision::Skipped)
    }

    /// Replay the user's due queue records through the pipeline. Runs after
    /// a session completes, when the user is demonstrably active. Skipped
    /// entirely during quiet hours so replays cannot re-defer themselves.
    pub async fn replay_due_queue(&self, user_id: &str) -> Result<usize> {
        if self.prefs.is_in_quiet_hours(user_id).await? {
            debug!(user_id, "quiet hours, leaving queue untouched");
            return Ok(0);
        }

        let pending = self.queue.pending_notifications(user_id).await?;
        let mut replayed = 0;
        for record in pending {
            match self.replay_record(&record).await {
                Ok(true) => replayed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(record = %record.id, error = %err, "queue replay failed");
                    self.queue.mark_failed(&record.id, &err.to_string()).await?;
                }
            }
        }
        if replayed > 0 {
            info!(user_id, replayed, "replayed due queue records");
        }
        Ok(replayed)
    }

    async fn replay_record(&self, record: &NotificationQueueItem) -> Result<bool> {
        let content = NotificationContent {
            title: record.payload.title.clone(),
            message: record.payload.message.clone(),
            action_url: record.payload.action_url.clone(),
            priority: record.payload.priority,
            metadata: record.payload.metadata.clone(),
        };
        let report = self
            .pipeline
            .send_notification(DeliveryRequest {
                user_id: record.user_id.clone(),
                kind: record.kind,
                content,
                channels: vec![record.channel],
            })
            .await?;

        if report.any_delivered() {
            self.queue.mark_sent(&record.id).await?;
            return Ok(true);
        }
        if report.deferred_until.is_some() {
            // The pipeline re-queued it; withdraw the old record.
            self.queue.cancel(&record.id).await?;
            return Ok(false);
        }
        if report.outcomes.is_empty() {
            // Channel no longer enabled.
            self.queue.cancel(&record.id).await?;
            return Ok(false);
        }
        let error = report
            .outcomes
            .iter()
            .find_map(|o| o.error.clone())
            .unwrap_or_else(|| "delivery failed".to_string());
        self.queue.mark_failed(&record.id, &error).await?;
        Ok(false)
    }

    async fn handle_progress(&self, user_id: &str, streak: u32) -> Result<()> {
        if streak == 0 || streak % self.config.streak_milestone != 0 {
            return Ok(());
        }
        self.events.publish(NotificationEvent::StreakMilestone {
            user_id: user_id.to_string(),
            streak,
        });

        let ctx = ContentContext {
            streak: Some(streak),
            achievement: Some(format!("You reached a {streak}-day streak!")),
            ..ContentContext::default()
        };
        let content = content::render(NotificationType::Achievement, &ctx);
        self.pipeline
            .send_notification(DeliveryRequest {
                user_id: user_id.to_string(),
                kind: NotificationType::Achievement,
                content,
                channels: Vec::new(),
            })
            .await?;
        Ok(())
    }
}
