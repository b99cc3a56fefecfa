//! Gated, parallel channel dispatch
//!
//! The pipeline is the single send path for every notification, whether it
//! comes from the scheduler firing, a queue replay, or a direct call. It
//! applies the quiet-hours and rate-limit gates, then dispatches to every
//! resolved channel in parallel with per-channel failure isolation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::channel::ChannelSender;
use crate::clock::SharedClock;
use crate::error::Result;
use crate::event_bus::{EventBus, NotificationEvent};
use crate::preferences::{NotificationPreferences, PreferenceManager};
use crate::queue::NotificationQueue;
use crate::quiet_hours::QuietHours;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{DeliveryRequest, NotificationSink};
use crate::types::Channel;

use super::types::{ChannelOutcome, DispatchReport};

/// The send path: preference, quiet-hours, and rate-limit gates in front of
/// parallel per-channel dispatch.
pub struct DeliveryPipeline {
    prefs: Arc<PreferenceManager>,
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<NotificationQueue>,
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
    events: EventBus,
    clock: SharedClock,
}

impl DeliveryPipeline {
    /// Create a pipeline over a set of channel senders.
    pub fn new(
        prefs: Arc<PreferenceManager>,
        rate_limiter: Arc<RateLimiter>,
        queue: Arc<NotificationQueue>,
        senders: Vec<Arc<dyn ChannelSender>>,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        let senders = senders.into_iter().map(|s| (s.channel(), s)).collect();
        Self {
            prefs,
            rate_limiter,
            queue,
            senders,
            events,
            clock,
        }
    }

    /// Send a notification now, unless a gate defers it. Deferred sends are
    /// queued for the end of the quiet window (or the rate-limit retry time)
    /// rather than dropped.
    pub async fn send_notification(&self, request: DeliveryRequest) -> Result<DispatchReport> {
        let prefs = self.prefs.get_preferences(&request.user_id).await?;
        let channels = resolve_channels(&prefs, &request.channels);
        if channels.is_empty() {
            debug!(user_id = %request.user_id, "no enabled channel, dropping notification");
            return Ok(DispatchReport::default());
        }

        let quiet = QuietHours::new(prefs.quiet_hours.clone())?;
        let now = self.clock.now();
        if quiet.should_delay(now, request.content.priority) {
            let until = quiet.quiet_hours_end(now).unwrap_or(now);
            let window = batch_window(&prefs);
            for channel in &channels {
                self.queue
                    .add_to_queue(
                        &request.user_id,
                        request.kind,
                        *channel,
                        until,
                        item_ids_of(&request),
                        window,
                    )
                    .await?;
            }
            debug!(user_id = %request.user_id, %until, "quiet hours, deferred notification");
            self.events.publish(NotificationEvent::Deferred {
                user_id: request.user_id.clone(),
                until,
            });
            return Ok(DispatchReport {
                deferred_until: Some(until),
                ..DispatchReport::default()
            });
        }

        let dispatches = channels.iter().map(|channel| self.dispatch(&request, *channel));
        let outcomes = join_all(dispatches).await;

        let report = DispatchReport {
            outcomes,
            deferred_until: None,
        };
        let delivered = report.delivered_channels();
        if !delivered.is_empty() {
            self.events.publish(NotificationEvent::Delivered {
                user_id: request.user_id.clone(),
                notification_type: request.kind,
                channels: delivered,
            });
        }
        Ok(report)
    }

    /// One channel's gated send. Never returns an error; failures land in
    /// the outcome so sibling channels are unaffected.
    async fn dispatch(&self, request: &DeliveryRequest, channel: Channel) -> ChannelOutcome {
        let decision = self
            .rate_limiter
            .check_limit(&request.user_id, Some(channel), request.content.priority)
            .await;
        if !decision.allowed {
            self.events.publish(NotificationEvent::RateLimited {
                user_id: request.user_id.clone(),
                scope: decision.denied_key.clone().unwrap_or_default(),
                retry_after_secs: decision.retry_after_secs,
            });
            // Defer rather than drop: requeue for the retry time.
            let retry_at =
                self.clock.now() + ChronoDuration::seconds(decision.retry_after_secs as i64);
            if let Err(err) = self
                .queue
                .add_to_queue(
                    &request.user_id,
                    request.kind,
                    channel,
                    retry_at,
                    item_ids_of(request),
                    None,
                )
                .await
            {
                warn!(
                    user_id = %request.user_id,
                    %channel,
                    error = %err,
                    "failed to requeue rate-limited notification"
                );
            }
            return ChannelOutcome {
                channel,
                success: false,
                error: Some(format!(
                    "rate limited, retry in {}s",
                    decision.retry_after_secs
                )),
                provider_id: None,
            };
        }

        let Some(sender) = self.senders.get(&channel) else {
            warn!(%channel, "no sender registered for channel");
            return ChannelOutcome {
                channel,
                success: false,
                error: Some("no sender registered".to_string()),
                provider_id: None,
            };
        };

        match sender.send(&request.user_id, &request.content).await {
            Ok(outcome) => ChannelOutcome {
                channel,
                success: true,
                error: None,
                provider_id: outcome.provider_id,
            },
            Err(err) => {
                warn!(
                    user_id = %request.user_id,
                    %channel,
                    error = %err,
                    "channel send failed"
                );
                ChannelOutcome {
                    channel,
                    success: false,
                    error: Some(err.to_string()),
                    provider_id: None,
                }
            }
        }
    }
}

#[async_trait]
impl NotificationSink for DeliveryPipeline {
    async fn deliver(&self, request: DeliveryRequest) -> Result<()> {
        self.send_notification(request).await.map(|_| ())
    }
}

/// The user's enabled channels, intersected with an explicitly requested
/// subset when one is given. Order follows [`Channel::ALL`].
fn resolve_channels(prefs: &NotificationPreferences, requested: &[Channel]) -> Vec<Channel> {
    prefs
        .channels
        .enabled()
        .into_iter()
        .filter(|c| requested.is_empty() || requested.contains(c))
        .collect()
}

fn batch_window(prefs: &NotificationPreferences) -> Option<ChronoDuration> {
    prefs
        .batching
        .enabled
        .then(|| ChronoDuration::minutes(i64::from(prefs.batching.window_minutes)))
}

fn item_ids_of(request: &DeliveryRequest) -> Vec<String> {
    serde_json::from_value(request.content.metadata["item_ids"].clone()).unwrap_or_default()
}
