//! Per-user notification preferences
//!
//! Preferences live in the document store under one document per user. The
//! manager writes defaults on first access, keeps an in-memory cache current
//! through the store's live-update feed, and falls back to a TTL on the
//! cached value when the feed is not running. Updates merge a partial patch
//! over the current record and persist before the cache is touched, so a
//! failed write never leaves the cache ahead of the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::quiet_hours::{QuietHours, QuietHoursConfig};
use crate::store::DocumentStore;
use crate::types::Channel;

const COLLECTION: &str = "notification_preferences";

/// Which delivery channels a user has enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChannelToggles {
    /// Native browser notifications
    pub browser: bool,
    /// In-app feed
    pub in_app: bool,
    /// Mobile/web push
    pub push: bool,
    /// Email
    pub email: bool,
}

impl Default for ChannelToggles {
    fn default() -> Self {
        Self {
            browser: true,
            in_app: true,
            push: false,
            email: false,
        }
    }
}

impl ChannelToggles {
    /// Whether one channel is on.
    #[must_use]
    pub fn is_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Browser => self.browser,
            Channel::InApp => self.in_app,
            Channel::Push => self.push,
            Channel::Email => self.email,
        }
    }

    /// All enabled channels, in dispatch order.
    #[must_use]
    pub fn enabled(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }
}

/// When a user wants to hear about due reviews.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimingPrefs {
    /// Exact-time notifications for reviews due within the hour
    pub immediate: bool,
    /// Daily digest for reviews further out
    pub daily: bool,
    /// Overdue nudges
    pub overdue: bool,
}

impl Default for TimingPrefs {
    fn default() -> Self {
        Self {
            immediate: true,
            daily: true,
            overdue: true,
        }
    }
}

/// Batching behavior for near-simultaneous notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BatchingPrefs {
    /// Whether nearby notifications merge into one
    pub enabled: bool,
    /// Merge radius in minutes
    pub window_minutes: u32,
}

impl Default for BatchingPrefs {
    fn default() -> Self {
        Self {
            enabled: true,
            window_minutes: 30,
        }
    }
}

/// The full per-user preference record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct NotificationPreferences {
    /// Channel on/off switches
    #[serde(default)]
    pub channels: ChannelToggles,
    /// Timing flags
    #[serde(default)]
    pub timing: TimingPrefs,
    /// Quiet-hours window
    #[serde(default)]
    pub quiet_hours: QuietHoursConfig,
    /// Batching settings
    #[serde(default)]
    pub batching: BatchingPrefs,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreferences {
    fn defaults_at(now: DateTime<Utc>) -> Self {
        Self {
            channels: ChannelToggles::default(),
            timing: TimingPrefs::default(),
            quiet_hours: QuietHoursConfig::default(),
            batching: BatchingPrefs::default(),
            updated_at: now,
        }
    }
}

/// Partial update applied over the current record. `None` sections are left
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PreferencesPatch {
    /// Replace the channel toggles
    pub channels: Option<ChannelToggles>,
    /// Replace the timing flags
    pub timing: Option<TimingPrefs>,
    /// Replace the quiet-hours window
    pub quiet_hours: Option<QuietHoursConfig>,
    /// Replace the batching settings
    pub batching: Option<BatchingPrefs>,
}

struct CacheEntry {
    prefs: NotificationPreferences,
    fetched_at: Instant,
    live: bool,
}

/// Preference manager configuration.
#[derive(Debug, Clone)]
pub struct PreferenceManagerConfig {
    /// How long a cached record stays valid without the live feed
    pub cache_ttl: Duration,
}

impl Default for PreferenceManagerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Cached, live-synced access to per-user notification preferences.
pub struct PreferenceManager {
    store: Arc<dyn DocumentStore>,
    clock: SharedClock,
    config: PreferenceManagerConfig,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    subscriptions: Arc<RwLock<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl PreferenceManager {
    /// Create a manager over a document store.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: SharedClock,
        config: PreferenceManagerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Load a user's preferences, writing defaults if the user has none yet.
    pub async fn get_preferences(&self, user_id: &str) -> Result<NotificationPreferences> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(user_id) {
                if entry.live || entry.fetched_at.elapsed() < self.config.cache_ttl {
                    return Ok(entry.prefs.clone());
                }
            }
        }

        let prefs = match self.store.get(COLLECTION, user_id).await? {
            Some(value) => serde_json::from_value(value)?,
            None => {
                let defaults = NotificationPreferences::defaults_at(self.clock.now());
                info!(user_id, "writing default notification preferences");
                self.store
                    .set(COLLECTION, user_id, serde_json::to_value(&defaults)?, false)
                    .await?;
                defaults
            }
        };

        let live = self.ensure_subscription(user_id).await;
        self.cache.write().await.insert(
            user_id.to_string(),
            CacheEntry {
                prefs: prefs.clone(),
                fetched_at: Instant::now(),
                live,
            },
        );
        Ok(prefs)
    }

    /// Merge a patch over the current record, persist, and refresh the
    /// cache. The cache is only updated after the write succeeds.
    pub async fn update_preferences(
        &self,
        user_id: &str,
        patch: PreferencesPatch,
    ) -> Result<NotificationPreferences> {
        // Reject malformed quiet-hours settings before anything persists.
        if let Some(quiet) = &patch.quiet_hours {
            QuietHours::new(quiet.clone())?;
        }

        let mut prefs = self.get_preferences(user_id).await?;
        if let Some(channels) = patch.channels {
            prefs.channels = channels;
        }
        if let Some(timing) = patch.timing {
            prefs.timing = timing;
        }
        if let Some(quiet_hours) = patch.quiet_hours {
            prefs.quiet_hours = quiet_hours;
        }
        if let Some(batching) = patch.batching {
            prefs.batching = batching;
        }
        prefs.updated_at = self.clock.now();

        self.store
            .set(COLLECTION, user_id, serde_json::to_value(&prefs)?, false)
            .await?;

        let mut cache = self.cache.write().await;
        let live = cache.get(user_id).is_some_and(|e| e.live);
        cache.insert(
            user_id.to_string(),
            CacheEntry {
                prefs: prefs.clone(),
                fetched_at: Instant::now(),
                live,
            },
        );
        debug!(user_id, "preferences updated");
        Ok(prefs)
    }

    /// Whether one channel is enabled for a user.
    pub async fn is_channel_enabled(&self, user_id: &str, channel: Channel) -> Result<bool> {
        Ok(self.get_preferences(user_id).await?.channels.is_enabled(channel))
    }

    /// All channels a user has enabled, in dispatch order.
    pub async fn enabled_channels(&self, user_id: &str) -> Result<Vec<Channel>> {
        Ok(self.get_preferences(user_id).await?.channels.enabled())
    }

    /// Whether the user is currently inside their quiet-hours window.
    pub async fn is_in_quiet_hours(&self, user_id: &str) -> Result<bool> {
        let prefs = self.get_preferences(user_id).await?;
        let quiet = QuietHours::new(prefs.quiet_hours)?;
        Ok(quiet.is_in_quiet_hours(self.clock.now()))
    }

    /// When the user's current quiet-hours window ends, if they are in one.
    pub async fn quiet_hours_end(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let prefs = self.get_preferences(user_id).await?;
        let quiet = QuietHours::new(prefs.quiet_hours)?;
        Ok(quiet.quiet_hours_end(self.clock.now()))
    }

    /// Stop all live-update subscription tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.subscriptions.write().await.clear();
    }

    /// Start the live feed for a user if it is not already running. Returns
    /// whether a feed is active.
    async fn ensure_subscription(&self, user_id: &str) -> bool {
        {
            let subs = self.subscriptions.read().await;
            if subs.contains_key(user_id) {
                return true;
            }
        }

        let mut rx = match self.store.subscribe(COLLECTION, user_id).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(user_id, error = %err, "preference feed unavailable, relying on cache TTL");
                return false;
            }
        };

        let token = self.shutdown.child_token();
        self.subscriptions
            .write()
            .await
            .insert(user_id.to_string(), token.clone());

        let cache = self.cache.clone();
        let subscriptions = self.subscriptions.clone();
        let user = user_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    value = rx.recv() => match value {
                        Some(value) => match serde_json::from_value::<NotificationPreferences>(value) {
                            Ok(prefs) => {
                                let mut cache = cache.write().await;
                                cache.insert(
                                    user.clone(),
                                    CacheEntry {
                                        prefs,
                                        fetched_at: Instant::now(),
                                        live: true,
                                    },
                                );
                                debug!(user_id = %user, "preferences refreshed from live feed");
                            }
                            Err(err) => {
                                warn!(user_id = %user, error = %err, "ignoring malformed preference update");
                            }
                        },
                        None => break,
                    },
                }
            }
            // Feed gone (closed or cancelled); drop the live flag so reads
            // fall back to the TTL, and let a later read restart the
            // subscription.
            if let Some(entry) = cache.write().await.get_mut(&user) {
                entry.live = false;
            }
            subscriptions.write().await.remove(&user);
        });
        true
    }
}
