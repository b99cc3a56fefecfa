//! Mnemo Core - Notification Orchestration Engine
//!
//! This crate provides the notification scheduling and delivery core for the
//! Mnemo spaced-repetition service, including:
//! - Orchestrator: Reacting to review-engine events and routing notifications
//! - Scheduler: Exact-time schedules with persistence and restore
//! - Timers: A capacity-capped async timer registry
//! - Queue: Deferred and daily-digest notification records
//! - Preferences: Cached, live-synced per-user settings
//! - Quiet hours: Timezone-aware delivery windows
//! - Rate limiter: Multi-scope limits with penalty escalation
//! - Breaker: Circuit breakers guarding flaky channel providers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod breaker;
pub mod channel;
pub mod clock;
pub mod content;
pub mod error;
pub mod event_bus;
pub mod orchestrator;
pub mod preferences;
pub mod queue;
pub mod quiet_hours;
pub mod rate_limiter;
pub mod scheduler;
pub mod store;
pub mod timers;
pub mod types;

pub use breaker::{
    fallback_fn, BreakerEvent, BreakerRegistry, BreakerStats, CircuitBreaker,
    CircuitBreakerConfig, CircuitState,
};
pub use channel::{ChannelSender, SendOutcome};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use content::{render, ContentContext, NotificationContent};
pub use error::{Error, Result};
pub use event_bus::{EventBus, NotificationEvent};
pub use orchestrator::{
    ChannelOutcome, DeliveryPipeline, DispatchReport, NotificationOrchestrator,
    OrchestratorConfig, ReviewEvent, ReviewScheduleParams, ScheduleDecision,
};
pub use preferences::{
    BatchingPrefs, ChannelToggles, NotificationPreferences, PreferenceManager,
    PreferenceManagerConfig, PreferencesPatch, TimingPrefs,
};
pub use queue::{
    NotificationQueue, NotificationQueueConfig, NotificationQueueItem, QueueStatus,
};
pub use quiet_hours::{QuietHours, QuietHoursConfig};
pub use rate_limiter::{
    RateLimitDecision, RateLimiter, RateLimiterConfig, ScopeConfig, ScopeKind,
};
pub use scheduler::{
    schedule_id, DeliveryRequest, NotificationScheduler, NotificationSink, RestoreSummary,
    ScheduleOptions, ScheduleStore, ScheduledNotification, SchedulerConfig, SqliteScheduleStore,
};
pub use store::{Document, DocumentStore, Filter, FilterOp, MemoryDocumentStore, Order};
pub use timers::{callback, TimerManager, TimerManagerConfig};
pub use types::{Channel, NotificationType, Priority};
