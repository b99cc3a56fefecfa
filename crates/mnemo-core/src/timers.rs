//! Bounded timer registry
//!
//! Owns delayed and repeating callbacks for the notification core. Timers
//! are keyed by id with last-write-wins re-registration, a hard cap on the
//! active count, per-callback error isolation, pause/resume for coordinated
//! shutdown, and a periodic sweep that purges one-shot entries that should
//! have fired but never did.
//!
//! Deadlines are `tokio::time::Instant`s, so tests drive firing with
//! `#[tokio::test(start_paused = true)]` and `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Async callback run when a timer fires.
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a closure returning a future into a [`TimerCallback`].
pub fn callback<F, Fut>(f: F) -> TimerCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// One-shot or repeating timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then the entry is removed
    OneShot,
    /// Fires every `delay` until cleared
    Repeating,
}

/// Timer manager configuration.
#[derive(Debug, Clone)]
pub struct TimerManagerConfig {
    /// Hard cap on concurrently registered timers
    pub max_timers: usize,
    /// How often the stuck-entry sweep runs
    pub sweep_interval: Duration,
    /// How far past its deadline a one-shot may be before the sweep
    /// treats it as stuck
    pub stuck_tolerance: Duration,
}

impl Default for TimerManagerConfig {
    fn default() -> Self {
        Self {
            max_timers: 1000,
            sweep_interval: Duration::from_secs(30),
            stuck_tolerance: Duration::from_secs(60),
        }
    }
}

struct TimerEntry {
    kind: TimerKind,
    callback: TimerCallback,
    delay: Duration,
    /// Next fire time. Preserved across pause/resume so a resumed timer
    /// keeps its original schedule.
    deadline: Instant,
    metadata: Value,
    /// Guards against a stale fire task removing a re-registered entry.
    epoch: u64,
    /// None while paused.
    task: Option<JoinHandle<()>>,
}

struct Inner {
    timers: RwLock<HashMap<String, TimerEntry>>,
    config: TimerManagerConfig,
    next_epoch: AtomicU64,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
}

/// Bounded registry of delayed and repeating callbacks.
pub struct TimerManager {
    inner: Arc<Inner>,
}

impl TimerManager {
    /// Create a manager and start its background sweep.
    #[must_use]
    pub fn new(config: TimerManagerConfig) -> Self {
        let inner = Arc::new(Inner {
            timers: RwLock::new(HashMap::new()),
            config,
            next_epoch: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let sweep = Arc::downgrade(&inner);
        let token = inner.shutdown.clone();
        let interval = inner.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(inner) = sweep.upgrade() else { break };
                        sweep_stuck(&inner).await;
                    }
                    _ = token.cancelled() => break,
                }
            }
        });

        Self { inner }
    }

    /// Create a manager with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(TimerManagerConfig::default())
    }

    /// Register a one-shot timer.
    ///
    /// A supplied `id` replaces any existing timer under the same id
    /// (last-write-wins). Returns the timer id.
    pub async fn set_timeout(
        &self,
        callback: TimerCallback,
        delay: Duration,
        id: Option<String>,
        metadata: Value,
    ) -> Result<String> {
        self.register(TimerKind::OneShot, callback, delay, id, metadata)
            .await
    }

    /// Register a repeating timer firing every `period`.
    pub async fn set_interval(
        &self,
        callback: TimerCallback,
        period: Duration,
        id: Option<String>,
        metadata: Value,
    ) -> Result<String> {
        self.register(TimerKind::Repeating, callback, period, id, metadata)
            .await
    }

    async fn register(
        &self,
        kind: TimerKind,
        callback: TimerCallback,
        delay: Duration,
        id: Option<String>,
        metadata: Value,
    ) -> Result<String> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::TimerManagerDestroyed);
        }

        let id = id.unwrap_or_else(|| {
            let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            format!("timer_{n}")
        });

        let mut timers = self.inner.timers.write().await;

        // Re-registering an id cancels the prior timer first.
        if let Some(previous) = timers.remove(&id) {
            if let Some(task) = previous.task {
                task.abort();
            }
            debug!(id = %id, "replacing existing timer");
        }

        if timers.len() >= self.inner.config.max_timers {
            return Err(Error::TimerCapacity {
                active: timers.len(),
                limit: self.inner.config.max_timers,
            });
        }

        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + delay;
        let task = spawn_fire_task(
            Arc::downgrade(&self.inner),
            id.clone(),
            epoch,
            kind,
            deadline,
            delay,
            callback.clone(),
        );

        timers.insert(
            id.clone(),
            TimerEntry {
                kind,
                callback,
                delay,
                deadline,
                metadata,
                epoch,
                task: Some(task),
            },
        );

        Ok(id)
    }

    /// Cancel a timer. Idempotent; returns whether a timer was removed.
    pub async fn clear_timer(&self, id: &str) -> bool {
        let mut timers = self.inner.timers.write().await;
        match timers.remove(id) {
            Some(entry) => {
                if let Some(task) = entry.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Cancel every timer whose metadata matches the predicate.
    /// Returns the number of timers cleared.
    pub async fn clear_by_metadata<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Value) -> bool,
    {
        let mut timers = self.inner.timers.write().await;
        let matching: Vec<String> = timers
            .iter()
            .filter(|(_, entry)| predicate(&entry.metadata))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &matching {
            if let Some(entry) = timers.remove(id) {
                if let Some(task) = entry.task {
                    task.abort();
                }
            }
        }
        matching.len()
    }

    /// Re-arm a one-shot timer with a new delay, keeping its id, callback,
    /// and metadata. Returns false if the timer does not exist or is
    /// repeating.
    pub async fn reschedule(&self, id: &str, new_delay: Duration) -> Result<bool> {
        let (callback, metadata) = {
            let timers = self.inner.timers.read().await;
            match timers.get(id) {
                Some(entry) if entry.kind == TimerKind::OneShot => {
                    (entry.callback.clone(), entry.metadata.clone())
                }
                _ => return Ok(false),
            }
        };
        self.register(
            TimerKind::OneShot,
            callback,
            new_delay,
            Some(id.to_string()),
            metadata,
        )
        .await?;
        Ok(true)
    }

    /// Suspend every live timer, cancelling the underlying tasks but
    /// keeping the entries and their deadlines. Returns the number paused.
    pub async fn pause_all(&self) -> usize {
        let mut timers = self.inner.timers.write().await;
        let mut paused = 0;
        for entry in timers.values_mut() {
            if let Some(task) = entry.task.take() {
                task.abort();
                paused += 1;
            }
        }
        debug!(paused, "timers paused");
        paused
    }

    /// Re-arm every paused timer with its remaining delay recomputed from
    /// the original deadline. Timers whose deadline has already passed fire
    /// immediately. Returns the number resumed.
    pub async fn resume_all(&self) -> usize {
        let mut timers = self.inner.timers.write().await;
        let mut resumed = 0;
        for (id, entry) in timers.iter_mut() {
            if entry.task.is_some() {
                continue;
            }
            entry.task = Some(spawn_fire_task(
                Arc::downgrade(&self.inner),
                id.clone(),
                entry.epoch,
                entry.kind,
                entry.deadline,
                entry.delay,
                entry.callback.clone(),
            ));
            resumed += 1;
        }
        debug!(resumed, "timers resumed");
        resumed
    }

    /// Number of registered timers (paused timers included).
    pub async fn active_count(&self) -> usize {
        self.inner.timers.read().await.len()
    }

    /// Whether a timer with this id is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.timers.read().await.contains_key(id)
    }

    /// Cancel everything and reject further scheduling.
    pub async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        let mut timers = self.inner.timers.write().await;
        for (_, entry) in timers.drain() {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }
}

impl Clone for TimerManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_fire_task(
    inner: Weak<Inner>,
    id: String,
    epoch: u64,
    kind: TimerKind,
    deadline: Instant,
    period: Duration,
    callback: TimerCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next = deadline;
        loop {
            tokio::time::sleep_until(next).await;

            // One bad timer must not prevent others from firing.
            if let Err(e) = callback().await {
                error!(id = %id, error = %e, "timer callback failed");
            }

            let Some(inner) = inner.upgrade() else { return };
            let mut timers = inner.timers.write().await;
            match kind {
                TimerKind::OneShot => {
                    if timers.get(&id).is_some_and(|e| e.epoch == epoch) {
                        timers.remove(&id);
                    }
                    return;
                }
                TimerKind::Repeating => {
                    next += period;
                    match timers.get_mut(&id) {
                        Some(entry) if entry.epoch == epoch => entry.deadline = next,
                        // Cleared or replaced while we were running.
                        _ => return,
                    }
                }
            }
        }
    })
}

/// Purge one-shot entries whose deadline passed by more than the tolerance
/// without the fire task removing them. A safety net against platform timer
/// anomalies; paused timers are left alone.
async fn sweep_stuck(inner: &Arc<Inner>) {
    let now = Instant::now();
    let tolerance = inner.config.stuck_tolerance;
    let mut timers = inner.timers.write().await;
    let stuck: Vec<String> = timers
        .iter()
        .filter(|(_, entry)| {
            entry.kind == TimerKind::OneShot
                && entry.task.is_some()
                && now.saturating_duration_since(entry.deadline) > tolerance
        })
        .map(|(id, _)| id.clone())
        .collect();

    for id in stuck {
        if let Some(entry) = timers.remove(&id) {
            if let Some(task) = entry.task {
                task.abort();
            }
            warn!(id = %id, "purged stuck one-shot timer");
        }
    }
}
