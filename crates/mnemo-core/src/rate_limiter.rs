//! Sliding-window rate limiting with penalty backoff
//!
//! Three scopes are evaluated in order for every check: burst protection
//! (short window, low count), per-user, and per-channel-per-user. The first
//! scope that denies short-circuits the whole check. Repeat violations
//! escalate a penalty window exponentially; the first allowed request after
//! a violation streak clears the penalty state.
//!
//! A denial is a normal structured outcome, not an error: callers defer and
//! retry after `retry_after_secs`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::types::{Channel, Priority};

/// Limits for one scope.
#[derive(Debug, Clone, Copy)]
pub struct ScopeConfig {
    /// Maximum requests allowed in the window
    pub max_requests: u32,
    /// Trailing window length
    pub window: Duration,
}

impl ScopeConfig {
    /// Create a scope config.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Which scope a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Short-window burst protection
    Burst,
    /// Per-user budget
    User,
    /// Per-channel-per-user budget
    Channel,
}

impl ScopeKind {
    /// Stable name used in scope keys and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Burst => "burst",
            ScopeKind::User => "user",
            ScopeKind::Channel => "channel",
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Burst scope limits
    pub burst: ScopeConfig,
    /// Per-user scope limits
    pub per_user: ScopeConfig,
    /// Per-channel-per-user scope limits
    pub per_channel: ScopeConfig,
    /// Penalty growth factor per repeat violation
    pub penalty_multiplier: f64,
    /// Cap on the escalated penalty window
    pub max_penalty: Duration,
    /// Scopes that high-priority requests skip entirely
    pub high_priority_bypass: HashSet<ScopeKind>,
    /// Entries with no activity for this long are pruned by `cleanup`
    pub idle_expiry: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst: ScopeConfig::new(3, Duration::from_secs(10)),
            per_user: ScopeConfig::new(10, Duration::from_secs(60)),
            per_channel: ScopeConfig::new(5, Duration::from_secs(60)),
            penalty_multiplier: 2.0,
            max_penalty: Duration::from_secs(3600),
            high_priority_bypass: HashSet::from([ScopeKind::Burst]),
            idle_expiry: Duration::from_secs(24 * 3600),
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request is allowed
    pub allowed: bool,
    /// The scope that denied (None when allowed)
    pub denied_by: Option<ScopeKind>,
    /// Scope key that denied, e.g. `channel:email:u1`
    pub denied_key: Option<String>,
    /// Remaining requests in the tightest evaluated scope
    pub remaining: u32,
    /// Time until the deciding window resets
    pub reset_after: Duration,
    /// Seconds a caller should wait before retrying (0 when allowed)
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    fn allowed(remaining: u32, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            denied_by: None,
            denied_key: None,
            remaining,
            reset_after,
            retry_after_secs: 0,
        }
    }

    fn denied(scope: ScopeKind, key: String, reset_after: Duration) -> Self {
        Self {
            allowed: false,
            denied_by: Some(scope),
            denied_key: Some(key),
            remaining: 0,
            reset_after,
            retry_after_secs: reset_after.as_secs_f64().ceil() as u64,
        }
    }
}

#[derive(Debug)]
struct ScopeEntry {
    timestamps: Vec<Instant>,
    violations: u32,
    penalty_until: Option<Instant>,
    last_activity: Instant,
}

impl ScopeEntry {
    fn new(now: Instant) -> Self {
        Self {
            timestamps: Vec::new(),
            violations: 0,
            penalty_until: None,
            last_activity: now,
        }
    }
}

/// Sliding-window rate limiter keyed by composite scope strings.
pub struct RateLimiter {
    config: RateLimiterConfig,
    entries: Arc<RwLock<HashMap<String, ScopeEntry>>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Check whether a notification for `user_id` (optionally on `channel`)
    /// may go out now. A full allow records one request in every evaluated
    /// scope; a denial records nothing except the violation.
    pub async fn check_limit(
        &self,
        user_id: &str,
        channel: Option<Channel>,
        priority: Priority,
    ) -> RateLimitDecision {
        let now = Instant::now();
        let scopes = self.applicable_scopes(user_id, channel, priority);

        let mut entries = self.entries.write().await;
        let mut tightest_remaining = u32::MAX;
        let mut tightest_reset = Duration::ZERO;

        // First pass: deny on the first exhausted scope.
        for (kind, key, scope) in &scopes {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| ScopeEntry::new(now));
            entry.last_activity = now;

            if let Some(until) = entry.penalty_until {
                if now < until {
                    let reset = until - now;
                    warn!(key = %key, retry_in = ?reset, "request denied by active penalty");
                    return RateLimitDecision::denied(*kind, key.clone(), reset);
                }
            }

            entry
                .timestamps
                .retain(|t| now.duration_since(*t) < scope.window);

            let count = entry.timestamps.len() as u32;
            if count >= scope.max_requests {
                entry.violations += 1;
                let penalty = penalty_window(scope.window, self.config.penalty_multiplier,
                    entry.violations, self.config.max_penalty);
                entry.penalty_until = Some(now + penalty);
                let window_reset = entry
                    .timestamps
                    .first()
                    .map(|oldest| scope.window.saturating_sub(now.duration_since(*oldest)))
                    .unwrap_or(Duration::ZERO);
                let reset = penalty.max(window_reset);
                warn!(
                    key = %key,
                    violations = entry.violations,
                    retry_in = ?reset,
                    "rate limit exceeded"
                );
                return RateLimitDecision::denied(*kind, key.clone(), reset);
            }

            let remaining = scope.max_requests - count - 1;
            if remaining < tightest_remaining {
                tightest_remaining = remaining;
                tightest_reset = entry
                    .timestamps
                    .first()
                    .map(|oldest| scope.window.saturating_sub(now.duration_since(*oldest)))
                    .unwrap_or(scope.window);
            }
        }

        // Second pass: all scopes allowed, record the request.
        for (_, key, _) in &scopes {
            if let Some(entry) = entries.get_mut(key) {
                entry.timestamps.push(now);
                if entry.violations > 0 {
                    debug!(key = %key, "clearing violation state after allowed request");
                    entry.violations = 0;
                    entry.penalty_until = None;
                }
            }
        }

        if tightest_remaining == u32::MAX {
            // Every scope was bypassed.
            tightest_remaining = 0;
        }
        RateLimitDecision::allowed(tightest_remaining, tightest_reset)
    }

    /// Record a request that succeeded through another code path, without
    /// running the full check.
    pub async fn record_request(&self, user_id: &str, channel: Option<Channel>) {
        let now = Instant::now();
        let scopes = self.applicable_scopes(user_id, channel, Priority::Normal);
        let mut entries = self.entries.write().await;
        for (_, key, scope) in &scopes {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| ScopeEntry::new(now));
            entry.last_activity = now;
            entry
                .timestamps
                .retain(|t| now.duration_since(*t) < scope.window);
            entry.timestamps.push(now);
        }
    }

    /// Remove scope entries with no activity within the idle expiry.
    /// Returns the number of entries removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_expiry;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_activity) < idle);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "pruned idle rate-limit entries");
        }
        removed
    }

    /// Number of tracked scope entries.
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    fn applicable_scopes(
        &self,
        user_id: &str,
        channel: Option<Channel>,
        priority: Priority,
    ) -> Vec<(ScopeKind, String, ScopeConfig)> {
        let bypass = |kind: &ScopeKind| {
            priority == Priority::High && self.config.high_priority_bypass.contains(kind)
        };

        let mut scopes = Vec::with_capacity(3);
        if !bypass(&ScopeKind::Burst) {
            scopes.push((
                ScopeKind::Burst,
                format!("burst:{user_id}"),
                self.config.burst,
            ));
        }
        if !bypass(&ScopeKind::User) {
            scopes.push((
                ScopeKind::User,
                format!("user:{user_id}"),
                self.config.per_user,
            ));
        }
        if let Some(channel) = channel {
            if !bypass(&ScopeKind::Channel) {
                scopes.push((
                    ScopeKind::Channel,
                    format!("channel:{channel}:{user_id}"),
                    self.config.per_channel,
                ));
            }
        }
        scopes
    }
}

fn penalty_window(
    window: Duration,
    multiplier: f64,
    violations: u32,
    max_penalty: Duration,
) -> Duration {
    let factor = multiplier.powi(violations.saturating_sub(1) as i32);
    let penalty = window.mul_f64(factor.max(1.0));
    penalty.min(max_penalty)
}
