//! Timezone-aware quiet-hours windows
//!
//! A pure calculator over a per-user config: no stored state, no clock of
//! its own. Callers pass the instant they are deciding about; containment is
//! evaluated against the local wall time in the configured IANA timezone.
//!
//! Windows where `end <= start` (by wall-clock comparison) cross midnight:
//! `22:00`–`08:00` covers 22:00 through 07:59 of the next day. The start
//! boundary is inclusive, the end boundary exclusive.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Priority;

/// Per-user quiet-hours settings, as stored in preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QuietHoursConfig {
    /// Whether quiet hours apply at all
    pub enabled: bool,
    /// Window start, wall clock `HH:MM`
    pub start: String,
    /// Window end, wall clock `HH:MM`
    pub end: String,
    /// IANA timezone name, e.g. `America/New_York`
    pub timezone: String,
    /// Days the window applies to, 0 = Sunday. `None` means every day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<HashSet<u8>>,
    /// Dates the window is suspended for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exception_dates: Vec<NaiveDate>,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "22:00".to_string(),
            end: "08:00".to_string(),
            timezone: "UTC".to_string(),
            days_of_week: None,
            exception_dates: Vec::new(),
        }
    }
}

/// Validated quiet-hours calculator.
#[derive(Debug, Clone)]
pub struct QuietHours {
    config: QuietHoursConfig,
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
}

impl QuietHours {
    /// Validate a config and build the calculator. Malformed times, unknown
    /// timezones, and out-of-range day values fail fast.
    pub fn new(config: QuietHoursConfig) -> Result<Self> {
        let start = parse_wall_time("start", &config.start)?;
        let end = parse_wall_time("end", &config.end)?;
        let tz: Tz = config.timezone.parse().map_err(|_| Error::InvalidConfig {
            field: "timezone".to_string(),
            message: format!("unknown IANA timezone: {}", config.timezone),
        })?;
        if let Some(days) = &config.days_of_week {
            if let Some(bad) = days.iter().find(|d| **d > 6) {
                return Err(Error::InvalidConfig {
                    field: "days_of_week".to_string(),
                    message: format!("day value {bad} out of range 0-6"),
                });
            }
        }
        Ok(Self {
            config,
            start,
            end,
            tz,
        })
    }

    /// The config this calculator was built from.
    #[must_use]
    pub fn config(&self) -> &QuietHoursConfig {
        &self.config
    }

    fn crosses_midnight(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `at` falls inside the quiet window.
    #[must_use]
    pub fn is_in_quiet_hours(&self, at: DateTime<Utc>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let local = at.with_timezone(&self.tz);
        if self.config.exception_dates.contains(&local.date_naive()) {
            return false;
        }
        if let Some(days) = &self.config.days_of_week {
            let day = local.weekday().num_days_from_sunday() as u8;
            if !days.contains(&day) {
                return false;
            }
        }
        let time = local.time();
        if self.crosses_midnight() {
            time >= self.start || time < self.end
        } else {
            time >= self.start && time < self.end
        }
    }

    /// The instant the current quiet window ends, or `None` when `at` is not
    /// inside one.
    #[must_use]
    pub fn quiet_hours_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_in_quiet_hours(at) {
            return None;
        }
        let local = at.with_timezone(&self.tz);
        let end_date = if self.crosses_midnight() && local.time() >= self.start {
            // Still before midnight; the window ends tomorrow.
            local.date_naive() + ChronoDuration::days(1)
        } else {
            local.date_naive()
        };
        Some(resolve_local(&self.tz, end_date.and_time(self.end)))
    }

    /// Alias used by delivery gates: the earliest instant a deferred
    /// notification may go out.
    #[must_use]
    pub fn next_available_time(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.quiet_hours_end(at)
    }

    /// How long a notification at `at` must wait. Zero outside quiet hours.
    #[must_use]
    pub fn delay_until_allowed(&self, at: DateTime<Utc>) -> ChronoDuration {
        match self.quiet_hours_end(at) {
            Some(end) => (end - at).max(ChronoDuration::zero()),
            None => ChronoDuration::zero(),
        }
    }

    /// Whether delivery at `at` should be deferred. High priority bypasses
    /// quiet hours entirely.
    #[must_use]
    pub fn should_delay(&self, at: DateTime<Utc>, priority: Priority) -> bool {
        priority != Priority::High && self.is_in_quiet_hours(at)
    }
}

fn parse_wall_time(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| Error::InvalidConfig {
        field: field.to_string(),
        message: format!("expected HH:MM, got {value:?}"),
    })
}

/// Map a local wall time to UTC. Ambiguous times (DST fall-back) take the
/// earliest instant; nonexistent times (spring-forward gap) take the first
/// instant after the gap.
pub(crate) fn resolve_local(tz: &Tz, naive: chrono::NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(naive + ChronoDuration::hours(1)))
            .earliest()
            .map_or_else(|| Utc.from_utc_datetime(&naive), |dt| dt.with_timezone(&Utc)),
    }
}
