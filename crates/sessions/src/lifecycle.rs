//! Session reset lifecycle — daily + idle, with per-type and per-channel
//! overrides.
//!
//! Reset is evaluated on every inbound arrival.  Each applicable policy
//! yields an expiry instant; the earliest one that has passed wins.  When
//! a session is stale the store mints a new session ID for the same key
//! and the transcript rotates to the new ID's file.

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;

use sb_domain::config::{LifecycleConfig, ResetOverride};

use crate::store::SessionEntry;

/// Reason a session was reset, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    DailyReset { hour: u8 },
    IdleTimeout { idle_minutes: u32 },
    Explicit,
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyReset { hour } => write!(f, "daily reset (hour={hour})"),
            Self::IdleTimeout { idle_minutes } => {
                write!(f, "idle timeout ({idle_minutes}m)")
            }
            Self::Explicit => write!(f, "explicit reset"),
        }
    }
}

/// Evaluates whether a session should be reset.
pub struct LifecycleManager {
    config: LifecycleConfig,
    tz: Tz,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        let tz = config
            .timezone
            .as_deref()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::UTC);
        Self { config, tz }
    }

    /// Evaluate whether the session should reset given the current time,
    /// the inbound channel, and chat type (`dm`, `group`, `thread`).
    /// Returns the earliest applicable expiry's reason.
    pub fn should_reset(
        &self,
        entry: &SessionEntry,
        channel: &str,
        chat_type: &str,
        now: DateTime<Utc>,
    ) -> Option<ResetReason> {
        let (daily_hour, idle_mins) = self.resolve_params(channel, chat_type);

        let mut earliest: Option<(DateTime<Utc>, ResetReason)> = None;

        if let Some(hour) = daily_hour {
            if let Some(expiry) = next_daily_boundary(entry.updated_at, hour, self.tz) {
                if now >= expiry {
                    earliest = Some((expiry, ResetReason::DailyReset { hour }));
                }
            }
        }

        // Threads are exempt from idle expiry by default so thread replies
        // stay coherent.
        let idle_applies = chat_type != "thread" || !self.config.thread_idle_exempt;
        if idle_applies {
            if let Some(idle) = idle_mins {
                let expiry = entry.updated_at + Duration::minutes(idle as i64);
                if now >= expiry {
                    let candidate = (expiry, ResetReason::IdleTimeout { idle_minutes: idle });
                    earliest = match earliest {
                        Some(prev) if prev.0 <= candidate.0 => Some(prev),
                        _ => Some(candidate),
                    };
                }
            }
        }

        earliest.map(|(_, reason)| reason)
    }

    /// Resolve the effective (daily_reset_hour, idle_minutes), applying
    /// per-channel → per-type → global fallback.
    fn resolve_params(&self, channel: &str, chat_type: &str) -> (Option<u8>, Option<u32>) {
        let mut daily = self.config.daily_reset_hour;
        let mut idle = self.config.idle_minutes;

        let apply = |daily: &mut Option<u8>, idle: &mut Option<u32>, ovr: &ResetOverride| {
            if ovr.daily_reset_hour.is_some() {
                *daily = ovr.daily_reset_hour;
            }
            if ovr.idle_minutes.is_some() {
                *idle = ovr.idle_minutes;
            }
        };

        if let Some(ovr) = self.config.reset_by_type.get(chat_type) {
            apply(&mut daily, &mut idle, ovr);
        }

        // Per-channel override takes precedence.
        if let Some(ovr) = self.config.reset_by_channel.get(channel) {
            apply(&mut daily, &mut idle, ovr);
        }

        (daily, idle)
    }
}

/// The first boundary at `hour:00` (in `tz`) strictly after `last_active`.
/// Resolving via the naive local date handles DST transitions in the
/// configured zone.
fn next_daily_boundary(last_active: DateTime<Utc>, hour: u8, tz: Tz) -> Option<DateTime<Utc>> {
    if hour >= 24 {
        return None;
    }

    let local = last_active.with_timezone(&tz);
    let boundary_on = |date: chrono::NaiveDate| {
        date.and_hms_opt(hour as u32, 0, 0)
            .and_then(|naive| tz.from_local_datetime(&naive).single())
    };

    let same_day = boundary_on(local.date_naive())?;
    let boundary = if same_day > local {
        same_day
    } else {
        boundary_on(local.date_naive() + Duration::days(1))?
    };

    Some(boundary.with_timezone(&Utc))
}
