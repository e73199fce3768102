//! When a cached changing revision must be re-checked
//!
//! Only changing (snapshot) revisions are subject to a policy; stable
//! revisions are served from cache unconditionally by the cache manager.

use crate::error::WharfError;
use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Staleness policy for cached changing revisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StalenessPolicy {
    /// Trust cached resolutions forever
    Never,
    /// Re-check on every lookup
    Always,
    /// Stale once more than the interval has elapsed
    Interval(Duration),
    /// Stale once the calendar day (in the given offset) has changed
    Daily(FixedOffset),
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::daily_utc()
    }
}

impl StalenessPolicy {
    /// Day-boundary policy evaluated in UTC
    pub fn daily_utc() -> Self {
        Self::Daily(utc_offset())
    }

    /// Fixed-interval policy from milliseconds
    pub fn interval_millis(millis: u64) -> Self {
        Self::Interval(Duration::from_millis(millis))
    }

    /// Whether a resolution made at `last_resolved_millis` (epoch ms) is stale now
    pub fn is_stale(&self, last_resolved_millis: i64) -> bool {
        self.is_stale_at(last_resolved_millis, Utc::now())
    }

    /// Whether a resolution made at `last_resolved_millis` is stale at `now`
    pub fn is_stale_at(&self, last_resolved_millis: i64, now: DateTime<Utc>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Interval(interval) => {
                let elapsed = i128::from(now.timestamp_millis()) - i128::from(last_resolved_millis);
                elapsed > interval.as_millis() as i128
            }
            Self::Daily(offset) => {
                let Some(last) = Utc.timestamp_millis_opt(last_resolved_millis).single() else {
                    return true;
                };
                let last = last.with_timezone(offset);
                let now = now.with_timezone(offset);
                last.year() != now.year() || last.ordinal() != now.ordinal()
            }
        }
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

fn parse_offset(text: &str) -> Option<FixedOffset> {
    if text.eq_ignore_ascii_case("utc") || text.eq_ignore_ascii_case("z") {
        return Some(utc_offset());
    }

    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn format_offset(offset: &FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    let sign = if seconds < 0 { '-' } else { '+' };
    let seconds = seconds.abs();
    format!("{}{:02}:{:02}", sign, seconds / 3600, (seconds % 3600) / 60)
}

impl fmt::Display for StalenessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Always => write!(f, "always"),
            Self::Interval(interval) => write!(f, "interval:{}", interval.as_millis()),
            Self::Daily(offset) if offset.local_minus_utc() == 0 => write!(f, "daily"),
            Self::Daily(offset) => write!(f, "daily:{}", format_offset(offset)),
        }
    }
}

impl FromStr for StalenessPolicy {
    type Err = WharfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| WharfError::InvalidSetting {
            setting: "snapshot_timeout",
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let text = s.trim();
        let (kind, argument) = match text.split_once(':') {
            Some((kind, argument)) => (kind, Some(argument.trim())),
            None => (text, None),
        };

        match (kind.to_ascii_lowercase().as_str(), argument) {
            ("never", None) => Ok(Self::Never),
            ("always", None) => Ok(Self::Always),
            ("daily", None) => Ok(Self::daily_utc()),
            ("daily", Some(offset)) => parse_offset(offset)
                .map(Self::Daily)
                .ok_or_else(|| invalid("expected an offset like +02:00 or utc")),
            ("interval", Some(millis)) => millis
                .parse::<u64>()
                .map(Self::interval_millis)
                .map_err(|_| invalid("expected interval:<milliseconds>")),
            _ => Err(invalid(
                "expected never, always, interval:<ms>, daily or daily:<offset>",
            )),
        }
    }
}

impl TryFrom<String> for StalenessPolicy {
    type Error = WharfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StalenessPolicy> for String {
    fn from(policy: StalenessPolicy) -> Self {
        policy.to_string()
    }
}
