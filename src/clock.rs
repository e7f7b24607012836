//! Local time to canonical instant conversion.
//!
//! Every function here takes `now` explicitly so that schedule creation, the
//! due-time poller and countdown display compute identical answers for the
//! same inputs.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How far in the past a requested run time may be before it is rejected.
pub const PAST_GRACE_SECS: i64 = 60;

/// Display format for local wall-clock times.
pub const LOCAL_DISPLAY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const ACCEPTED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),
    #[error("invalid date-time '{input}': {reason}")]
    InvalidDateTime { input: String, reason: String },
}

/// A canonical UTC instant that remembers the zone it was entered in.
///
/// Equality and ordering only look at the UTC instant; the origin zone is
/// display metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduledInstant {
    utc: DateTime<Utc>,
    zone: Tz,
}

impl ScheduledInstant {
    pub fn new(utc: DateTime<Utc>, zone: Tz) -> Self {
        Self { utc, zone }
    }

    pub fn utc(&self) -> DateTime<Utc> {
        self.utc
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    /// Wall-clock time in the origin zone.
    pub fn local_display(&self) -> String {
        to_local(&self.utc, self.zone)
    }
}

impl PartialEq for ScheduledInstant {
    fn eq(&self, other: &Self) -> bool {
        self.utc == other.utc
    }
}

impl Eq for ScheduledInstant {}

impl PartialOrd for ScheduledInstant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledInstant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.utc.cmp(&other.utc)
    }
}

impl fmt::Display for ScheduledInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.local_display(), self.zone.name())
    }
}

/// Resolve an IANA zone name. `Z` is accepted as an alias for UTC.
pub fn parse_timezone(name: &str) -> Result<Tz, ClockError> {
    let trimmed = name.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return Ok(Tz::UTC);
    }
    trimmed
        .parse::<Tz>()
        .map_err(|_| ClockError::InvalidTimezone(name.to_string()))
}

fn parse_local(input: &str) -> Result<NaiveDateTime, ClockError> {
    let trimmed = input.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| ClockError::InvalidDateTime {
            input: input.to_string(),
            reason: "expected YYYY-MM-DDTHH:MM[:SS]".to_string(),
        })
}

/// Interpret a wall-clock time in `zone` without any past-time check.
pub fn resolve_local(local_datetime: &str, zone: Tz) -> Result<DateTime<Utc>, ClockError> {
    let naive = parse_local(local_datetime)?;
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        // DST overlap: the earlier of the two readings.
        LocalResult::Ambiguous(a, b) => Ok(a.min(b).with_timezone(&Utc)),
        LocalResult::None => Err(ClockError::InvalidDateTime {
            input: local_datetime.to_string(),
            reason: format!("time does not exist in {} (DST gap)", zone.name()),
        }),
    }
}

/// Convert a local date-time entered in `timezone_name` into a canonical
/// instant. Rejects instants more than [`PAST_GRACE_SECS`] before `now`.
pub fn normalize(
    local_datetime: &str,
    timezone_name: &str,
    now: DateTime<Utc>,
) -> Result<ScheduledInstant, ClockError> {
    let zone = parse_timezone(timezone_name)?;
    let utc = resolve_local(local_datetime, zone)?;

    if utc < now - Duration::seconds(PAST_GRACE_SECS) {
        return Err(ClockError::InvalidDateTime {
            input: local_datetime.to_string(),
            reason: format!("{} is in the past", utc.to_rfc3339()),
        });
    }

    Ok(ScheduledInstant::new(utc, zone))
}

/// Whole minutes from `now` until `instant`, truncated toward zero.
/// Negative once the instant is overdue by a full minute.
pub fn minutes_until(instant: &DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (*instant - now).num_minutes()
}

/// Render a canonical instant as wall-clock time in `zone`.
pub fn to_local(instant: &DateTime<Utc>, zone: Tz) -> String {
    zone.from_utc_datetime(&instant.naive_utc())
        .format(LOCAL_DISPLAY_FORMAT)
        .to_string()
}
