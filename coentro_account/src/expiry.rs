//! Parsing of the expiry timestamps reported by the daemon.
//!
//! The daemon formats expiries as `YYYY-MM-DD HH:MM:SS <zone>`, where the zone
//! is `UTC`, `GMT`, `Z` or a numeric offset such as `+0100` or `-05:30`.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use thiserror::Error;

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Why an expiry string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpiryParseError {
    #[error("{0:?} is not of the form YYYY-MM-DD HH:MM:SS <zone>")]
    Malformed(String),

    #[error("invalid date or time in {input:?}: {reason}")]
    InvalidDateTime { input: String, reason: String },

    #[error("unsupported time zone {0:?}")]
    UnknownZone(String),
}

/// Parse a daemon expiry string into a UTC timestamp.
pub fn parse_expiry(input: &str) -> Result<DateTime<Utc>, ExpiryParseError> {
    let trimmed = input.trim();
    let (date_time, zone) = trimmed
        .rsplit_once(' ')
        .ok_or_else(|| ExpiryParseError::Malformed(input.to_string()))?;

    let naive = NaiveDateTime::parse_from_str(date_time.trim_end(), DATE_TIME_FORMAT).map_err(
        |e| ExpiryParseError::InvalidDateTime {
            input: input.to_string(),
            reason: e.to_string(),
        },
    )?;
    let offset = parse_zone(zone)?;

    naive
        .and_local_timezone(offset)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| ExpiryParseError::InvalidDateTime {
            input: input.to_string(),
            reason: "ambiguous local time".to_string(),
        })
}

fn parse_zone(zone: &str) -> Result<FixedOffset, ExpiryParseError> {
    let unknown = || ExpiryParseError::UnknownZone(zone.to_string());

    if ["UTC", "GMT", "Z"]
        .iter()
        .any(|name| zone.eq_ignore_ascii_case(name))
    {
        return FixedOffset::east_opt(0).ok_or_else(unknown);
    }

    let (sign, digits) = match zone.as_bytes().first() {
        Some(b'+') => (1, &zone[1..]),
        Some(b'-') => (-1, &zone[1..]),
        _ => return Err(unknown()),
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(unknown());
    }

    let hours: i32 = digits[..2].parse().map_err(|_| unknown())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| unknown())?;
    if minutes >= 60 {
        return Err(unknown());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(unknown)
}
