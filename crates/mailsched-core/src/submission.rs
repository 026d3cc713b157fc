//! Boundary validation for schedule requests.
//!
//! Everything that arrives from a caller (HTTP body, CLI flags) is turned into
//! a [`NewEvent`] here. Timestamps are normalised to UTC at this point and
//! nowhere else; the store and the scheduler only ever see `DateTime<Utc>`.

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{NewEvent, Recipients};

/// Zone used to interpret timestamps that carry no offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputZone {
    #[default]
    Utc,
    /// The server's local zone (DST-aware).
    Local,
    Fixed(FixedOffset),
}

impl std::fmt::Display for InputZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputZone::Utc => f.write_str("utc"),
            InputZone::Local => f.write_str("local"),
            InputZone::Fixed(off) => write!(f, "{off}"),
        }
    }
}

impl std::str::FromStr for InputZone {
    type Err = ValidationError;

    /// Accepts `utc`, `local`, or a fixed offset such as `+08:00` / `-0530`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "utc" | "z" | "" => return Ok(InputZone::Utc),
            "local" => return Ok(InputZone::Local),
            _ => {}
        }
        parse_offset(s)
            .map(InputZone::Fixed)
            .ok_or_else(|| ValidationError::InvalidZone(s.to_string()))
    }
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Formats that carry their own offset.
const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M%z",
    "%d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M %z",
];

/// Formats without offset; interpreted in the configured [`InputZone`].
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M",
];

/// Parse a caller-supplied timestamp and normalise it to UTC.
///
/// Explicit offsets always win. Naive input is placed in `zone`; a local
/// time repeated by a DST fold resolves to the earlier instant, a local time
/// skipped by a DST gap is rejected.
pub fn parse_timestamp(input: &str, zone: InputZone) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField { field: "timestamp" });
    }

    let widened = widen_hour_offset(trimmed);
    for candidate in std::iter::once(trimmed).chain(widened.as_deref()) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(candidate) {
            return Ok(dt.with_timezone(&Utc));
        }
        for fmt in ZONED_FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(candidate, fmt) {
                return Ok(dt.with_timezone(&Utc));
            }
        }
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| ValidationError::InvalidTimestamp {
            input: trimmed.to_string(),
        })?;

    match zone {
        InputZone::Utc => Ok(Utc.from_utc_datetime(&naive)),
        InputZone::Local => resolve_local(&chrono::Local, &naive, trimmed, zone),
        InputZone::Fixed(off) => resolve_local(&off, &naive, trimmed, zone),
    }
}

/// `18:30 +08` becomes `18:30 +0800`; anything else is left alone.
fn widen_hour_offset(s: &str) -> Option<String> {
    let b = s.as_bytes();
    let n = b.len();
    if n < 4 || !b[n - 2..].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let sign = b[n - 3];
    let before = b[n - 4];
    let time_before = s[..n - 3].contains(':');
    if (sign == b'+' || sign == b'-') && (before.is_ascii_digit() || before == b' ') && time_before {
        Some(format!("{s}00"))
    } else {
        None
    }
}

fn resolve_local<Tz: TimeZone>(
    tz: &Tz,
    naive: &NaiveDateTime,
    input: &str,
    zone: InputZone,
) -> Result<DateTime<Utc>, ValidationError> {
    match tz.from_local_datetime(naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(ValidationError::NonexistentLocalTime {
            input: input.to_string(),
            zone: zone.to_string(),
        }),
    }
}

/// Recipients as sent by callers: `"a@x.com, b@y.org"` or `["a@x.com", …]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecipientsInput {
    Joined(String),
    List(Vec<String>),
}

/// A raw schedule request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub subject: String,
    pub content: String,
    /// ISO-8601 (offset optional) or `DD Mon YYYY HH:MM`.
    pub timestamp: String,
    pub recipients: RecipientsInput,
}

impl SubmitRequest {
    /// Validate every field and produce a store-ready [`NewEvent`].
    pub fn validate(&self, zone: InputZone) -> Result<NewEvent, ValidationError> {
        if self.subject.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "subject" });
        }
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "content" });
        }
        let recipients = match &self.recipients {
            RecipientsInput::Joined(s) => Recipients::parse(s)?,
            RecipientsInput::List(list) => Recipients::from_list(list)?,
        };
        let scheduled_at = parse_timestamp(&self.timestamp, zone)?;

        Ok(NewEvent {
            subject: self.subject.trim().to_string(),
            content: self.content.clone(),
            recipients,
            scheduled_at,
        })
    }
}
