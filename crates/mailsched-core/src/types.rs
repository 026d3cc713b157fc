use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Primary key of a scheduled event. Assigned by the store, monotonically increasing.
pub type EventId = i64;

/// Lifecycle state of a scheduled email.
///
/// Transitions only move forward: `Pending → Claimed → {Done, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for `scheduled_at` to pass.
    Pending,
    /// Owned by exactly one delivery attempt chain.
    Claimed,
    /// Delivered; `done_at` is set.
    Done,
    /// Retries exhausted or permanently rejected by the transport.
    Failed,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Done | EventStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Claimed => "claimed",
            EventStatus::Done => "done",
            EventStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "claimed" => Ok(EventStatus::Claimed),
            "done" => Ok(EventStatus::Done),
            "failed" => Ok(EventStatus::Failed),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// Validated, de-duplicated recipient list. Never empty.
///
/// Duplicates are detected case-insensitively; the first spelling wins and
/// first-seen order is kept for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Recipients(Vec<String>);

impl Recipients {
    /// Parse a comma-separated address list, e.g. `"a@x.com, b@y.org"`.
    pub fn parse(joined: &str) -> Result<Self, ValidationError> {
        Self::from_list(joined.split(','))
    }

    /// Validate each entry; blank entries are ignored.
    pub fn from_list<I, S>(items: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for item in items {
            let addr = item.as_ref().trim();
            if addr.is_empty() {
                continue;
            }
            if addr.parse::<lettre::Address>().is_err() {
                return Err(ValidationError::InvalidAddress {
                    address: addr.to_string(),
                });
            }
            if seen.insert(addr.to_ascii_lowercase()) {
                out.push(addr.to_string());
            }
        }
        if out.is_empty() {
            return Err(ValidationError::NoRecipients);
        }
        Ok(Self(out))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed value.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<'de> Deserialize<'de> for Recipients {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let list = Vec::<String>::deserialize(deserializer)?;
        Recipients::from_list(list).map_err(serde::de::Error::custom)
    }
}

/// Input to `EventStore::create`. Every field has already been validated.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub subject: String,
    pub content: String,
    pub recipients: Recipients,
    /// Canonical (UTC) eligibility instant.
    pub scheduled_at: DateTime<Utc>,
}

/// A persisted scheduled email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub subject: String,
    pub content: String,
    pub recipients: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: EventStatus,
    /// When the dispatcher won the claim.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set once on successful delivery, never cleared.
    pub done_at: Option<DateTime<Utc>>,
    /// Transport sends started for this event.
    pub attempt_count: u32,
    /// Most recent transport failure, if any.
    pub last_error: Option<String>,
}

impl Event {
    /// True when the event may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.scheduled_at <= now
    }
}
