//! Sync data models
//!
//! Instants are always `DateTime<Utc>`; dates and wall-clock times are naive
//! and interpreted in the user's configured calendar timezone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Calendar identifier the provider resolves to the account's main calendar.
pub const PRIMARY_CALENDAR: &str = "primary";

/// Which way data is allowed to flow during a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncDirection {
    #[default]
    #[serde(rename = "bidirectional")]
    Bidirectional,
    #[serde(rename = "to_google")]
    ToExternalOnly,
    #[serde(rename = "from_google")]
    FromExternalOnly,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::ToExternalOnly => "to_google",
            Self::FromExternalOnly => "from_google",
        }
    }

    /// Local tasks may be written to the calendar.
    pub fn pushes(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::ToExternalOnly)
    }

    /// Calendar events may be written to the local store.
    pub fn pulls(&self) -> bool {
        matches!(self, Self::Bidirectional | Self::FromExternalOnly)
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bidirectional" => Ok(Self::Bidirectional),
            "to_google" => Ok(Self::ToExternalOnly),
            "from_google" => Ok(Self::FromExternalOnly),
            other => Err(format!("unknown sync direction '{}'", other)),
        }
    }
}

/// OAuth token pair for the calendar provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Per-user calendar connection
///
/// Credentials are never serialized; API responses only expose whether
/// they have expired.
#[derive(Debug, Clone, Serialize)]
pub struct SyncConfig {
    pub user_id: String,
    #[serde(skip)]
    pub credentials: Credentials,
    pub account_email: Option<String>,
    pub enabled: bool,
    pub direction: SyncDirection,
    pub calendar_id: String,
    pub timezone: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfig {
    /// The configured zone, or UTC when the stored name is not a known IANA zone.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!(
                user_id = %self.user_id,
                timezone = %self.timezone,
                "Unknown timezone, falling back to UTC"
            );
            Tz::UTC
        })
    }

    /// Today's date in the user's calendar timezone.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz()).date_naive()
    }
}

/// A local task, as far as calendar sync is concerned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub scheduled_start: Option<NaiveTime>,
    #[serde(default)]
    pub scheduled_end: Option<NaiveTime>,
    #[serde(default)]
    pub external_event_id: Option<String>,
    #[serde(default)]
    pub external_calendar_id: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
impl Task {
    /// Never pushed, or edited locally since the last confirmed agreement.
    pub fn is_dirty(&self) -> bool {
        match (&self.external_event_id, self.last_synced_at) {
            (None, _) | (_, None) => true,
            (Some(_), Some(synced)) => synced < self.updated_at,
        }
    }
}

/// Fields for creating a task
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub scheduled_start: Option<NaiveTime>,
    #[serde(default)]
    pub scheduled_end: Option<NaiveTime>,
}

/// Partial edit of a task; absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub scheduled_start: Option<NaiveTime>,
    pub scheduled_end: Option<NaiveTime>,
}

/// Task fields derived from a calendar event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedTask {
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub scheduled_start: Option<NaiveTime>,
    pub scheduled_end: Option<NaiveTime>,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub pushed: usize,
    pub imported: usize,
    /// Local tasks removed because their event was cancelled
    #[serde(default)]
    pub deleted: usize,
    pub errors: Vec<String>,
}

/// Provider-side status of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

impl EventStatus {
    /// Unknown or missing statuses are treated as confirmed.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("cancelled") => Self::Cancelled,
            Some("tentative") => Self::Tentative,
            _ => Self::Confirmed,
        }
    }
}

/// Start or end of an event as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTime {
    /// All-day event
    Date(NaiveDate),
    /// Timed event with an offset
    DateTime(DateTime<Utc>),
    /// Timed event without an offset, in the named zone if any
    Floating {
        at: NaiveDateTime,
        time_zone: Option<String>,
    },
}

/// A calendar event fetched from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub id: String,
    pub summary: String,
    pub description: Option<String>,
    pub status: EventStatus,
    /// None when the provider sent neither `date` nor a parseable `dateTime`
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    pub updated: Option<DateTime<Utc>>,
}

/// Civil datetime qualified by a zone name, as the provider expects it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadTime {
    pub date_time: String,
    pub time_zone: String,
}

/// Body of an event create or update request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: PayloadTime,
    pub end: PayloadTime,
}
