//! Conversion between local tasks and calendar events

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::models::{EventPayload, EventTime, ExternalEvent, ImportedTask, PayloadTime, Task};

/// Window used for tasks without explicit times
const DEFAULT_START: (u32, u32) = (9, 0);
const DEFAULT_DURATION_MINUTES: i64 = 60;

const CIVIL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Build the provider payload for a task.
///
/// Times are civil datetimes qualified with `timezone`. A task with only a
/// start, or an end equal to its start, gets a one hour event; a task without
/// a start gets 09:00-10:00 on its date. An end before the start rolls over
/// to the next day.
pub fn to_external_event(task: &Task, timezone: &str) -> EventPayload {
    let (start, end) = event_window(task);

    EventPayload {
        summary: task.title.clone(),
        description: task.description.clone().filter(|d| !d.is_empty()),
        start: PayloadTime {
            date_time: start.format(CIVIL_FORMAT).to_string(),
            time_zone: timezone.to_string(),
        },
        end: PayloadTime {
            date_time: end.format(CIVIL_FORMAT).to_string(),
            time_zone: timezone.to_string(),
        },
    }
}

fn event_window(task: &Task) -> (NaiveDateTime, NaiveDateTime) {
    let default_start = NaiveTime::from_hms_opt(DEFAULT_START.0, DEFAULT_START.1, 0)
        .unwrap_or(NaiveTime::MIN);

    let start = task.date.and_time(whole_seconds(task.scheduled_start.unwrap_or(default_start)));

    let end = match (task.scheduled_start, task.scheduled_end) {
        (Some(_), Some(end)) if whole_seconds(end) != start.time() => {
            let end = task.date.and_time(whole_seconds(end));
            if end > start {
                end
            } else {
                end + Duration::days(1)
            }
        }
        _ => start + Duration::minutes(DEFAULT_DURATION_MINUTES),
    };

    (start, end)
}

fn whole_seconds(time: NaiveTime) -> NaiveTime {
    time.with_nanosecond(0).unwrap_or(time)
}

fn minutes_only(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

/// Derive task fields from a calendar event.
///
/// All-day events yield a date without times. Timed events are converted to
/// wall-clock HH:MM in `tz`. Returns `None` when the event has no usable
/// start.
pub fn from_external_event(event: &ExternalEvent, tz: Tz) -> Option<ImportedTask> {
    let start = event.start.as_ref()?;

    let (date, scheduled_start, scheduled_end) = match start {
        EventTime::Date(date) => (*date, None, None),
        timed => {
            let start = localize(timed, tz)?;
            let end = event
                .end
                .as_ref()
                .and_then(|end| localize(end, tz))
                .map(|end| minutes_only(end.time()));
            (start.date_naive(), Some(minutes_only(start.time())), end)
        }
    };

    Some(ImportedTask {
        title: event.summary.clone(),
        description: event.description.clone().filter(|d| !d.is_empty()),
        date,
        scheduled_start,
        scheduled_end,
    })
}

/// Resolve a timed event boundary to a datetime in `tz`.
fn localize(time: &EventTime, tz: Tz) -> Option<DateTime<Tz>> {
    match time {
        EventTime::Date(_) => None,
        EventTime::DateTime(utc) => Some(utc.with_timezone(&tz)),
        EventTime::Floating { at, time_zone } => {
            let zone: Tz = time_zone
                .as_deref()
                .and_then(|name| name.parse().ok())
                .unwrap_or(tz);
            // A wall-clock time skipped by a DST jump lands just after the gap
            let instant: DateTime<Utc> = zone
                .from_local_datetime(at)
                .earliest()
                .or_else(|| {
                    zone.from_local_datetime(&(*at + Duration::hours(1)))
                        .earliest()
                })?
                .to_utc();
            Some(instant.with_timezone(&tz))
        }
    }
}
