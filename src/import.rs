//! Inbound import of calendar events into local tasks

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::models::{EventStatus, ExternalEvent, SyncConfig, Task};
use crate::provider::CalendarApi;
use crate::transcode;

/// Title prefix of events once generated from routines. Those are no
/// longer owned by this service and are never imported as new tasks.
pub const ROUTINE_MARKER: &str = "[Routine]";

/// Outcome of importing one window of events
#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

enum Applied {
    Created,
    Updated,
    Deleted,
    Unchanged,
    Skipped,
}

/// Fetch events in `[window_start, window_end)` and reconcile them with
/// local tasks, one at a time.
///
/// Events in `skip` were written by this same pass and are left alone.
/// Only a failure to list events fails the import; per-event problems
/// are collected in the report.
pub async fn import_events(
    db: &Database,
    calendar: &dyn CalendarApi,
    config: &SyncConfig,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    skip: &HashSet<String>,
) -> Result<ImportReport> {
    let events = calendar
        .list_events(
            &config.credentials.access_token,
            &config.calendar_id,
            window_start,
            window_end,
        )
        .await?;

    let mut report = ImportReport::default();

    for event in &events {
        if skip.contains(&event.id) {
            debug!(event_id = %event.id, "Event pushed this pass, not re-importing");
            continue;
        }

        match apply_event(db, config, event) {
            Ok(Applied::Created | Applied::Updated) => report.imported += 1,
            Ok(Applied::Deleted) => report.deleted += 1,
            Ok(Applied::Unchanged | Applied::Skipped) => {}
            Err(SyncError::MalformedEvent(id)) => {
                warn!(event_id = %id, "Skipping calendar event without usable start");
            }
            Err(e @ SyncError::Persistence(_)) => {
                error!(event_id = %event.id, error = %e, "Failed to store imported event");
                report
                    .errors
                    .push(format!("Failed to import '{}': {}", event.summary, e));
            }
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Failed to import event");
                report
                    .errors
                    .push(format!("Failed to import '{}': {}", event.summary, e));
            }
        }
    }

    info!(
        user_id = %config.user_id,
        fetched = events.len(),
        imported = report.imported,
        deleted = report.deleted,
        errors = report.errors.len(),
        "Imported calendar events"
    );

    Ok(report)
}

fn apply_event(db: &Database, config: &SyncConfig, event: &ExternalEvent) -> Result<Applied> {
    let user_id = &config.user_id;

    // Cancelled events often come back without a title, so this runs first
    if event.status == EventStatus::Cancelled {
        let deleted = db.delete_by_external_id(user_id, &event.id)?;
        if deleted {
            info!(user_id = %user_id, event_id = %event.id, "Deleted task for cancelled event");
            return Ok(Applied::Deleted);
        }
        return Ok(Applied::Skipped);
    }

    if event.summary.trim().is_empty() {
        return Ok(Applied::Skipped);
    }

    let fields = transcode::from_external_event(event, config.tz())
        .ok_or_else(|| SyncError::MalformedEvent(event.id.clone()))?;

    match db.find_by_external_id(user_id, &event.id)? {
        None => {
            if event.summary.starts_with(ROUTINE_MARKER) {
                debug!(event_id = %event.id, "Skipping routine-generated event");
                return Ok(Applied::Skipped);
            }
            let task =
                db.insert_imported(user_id, &event.id, &config.calendar_id, &fields, Utc::now())?;
            debug!(task_id = %task.id, event_id = %event.id, "Imported new task");
            Ok(Applied::Created)
        }
        Some(task) => {
            if !provider_is_newer(event, &task) {
                return Ok(Applied::Unchanged);
            }
            db.apply_import(&task.id, &fields, Utc::now())?;
            debug!(task_id = %task.id, event_id = %event.id, "Task overwritten from calendar");
            Ok(Applied::Updated)
        }
    }
}

/// Last writer wins, judged against the last confirmed agreement rather
/// than the last local edit.
fn provider_is_newer(event: &ExternalEvent, task: &Task) -> bool {
    match (event.updated, task.last_synced_at) {
        (Some(updated), Some(synced)) => updated > synced,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventTime, NewTask};
    use crate::testing::{FakeCalendar, connected};
    use chrono::{Duration, NaiveDate, NaiveTime, TimeZone};

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now, now + Duration::days(30))
    }

    fn timed_event(id: &str, summary: &str, start: &str, end: &str, updated: &str) -> ExternalEvent {
        ExternalEvent {
            id: id.into(),
            summary: summary.into(),
            description: None,
            status: EventStatus::Confirmed,
            start: Some(EventTime::DateTime(start.parse().unwrap())),
            end: Some(EventTime::DateTime(end.parse().unwrap())),
            updated: Some(updated.parse().unwrap()),
        }
    }

    fn dentist() -> ExternalEvent {
        timed_event(
            "ext-1",
            "Dentist",
            "2026-03-01T10:00:00Z",
            "2026-03-01T10:30:00Z",
            "2026-02-20T00:00:00Z",
        )
    }

    async fn run(
        db: &Database,
        calendar: &FakeCalendar,
        config: &SyncConfig,
    ) -> ImportReport {
        let (start, end) = window();
        import_events(db, calendar, config, start, end, &HashSet::new())
            .await
            .unwrap()
    }

    /// Local task mirroring `event_id`, last confirmed at `synced_at`
    fn mirrored(db: &Database, event_id: &str, synced_at: DateTime<Utc>) -> Task {
        let task = db
            .create_task(
                "u1",
                &NewTask {
                    title: "Local title".into(),
                    description: None,
                    date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                    scheduled_start: NaiveTime::from_hms_opt(8, 0, 0),
                    scheduled_end: None,
                },
            )
            .unwrap();
        db.set_sync_bookkeeping(&task.id, event_id, "primary", synced_at, task.updated_at)
            .unwrap();
        task
    }

    #[tokio::test]
    async fn new_event_becomes_task() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        calendar.set_listed(vec![dentist()]);

        let report = run(&db, &calendar, &config).await;
        assert_eq!(report.imported, 1);
        assert!(report.errors.is_empty());

        let task = db.find_by_external_id("u1", "ext-1").unwrap().unwrap();
        assert_eq!(task.title, "Dentist");
        assert_eq!(task.date, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(task.scheduled_start, NaiveTime::from_hms_opt(10, 0, 0));
        assert_eq!(task.scheduled_end, NaiveTime::from_hms_opt(10, 30, 0));
        assert_eq!(task.external_calendar_id.as_deref(), Some("primary"));
        assert!(task.last_synced_at.is_some());
        assert!(!task.is_dirty());
    }

    #[tokio::test]
    async fn reimport_does_not_duplicate() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        calendar.set_listed(vec![dentist()]);

        run(&db, &calendar, &config).await;
        let report = run(&db, &calendar, &config).await;
        assert_eq!(report.imported, 0);
        assert_eq!(db.list_tasks("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn newer_provider_edit_overwrites_local_task() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
        let task = mirrored(&db, "ext-1", t0);
        calendar.set_listed(vec![dentist()]);

        let report = run(&db, &calendar, &config).await;
        assert_eq!(report.imported, 1);

        let stored = db.get_task("u1", &task.id).unwrap().unwrap();
        assert_eq!(stored.title, "Dentist");
        assert_eq!(stored.scheduled_start, NaiveTime::from_hms_opt(10, 0, 0));
        assert!(stored.last_synced_at.unwrap() > t0);
        assert!(!stored.is_dirty());
    }

    #[tokio::test]
    async fn stale_or_equal_provider_edit_is_ignored() {
        for synced in ["2026-02-20T00:00:00Z", "2026-02-25T00:00:00Z"] {
            let (db, config) = connected("UTC");
            let calendar = FakeCalendar::new();
            let t0: DateTime<Utc> = synced.parse().unwrap();
            let task = mirrored(&db, "ext-1", t0);
            calendar.set_listed(vec![dentist()]);

            let report = run(&db, &calendar, &config).await;
            assert_eq!(report.imported, 0);

            let stored = db.get_task("u1", &task.id).unwrap().unwrap();
            assert_eq!(stored.title, "Local title");
            assert_eq!(stored.last_synced_at, Some(t0));
        }
    }

    #[tokio::test]
    async fn cancelled_event_deletes_matching_task() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        let task = mirrored(&db, "ext-1", Utc::now());
        let mut cancelled = dentist();
        cancelled.status = EventStatus::Cancelled;
        cancelled.summary = String::new();
        let mut unknown = dentist();
        unknown.id = "ext-unknown".into();
        unknown.status = EventStatus::Cancelled;
        calendar.set_listed(vec![cancelled, unknown]);

        let report = run(&db, &calendar, &config).await;
        assert_eq!(report.deleted, 1);
        assert_eq!(report.imported, 0);
        assert!(report.errors.is_empty());
        assert!(db.get_task("u1", &task.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn untitled_routine_and_malformed_events_are_skipped() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        let mut untitled = dentist();
        untitled.id = "ext-2".into();
        untitled.summary = "   ".into();
        let mut routine = dentist();
        routine.id = "ext-3".into();
        routine.summary = "[Routine] Morning run".into();
        let mut malformed = dentist();
        malformed.id = "ext-4".into();
        malformed.start = None;
        calendar.set_listed(vec![untitled, routine, malformed, dentist()]);

        let report = run(&db, &calendar, &config).await;
        assert_eq!(report.imported, 1);
        assert!(report.errors.is_empty());
        let tasks = db.list_tasks("u1").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].external_event_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn routine_marker_does_not_block_known_tasks() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        let task = mirrored(&db, "ext-1", Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let mut routine = dentist();
        routine.summary = "[Routine] Dentist".into();
        calendar.set_listed(vec![routine]);

        let report = run(&db, &calendar, &config).await;
        assert_eq!(report.imported, 1);
        let stored = db.get_task("u1", &task.id).unwrap().unwrap();
        assert_eq!(stored.title, "[Routine] Dentist");
    }

    #[tokio::test]
    async fn events_pushed_this_pass_are_skipped() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        calendar.set_listed(vec![dentist()]);

        let (start, end) = window();
        let skip: HashSet<String> = ["ext-1".to_string()].into_iter().collect();
        let report = import_events(&db, calendar.as_ref(), &config, start, end, &skip)
            .await
            .unwrap();
        assert_eq!(report.imported, 0);
        assert!(db.list_tasks("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_times_follow_configured_timezone() {
        let (db, config) = connected("Europe/Paris");
        let calendar = FakeCalendar::new();
        calendar.set_listed(vec![dentist()]);

        run(&db, &calendar, &config).await;
        let task = db.find_by_external_id("u1", "ext-1").unwrap().unwrap();
        assert_eq!(task.scheduled_start, NaiveTime::from_hms_opt(11, 0, 0));
        assert_eq!(task.scheduled_end, NaiveTime::from_hms_opt(11, 30, 0));
    }

    #[tokio::test]
    async fn listing_failure_fails_the_import() {
        let (db, config) = connected("UTC");
        let calendar = FakeCalendar::new();
        calendar.fail_listing();

        let (start, end) = window();
        let err = import_events(&db, calendar.as_ref(), &config, start, end, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Provider(_)));
    }
}
