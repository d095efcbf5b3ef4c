//! Outbound push of local tasks to the calendar

use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{ProviderError, Result, SyncError};
use crate::models::{SyncConfig, Task};
use crate::provider::CalendarApi;
use crate::transcode;

/// Outcome of pushing a batch of tasks
#[derive(Debug, Default)]
pub struct PushReport {
    pub pushed: usize,
    pub errors: Vec<String>,
    /// Event ids written during this batch
    pub event_ids: HashSet<String>,
}

/// Create or update the calendar event for one task and record the result.
///
/// A task whose remembered event no longer exists on the provider gets a
/// new event. A 401 surfaces as [`SyncError::CredentialsExpired`].
pub async fn push_task(
    db: &Database,
    calendar: &dyn CalendarApi,
    config: &SyncConfig,
    task: &Task,
) -> Result<String> {
    let tz = config.tz();
    let payload = transcode::to_external_event(task, tz.name());
    let token = &config.credentials.access_token;
    let calendar_id = &config.calendar_id;

    let linked_calendar = task.external_calendar_id.as_deref().unwrap_or(calendar_id);

    let event_id = match &task.external_event_id {
        Some(existing) if linked_calendar != calendar_id => {
            // Target calendar changed: move the event rather than leave a copy behind
            match calendar.delete_event(token, linked_calendar, existing).await {
                Ok(()) | Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            info!(
                task_id = %task.id,
                event_id = %existing,
                from = %linked_calendar,
                to = %calendar_id,
                "Moving calendar event to new calendar"
            );
            calendar.create_event(token, calendar_id, &payload).await?
        }
        Some(existing) => {
            match calendar
                .update_event(token, calendar_id, existing, &payload)
                .await
            {
                Ok(id) => id,
                Err(ProviderError::NotFound(_)) => {
                    warn!(
                        task_id = %task.id,
                        event_id = %existing,
                        "Calendar event vanished, creating a new one"
                    );
                    calendar.create_event(token, calendar_id, &payload).await?
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => calendar.create_event(token, calendar_id, &payload).await?,
    };

    let agreed =
        db.set_sync_bookkeeping(&task.id, &event_id, calendar_id, Utc::now(), task.updated_at)?;
    if !agreed {
        debug!(task_id = %task.id, "Task edited during push, left dirty");
    }

    debug!(task_id = %task.id, event_id = %event_id, "Task pushed");
    Ok(event_id)
}

/// Push up to `batch_size` dirty tasks dated today or later.
pub async fn push_due_tasks(
    db: &Database,
    calendar: &dyn CalendarApi,
    config: &SyncConfig,
    batch_size: usize,
) -> Result<PushReport> {
    let today = config.today(Utc::now());
    let tasks = db.list_dirty(&config.user_id, today, batch_size)?;
    push_tasks(db, calendar, config, &tasks).await
}

/// Push each task in turn, collecting per-task failures.
///
/// Only an expired credential stops the batch, since every later call
/// would be rejected the same way.
pub async fn push_tasks(
    db: &Database,
    calendar: &dyn CalendarApi,
    config: &SyncConfig,
    tasks: &[Task],
) -> Result<PushReport> {
    let mut report = PushReport::default();

    for task in tasks {
        match push_task(db, calendar, config, task).await {
            Ok(event_id) => {
                report.pushed += 1;
                report.event_ids.insert(event_id);
            }
            Err(SyncError::CredentialsExpired) => return Err(SyncError::CredentialsExpired),
            Err(e @ SyncError::Persistence(_)) => {
                error!(task_id = %task.id, error = %e, "Failed to record push");
                report.errors.push(format!("Failed to push '{}': {}", task.title, e));
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to push task");
                report.errors.push(format!("Failed to push '{}': {}", task.title, e));
            }
        }
    }

    if !tasks.is_empty() {
        info!(
            user_id = %config.user_id,
            pushed = report.pushed,
            errors = report.errors.len(),
            "Pushed tasks to calendar"
        );
    }

    Ok(report)
}

/// Delete a task locally, removing its calendar event first when sync is
/// able to write to the calendar.
///
/// An event already gone on the provider side is not an error. Any other
/// provider failure keeps the local task, so the next import does not
/// bring the event back as a new task.
pub async fn remove_task(
    db: &Database,
    calendar: &dyn CalendarApi,
    config: Option<&SyncConfig>,
    user_id: &str,
    task_id: &str,
) -> Result<()> {
    let task = db
        .get_task(user_id, task_id)?
        .ok_or_else(|| SyncError::TaskNotFound(task_id.to_string()))?;

    let writable = config.filter(|c| {
        c.enabled && c.direction.pushes() && !c.credentials.is_expired_at(Utc::now())
    });

    if let (Some(config), Some(event_id)) = (writable, task.external_event_id.as_deref()) {
        let calendar_id = task
            .external_calendar_id
            .as_deref()
            .unwrap_or(&config.calendar_id);
        match calendar
            .delete_event(&config.credentials.access_token, calendar_id, event_id)
            .await
        {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    db.delete_task(user_id, task_id)?;
    Ok(())
}
