//! Sync pass orchestration
//!
//! One pass per user: gate on connection state, push dirty tasks, import
//! calendar events, then advance the watermark. Passes for different users
//! share nothing but the database handle and the stateless API client.

use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CalendarConfig;
use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::import;
use crate::models::{SyncConfig, SyncResult};
use crate::provider::CalendarApi;
use crate::push::{self, PushReport};

/// Tunables for a sync pass
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub push_batch_size: usize,
    pub import_window_days: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            push_batch_size: 50,
            import_window_days: 30,
        }
    }
}

impl From<&CalendarConfig> for SyncSettings {
    fn from(config: &CalendarConfig) -> Self {
        Self {
            push_batch_size: config.push_batch_size,
            import_window_days: config.import_window_days,
        }
    }
}

/// Drives calendar sync for all users
///
/// Work that writes to the calendar for one user runs under that user's
/// lock, so two paths never create an event for the same task.
#[derive(Clone)]
pub struct CalendarSync {
    db: Arc<Database>,
    calendar: Arc<dyn CalendarApi>,
    settings: SyncSettings,
    user_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl CalendarSync {
    pub fn new(db: Arc<Database>, calendar: Arc<dyn CalendarApi>, settings: SyncSettings) -> Self {
        Self {
            db,
            calendar,
            settings,
            user_locks: Arc::default(),
        }
    }

    async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .user_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Run one sync pass for `user_id`.
    ///
    /// A missing or disabled connection is a no-op with an empty result.
    /// Expired credentials abort before any provider call. Otherwise the
    /// pass always completes, item failures land in `errors`, and the
    /// watermark advances.
    pub async fn sync_user(&self, user_id: &str) -> Result<SyncResult> {
        let _guard = self.lock_user(user_id).await;
        let Some(config) = self.db.get_sync_config(user_id)? else {
            debug!(user_id = %user_id, "Calendar not connected, nothing to sync");
            return Ok(SyncResult::default());
        };

        if !config.enabled {
            debug!(user_id = %user_id, "Calendar sync disabled, nothing to sync");
            return Ok(SyncResult::default());
        }

        let started = Utc::now();
        if config.credentials.is_expired_at(started) {
            warn!(user_id = %user_id, "Calendar credentials expired, reconnect required");
            return Err(SyncError::CredentialsExpired);
        }

        info!(
            user_id = %user_id,
            direction = %config.direction,
            calendar_id = %config.calendar_id,
            "Calendar sync started"
        );

        let mut result = SyncResult::default();
        let mut pushed_ids = HashSet::new();

        if config.direction.pushes() {
            match push::push_due_tasks(
                &self.db,
                self.calendar.as_ref(),
                &config,
                self.settings.push_batch_size,
            )
            .await
            {
                Ok(report) => {
                    result.pushed = report.pushed;
                    result.errors.extend(report.errors);
                    pushed_ids = report.event_ids;
                }
                Err(SyncError::CredentialsExpired) => return Err(SyncError::CredentialsExpired),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Push step failed");
                    result.errors.push(format!("Push failed: {}", e));
                }
            }
        }

        if config.direction.pulls() {
            let window_end = started + Duration::days(self.settings.import_window_days);
            match import::import_events(
                &self.db,
                self.calendar.as_ref(),
                &config,
                started,
                window_end,
                &pushed_ids,
            )
            .await
            {
                Ok(report) => {
                    result.imported = report.imported;
                    result.deleted = report.deleted;
                    result.errors.extend(report.errors);
                }
                Err(SyncError::CredentialsExpired) => return Err(SyncError::CredentialsExpired),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Import step failed");
                    result.errors.push(format!("Import failed: {}", e));
                }
            }
        }

        self.db.set_last_sync(user_id, Utc::now())?;

        info!(
            user_id = %user_id,
            pushed = result.pushed,
            imported = result.imported,
            deleted = result.deleted,
            errors = result.errors.len(),
            "Calendar sync complete"
        );

        Ok(result)
    }

    /// Push one task right away, outside of a sync pass.
    pub async fn push_single_task(&self, user_id: &str, task_id: &str) -> Result<String> {
        let _guard = self.lock_user(user_id).await;
        let config = self.writable_config(user_id)?;
        let task = self
            .db
            .get_task(user_id, task_id)?
            .ok_or_else(|| SyncError::TaskNotFound(task_id.to_string()))?;

        push::push_task(&self.db, self.calendar.as_ref(), &config, &task).await
    }

    /// Delete a task, and its calendar event when sync writes to the calendar.
    pub async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<()> {
        let _guard = self.lock_user(user_id).await;
        let config = self.db.get_sync_config(user_id)?;
        push::remove_task(
            &self.db,
            self.calendar.as_ref(),
            config.as_ref(),
            user_id,
            task_id,
        )
        .await
    }

    /// Push every task dated today or later, synced or not.
    pub async fn retroactive_sync(&self, user_id: &str) -> Result<PushReport> {
        let _guard = self.lock_user(user_id).await;
        let config = self.writable_config(user_id)?;
        let tasks = self.db.list_future(user_id, config.today(Utc::now()))?;
        push::push_tasks(&self.db, self.calendar.as_ref(), &config, &tasks).await
    }

    /// Run [`Self::retroactive_sync`] in the background.
    ///
    /// Nothing is reported to the caller; the outcome is logged as one
    /// structured completion event.
    pub fn spawn_retroactive_sync(&self, user_id: String) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            match sync.retroactive_sync(&user_id).await {
                Ok(report) => info!(
                    target: "taskcal_sync::retroactive",
                    user_id = %user_id,
                    pushed = report.pushed,
                    errors = report.errors.len(),
                    "Retroactive calendar sync complete"
                ),
                Err(e) => warn!(
                    target: "taskcal_sync::retroactive",
                    user_id = %user_id,
                    error = %e,
                    "Retroactive calendar sync failed"
                ),
            }
        })
    }

    /// Connection that currently allows writing to the calendar.
    fn writable_config(&self, user_id: &str) -> Result<SyncConfig> {
        let config = self
            .db
            .get_sync_config(user_id)?
            .ok_or(SyncError::NotConnected)?;

        if !config.enabled {
            return Err(SyncError::SyncDisabled);
        }
        if !config.direction.pushes() {
            return Err(SyncError::PushNotAllowed);
        }
        if config.credentials.is_expired_at(Utc::now()) {
            return Err(SyncError::CredentialsExpired);
        }

        Ok(config)
    }
}
