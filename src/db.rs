//! Database module for taskcal-sync
//!
//! Holds the per-user calendar connection and the sync-relevant view of
//! tasks. Instants are stored as UTC Unix milliseconds so ordering checks
//! happen on integers.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::models::{
    Credentials, ImportedTask, NewTask, PRIMARY_CALENDAR, SyncConfig, SyncDirection, Task,
    TaskPatch,
};

const TASK_COLUMNS: &str = "id, user_id, title, description, date, scheduled_start, scheduled_end, \
     external_event_id, external_calendar_id, last_synced_at, created_at, updated_at";

const CONFIG_COLUMNS: &str = "user_id, access_token, refresh_token, token_expires_at, account_email, \
     enabled, direction, calendar_id, timezone, last_sync_at, created_at, updated_at";

/// Preference changes; `None` leaves a field as it is
#[derive(Debug, Clone, Default)]
pub struct PreferencesUpdate {
    pub enabled: Option<bool>,
    pub direction: Option<SyncDirection>,
    pub calendar_id: Option<String>,
    pub timezone: Option<String>,
}

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Tasks, reduced to the fields calendar sync reads and writes
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                date TEXT NOT NULL,
                scheduled_start TEXT,
                scheduled_end TEXT,
                external_event_id TEXT,
                external_calendar_id TEXT,
                last_synced_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- One calendar connection per user
            CREATE TABLE IF NOT EXISTS sync_configs (
                user_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                token_expires_at INTEGER NOT NULL,
                account_email TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                direction TEXT NOT NULL DEFAULT 'bidirectional',
                calendar_id TEXT NOT NULL DEFAULT 'primary',
                timezone TEXT NOT NULL,
                last_sync_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_tasks_user_date ON tasks(user_id, date);
            CREATE INDEX IF NOT EXISTS idx_tasks_external ON tasks(user_id, external_event_id);
            "#,
        )?;

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Sync configs
    // ---------------------------------------------------------------------

    pub fn get_sync_config(&self, user_id: &str) -> Result<Option<SyncConfig>> {
        let conn = self.conn()?;
        query_config(&conn, user_id)
    }

    /// Save credentials, creating the connection if needed.
    ///
    /// Always re-enables sync. The returned flag is true when the connection
    /// did not exist before.
    pub fn upsert_credentials(
        &self,
        user_id: &str,
        credentials: &Credentials,
        account_email: Option<&str>,
        default_timezone: &str,
    ) -> Result<(SyncConfig, bool)> {
        let conn = self.conn()?;
        let now = millis(Utc::now());
        let created = query_config(&conn, user_id)?.is_none();

        conn.execute(
            r#"INSERT INTO sync_configs (user_id, access_token, refresh_token, token_expires_at,
               account_email, enabled, direction, calendar_id, timezone, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?9)
               ON CONFLICT(user_id) DO UPDATE SET
                   access_token = excluded.access_token,
                   refresh_token = excluded.refresh_token,
                   token_expires_at = excluded.token_expires_at,
                   account_email = COALESCE(excluded.account_email, account_email),
                   enabled = 1,
                   updated_at = excluded.updated_at"#,
            params![
                user_id,
                &credentials.access_token,
                &credentials.refresh_token,
                millis(credentials.expires_at),
                account_email,
                SyncDirection::default().as_str(),
                PRIMARY_CALENDAR,
                default_timezone,
                now,
            ],
        )
        .context("Failed to save calendar credentials")?;

        let config = query_config(&conn, user_id)?
            .ok_or_else(|| anyhow!("sync config for {} missing after upsert", user_id))?;
        Ok((config, created))
    }

    /// Apply preference changes. Returns `None` when the user has no connection.
    pub fn update_preferences(
        &self,
        user_id: &str,
        update: &PreferencesUpdate,
    ) -> Result<Option<SyncConfig>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"UPDATE sync_configs SET
                   enabled = COALESCE(?2, enabled),
                   direction = COALESCE(?3, direction),
                   calendar_id = COALESCE(?4, calendar_id),
                   timezone = COALESCE(?5, timezone),
                   updated_at = ?6
               WHERE user_id = ?1"#,
            params![
                user_id,
                update.enabled,
                update.direction.map(|d| d.as_str()),
                &update.calendar_id,
                &update.timezone,
                millis(Utc::now()),
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        query_config(&conn, user_id)
    }

    /// Record the watermark of a completed sync pass
    pub fn set_last_sync(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_configs SET last_sync_at = ?2, updated_at = ?2 WHERE user_id = ?1",
            params![user_id, millis(at)],
        )?;
        Ok(())
    }

    /// Remove the connection and scrub sync bookkeeping from the user's tasks.
    ///
    /// Returns false when there was nothing to remove.
    pub fn delete_sync_config(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let removed = tx.execute("DELETE FROM sync_configs WHERE user_id = ?1", params![user_id])?;
        tx.execute(
            r#"UPDATE tasks SET external_event_id = NULL, external_calendar_id = NULL,
               last_synced_at = NULL WHERE user_id = ?1"#,
            params![user_id],
        )?;

        tx.commit()?;
        Ok(removed > 0)
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    pub fn create_task(&self, user_id: &str, new: &NewTask) -> Result<Task> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = millis(Utc::now());

        conn.execute(
            r#"INSERT INTO tasks (id, user_id, title, description, date, scheduled_start,
               scheduled_end, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)"#,
            params![
                &id,
                user_id,
                &new.title,
                &new.description,
                new.date,
                new.scheduled_start,
                new.scheduled_end,
                now,
            ],
        )
        .context("Failed to create task")?;

        query_task(&conn, user_id, &id)?.ok_or_else(|| anyhow!("task {} missing after insert", id))
    }

    /// Local edit; `updated_at` moves strictly past both its previous value
    /// and `last_synced_at`, so the task is always dirty afterwards.
    pub fn update_task(&self, user_id: &str, task_id: &str, patch: &TaskPatch) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"UPDATE tasks SET
                   title = COALESCE(?3, title),
                   description = COALESCE(?4, description),
                   date = COALESCE(?5, date),
                   scheduled_start = COALESCE(?6, scheduled_start),
                   scheduled_end = COALESCE(?7, scheduled_end),
                   updated_at = MAX(?8, updated_at + 1, COALESCE(last_synced_at, 0) + 1)
               WHERE id = ?1 AND user_id = ?2"#,
            params![
                task_id,
                user_id,
                &patch.title,
                &patch.description,
                patch.date,
                patch.scheduled_start,
                patch.scheduled_end,
                millis(Utc::now()),
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        query_task(&conn, user_id, task_id)
    }

    pub fn get_task(&self, user_id: &str, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        query_task(&conn, user_id, task_id)
    }

    pub fn delete_task(&self, user_id: &str, task_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM tasks WHERE id = ?1 AND user_id = ?2",
            params![task_id, user_id],
        )?;
        Ok(removed > 0)
    }

    pub fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE user_id = ?1 ORDER BY date, scheduled_start",
            TASK_COLUMNS
        ))?;
        collect_tasks(&mut stmt, params![user_id])
    }

    /// Tasks dated `from` or later that were never pushed or changed since.
    pub fn list_dirty(&self, user_id: &str, from: NaiveDate, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"SELECT {} FROM tasks
               WHERE user_id = ?1 AND date >= ?2
                 AND (external_event_id IS NULL OR last_synced_at IS NULL
                      OR last_synced_at < updated_at)
               ORDER BY date, scheduled_start
               LIMIT ?3"#,
            TASK_COLUMNS
        ))?;
        collect_tasks(&mut stmt, params![user_id, from, limit as i64])
    }

    /// Every task dated `from` or later, regardless of sync state.
    pub fn list_future(&self, user_id: &str, from: NaiveDate) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE user_id = ?1 AND date >= ?2 ORDER BY date, scheduled_start",
            TASK_COLUMNS
        ))?;
        collect_tasks(&mut stmt, params![user_id, from])
    }

    pub fn find_by_external_id(&self, user_id: &str, event_id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM tasks WHERE user_id = ?1 AND external_event_id = ?2 LIMIT 1",
                TASK_COLUMNS
            ),
            params![user_id, event_id],
            task_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Create a task mirrored from a calendar event, already in agreement.
    pub fn insert_imported(
        &self,
        user_id: &str,
        event_id: &str,
        calendar_id: &str,
        imported: &ImportedTask,
        synced_at: DateTime<Utc>,
    ) -> Result<Task> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let at = millis(synced_at);

        conn.execute(
            r#"INSERT INTO tasks (id, user_id, title, description, date, scheduled_start,
               scheduled_end, external_event_id, external_calendar_id, last_synced_at,
               created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10)"#,
            params![
                &id,
                user_id,
                &imported.title,
                &imported.description,
                imported.date,
                imported.scheduled_start,
                imported.scheduled_end,
                event_id,
                calendar_id,
                at,
            ],
        )
        .context("Failed to insert imported task")?;

        query_task(&conn, user_id, &id)?.ok_or_else(|| anyhow!("task {} missing after import", id))
    }

    /// Overwrite a task with newer calendar-side fields.
    pub fn apply_import(
        &self,
        task_id: &str,
        imported: &ImportedTask,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE tasks SET title = ?2, description = ?3, date = ?4, scheduled_start = ?5,
               scheduled_end = ?6, last_synced_at = ?7, updated_at = ?7
               WHERE id = ?1"#,
            params![
                task_id,
                &imported.title,
                &imported.description,
                imported.date,
                imported.scheduled_start,
                imported.scheduled_end,
                millis(synced_at),
            ],
        )
        .context("Failed to apply imported event")?;
        Ok(())
    }

    /// Delete the task mirroring `event_id`. Returns false when none matched.
    pub fn delete_by_external_id(&self, user_id: &str, event_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM tasks WHERE user_id = ?1 AND external_event_id = ?2",
            params![user_id, event_id],
        )?;
        Ok(removed > 0)
    }

    /// Record a successful push.
    ///
    /// `last_synced_at` only advances when the task still has the
    /// `updated_at` it was pushed with; an edit made during the push leaves
    /// the task dirty. Returns whether the task is now in agreement.
    pub fn set_sync_bookkeeping(
        &self,
        task_id: &str,
        event_id: &str,
        calendar_id: &str,
        synced_at: DateTime<Utc>,
        pushed_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let synced = conn.execute(
            r#"UPDATE tasks SET external_event_id = ?2, external_calendar_id = ?3,
               last_synced_at = ?4
               WHERE id = ?1 AND updated_at = ?5"#,
            params![
                task_id,
                event_id,
                calendar_id,
                millis(synced_at),
                millis(pushed_updated_at)
            ],
        )?;

        if synced == 0 {
            conn.execute(
                "UPDATE tasks SET external_event_id = ?2, external_calendar_id = ?3 WHERE id = ?1",
                params![task_id, event_id, calendar_id],
            )?;
        }

        Ok(synced > 0)
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn optional_instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
    })
    .transpose()
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        date: row.get(4)?,
        scheduled_start: row.get(5)?,
        scheduled_end: row.get(6)?,
        external_event_id: row.get(7)?,
        external_calendar_id: row.get(8)?,
        last_synced_at: optional_instant(row, 9)?,
        created_at: instant(row, 10)?,
        updated_at: instant(row, 11)?,
    })
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<SyncConfig> {
    let direction_str: String = row.get(6)?;
    let direction = direction_str.parse().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Unknown stored sync direction, using default");
        SyncDirection::default()
    });

    Ok(SyncConfig {
        user_id: row.get(0)?,
        credentials: Credentials {
            access_token: row.get(1)?,
            refresh_token: row.get(2)?,
            expires_at: instant(row, 3)?,
        },
        account_email: row.get(4)?,
        enabled: row.get::<_, i32>(5)? != 0,
        direction,
        calendar_id: row.get(7)?,
        timezone: row.get(8)?,
        last_sync_at: optional_instant(row, 9)?,
        created_at: instant(row, 10)?,
        updated_at: instant(row, 11)?,
    })
}

fn query_config(conn: &Connection, user_id: &str) -> Result<Option<SyncConfig>> {
    conn.query_row(
        &format!("SELECT {} FROM sync_configs WHERE user_id = ?1", CONFIG_COLUMNS),
        params![user_id],
        config_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn query_task(conn: &Connection, user_id: &str, task_id: &str) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1 AND user_id = ?2", TASK_COLUMNS),
        params![task_id, user_id],
        task_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn collect_tasks<P: rusqlite::Params>(stmt: &mut rusqlite::Statement, params: P) -> Result<Vec<Task>> {
    let rows = stmt.query_map(params, task_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}
