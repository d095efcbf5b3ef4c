//! In-memory calendar used by the sync tests

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::error::ProviderError;
use crate::models::{Credentials, EventPayload, ExternalEvent, SyncConfig};
use crate::provider::CalendarApi;

#[derive(Default)]
struct FakeState {
    stored: BTreeMap<String, EventPayload>,
    calendars: BTreeMap<String, String>,
    listed: Vec<ExternalEvent>,
    failing_titles: HashSet<String>,
    deleted: Vec<String>,
    unauthorized: bool,
    list_fails: bool,
    create_delay: Option<std::time::Duration>,
    creates: usize,
    updates: usize,
    calls: usize,
}

/// Records every call; events pushed to it are kept by id
#[derive(Default)]
pub struct FakeCalendar {
    state: Mutex<FakeState>,
}

impl FakeCalendar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Events returned by `list_events`
    pub fn set_listed(&self, events: Vec<ExternalEvent>) {
        self.state().listed = events;
    }

    /// Creates and updates for this title fail with a 500
    pub fn fail_title(&self, title: &str) {
        self.state().failing_titles.insert(title.to_string());
    }

    /// Every call fails with a 401
    pub fn reject_credentials(&self) {
        self.state().unauthorized = true;
    }

    /// Every create waits this long before answering
    pub fn slow_creates(&self, delay: std::time::Duration) {
        self.state().create_delay = Some(delay);
    }

    pub fn fail_listing(&self) {
        self.state().list_fails = true;
    }

    pub fn stored(&self) -> BTreeMap<String, EventPayload> {
        self.state().stored.clone()
    }

    /// Calendar an event currently lives in
    pub fn calendar_of(&self, event_id: &str) -> Option<String> {
        self.state().calendars.get(event_id).cloned()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn calls(&self) -> usize {
        self.state().calls
    }

    pub fn creates(&self) -> usize {
        self.state().creates
    }

    pub fn updates(&self) -> usize {
        self.state().updates
    }

    fn check(&self, summary: Option<&str>) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls += 1;
        if state.unauthorized {
            return Err(ProviderError::Unauthorized);
        }
        if let Some(summary) = summary
            && state.failing_titles.contains(summary)
        {
            return Err(ProviderError::Api {
                status: 500,
                body: "backend error".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarApi for FakeCalendar {
    async fn create_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<String, ProviderError> {
        self.check(Some(&payload.summary))?;
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.creates += 1;
        let id = format!("evt-{}", state.creates);
        state.stored.insert(id.clone(), payload.clone());
        state.calendars.insert(id.clone(), calendar_id.to_string());
        Ok(id)
    }

    async fn update_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        event_id: &str,
        payload: &EventPayload,
    ) -> Result<String, ProviderError> {
        self.check(Some(&payload.summary))?;
        let mut state = self.state();
        if state.calendars.get(event_id).map(String::as_str) != Some(calendar_id) {
            return Err(ProviderError::NotFound(event_id.to_string()));
        }
        state.updates += 1;
        state.stored.insert(event_id.to_string(), payload.clone());
        Ok(event_id.to_string())
    }

    async fn list_events(
        &self,
        _access_token: &str,
        _calendar_id: &str,
        _time_min: DateTime<Utc>,
        _time_max: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, ProviderError> {
        self.check(None)?;
        let state = self.state();
        if state.list_fails {
            return Err(ProviderError::Transport("connection reset".to_string()));
        }
        Ok(state.listed.clone())
    }

    async fn delete_event(
        &self,
        _access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError> {
        self.check(None)?;
        let mut state = self.state();
        state.deleted.push(event_id.to_string());
        if state.calendars.get(event_id).map(String::as_str) != Some(calendar_id) {
            return Err(ProviderError::NotFound(event_id.to_string()));
        }
        state.calendars.remove(event_id);
        state.stored.remove(event_id);
        Ok(())
    }
}

/// Credentials valid for another hour
pub fn valid_credentials() -> Credentials {
    Credentials {
        access_token: "access".to_string(),
        refresh_token: "refresh".to_string(),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

/// Fresh database with a connected, enabled user `u1`
pub fn connected(timezone: &str) -> (Arc<Database>, SyncConfig) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let (config, _) = db
        .upsert_credentials("u1", &valid_credentials(), Some("u1@example.com"), timezone)
        .unwrap();
    (db, config)
}
