//! Calendar provider client
//!
//! [`CalendarApi`] is the seam the sync engine talks through. It holds no
//! credentials; every call takes the user's access token, so one client is
//! shared by all users.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::models::{EventPayload, EventStatus, EventTime, ExternalEvent};

/// Base URL for Google Calendar API v3.
pub const GOOGLE_CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

const PAGE_SIZE: &str = "250";

/// Operations the sync engine needs from a calendar service
#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// Create an event and return its provider identifier.
    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<String, ProviderError>;

    /// Update an existing event and return its provider identifier.
    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        payload: &EventPayload,
    ) -> Result<String, ProviderError>;

    /// Events overlapping `[time_min, time_max)`, cancelled ones included,
    /// ordered by start time.
    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, ProviderError>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError>;
}

/// Google Calendar REST client
#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl GoogleCalendarClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(event_id)
        )
    }

    async fn list_page(
        &self,
        access_token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<EventListResponse, ProviderError> {
        let mut request = self
            .http_client
            .get(self.events_url(calendar_id))
            .bearer_auth(access_token)
            .query(&[
                ("timeMin", time_min.to_rfc3339()),
                ("timeMax", time_max.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
                ("showDeleted", "true".to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
            ]);

        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = check_status(request.send().await?).await?;
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse events: {}", e)))
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<String, ProviderError> {
        let response = self
            .http_client
            .post(self.events_url(calendar_id))
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await?;

        let created: EventRef = check_status(response).await?.json().await?;
        Ok(created.id)
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        payload: &EventPayload,
    ) -> Result<String, ProviderError> {
        let response = self
            .http_client
            .patch(self.event_url(calendar_id, event_id))
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await?;

        let updated: EventRef = check_status(response).await?.json().await?;
        Ok(updated.id)
    }

    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, ProviderError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();

        loop {
            let page = self
                .list_page(
                    access_token,
                    calendar_id,
                    time_min,
                    time_max,
                    page_token.as_deref(),
                )
                .await?;

            events.extend(page.items.into_iter().filter_map(convert_event));

            match page.next_page_token {
                Some(token) if seen_tokens.insert(token.clone()) => page_token = Some(token),
                Some(token) => {
                    warn!(calendar_id = %calendar_id, page_token = %token, "page token repeated, stopping");
                    break;
                }
                None => break,
            }
        }

        debug!("fetched {} events from calendar {}", events.len(), calendar_id);
        Ok(events)
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> Result<(), ProviderError> {
        let response = self
            .http_client
            .delete(self.event_url(calendar_id, event_id))
            .bearer_auth(access_token)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}

/// Map provider status codes onto [`ProviderError`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ProviderError::Unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
        return Err(ProviderError::NotFound(body));
    }

    Err(ProviderError::Api {
        status: status.as_u16(),
        body,
    })
}

fn convert_event(event: ApiEvent) -> Option<ExternalEvent> {
    let Some(id) = event.id.filter(|id| !id.is_empty()) else {
        warn!("skipping calendar event without id");
        return None;
    };

    let updated = event.updated.as_deref().and_then(|raw| {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| warn!(event_id = %id, "failed to parse updated timestamp: {}", e))
            .ok()
    });

    Some(ExternalEvent {
        start: event.start.as_ref().and_then(parse_event_time),
        end: event.end.as_ref().and_then(parse_event_time),
        status: EventStatus::parse(event.status.as_deref()),
        summary: event.summary.unwrap_or_default(),
        description: event.description,
        updated,
        id,
    })
}

fn parse_event_time(time: &ApiEventTime) -> Option<EventTime> {
    if let Some(raw) = time.date_time.as_deref() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(EventTime::DateTime(dt.with_timezone(&Utc)));
        }
        return NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|at| EventTime::Floating {
                at,
                time_zone: time.time_zone.clone(),
            })
            .map_err(|e| warn!("failed to parse event dateTime '{}': {}", raw, e))
            .ok();
    }

    let raw = time.date.as_deref()?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(EventTime::Date)
        .map_err(|e| warn!("failed to parse event date '{}': {}", raw, e))
        .ok()
}

/// Response from the events.list endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    #[serde(default)]
    items: Vec<ApiEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEvent {
    id: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    status: Option<String>,
    start: Option<ApiEventTime>,
    end: Option<ApiEventTime>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEventTime {
    date_time: Option<String>,
    date: Option<String>,
    time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventRef {
    id: String,
}
