//! HTTP API for taskcal-sync server

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::{Database, PreferencesUpdate};
use crate::error::{ProviderError, SyncError};
use crate::models::{Credentials, NewTask, SyncConfig, SyncDirection, SyncResult, Task, TaskPatch};
use crate::provider::CalendarApi;
use crate::sync::{CalendarSync, SyncSettings};

/// Application state shared across handlers
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Config,
    pub sync: CalendarSync,
}

impl AppState {
    pub fn new(db: Arc<Database>, config: Config, calendar: Arc<dyn CalendarApi>) -> Arc<Self> {
        let sync = CalendarSync::new(
            db.clone(),
            calendar,
            SyncSettings::from(&config.calendar),
        );
        Arc::new(Self { db, config, sync })
    }
}

/// Identity resolved from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/calendar/config", get(get_config))
        .route("/api/v1/calendar/credentials", put(save_credentials))
        .route("/api/v1/calendar/preferences", patch(update_preferences))
        .route("/api/v1/calendar", delete(disconnect))
        .route("/api/v1/calendar/sync", post(sync_now))
        .route("/api/v1/calendar/push/{task_id}", post(push_task))
        .route("/api/v1/tasks", get(list_tasks).post(create_task))
        .route("/api/v1/tasks/{task_id}", patch(update_task).delete(delete_task))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskcal-sync",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - validates Bearer token and attaches the user
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    // Extract Authorization header
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Missing or invalid Authorization header" })),
            )
                .into_response();
        }
    };

    // Validate token
    let Some(user_id) = state.config.authenticate(token).map(str::to_string) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid API token" })),
        )
            .into_response();
    };

    request.extensions_mut().insert(AuthUser(user_id));
    next.run(request).await
}

/// Connection as shown to clients; tokens stay server-side
#[derive(Debug, Serialize)]
struct ConfigView<'a> {
    #[serde(flatten)]
    config: &'a SyncConfig,
    credentials_expired: bool,
}

fn config_view(config: &SyncConfig) -> Json<serde_json::Value> {
    let view = ConfigView {
        config,
        credentials_expired: config.credentials.is_expired_at(Utc::now()),
    };
    Json(serde_json::to_value(view).unwrap_or_default())
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = state
        .db
        .get_sync_config(&user_id)?
        .ok_or(SyncError::NotConnected)?;
    Ok(config_view(&config))
}

#[derive(Debug, Deserialize)]
pub struct SaveCredentialsRequest {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry; takes precedence over `expires_in`
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Lifetime in seconds from now
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub account_email: Option<String>,
}

async fn save_credentials(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(request): Json<SaveCredentialsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let expires_at = match (request.expires_at, request.expires_in) {
        (Some(at), _) => at,
        (None, Some(secs)) => Duration::try_seconds(secs)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| ApiError::BadRequest(format!("expires_in {} is out of range", secs)))?,
        (None, None) => {
            return Err(ApiError::BadRequest(
                "expires_at or expires_in is required".to_string(),
            ));
        }
    };

    let credentials = Credentials {
        access_token: request.access_token,
        refresh_token: request.refresh_token,
        expires_at,
    };

    let (config, created) = state.db.upsert_credentials(
        &user_id,
        &credentials,
        request.account_email.as_deref(),
        &state.config.calendar.default_timezone,
    )?;

    tracing::info!(user_id = %user_id, created, "Calendar credentials saved");

    if created {
        state.sync.spawn_retroactive_sync(user_id.clone());
    }

    Ok(config_view(&config))
}

#[derive(Debug, Default, Deserialize)]
pub struct PreferencesRequest {
    pub enabled: Option<bool>,
    pub direction: Option<SyncDirection>,
    pub calendar_id: Option<String>,
    pub timezone: Option<String>,
}

async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(request): Json<PreferencesRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(tz) = &request.timezone
        && tz.parse::<chrono_tz::Tz>().is_err()
    {
        return Err(ApiError::BadRequest(format!("unknown timezone '{}'", tz)));
    }
    if request.calendar_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(ApiError::BadRequest("calendar_id must not be empty".to_string()));
    }

    let update = PreferencesUpdate {
        enabled: request.enabled,
        direction: request.direction,
        calendar_id: request.calendar_id,
        timezone: request.timezone,
    };

    let config = state
        .db
        .update_preferences(&user_id, &update)?
        .ok_or(SyncError::NotConnected)?;
    Ok(config_view(&config))
}

async fn disconnect(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<StatusCode, ApiError> {
    if !state.db.delete_sync_config(&user_id)? {
        return Err(SyncError::NotConnected.into());
    }
    tracing::info!(user_id = %user_id, "Calendar disconnected");
    Ok(StatusCode::NO_CONTENT)
}

/// Run a sync pass now
async fn sync_now(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<SyncResult>, ApiError> {
    let config = state
        .db
        .get_sync_config(&user_id)?
        .ok_or(SyncError::NotConnected)?;
    if !config.enabled {
        return Err(SyncError::SyncDisabled.into());
    }

    let result = state.sync.sync_user(&user_id).await?;
    Ok(Json(result))
}

async fn push_task(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let event_id = state.sync.push_single_task(&user_id, &task_id).await?;
    Ok(Json(serde_json::json!({ "external_event_id": event_id })))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.db.list_tasks(&user_id)?))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(new): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    if new.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    let task = state.db.create_task(&user_id, &new)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .db
        .update_task(&user_id, &task_id, &patch)?
        .ok_or(SyncError::TaskNotFound(task_id))?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sync.delete_task(&user_id, &task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// API error type
#[derive(Debug)]
pub enum ApiError {
    Sync(SyncError),
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Sync(err) => match err {
                SyncError::NotConnected | SyncError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                SyncError::SyncDisabled | SyncError::PushNotAllowed => StatusCode::BAD_REQUEST,
                SyncError::CredentialsExpired | SyncError::Provider(ProviderError::Unauthorized) => {
                    StatusCode::UNAUTHORIZED
                }
                SyncError::MalformedEvent(_) | SyncError::Provider(_) => StatusCode::BAD_GATEWAY,
                SyncError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Sync(err) => err.code(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(err) => write!(f, "{}", err),
            Self::BadRequest(msg) => write!(f, "{}", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "API error");
        } else {
            tracing::debug!(error = %self, status = %status, "API request rejected");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "code": self.code() })),
        )
            .into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Sync(SyncError::Persistence(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::testing::FakeCalendar;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Harness {
        db: Arc<Database>,
        calendar: Arc<FakeCalendar>,
        router: Router,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let calendar = FakeCalendar::new();
        let mut config = Config::default();
        config.tokens.push(TokenConfig {
            name: "test".into(),
            user_id: "u1".into(),
            token_hash: "tok-u1".into(),
        });
        let state = AppState::new(db.clone(), config, calendar.clone());
        Harness {
            db,
            calendar,
            router: create_router(state),
        }
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer tok-u1");
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn credentials(expires_in: i64) -> serde_json::Value {
        serde_json::json!({
            "access_token": "secret-access",
            "refresh_token": "secret-refresh",
            "expires_in": expires_in,
            "account_email": "u1@example.com"
        })
    }

    #[tokio::test]
    async fn health_needs_no_token_but_api_does() {
        let h = harness();
        let response = h
            .router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/calendar/config")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn not_connected_and_disabled_have_distinct_statuses() {
        let h = harness();
        let (status, body) = call(&h.router, "POST", "/api/v1/calendar/sync", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_connected");

        call(&h.router, "PUT", "/api/v1/calendar/credentials", Some(credentials(3600))).await;
        let (status, body) = call(
            &h.router,
            "PATCH",
            "/api/v1/calendar/preferences",
            Some(serde_json::json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);

        let (status, body) = call(&h.router, "POST", "/api/v1/calendar/sync", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "sync_disabled");
    }

    #[tokio::test]
    async fn config_never_exposes_tokens() {
        let h = harness();
        let (status, body) =
            call(&h.router, "PUT", "/api/v1/calendar/credentials", Some(credentials(3600))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["direction"], "bidirectional");
        assert_eq!(body["calendar_id"], "primary");
        assert_eq!(body["credentials_expired"], false);

        let (_, body) = call(&h.router, "GET", "/api/v1/calendar/config", None).await;
        let text = body.to_string();
        assert!(!text.contains("secret-access"));
        assert!(!text.contains("secret-refresh"));
        assert_eq!(body["account_email"], "u1@example.com");
    }

    #[tokio::test]
    async fn expired_credentials_return_unauthorized() {
        let h = harness();
        call(&h.router, "PUT", "/api/v1/calendar/credentials", Some(credentials(-60))).await;

        let (status, body) = call(&h.router, "POST", "/api/v1/calendar/sync", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "credentials_expired");
        assert_eq!(h.calendar.calls(), 0);
    }

    #[tokio::test]
    async fn sync_reports_partial_failures_with_ok() {
        let h = harness();
        call(&h.router, "PUT", "/api/v1/calendar/credentials", Some(credentials(3600))).await;
        h.calendar.fail_title("Broken");
        let date = (Utc::now() + Duration::days(1)).date_naive().to_string();
        for title in ["Gym", "Broken"] {
            call(
                &h.router,
                "POST",
                "/api/v1/tasks",
                Some(serde_json::json!({ "title": title, "date": date })),
            )
            .await;
        }

        let (status, body) = call(&h.router, "POST", "/api/v1/calendar/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        let errors = body["errors"].as_array().unwrap();
        assert!(errors.iter().any(|e| e.as_str().unwrap().contains("Broken")));
    }

    #[tokio::test]
    async fn push_single_task_returns_event_id() {
        let h = harness();
        call(&h.router, "PUT", "/api/v1/calendar/credentials", Some(credentials(3600))).await;
        let (status, task) = call(
            &h.router,
            "POST",
            "/api/v1/tasks",
            Some(serde_json::json!({
                "title": "Gym",
                "date": "2026-02-16",
                "scheduled_start": "18:00:00",
                "scheduled_end": "19:30:00"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let task_id = task["id"].as_str().unwrap();

        let (status, body) =
            call(&h.router, "POST", &format!("/api/v1/calendar/push/{task_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let event_id = body["external_event_id"].as_str().unwrap();
        let payload = h.calendar.stored()[event_id].clone();
        assert_eq!(payload.start.date_time, "2026-02-16T18:00:00");

        let (status, body) =
            call(&h.router, "POST", "/api/v1/calendar/push/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "task_not_found");
    }

    #[tokio::test]
    async fn disconnect_scrubs_and_then_reports_not_connected() {
        let h = harness();
        call(&h.router, "PUT", "/api/v1/calendar/credentials", Some(credentials(3600))).await;
        let task = h
            .db
            .create_task(
                "u1",
                &NewTask {
                    title: "Gym".into(),
                    description: None,
                    date: Utc::now().date_naive(),
                    scheduled_start: None,
                    scheduled_end: None,
                },
            )
            .unwrap();
        h.db.set_sync_bookkeeping(&task.id, "evt-x", "primary", Utc::now(), task.updated_at)
            .unwrap();

        let (status, _) = call(&h.router, "DELETE", "/api/v1/calendar", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let stored = h.db.get_task("u1", &task.id).unwrap().unwrap();
        assert_eq!(stored.external_event_id, None);

        let (status, _) = call(&h.router, "DELETE", "/api/v1/calendar", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_preferences_are_rejected() {
        let h = harness();
        call(&h.router, "PUT", "/api/v1/calendar/credentials", Some(credentials(3600))).await;
        let (status, _) = call(
            &h.router,
            "PATCH",
            "/api/v1/calendar/preferences",
            Some(serde_json::json!({ "timezone": "Mars/Olympus" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &h.router,
            "PATCH",
            "/api/v1/calendar/preferences",
            Some(serde_json::json!({ "direction": "from_google", "timezone": "Asia/Tokyo" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["direction"], "from_google");
        assert_eq!(body["timezone"], "Asia/Tokyo");
    }

    #[tokio::test]
    async fn out_of_range_expiry_is_rejected() {
        let h = harness();
        for expires_in in [9_000_000_000_000_000_i64, i64::MAX, i64::MIN] {
            let (status, body) = call(
                &h.router,
                "PUT",
                "/api/v1/calendar/credentials",
                Some(credentials(expires_in)),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], "bad_request");
        }
        assert!(h.db.get_sync_config("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn credentials_require_an_expiry() {
        let h = harness();
        let (status, _) = call(
            &h.router,
            "PUT",
            "/api/v1/calendar/credentials",
            Some(serde_json::json!({ "access_token": "a", "refresh_token": "r" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.db.get_sync_config("u1").unwrap().is_none());
    }
}
