//! Error types for calendar sync

use thiserror::Error;

/// Failure talking to the calendar provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// 401 from the provider; the user has to reconnect.
    #[error("calendar credentials rejected by provider")]
    Unauthorized,

    #[error("calendar event not found: {0}")]
    NotFound(String),

    #[error("calendar API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("calendar request failed: {0}")]
    Transport(String),

    #[error("invalid calendar response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport("request timeout".to_string())
        } else if err.is_connect() {
            Self::Transport(format!("connection failed: {}", err))
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Sync failure, either for a whole pass or a single item
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("calendar is not connected")]
    NotConnected,

    #[error("calendar sync is disabled")]
    SyncDisabled,

    #[error("sync direction does not allow pushing to the calendar")]
    PushNotAllowed,

    #[error("calendar credentials expired, reconnect required")]
    CredentialsExpired,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("malformed calendar event {0}")]
    MalformedEvent(String),

    #[error(transparent)]
    Provider(ProviderError),

    #[error("local store error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unauthorized => Self::CredentialsExpired,
            other => Self::Provider(other),
        }
    }
}

impl SyncError {
    /// Short machine-readable name, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::SyncDisabled => "sync_disabled",
            Self::PushNotAllowed => "push_not_allowed",
            Self::CredentialsExpired => "credentials_expired",
            Self::TaskNotFound(_) => "task_not_found",
            Self::MalformedEvent(_) => "malformed_event",
            Self::Provider(_) => "provider_error",
            Self::Persistence(_) => "persistence_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
