//! Configuration for taskcal-sync server

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::provider::GOOGLE_CALENDAR_API;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// Calendar provider and sync tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Base URL of the calendar REST API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum number of dirty tasks pushed per pass
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,

    /// How many days ahead events are imported
    #[serde(default = "default_import_window_days")]
    pub import_window_days: i64,

    /// Timezone given to new connections
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// User the token authenticates as
    pub user_id: String,
    /// The hashed API token (argon2 hash, or plain text for backwards compat)
    pub token_hash: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_db_path() -> PathBuf {
    PathBuf::from("taskcal-sync.sqlite")
}

fn default_api_base() -> String {
    GOOGLE_CALENDAR_API.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_push_batch_size() -> usize {
    50
}

fn default_import_window_days() -> i64 {
    30
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
            push_batch_size: default_push_batch_size(),
            import_window_days: default_import_window_days(),
            default_timezone: default_timezone(),
        }
    }
}

impl CalendarConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: default_bind(),
                port: default_port(),
            },
            database: DatabaseConfig {
                path: default_db_path(),
            },
            calendar: CalendarConfig::default(),
            tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("TASKCAL_SYNC_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Check /data/config.toml (Docker default)
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        // Then check XDG config
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("taskcal-sync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        if config.calendar.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!(
                "Invalid calendar.default_timezone '{}'",
                config.calendar.default_timezone
            );
        }

        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let with_comments = format!(
            "# taskcal-sync configuration\n\n\
             {}\n\n\
             # Add tokens with: taskcal-sync token --name <device-name> --user <user-id>\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// Resolve a bearer token to the user it belongs to (supports both
    /// hashed and legacy plain tokens)
    pub fn authenticate(&self, token: &str) -> Option<&str> {
        let argon2 = Argon2::default();

        self.tokens
            .iter()
            .find(|t| match PasswordHash::new(&t.token_hash) {
                Ok(parsed_hash) => argon2
                    .verify_password(token.as_bytes(), &parsed_hash)
                    .is_ok(),
                // Fallback: plain text comparison (legacy/backwards compat)
                Err(_) => t.token_hash == token,
            })
            .map(|t| t.user_id.as_str())
    }
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}
