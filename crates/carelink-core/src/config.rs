//! Configuration management.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default chat server base URL.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:4000/api";

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Base URL of the chat server REST surface.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Bearer token sent with every request, if any.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub outbox: OutboxSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
}

/// Retry behaviour of the offline outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Attempts after which an item is abandoned.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
        }
    }
}

/// Inbound pull and connectivity probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Attempts per server fetch before the fetch counts as failed.
    pub fetch_attempts: u32,
    pub fetch_retry_delay_ms: u64,
    pub probe_interval_secs: u64,
    /// How often a connected manager retries the outbox and pulls.
    pub sync_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_attempts: 3,
            fetch_retry_delay_ms: 500,
            probe_interval_secs: 15,
            sync_interval_secs: 30,
        }
    }
}

/// Retention sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_message_age_days: u32,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_message_age_days: 90,
            sweep_interval_secs: 3_600,
        }
    }
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            server_url: default_server_url(),
            auth_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            outbox: OutboxSettings::default(),
            sync: SyncSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override fields from `CARELINK_*` variables resolved by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("CARELINK_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            self.log_level = level;
        }
        if let Some(url) = lookup("CARELINK_SERVER_URL").filter(|v| !v.trim().is_empty()) {
            self.server_url = url;
        }
        if let Some(token) = lookup("CARELINK_AUTH_TOKEN").filter(|v| !v.trim().is_empty()) {
            self.auth_token = Some(token);
        }
    }

    /// Reject settings the rest of the stack cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        self.server_url()?;
        if self.outbox.max_attempts == 0 {
            return Err(CoreError::Config(
                "outbox.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sync.fetch_attempts == 0 {
            return Err(CoreError::Config(
                "sync.fetch_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the server URL as a parsed URL.
    pub fn server_url(&self) -> CoreResult<Url> {
        Url::parse(&self.server_url).map_err(CoreError::from)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
