//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PIPEWATCH_API_URL`, `PIPEWATCH_HUB_URL`,
//!    `PIPEWATCH_TOKEN`, `PIPEWATCH_TOKEN_FILE`
//! 2. **Config file** — path via `--config <path>`, or `pipewatch.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [api]
//! base_url = "http://localhost:5000/api"
//! request_timeout_ms = 5000
//!
//! [hub]
//! url = "http://localhost:5000/hubs/pipeline"
//! reconnect_delay_ms = 1000
//! reconnect_max_delay_ms = 30000
//! # max_reconnect_attempts = 10        # omit to retry forever
//! keepalive_interval_ms = 15000
//! server_timeout_ms = 30000
//!
//! [auth]
//! token = "eyJ..."                     # or:
//! token_file = "~/.config/pipewatch/token"
//!
//! [sync]
//! poll_interval_ms = 2000
//! notification_capacity = 50
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default file looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "pipewatch.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// REST collaborator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL the `/pipeline-runs` paths are appended to.
    #[serde(default = "default_api_url")]
    pub base_url: String,
    /// Timeout for the snapshot fetch, each poll tick and each command (default 5 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Push-channel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Hub endpoint. `http(s)://` is rewritten to `ws(s)://` at connect time.
    #[serde(default = "default_hub_url")]
    pub url: String,
    /// Initial reconnect backoff (default 1 000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Backoff ceiling (default 30 000).
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    /// Interval between client pings (default 15 000).
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Silence longer than this drops the connection (default 30 000).
    #[serde(default = "default_server_timeout_ms")]
    pub server_timeout_ms: u64,
}

/// Bearer token source. `token_file` wins over `token` when both are set,
/// since the file is re-read on every connection attempt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
}

/// Run synchronizer and aggregator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Poll interval for non-terminal runs (default 2 000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum notifications retained (default 50).
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_api_url() -> String {
    "http://localhost:5000/api".to_string()
}
fn default_hub_url() -> String {
    "http://localhost:5000/hubs/pipeline".to_string()
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_keepalive_interval_ms() -> u64 {
    15_000
}
fn default_server_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_notification_capacity() -> usize {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: None,
            keepalive_interval_ms: default_keepalive_interval_ms(),
            server_timeout_ms: default_server_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `pipewatch.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(&expand_tilde(p))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse a TOML document. Used directly by tests; file errors carry an empty path.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("PIPEWATCH_API_URL") {
            self.api.base_url = url;
        }
        if let Some(url) = var("PIPEWATCH_HUB_URL") {
            self.hub.url = url;
        }
        if let Some(token) = var("PIPEWATCH_TOKEN") {
            self.auth.token = Some(token);
        }
        if let Some(file) = var("PIPEWATCH_TOKEN_FILE") {
            self.auth.token_file = Some(PathBuf::from(file));
        }
        if let Some(file) = self.auth.token_file.take() {
            self.auth.token_file = Some(expand_tilde(&file));
        }
    }

    /// Reject values that would make the synchronizer spin or never connect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api.base_url is empty".into()));
        }
        if self.hub.url.trim().is_empty() {
            return Err(ConfigError::Invalid("hub.url is empty".into()));
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("sync.poll_interval_ms must be > 0".into()));
        }
        if self.api.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "api.request_timeout_ms must be > 0".into(),
            ));
        }
        if self.sync.notification_capacity == 0 {
            return Err(ConfigError::Invalid(
                "sync.notification_capacity must be > 0".into(),
            ));
        }
        if self.hub.reconnect_delay_ms > self.hub.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(
                "hub.reconnect_delay_ms exceeds hub.reconnect_max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.sync.poll_interval_ms, 2000);
        assert_eq!(config.sync.notification_capacity, 50);
        assert_eq!(config.api.request_timeout_ms, 5000);
        assert!(config.hub.max_reconnect_attempts.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_fill_remaining_defaults() {
        let config = Config::from_toml(
            r#"
            [hub]
            url = "https://studio.example.com/hubs/pipeline"
            max_reconnect_attempts = 4

            [sync]
            poll_interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.hub.url, "https://studio.example.com/hubs/pipeline");
        assert_eq!(config.hub.max_reconnect_attempts, Some(4));
        assert_eq!(config.hub.reconnect_max_delay_ms, 30_000);
        assert_eq!(config.sync.poll_interval_ms, 500);
        assert_eq!(config.sync.notification_capacity, 50);
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut config = Config::from_toml(
            r#"
            [api]
            base_url = "http://file/api"
            [auth]
            token = "from-file"
            "#,
        )
        .unwrap();
        config.apply_env(|key| match key {
            "PIPEWATCH_API_URL" => Some("http://env/api".into()),
            "PIPEWATCH_TOKEN" => Some("from-env".into()),
            _ => None,
        });
        assert_eq!(config.api.base_url, "http://env/api");
        assert_eq!(config.auth.token.as_deref(), Some("from-env"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = Config::from_toml("[sync]\npoll_interval_ms = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = Config::from_toml(
            "[hub]\nreconnect_delay_ms = 5000\nreconnect_max_delay_ms = 1000",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            Config::from_toml("[sync\npoll_interval_ms = 1"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
