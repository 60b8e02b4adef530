//! Client configuration parsed from environment variables.
//!
//! Every field has a default so a bare environment yields a usable config
//! pointed at a local server. The CLI layers its flags over these values.

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::time::Duration;

use crate::error::ValidationError;
use crate::names;

/// Errors produced while building a [`SyncConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration value could not be parsed.
    #[error("config parse failed: {0}")]
    Parse(String),
    /// A configured value failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_CANVAS_SIZE: u32 = 50;
pub const MIN_CANVAS_SIZE: u32 = 10;
pub const MAX_CANVAS_SIZE: u32 = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

/// What the session does when the initial snapshot cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotFallback {
    /// Drop the freshly opened channel and schedule a reconnect.
    #[default]
    Retry,
    /// Keep the channel and start from an empty grid/log.
    EmptyBaseline,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: `initial * 2^(attempt-1)`, capped at `max`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }

    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// HTTP base URL of the read/write endpoints, without trailing slash.
    pub base_url: String,
    /// Author name stamped on pixels and messages.
    pub author_id: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub snapshot_fallback: SnapshotFallback,
}

impl SyncConfig {
    /// Build a config with defaults and a random author name.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            author_id: names::random_author(),
            canvas_width: DEFAULT_CANVAS_SIZE,
            canvas_height: DEFAULT_CANVAS_SIZE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            reconnect: ReconnectPolicy::default(),
            snapshot_fallback: SnapshotFallback::default(),
        }
    }

    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `PIXAME_BASE_URL`: default `http://127.0.0.1:8080`
    /// - `PIXAME_AUTHOR`: random `<Adjective><Noun><n>` when absent
    /// - `PIXAME_CANVAS_WIDTH` / `PIXAME_CANVAS_HEIGHT`: default 50, clamped to 10..=100
    /// - `PIXAME_REQUEST_TIMEOUT_SECS`: default 10
    /// - `PIXAME_CONNECT_TIMEOUT_SECS`: default 5
    /// - `PIXAME_RECONNECT_INITIAL_MS` / `PIXAME_RECONNECT_MAX_MS`: default 1000 / 10000
    /// - `PIXAME_RECONNECT_MAX_ATTEMPTS`: unlimited when absent
    /// - `PIXAME_SNAPSHOT_FALLBACK`: `retry` (default) or `empty`
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid author name, an unknown fallback mode,
    /// a malformed reconnect setting or a zero initial reconnect delay.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("PIXAME_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());
        let mut config = Self::new(base_url);

        if let Ok(author) = std::env::var("PIXAME_AUTHOR") {
            config.author_id = names::validate_author(&author)?;
        }
        config.canvas_width = clamp_canvas(env_parse("PIXAME_CANVAS_WIDTH", DEFAULT_CANVAS_SIZE));
        config.canvas_height = clamp_canvas(env_parse("PIXAME_CANVAS_HEIGHT", DEFAULT_CANVAS_SIZE));
        config.request_timeout =
            Duration::from_secs(env_parse("PIXAME_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS));
        config.connect_timeout =
            Duration::from_secs(env_parse("PIXAME_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS));
        let initial_ms = env_require("PIXAME_RECONNECT_INITIAL_MS")?.unwrap_or(DEFAULT_RECONNECT_INITIAL_MS);
        if initial_ms == 0 {
            return Err(ConfigError::Parse("PIXAME_RECONNECT_INITIAL_MS must be at least 1".to_owned()));
        }
        config.reconnect = ReconnectPolicy {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(env_parse("PIXAME_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)),
            max_attempts: env_require("PIXAME_RECONNECT_MAX_ATTEMPTS")?,
        };
        config.snapshot_fallback = parse_fallback(std::env::var("PIXAME_SNAPSHOT_FALLBACK").ok().as_deref())?;

        Ok(config)
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = normalize_base_url(base_url);
        self
    }

    /// Set the canvas dimensions, clamped to the supported range.
    #[must_use]
    pub fn with_canvas_size(mut self, width: u32, height: u32) -> Self {
        self.canvas_width = clamp_canvas(width);
        self.canvas_height = clamp_canvas(height);
        self
    }

    /// Replace the author name after validation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidAuthor`] for an empty or overlong name.
    pub fn with_author(mut self, author: &str) -> Result<Self, ValidationError> {
        self.author_id = names::validate_author(author)?;
        Ok(self)
    }
}

#[must_use]
pub fn clamp_canvas(size: u32) -> u32 {
    size.clamp(MIN_CANVAS_SIZE, MAX_CANVAS_SIZE)
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_owned()
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Like [`env_parse`], but a value that is set and malformed is an error.
fn env_require<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("invalid {key} '{raw}'"))),
        Err(_) => Ok(None),
    }
}

fn parse_fallback(raw: Option<&str>) -> Result<SnapshotFallback, ConfigError> {
    match raw.unwrap_or("retry") {
        "retry" => Ok(SnapshotFallback::Retry),
        "empty" => Ok(SnapshotFallback::EmptyBaseline),
        other => Err(ConfigError::Parse(format!(
            "unknown PIXAME_SNAPSHOT_FALLBACK '{other}' (expected 'retry' or 'empty')"
        ))),
    }
}
