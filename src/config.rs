//! Client configuration parsed from environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::path::PathBuf;
use std::time::Duration;

use crate::session::keeper::{
    DEFAULT_DEBOUNCE_MS, DEFAULT_MIN_LIFETIME_MS, DEFAULT_REFRESH_WINDOW_MS, DEFAULT_RENEWED_LIFETIME_MS,
    RefreshPolicy,
};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STORE_PATH: &str = ".lisa/session.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    /// Overrides the user id otherwise decoded from the credential.
    pub user: Option<String>,
    pub history_page_size: u32,
    pub timeouts: HttpTimeouts,
    pub refresh: RefreshPolicy,
    pub store_path: PathBuf,
    pub voice_output: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_owned(),
            user: None,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            timeouts: HttpTimeouts {
                request_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            },
            refresh: RefreshPolicy::default(),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            voice_output: false,
        }
    }
}

impl ClientConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `LISA_API_BASE_URL`: default `http://127.0.0.1:8000`
    /// - `LISA_USER`: user id override
    /// - `LISA_HISTORY_PAGE_SIZE`: default 50, must be positive
    /// - `LISA_REQUEST_TIMEOUT_SECS`: default 120
    /// - `LISA_CONNECT_TIMEOUT_SECS`: default 10
    /// - `LISA_REFRESH_DEBOUNCE_MS`: default 500
    /// - `LISA_REFRESH_WINDOW_MS`: default 30000
    /// - `LISA_RENEWED_LIFETIME_MS`: default 180000
    /// - `LISA_MIN_LIFETIME_MS`: default 45000
    /// - `LISA_STORE_PATH`: default `.lisa/session.json`
    /// - `LISA_VOICE_OUTPUT`: `1`/`true` enables speech hand-off
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed base URL or page size.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an injectable variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a malformed base URL or page size.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup("LISA_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                var: "LISA_API_BASE_URL",
                reason: format!("expected an http(s) URL, got '{base_url}'"),
            });
        }

        let history_page_size = parse_or(&lookup, "LISA_HISTORY_PAGE_SIZE", DEFAULT_HISTORY_PAGE_SIZE);
        if history_page_size == 0 {
            return Err(ConfigError::Invalid { var: "LISA_HISTORY_PAGE_SIZE", reason: "must be positive".to_owned() });
        }

        let refresh = RefreshPolicy {
            debounce: Duration::from_millis(parse_or(&lookup, "LISA_REFRESH_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)),
            refresh_window: Duration::from_millis(parse_or(
                &lookup,
                "LISA_REFRESH_WINDOW_MS",
                DEFAULT_REFRESH_WINDOW_MS,
            )),
            renewed_lifetime: Duration::from_millis(parse_or(
                &lookup,
                "LISA_RENEWED_LIFETIME_MS",
                DEFAULT_RENEWED_LIFETIME_MS,
            )),
            min_lifetime: Duration::from_millis(parse_or(&lookup, "LISA_MIN_LIFETIME_MS", DEFAULT_MIN_LIFETIME_MS)),
        };

        Ok(Self {
            base_url,
            user: lookup("LISA_USER").filter(|u| !u.trim().is_empty()),
            history_page_size,
            timeouts: HttpTimeouts {
                request_secs: parse_or(&lookup, "LISA_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                connect_secs: parse_or(&lookup, "LISA_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            },
            refresh,
            store_path: lookup("LISA_STORE_PATH").map_or_else(|| PathBuf::from(DEFAULT_STORE_PATH), PathBuf::from),
            voice_output: lookup("LISA_VOICE_OUTPUT").is_some_and(|v| parse_flag(&v)),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
