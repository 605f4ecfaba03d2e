//! Client configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the client can start with zero
//! configuration for local development.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;

use xpsync_shared::constants::{
    DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_FOLLOW_UP_DELAY_MS, DEFAULT_MAX_BATCH_SIZE,
    DEFAULT_MIN_FLUSH_INTERVAL_SECS,
};

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the API that hosts the sync endpoints.
    /// Env: `XPSYNC_BASE_URL`
    /// Default: `http://localhost:8080`
    pub base_url: String,

    /// Directory holding the outbox stores.
    /// Env: `XPSYNC_DATA_DIR`
    /// Default: the platform data directory (`~/.local/share/xpsync` on Linux).
    pub data_dir: PathBuf,

    /// Period of the manager's flush timer.
    /// Env: `XPSYNC_FLUSH_INTERVAL_SECS`
    /// Default: 10 s
    pub flush_interval: Duration,

    /// Minimum spacing between two successful flush passes.
    /// Env: `XPSYNC_MIN_FLUSH_INTERVAL_SECS`
    /// Default: 5 s
    pub min_flush_interval: Duration,

    /// Maximum number of events per request.
    /// Env: `XPSYNC_MAX_BATCH_SIZE`
    /// Default: 50
    pub max_batch_size: usize,

    /// Delay before flushing again when a batch left events behind.
    /// Env: `XPSYNC_FOLLOW_UP_DELAY_MS`
    /// Default: 1000 ms
    pub follow_up_delay: Duration,

    /// Optional per-request timeout. Unset means no timeout: failure is only
    /// inferred from a transport error or a non-success status.
    /// Env: `XPSYNC_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            data_dir: default_data_dir(),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            min_flush_interval: Duration::from_secs(DEFAULT_MIN_FLUSH_INTERVAL_SECS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            follow_up_delay: Duration::from_millis(DEFAULT_FOLLOW_UP_DELAY_MS),
            request_timeout: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("XPSYNC_BASE_URL") {
            if url.trim().is_empty() {
                tracing::warn!("Empty XPSYNC_BASE_URL, using default");
            } else {
                config.base_url = url.trim_end_matches('/').to_string();
            }
        }

        if let Ok(dir) = std::env::var("XPSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(secs) = parse_var::<u64>("XPSYNC_FLUSH_INTERVAL_SECS") {
            if secs == 0 {
                tracing::warn!("XPSYNC_FLUSH_INTERVAL_SECS must be positive, using default");
            } else {
                config.flush_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_var::<u64>("XPSYNC_MIN_FLUSH_INTERVAL_SECS") {
            config.min_flush_interval = Duration::from_secs(secs);
        }

        if let Some(n) = parse_var::<usize>("XPSYNC_MAX_BATCH_SIZE") {
            if n == 0 {
                tracing::warn!("XPSYNC_MAX_BATCH_SIZE must be positive, using default");
            } else {
                config.max_batch_size = n;
            }
        }

        if let Some(ms) = parse_var::<u64>("XPSYNC_FOLLOW_UP_DELAY_MS") {
            config.follow_up_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_var::<u64>("XPSYNC_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }

    /// Defaults with the stores rooted at `dir`; handy for tests and embedding.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("com", "xpsync", "xpsync")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./xpsync-data"))
}

/// Read and parse an env var, warning (and returning `None`) on bad input.
fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.min_flush_interval, Duration::from_secs(5));
        assert_eq!(config.max_batch_size, 50);
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn test_with_data_dir() {
        let config = SyncConfig::with_data_dir("/tmp/outbox");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/outbox"));
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        std::env::set_var("XPSYNC_TEST_PARSE_GARBAGE", "ten");
        assert_eq!(parse_var::<u64>("XPSYNC_TEST_PARSE_GARBAGE"), None);
        std::env::set_var("XPSYNC_TEST_PARSE_OK", " 42 ");
        assert_eq!(parse_var::<u64>("XPSYNC_TEST_PARSE_OK"), Some(42));
    }
}
