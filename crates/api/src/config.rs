//! Application configuration loaded from environment variables.

use std::time::Duration;

use projections::CatchupConfig;
use scheduler::DEFAULT_CLOCK;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `text` or `json` (default: `text`)
/// - `DATABASE_URL` — PostgreSQL connection string; in-memory stores when unset
/// - `CATCHUP_BATCH_SIZE` — most events per catchup run (default: `10000`)
/// - `CATCHUP_POLL_INTERVAL_MS` — catchup polling interval (default: `1000`)
/// - `CATCHUP_LOCK_TIMEOUT_MS` — wait for the catchup lock (default: `5000`)
/// - `SCHEDULER_DEFAULT_CLOCK` — clock for commands naming none (default: `"default"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub catchup_batch_size: u64,
    pub catchup_poll_interval: Duration,
    pub catchup_lock_timeout: Duration,
    pub scheduler_default_clock: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => defaults.log_format,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            catchup_batch_size: parsed("CATCHUP_BATCH_SIZE").unwrap_or(defaults.catchup_batch_size),
            catchup_poll_interval: parsed("CATCHUP_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.catchup_poll_interval),
            catchup_lock_timeout: parsed("CATCHUP_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.catchup_lock_timeout),
            scheduler_default_clock: lookup("SCHEDULER_DEFAULT_CLOCK").unwrap_or(defaults.scheduler_default_clock),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn catchup_config(&self) -> CatchupConfig {
        CatchupConfig {
            batch_size: self.catchup_batch_size,
            lock_timeout: self.catchup_lock_timeout,
            ..CatchupConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            catchup_batch_size: 10_000,
            catchup_poll_interval: Duration::from_millis(1000),
            catchup_lock_timeout: Duration::from_millis(5000),
            scheduler_default_clock: DEFAULT_CLOCK.to_string(),
        }
    }
}
