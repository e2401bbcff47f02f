//! Configuration file parser for `feedsieve.toml`.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos. Command-line flags override file values after
//! loading; the resulting value is built once at startup and passed down.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Server configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
///
/// SEC-015: Custom Debug impl masks `admin_token` to prevent secret leakage
/// in logs, error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the database file.
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`.
    pub database_file: String,

    /// Address the HTTP server binds to.
    pub bind_address: String,

    pub port: u16,

    /// Externally visible base URL, used for the feed's self link.
    /// Defaults to `http://{bind_address}:{port}`.
    pub public_base_url: Option<String>,

    /// Sources older than this many days are evicted.
    pub retention_days: u64,

    /// Minutes between background retention sweeps. 0 = no periodic sweep.
    pub sweep_interval_minutes: u64,

    /// Also sweep (in the background) after each merged-feed request.
    pub sweep_on_read: bool,

    /// Upper bound for one source fetch, retries included.
    pub fetch_timeout_secs: u64,

    /// Sources fetched in parallel for one request.
    pub max_concurrent_fetches: usize,

    /// Merged-feed requests processed at once; extra requests get 503.
    pub max_concurrent_aggregations: usize,

    /// Cap on entries in one merged feed (0 = unlimited).
    pub max_feed_entries: usize,

    /// Permit sources on localhost and private networks.
    pub allow_private_sources: bool,

    /// Bearer token required by the admin routes. Open when unset.
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_file: "feedsieve.db".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 5050,
            public_base_url: None,
            retention_days: 7,
            sweep_interval_minutes: 60,
            sweep_on_read: false,
            fetch_timeout_secs: 15,
            max_concurrent_fetches: 8,
            max_concurrent_aggregations: 32,
            max_feed_entries: 0,
            allow_private_sources: false,
            admin_token: None,
        }
    }
}

/// SEC-015: Mask admin_token in Debug output to prevent secret leakage.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("database_file", &self.database_file)
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("public_base_url", &self.public_base_url)
            .field("retention_days", &self.retention_days)
            .field("sweep_interval_minutes", &self.sweep_interval_minutes)
            .field("sweep_on_read", &self.sweep_on_read)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("max_concurrent_aggregations", &self.max_concurrent_aggregations)
            .field("max_feed_entries", &self.max_feed_entries)
            .field("allow_private_sources", &self.allow_private_sources)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "data_dir",
                "database_file",
                "bind_address",
                "port",
                "public_base_url",
                "retention_days",
                "sweep_interval_minutes",
                "sweep_on_read",
                "fetch_timeout_secs",
                "max_concurrent_fetches",
                "max_concurrent_aggregations",
                "max_feed_entries",
                "allow_private_sources",
                "admin_token",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), port = config.port, "Loaded configuration");
        Ok(config)
    }

    /// Full path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Base URL used to build absolute self links, without trailing slash.
    pub fn base_url(&self) -> String {
        self.public_base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{}", self.bind_addr()))
    }

    pub fn retention_window(&self) -> chrono::Duration {
        i64::try_from(self.retention_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    /// `None` when periodic sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_minutes > 0)
            .then(|| Duration::from_secs(self.sweep_interval_minutes.saturating_mul(60)))
    }
}

// ============================================================================
// Tests
// ============================================================================
