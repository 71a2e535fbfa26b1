//! Server configuration
//!
//! Plain structs with defaults and consuming setters. [`ServerConfig::from_env`]
//! reads overrides from `QUAY_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `QUAY_HOST` | `host` |
//! | `QUAY_PORT` | `port` |
//! | `QUAY_WORKERS` | `workers` |
//! | `QUAY_CONTEXT_ROOT` | `context_root` |
//! | `QUAY_STATIC_DIR` | `static_files.root` |
//! | `QUAY_STATIC_MAX_AGE` | `static_files.max_age` (seconds, negative disables) |
//! | `QUAY_STATIC_CACHE_BYTES` | `static_files.max_cache_size` |
//! | `QUAY_STATIC_DISABLED` | `static_files.enabled` (inverted) |
//! | `QUAY_SHUTDOWN_TIMEOUT_MS` | `shutdown_timeout` |
//! | `QUAY_MAX_BODY_SIZE` | `max_body_size` |
//!
//! Absent or unparseable values keep the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CONTEXT_ROOT: &str = "/";
pub const DEFAULT_STATIC_DIR: &str = "static";
/// One week
pub const DEFAULT_CLIENT_CACHE_MAX_AGE: i64 = 7 * 24 * 60 * 60;
/// 32 MiB
pub const DEFAULT_LOCAL_CACHE_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// 10 MiB
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Static file serving configuration
#[derive(Debug, Clone)]
pub struct StaticServingConfig {
    /// Directory files are served from
    pub root: PathBuf,
    /// In-memory cache capacity in bytes
    pub max_cache_size: usize,
    /// `Cache-Control: max-age` in seconds; negative omits the header
    pub max_age: i64,
    pub enabled: bool,
    /// File served for directory requests
    pub index: Option<String>,
    max_cached_file_size: Option<usize>,
    max_cached_files: Option<usize>,
}

impl Default for StaticServingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STATIC_DIR),
            max_cache_size: DEFAULT_LOCAL_CACHE_SIZE,
            max_age: DEFAULT_CLIENT_CACHE_MAX_AGE,
            enabled: true,
            index: Some("index.html".to_string()),
            max_cached_file_size: None,
            max_cached_files: None,
        }
    }
}

impl StaticServingConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn max_cache_size(mut self, bytes: usize) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = seconds;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn index(mut self, index: Option<String>) -> Self {
        self.index = index;
        self
    }

    /// Override the largest file kept in the cache (default: capacity / 2)
    pub fn max_cached_file_size(mut self, bytes: usize) -> Self {
        self.max_cached_file_size = Some(bytes);
        self
    }

    /// Override the number of files kept in the cache (default: capacity / 1024)
    pub fn max_cached_files(mut self, count: usize) -> Self {
        self.max_cached_files = Some(count);
        self
    }

    pub fn effective_max_cached_file_size(&self) -> usize {
        self.max_cached_file_size.unwrap_or(self.max_cache_size / 2)
    }

    pub fn effective_max_cached_files(&self) -> usize {
        self.max_cached_files.unwrap_or(self.max_cache_size / 1024)
    }

    /// `Cache-Control` value sent with static files
    pub fn cache_control(&self) -> Option<String> {
        (self.max_age >= 0).then(|| format!("max-age={}", self.max_age))
    }
}

/// Whole-server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Runtime worker threads
    pub workers: usize,
    pub context_root: String,
    pub static_files: StaticServingConfig,
    /// How long `stop` waits for open connections to drain
    pub shutdown_timeout: Duration,
    /// Largest request body read into memory; multipart-enabled routes use
    /// their own `MultipartConfig::max_request_size` instead
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workers: num_cpus::get(),
            context_root: DEFAULT_CONTEXT_ROOT.to_string(),
            static_files: StaticServingConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("QUAY_HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = parsed(&lookup, "QUAY_PORT") {
            config.port = port;
        }
        if let Some(workers) = parsed::<usize, _>(&lookup, "QUAY_WORKERS").filter(|w| *w > 0) {
            config.workers = workers;
        }
        if let Some(root) = lookup("QUAY_CONTEXT_ROOT") {
            config.context_root = root;
        }
        if let Some(dir) = lookup("QUAY_STATIC_DIR").filter(|d| !d.trim().is_empty()) {
            config.static_files.root = PathBuf::from(dir);
        }
        if let Some(max_age) = parsed(&lookup, "QUAY_STATIC_MAX_AGE") {
            config.static_files.max_age = max_age;
        }
        if let Some(bytes) = parsed(&lookup, "QUAY_STATIC_CACHE_BYTES") {
            config.static_files.max_cache_size = bytes;
        }
        if let Some(disabled) = lookup("QUAY_STATIC_DISABLED").and_then(|v| parse_bool(&v)) {
            config.static_files.enabled = !disabled;
        }
        if let Some(ms) = parsed(&lookup, "QUAY_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parsed(&lookup, "QUAY_MAX_BODY_SIZE") {
            config.max_body_size = bytes;
        }

        config
    }

    /// Context root with blank values mapped to `/` and trailing slashes removed
    pub fn normalized_context_root(&self) -> String {
        normalize_context_root(&self.context_root)
    }
}

pub(crate) fn normalize_context_root(root: &str) -> String {
    let trimmed = root.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_CONTEXT_ROOT.to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
