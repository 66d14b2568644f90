//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from a TOML file. Every section is optional;
//! missing keys fall back to built-in defaults. Resolution order for values
//! that can also be given on the command line or in the environment:
//!
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Built-in default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the config file looked up inside the root folder
pub const CONFIG_FILE_NAME: &str = "reindexer.toml";

/// Name of the SQLite database inside the root folder
pub const DATABASE_FILE_NAME: &str = "reindexer.db";

/// Store code treated as the default store when none is configured
pub const DEFAULT_STORE_CODE: &str = "default";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Folder holding the database (optional, see [`resolve_root_folder`])
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Store code whose documents live in the unprefixed collections
    #[serde(default = "default_store_code")]
    pub default_store_code: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub document_store: DocumentStoreConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            default_store_code: default_store_code(),
            logging: LoggingConfig::default(),
            source: SourceConfig::default(),
            document_store: DocumentStoreConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Catalog source (Magento REST API) connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Base REST URL, e.g. `http://shop.local/rest`
    #[serde(default = "default_source_url")]
    pub url: String,

    /// Integration access token sent as a bearer token
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            access_token: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// Document store (Elasticsearch) connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentStoreConfig {
    #[serde(default = "default_es_url")]
    pub url: String,

    /// Physical indices are named `{index_prefix}_{collection}`
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            url: default_es_url(),
            index_prefix: default_index_prefix(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// Scheduler and import engine tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Concurrent reindex jobs drained by one watcher
    #[serde(default = "default_max_active_jobs")]
    pub max_active_jobs: usize,

    /// Source records fetched per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Concurrent item consumers while draining a page
    #[serde(default = "default_max_active_item_workers")]
    pub max_active_item_workers: usize,

    /// Fixed delay between item retries
    #[serde(default = "default_item_backoff_ms")]
    pub item_backoff_ms: u64,

    /// Fixed delay between reindex job retries
    #[serde(default = "default_job_backoff_ms")]
    pub job_backoff_ms: u64,

    /// Idle sleep between claim attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum pending ids picked up by a single job pass
    #[serde(default = "default_dedup_page_limit")]
    pub dedup_page_limit: usize,

    /// Watchdog window; a run making no progress for this long is stalled
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,

    /// Delete documents not touched by a clean full run
    #[serde(default)]
    pub cleanup_stale: bool,

    /// Maximum total time spent retrying a locked database write
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: default_max_active_jobs(),
            page_size: default_page_size(),
            max_active_item_workers: default_max_active_item_workers(),
            item_backoff_ms: default_item_backoff_ms(),
            job_backoff_ms: default_job_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            dedup_page_limit: default_dedup_page_limit(),
            watchdog_secs: default_watchdog_secs(),
            cleanup_stale: false,
            max_lock_wait_ms: default_max_lock_wait_ms(),
        }
    }
}

fn default_store_code() -> String {
    DEFAULT_STORE_CODE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_url() -> String {
    "http://localhost/rest".to_string()
}

fn default_es_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_index_prefix() -> String {
    "catalog".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_max_active_jobs() -> usize {
    1
}

fn default_page_size() -> u32 {
    500
}

fn default_max_active_item_workers() -> usize {
    10
}

fn default_item_backoff_ms() -> u64 {
    60_000
}

fn default_job_backoff_ms() -> u64 {
    20_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_dedup_page_limit() -> usize {
    1_000
}

fn default_watchdog_secs() -> u64 {
    120
}

fn default_max_lock_wait_ms() -> u64 {
    5_000
}

impl TomlConfig {
    /// Load configuration from an explicit TOML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load configuration for a root folder
    ///
    /// Looks for `reindexer.toml` in the root folder, then the user config
    /// directory. Returns defaults when neither exists.
    pub fn load(root_folder: Option<&Path>) -> Result<Self> {
        match find_config_file(root_folder) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                Self::load_from(&path)
            }
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Write configuration to a TOML file, creating parent directories
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Root folder resolution:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `root_folder` key in the user TOML config file
/// 4. OS-dependent default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>, env_var_name: &str) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(config_path) = user_config_file() {
        if let Ok(config) = TomlConfig::load_from(&config_path) {
            if let Some(root_folder) = config.root_folder {
                return root_folder;
            }
        }
    }

    default_root_folder()
}

/// Path of the SQLite database inside a root folder
pub fn database_path(root_folder: &Path) -> PathBuf {
    root_folder.join(DATABASE_FILE_NAME)
}

fn find_config_file(root_folder: Option<&Path>) -> Option<PathBuf> {
    if let Some(root) = root_folder {
        let candidate = root.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    user_config_file()
}

/// `~/.config/reindexer/config.toml` (or the platform equivalent)
fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("reindexer").join("config.toml"))
        .filter(|p| p.exists())
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("reindexer"))
        .unwrap_or_else(|| PathBuf::from("./reindexer_data"))
}
