//! Configuration resolution for reindex-watcher
//!
//! Priority: command line → environment → TOML → built-in default. The CLI
//! layer is applied by `main`; this module merges environment overrides into
//! the TOML configuration of the resolved root folder.

use reindex_common::config::{database_path, resolve_root_folder, TomlConfig};
use reindex_common::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const ROOT_FOLDER_ENV: &str = "REINDEX_ROOT_FOLDER";
pub const SOURCE_URL_ENV: &str = "REINDEX_SOURCE_URL";
pub const SOURCE_TOKEN_ENV: &str = "REINDEX_SOURCE_TOKEN";
pub const ES_URL_ENV: &str = "REINDEX_ES_URL";

/// Fully resolved watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub root_folder: PathBuf,
    pub database_path: PathBuf,
    pub settings: TomlConfig,
}

impl WatcherConfig {
    /// Resolve the root folder, load its TOML and apply environment overrides
    pub fn resolve(cli_root_folder: Option<&Path>) -> Result<Self> {
        let root_folder = resolve_root_folder(cli_root_folder, ROOT_FOLDER_ENV);
        let mut settings = TomlConfig::load(Some(&root_folder))?;
        let overridden = apply_env_overrides(&mut settings);
        if !overridden.is_empty() {
            info!(keys = ?overridden, "Configuration overridden from environment");
        }
        debug!(root_folder = %root_folder.display(), "Configuration resolved");

        Ok(Self {
            database_path: database_path(&root_folder),
            root_folder,
            settings,
        })
    }

    pub fn default_store_code(&self) -> &str {
        &self.settings.default_store_code
    }
}

/// Apply `REINDEX_*` environment variables; returns the keys that changed
pub fn apply_env_overrides(config: &mut TomlConfig) -> Vec<&'static str> {
    let mut overridden = Vec::new();

    if let Some(url) = env_value(SOURCE_URL_ENV) {
        config.source.url = url;
        overridden.push("source.url");
    }
    if let Some(token) = env_value(SOURCE_TOKEN_ENV) {
        config.source.access_token = Some(token);
        overridden.push("source.access_token");
    }
    if let Some(url) = env_value(ES_URL_ENV) {
        config.document_store.url = url;
        overridden.push("document_store.url");
    }

    overridden
}

/// Non-blank environment value
fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reindex_common::config::CONFIG_FILE_NAME;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        for name in [ROOT_FOLDER_ENV, SOURCE_URL_ENV, SOURCE_TOKEN_ENV, ES_URL_ENV] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_cli_root_folder_and_toml_are_used() {
        clear_env();
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "default_store_code = \"en\"\n[source]\nurl = \"http://toml.test/rest\"\n",
        )
        .unwrap();

        let config = WatcherConfig::resolve(Some(dir.path())).unwrap();
        assert_eq!(config.root_folder, dir.path());
        assert_eq!(config.database_path, dir.path().join("reindexer.db"));
        assert_eq!(config.default_store_code(), "en");
        assert_eq!(config.settings.source.url, "http://toml.test/rest");
    }

    #[test]
    #[serial]
    fn test_environment_overrides_toml() {
        clear_env();
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[source]\nurl = \"http://toml.test/rest\"\n",
        )
        .unwrap();
        std::env::set_var(ROOT_FOLDER_ENV, dir.path());
        std::env::set_var(SOURCE_URL_ENV, "http://env.test/rest");
        std::env::set_var(SOURCE_TOKEN_ENV, "secret");
        std::env::set_var(ES_URL_ENV, "  ");

        let config = WatcherConfig::resolve(None).unwrap();
        clear_env();

        assert_eq!(config.root_folder, dir.path());
        assert_eq!(config.settings.source.url, "http://env.test/rest");
        assert_eq!(config.settings.source.access_token.as_deref(), Some("secret"));
        // Blank values are ignored
        assert_eq!(config.settings.document_store.url, "http://localhost:9200");
    }
}
