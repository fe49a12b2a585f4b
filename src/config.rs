//! Configuration file support for lazytodo
//!
//! Reads `config.toml` from `LAZYTODO_CONFIG` or the platform config
//! directory (e.g. `~/.config/lazytodo/config.toml`).

use crate::error::{Error, Result};
use crate::wal::WalConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "LAZYTODO_CONFIG";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub wal: WalSettings,

    #[serde(default)]
    pub archive: ArchiveConfig,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// Database file; `LAZYTODO_DB_PATH` still takes precedence
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Write-ahead log settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WalSettings {
    /// Quiet period before a batch of operations is applied
    /// Default: 100
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Depth of the undo stack
    /// Default: 100
    #[serde(default = "default_undo_limit")]
    pub undo_limit: usize,

    /// Undone operations older than this are removed by `gc`
    /// Default: 30
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_undo_limit() -> usize {
    100
}

fn default_retention_days() -> u32 {
    30
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            undo_limit: default_undo_limit(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ArchiveConfig {
    /// Completed todos older than this many days are archived at startup.
    /// 0 disables auto-archiving.
    #[serde(default = "default_auto_archive_days")]
    pub auto_archive_days: u32,
}

fn default_auto_archive_days() -> u32 {
    7
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            auto_archive_days: default_auto_archive_days(),
        }
    }
}

impl Config {
    /// Load the config file, falling back to defaults when it is missing or
    /// unreadable
    pub fn load() -> Self {
        match Self::find_config_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring config file");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Parse a specific file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        directories::ProjectDirs::from("", "", "lazytodo")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            debounce: Duration::from_millis(self.wal.debounce_ms),
            undo_limit: self.wal.undo_limit,
        }
    }

    /// Age after which completed todos are archived, if enabled
    pub fn auto_archive_after(&self) -> Option<chrono::Duration> {
        match self.archive.auto_archive_days {
            0 => None,
            days => Some(chrono::Duration::days(i64::from(days))),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.wal.retention_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.wal.debounce_ms, 100);
        assert_eq!(config.wal.undo_limit, 100);
        assert_eq!(config.retention(), chrono::Duration::days(30));
        assert_eq!(config.auto_archive_after(), Some(chrono::Duration::days(7)));
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
path = "/tmp/todos.db"

[wal]
debounce_ms = 250

[archive]
auto_archive_days = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.path, Some(PathBuf::from("/tmp/todos.db")));
        assert_eq!(config.wal_config().debounce, Duration::from_millis(250));
        // Unset keys keep their defaults
        assert_eq!(config.wal.undo_limit, 100);
        assert_eq!(config.auto_archive_after(), None);
    }

    #[test]
    fn test_load_from_missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_invalid_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[wal\ndebounce_ms = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
