//! TOML-based configuration for a ledger.
//!
//! Every field has a default, so an empty file (or no file at all, via
//! [`LedgerConfig::default`]) yields a usable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::pagination::PageLimits;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level ledger configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Where commits are kept.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Page size bounds for listings and notifications.
    #[serde(default)]
    pub pagination: PaginationConfig,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            pagination: PaginationConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding the SQLite databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Keep everything in memory; `data_dir` is ignored.
    #[serde(default)]
    pub in_memory: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/ledger")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            in_memory: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Page size bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Entries per `get_entries` / snapshot listing page.
    #[serde(default = "default_entries_page_size")]
    pub entries_page_size: usize,

    /// Entries per diff page.
    #[serde(default = "default_diff_page_size")]
    pub diff_page_size: usize,

    /// Changed plus deleted entries per watcher notification.
    #[serde(default = "default_change_page_size")]
    pub change_page_size: usize,

    /// Summed key and value bytes per listing page.
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: usize,
}

fn default_entries_page_size() -> usize {
    64
}
fn default_diff_page_size() -> usize {
    32
}
fn default_change_page_size() -> usize {
    64
}
fn default_max_page_bytes() -> usize {
    64 * 1024
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            entries_page_size: default_entries_page_size(),
            diff_page_size: default_diff_page_size(),
            change_page_size: default_change_page_size(),
            max_page_bytes: default_max_page_bytes(),
        }
    }
}

/// Limits handed to every page loop of a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSettings {
    pub entries: PageLimits,
    pub diff: PageLimits,
    pub change_page_size: usize,
}

impl Default for PageSettings {
    fn default() -> Self {
        PaginationConfig::default().page_settings()
    }
}

impl PaginationConfig {
    pub fn page_settings(&self) -> PageSettings {
        PageSettings {
            entries: PageLimits::new(self.entries_page_size, self.max_page_bytes),
            diff: PageLimits::new(self.diff_page_size, self.max_page_bytes),
            change_page_size: self.change_page_size.max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl LedgerConfig {
    /// Load a [`LedgerConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: LedgerConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("pagination.entries_page_size", self.pagination.entries_page_size),
            ("pagination.diff_page_size", self.pagination.diff_page_size),
            ("pagination.change_page_size", self.pagination.change_page_size),
        ];
        for (field, size) in sizes {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: "page size must be > 0".into(),
                });
            }
        }
        if self.pagination.max_page_bytes < 1024 {
            return Err(ConfigError::InvalidValue {
                field: "pagination.max_page_bytes".into(),
                detail: "must be at least 1024".into(),
            });
        }
        if !self.storage.in_memory && self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "storage.data_dir".into(),
                detail: "data directory must not be empty".into(),
            });
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".into(),
                detail: format!("unknown level '{}'", self.log_level),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, for writing a starter file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn page_settings(&self) -> PageSettings {
        self.pagination.page_settings()
    }

    /// Path of the SQLite database for a ledger without identity.
    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join("ledger.db")
    }
}
