//! Configuration file handling
//!
//! One TOML file holds `[general]` and `[cache]`. A missing file means
//! defaults; saving replaces the file atomically, like metadata records.

pub mod schema;

pub use schema::{CacheConfig, Config, GeneralConfig};

use crate::error::{WharfError, WharfResult};
use crate::metadata::store::write_durable;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.toml";

/// Location of a configuration file and the operations on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// The per-user file, see [`ConfigManager::default_config_path`]
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config_dir>/wharf/config.toml`, relative to the working directory
    /// when the platform has no config directory
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_default()
            .join("wharf")
            .join(CONFIG_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the managed file; defaults when it does not exist
    pub async fn load(&self) -> WharfResult<Config> {
        match read_config(&self.path).await? {
            Some(config) => Ok(config),
            None => {
                debug!(path = %self.path.display(), "no config file, using defaults");
                Ok(Config::default())
            }
        }
    }

    /// Read a specific file, which must exist
    pub async fn load_from_file(path: &Path) -> WharfResult<Config> {
        read_config(path).await?.ok_or_else(|| {
            WharfError::io(
                format!("reading config {}", path.display()),
                std::io::ErrorKind::NotFound.into(),
            )
        })
    }

    /// Replace the managed file with `config`
    pub async fn save(&self, config: &Config) -> WharfResult<()> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| WharfError::ConfigDirCreate {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
        }

        let text = toml::to_string_pretty(config)?;
        write_durable(self.path.clone(), text.into_bytes()).await?;

        info!(path = %self.path.display(), "saved configuration");
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_config(path: &Path) -> WharfResult<Option<Config>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(WharfError::io(
                format!("reading config {}", path.display()),
                e,
            ))
        }
    };

    toml::from_str(&text)
        .map(Some)
        .map_err(|e| WharfError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
