//! Updater Configuration Module
//! Handles loading and validating updater.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::updater::signature::KeyPoint;

pub const CONFIG_FILE_NAME: &str = "updater.config.json";
pub const CONFIG_ENV_VAR: &str = "DELTAUP_CONFIG";

/// `$DELTAUP_CONFIG`, else `<data dir>/deltaup/updater.config.json`
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    dirs::data_dir().map(|d| d.join("deltaup").join(CONFIG_FILE_NAME))
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Index is fetched from `<base_url>/index`
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Version of the originally installed bundle
    pub current_version: u32,
    pub cache_dir: PathBuf,
    pub original_bundle: PathBuf,
    /// Hex SEC1 public keys, compressed or uncompressed
    pub trusted_keys: Vec<String>,
    pub required_signers: usize,
    /// Rewrite patch URLs onto `base_url`, for local mirrors
    #[serde(default)]
    pub override_urls: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_index_bytes")]
    pub max_index_bytes: u64,
    #[serde(default)]
    pub bundle_extension: Option<String>,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
}

fn default_user_agent() -> String {
    format!("deltaup-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_index_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_entry_point() -> String {
    "main".to_string()
}

impl UpdaterConfig {
    pub fn new(
        base_url: &str,
        current_version: u32,
        cache_dir: PathBuf,
        original_bundle: PathBuf,
        trusted_keys: &[KeyPoint],
        required_signers: usize,
    ) -> Self {
        Self {
            base_url: base_url.to_string(),
            user_agent: default_user_agent(),
            current_version,
            cache_dir,
            original_bundle,
            trusted_keys: trusted_keys.iter().map(KeyPoint::to_hex).collect(),
            required_signers,
            override_urls: false,
            connect_timeout_secs: default_connect_timeout(),
            max_index_bytes: default_max_index_bytes(),
            bundle_extension: None,
            entry_point: default_entry_point(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `updater.config.json` from a directory
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&dir.join(CONFIG_FILE_NAME))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url is empty".to_string()));
        }
        if self.required_signers == 0 {
            return Err(ConfigError::Invalid(
                "required_signers must be at least 1".to_string(),
            ));
        }
        let keys = self.trusted_key_points()?;
        if self.required_signers > keys.len() {
            return Err(ConfigError::Invalid(format!(
                "required_signers is {} but only {} trusted key(s) are configured",
                self.required_signers,
                keys.len()
            )));
        }
        Ok(())
    }

    pub fn trusted_key_points(&self) -> Result<Vec<KeyPoint>, ConfigError> {
        self.trusted_keys
            .iter()
            .map(|hex| {
                KeyPoint::from_hex(hex)
                    .map_err(|e| ConfigError::Invalid(format!("trusted key {hex}: {e}")))
            })
            .collect()
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn index_url(&self) -> String {
        format!("{}/index", self.base_url())
    }

    /// Explicit extension, else the original bundle's, else `bundle`
    pub fn bundle_extension(&self) -> String {
        self.bundle_extension
            .clone()
            .or_else(|| {
                self.original_bundle
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| "bundle".to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
