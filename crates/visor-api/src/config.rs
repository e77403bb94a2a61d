//! Server configuration.
//!
//! Loaded from a TOML file located by `VISOR_CONFIG` (default
//! `./visor.toml`). `${VAR}` references in the file are replaced from the
//! environment before parsing, and a few server settings can be overridden
//! directly by environment variables:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `HOST` | `server.host` |
//! | `PORT` | `server.port` |
//! | `VISOR_PAGE_SIZE` | `server.page_size` |
//! | `VISOR_CACHE_PATH` | `server.image_cache_path` |

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use visor_core::defaults;
use visor_inference::ExtractorConfig;
use visor_search::RegularizationPolicy;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "./visor.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidEnv(String, String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Ranking entries per page; 0 returns everything as one page.
    pub page_size: usize,
    pub image_cache_path: PathBuf,
    pub download_workers: usize,
    pub download_timeout_secs: u64,
    pub download_max_bytes: u64,
    pub event_bus_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: defaults::SERVER_PORT,
            page_size: defaults::PAGE_SIZE,
            image_cache_path: PathBuf::from(defaults::IMAGE_CACHE_PATH),
            download_workers: defaults::DOWNLOAD_WORKERS,
            download_timeout_secs: defaults::DOWNLOAD_TIMEOUT_SECS,
            download_max_bytes: defaults::DOWNLOAD_MAX_BYTES,
            event_bus_capacity: defaults::EVENT_BUS_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.download_workers == 0 {
            return Err(ConfigError::Validation(
                "server.download_workers must be at least 1".to_string(),
            ));
        }
        if self.download_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "server.download_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.event_bus_capacity == 0 {
            return Err(ConfigError::Validation(
                "server.event_bus_capacity must be at least 1".to_string(),
            ));
        }
        if self.image_cache_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "server.image_cache_path must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[index]` section: precomputed feature files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub dataset_feats_file: PathBuf,
    pub dataset_base_path: PathBuf,
    pub neg_feats_file: PathBuf,
    pub neg_base_path: PathBuf,
}

impl IndexConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("dataset_feats_file", &self.dataset_feats_file),
            ("dataset_base_path", &self.dataset_base_path),
            ("neg_feats_file", &self.neg_feats_file),
        ] {
            if value.as_os_str().is_empty() {
                return Err(ConfigError::Validation(format!("index.{} must be set", name)));
            }
        }
        Ok(())
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisorConfig {
    pub server: ServerConfig,
    pub extractor: ExtractorConfig,
    pub index: IndexConfig,
    pub svm: RegularizationPolicy,
}

impl VisorConfig {
    /// Config file path from `VISOR_CONFIG`, or the default.
    pub fn config_path() -> PathBuf {
        env::var("VISOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load, apply environment overrides and validate.
    ///
    /// A missing config file is not an error by itself; the defaults are
    /// used, which then fail validation unless the index files are set.
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            info!("Loading config from: {}", path.display());
            Self::parse_file(&path)?
        } else {
            debug!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file, without environment overrides.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text after `${VAR}` substitution.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let content = Self::substitute_env_vars(content);
        Ok(toml::from_str(&content)?)
    }

    fn parse_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `HOST`, `PORT`, `VISOR_PAGE_SIZE` and `VISOR_CACHE_PATH`.
    pub fn apply_env_overrides<F>(&mut self, get: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("PORT".to_string(), port))?;
        }
        if let Some(page_size) = get("VISOR_PAGE_SIZE") {
            self.server.page_size = page_size
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("VISOR_PAGE_SIZE".to_string(), page_size))?;
        }
        if let Some(cache) = get("VISOR_CACHE_PATH") {
            self.server.image_cache_path = PathBuf::from(cache);
        }
        Ok(())
    }

    /// Check every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.server.validate()?;
        self.index.validate()?;
        self.extractor
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        self.svm
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(())
    }

    /// Substitute environment variables in the format ${VAR_NAME}.
    fn substitute_env_vars(content: &str) -> String {
        let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
            Ok(re) => re,
            Err(_) => return content.to_string(),
        };
        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        })
        .to_string()
    }
}
