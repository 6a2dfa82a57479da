//! Configuration loading and store folder resolution

use crate::fsutil::atomic_write;
use crate::params::PipelineParams;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the artifact store folder
pub const STORE_DIR_ENV: &str = "MSMP_STORE_DIR";

/// Configuration loaded from TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Artifact store folder (optional)
    ///
    /// If not specified, will attempt environment → OS default
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Pipeline parameter defaults (optional)
    #[serde(default)]
    pub pipeline: PipelineParams,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

fn default_log_level() -> String {
    "info".to_string()
}

/// Load TOML configuration
///
/// A missing file is not an error: defaults are returned with a warning.
/// A file that exists but cannot be parsed is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!("Config file {} not found, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;

    config.pipeline.validate()?;
    info!("Loaded TOML configuration from {}", path.display());
    Ok(config)
}

/// Write TOML configuration atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    atomic_write(path, content.as_bytes())
}

/// Store folder resolution, priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable `MSMP_STORE_DIR`
/// 3. TOML config file `store_dir`
/// 4. OS-dependent default (fallback)
pub fn resolve_store_dir(cli_arg: Option<&Path>, toml_config: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(STORE_DIR_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &toml_config.store_dir {
        return path.clone();
    }

    // Priority 4: OS-dependent default
    default_store_dir()
}

/// Default configuration file path (`~/.config/msmp/config.toml` on Linux)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("msmp").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("msmp.toml"))
}

/// OS-dependent default store folder
pub fn default_store_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/msmp
        dirs::data_local_dir()
            .map(|d| d.join("msmp"))
            .unwrap_or_else(|| PathBuf::from("./msmp_store"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/msmp
        dirs::data_dir()
            .map(|d| d.join("msmp"))
            .unwrap_or_else(|| PathBuf::from("./msmp_store"))
    } else {
        dirs::data_local_dir()
            .map(|d| d.join("msmp"))
            .unwrap_or_else(|| PathBuf::from("./msmp_store"))
    }
}
