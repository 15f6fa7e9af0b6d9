//! Runtime Configuration
//!
//! Handles parsing and management of dynffi.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ffi::{Abi, OpenMode, DEFAULT_CAPACITY};

/// File name searched for by `find_and_load`.
pub const CONFIG_FILE: &str = "dynffi.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching dynffi.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DynffiConfig {
    /// Library loading
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Async dispatch
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Variadic call interface cache
    #[serde(default)]
    pub variadic: VariadicConfig,

    /// Calling convention
    #[serde(default)]
    pub abi: AbiConfig,
}

impl DynffiConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: DynffiConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Library loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    /// Directories searched before the platform defaults
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Resolve symbols on first use
    #[serde(default = "default_true")]
    pub lazy: bool,

    /// Export loaded symbols to later loads
    #[serde(default)]
    pub global: bool,
}

fn default_true() -> bool {
    true
}

impl LoaderConfig {
    pub fn open_mode(&self) -> OpenMode {
        OpenMode {
            lazy: self.lazy,
            global: self.global,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            lazy: true,
            global: false,
        }
    }
}

/// Async dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Worker threads executing async calls
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Variadic call interface cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariadicConfig {
    /// Cached interfaces before the oldest is evicted (0 = unbounded)
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for VariadicConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Calling convention.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AbiConfig {
    /// Raw libffi ABI value; the platform default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<u32>,
}

impl AbiConfig {
    pub fn abi(&self) -> Abi {
        match self.default {
            Some(raw) => Abi::from_raw(raw as _),
            None => Abi::DEFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DynffiConfig::default();
        assert!(config.loader.lazy);
        assert!(!config.loader.global);
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.variadic.capacity, 1024);
        assert_eq!(config.abi.abi(), Abi::DEFAULT);
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[loader]
search_paths = ["/opt/keylite/lib"]
lazy = false

[dispatch]
workers = 2

[variadic]
capacity = 0
"#;
        let config: DynffiConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.loader.search_paths, vec![PathBuf::from("/opt/keylite/lib")]);
        assert!(!config.loader.lazy);
        assert_eq!(config.dispatch.workers, 2);
        assert_eq!(config.variadic.capacity, 0);
        assert!(config.abi.default.is_none());
    }

    #[test]
    fn test_find_and_load_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut config = DynffiConfig::default();
        config.dispatch.workers = 7;
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = DynffiConfig::find_and_load(&nested).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DynffiConfig::load(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
