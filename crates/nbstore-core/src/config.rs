//! Store configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/nbstore/config.toml)
//! 3. Environment variables (NBSTORE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::identity::SpaceIdentity;

/// Environment variable prefix
const ENV_PREFIX: &str = "NBSTORE";

/// Default capacity of status event channels
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding every space database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Buffered status events per subscriber before it starts lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Default log filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            event_capacity: default_event_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl StoreConfig {
    /// Configuration rooted at `data_dir`, everything else defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (NBSTORE_DATA_DIR, NBSTORE_EVENT_CAPACITY, NBSTORE_LOG_LEVEL)
    /// 2. Config file (~/.config/nbstore/config.toml or NBSTORE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: StoreConfig =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_EVENT_CAPACITY", ENV_PREFIX)) {
            match val.parse::<usize>() {
                Ok(capacity) if capacity > 0 => self.event_capacity = capacity,
                _ => warn!(value = %val, "ignoring invalid {}_EVENT_CAPACITY", ENV_PREFIX),
            }
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with NBSTORE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nbstore")
            .join("config.toml")
    }

    /// Database file of a space under this configuration
    pub fn space_db_path(&self, identity: &SpaceIdentity) -> PathBuf {
        identity.db_path(&self.data_dir)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nbstore")
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SpaceType;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "NBSTORE_DATA_DIR",
        "NBSTORE_EVENT_CAPACITY",
        "NBSTORE_LOG_LEVEL",
        "NBSTORE_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.ends_with("nbstore"));
    }

    #[test]
    fn test_space_db_path() {
        let config = StoreConfig::with_data_dir("/data/nbstore");
        let identity = SpaceIdentity::new("local", SpaceType::Userspace, "u-1");
        assert_eq!(
            config.space_db_path(&identity),
            PathBuf::from("/data/nbstore/userspace/u-1__local/storage.db")
        );
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = StoreConfig::default();

        env::set_var("NBSTORE_DATA_DIR", "/tmp/nbstore-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/nbstore-test"));
    }

    #[test]
    fn test_env_override_event_capacity() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = StoreConfig::default();

        env::set_var("NBSTORE_EVENT_CAPACITY", "32");
        config.apply_env_overrides();
        assert_eq!(config.event_capacity, 32);

        // Garbage and zero are ignored
        env::set_var("NBSTORE_EVENT_CAPACITY", "lots");
        config.apply_env_overrides();
        assert_eq!(config.event_capacity, 32);

        env::set_var("NBSTORE_EVENT_CAPACITY", "0");
        config.apply_env_overrides();
        assert_eq!(config.event_capacity, 32);
    }

    #[test]
    fn test_env_override_log_level() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = StoreConfig::default();

        env::set_var("NBSTORE_LOG_LEVEL", "debug");
        config.apply_env_overrides();
        assert_eq!(config.log_level, "debug");

        // Empty string keeps the current level
        env::set_var("NBSTORE_LOG_LEVEL", "");
        config.apply_env_overrides();
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_config_file_path_override() {
        let _guard = EnvGuard::new(ENV_VARS);

        assert!(StoreConfig::config_file_path().ends_with("nbstore/config.toml"));

        env::set_var("NBSTORE_CONFIG", "/etc/nbstore.toml");
        assert_eq!(
            StoreConfig::config_file_path(),
            PathBuf::from("/etc/nbstore.toml")
        );
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = StoreConfig {
            data_dir: PathBuf::from("/data/nbstore"),
            event_capacity: 64,
            log_level: "warn".to_string(),
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("event_capacity"));

        let parsed: StoreConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            event_capacity = 8
        "#;

        let config = StoreConfig::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_from_path_creates_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("spaces");

        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, format!("data_dir = {:?}\n", data_dir)).unwrap();

        let config = StoreConfig::load_from_path(&config_path).unwrap();
        assert_eq!(config.data_dir, data_dir);
        assert!(data_dir.is_dir());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        env::set_var("NBSTORE_DATA_DIR", temp_dir.path());

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = StoreConfig::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.data_dir, temp_dir.path());
    }
}
