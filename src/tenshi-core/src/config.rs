use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            adapters: AdaptersConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file_name: None,
        }
    }
}

/// Content adapter discovery and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptersConfig {
    /// Extra directories searched for adapter manifests, after the data dir's `adapters/`.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
    /// Keep adapters bound after discovery instead of binding on first request.
    #[serde(default)]
    pub auto_connect: bool,
    /// Background worker threads for discovery and stream requests.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Give up waiting for an adapter connection after this many milliseconds.
    /// Unset means wait until the adapter connects or disconnects.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

impl AdaptersConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Adapter directories in search order.
    pub fn search_dirs(&self, dirs: &AppDirs) -> Vec<PathBuf> {
        let mut out = vec![dirs.adapters_dir().to_path_buf()];
        for dir in &self.dirs {
            if !out.contains(dir) {
                out.push(dir.clone());
            }
        }
        out
    }
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            auto_connect: false,
            worker_threads: default_worker_threads(),
            connect_timeout_ms: None,
        }
    }
}

/// Persistent storage handed to adapters between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    #[serde(default = "default_storage_file")]
    pub file_name: String,
}

impl StorageConfig {
    pub fn path(&self, dirs: &AppDirs) -> PathBuf {
        dirs.data_dir().join(&self.file_name)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            file_name: default_storage_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("adapters.worker_threads must be at least 1")]
    NoWorkerThreads,
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents, &path)
    }

    fn from_toml_str(contents: &str, path: &std::path::Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        if self.adapters.worker_threads == 0 {
            return Err(ValidationError::NoWorkerThreads);
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

fn default_worker_threads() -> usize {
    4
}

fn default_storage_enabled() -> bool {
    true
}

fn default_storage_file() -> String {
    "storage.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.max_log_files, 7);
        assert!(config.logging.stdout);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(!config.adapters.auto_connect);
        assert_eq!(config.adapters.worker_threads, 4);
        assert!(config.adapters.connect_timeout().is_none());
        assert!(config.storage.enabled);
    }

    #[test]
    fn invalid_version_rejected() {
        let mut config = Config::default();
        config.config_version = CURRENT_CONFIG_VERSION + 1;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.adapters.worker_threads = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::NoWorkerThreads)
        ));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml = r#"
            [adapters]
            auto_connect = true
            connect_timeout_ms = 1500
            dirs = ["/opt/tenshi/adapters"]

            [logging]
            level = "debug"
        "#;
        let config = Config::from_toml_str(toml, Path::new("config.toml")).unwrap();
        assert!(config.adapters.auto_connect);
        assert_eq!(
            config.adapters.connect_timeout(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.adapters.worker_threads, 4);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.storage.file_name, "storage.json");
    }

    #[test]
    fn search_dirs_put_data_dir_first_without_duplicates() {
        let dirs = AppDirs::from_roots(Path::new("/cfg"), Path::new("/data"));
        let adapters = AdaptersConfig {
            dirs: vec![PathBuf::from("/data/adapters"), PathBuf::from("/opt/a")],
            ..AdaptersConfig::default()
        };
        let search = adapters.search_dirs(&dirs);
        assert_eq!(
            search,
            vec![PathBuf::from("/data/adapters"), PathBuf::from("/opt/a")]
        );
    }
}
