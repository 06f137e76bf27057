//! Configuration loading and validation for the operations service.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    pub storages: Vec<Storage>,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Storage {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HooksConfig {
    /// Global hooks directory consulted before the repository's own
    /// `custom_hooks/` directory.
    #[serde(default)]
    pub custom_hooks_dir: Option<String>,
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            custom_hooks_dir: None,
            timeout_secs: default_hook_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid toml: {0}")]
    InvalidToml(#[from] toml::de::Error),
    #[error("`listen_addr` must not be empty")]
    EmptyListenAddr,
    #[error("`listen_addr` is not a socket address: `{0}`")]
    InvalidListenAddr(String),
    #[error("at least one storage must be configured")]
    EmptyStorages,
    #[error("storage name must not be empty")]
    EmptyStorageName,
    #[error("duplicate storage name `{0}`")]
    DuplicateStorageName(String),
    #[error("storage `{name}` path must be absolute: `{path}`")]
    RelativeStoragePath { name: String, path: String },
    #[error("hooks custom_hooks_dir must be absolute: `{0}`")]
    RelativeHooksDir(String),
    #[error("hooks timeout must be greater than zero")]
    InvalidHookTimeout,
    #[error("unknown log level `{0}`")]
    InvalidLogLevel(String),
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let listen_addr = self.listen_addr.trim();
        if listen_addr.is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }
        if listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.listen_addr.clone()));
        }

        if self.storages.is_empty() {
            return Err(ConfigError::EmptyStorages);
        }

        let mut names = HashSet::new();

        for storage in &self.storages {
            if storage.name.trim().is_empty() {
                return Err(ConfigError::EmptyStorageName);
            }

            if !names.insert(storage.name.clone()) {
                return Err(ConfigError::DuplicateStorageName(storage.name.clone()));
            }

            if !Path::new(&storage.path).is_absolute() {
                return Err(ConfigError::RelativeStoragePath {
                    name: storage.name.clone(),
                    path: storage.path.clone(),
                });
            }
        }

        if let Some(dir) = &self.hooks.custom_hooks_dir {
            if !Path::new(dir).is_absolute() {
                return Err(ConfigError::RelativeHooksDir(dir.clone()));
            }
        }

        if self.hooks.timeout_secs == 0 {
            return Err(ConfigError::InvalidHookTimeout);
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }
}

const fn default_hook_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
