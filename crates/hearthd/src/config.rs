//! Configuration file parsing and structures.
//!
//! hearthd is configured with a single TOML file: logging, the HTTP API and
//! one `[entries.<id>]` table per polled device or service. Each entry carries
//! the coordinator settings understood by [`CoordinatorConfig`].

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use hearthd_coordinator::CoordinatorConfig;
use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub api: ApiConfig,

    /// Key = entry id
    #[serde(default)]
    pub entries: BTreeMap<String, EntryConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `hearthd_coordinator = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter for this configuration.
    pub fn filter(&self) -> Targets {
        self.overrides.iter().fold(
            Targets::new().with_default(LevelFilter::from(self.level)),
            |targets, (target, level)| targets.with_target(target.clone(), LevelFilter::from(*level)),
        )
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8565
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
        }
    }
}

/// A polled REST endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// URL returning the entry's JSON payload
    pub url: String,

    /// Sent as `Authorization: Bearer <token>`
    #[serde(default)]
    pub token: Option<String>,

    /// Whether this entry is set up at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(flatten)]
    pub coordinator: CoordinatorConfig,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        contents.parse()
    }

    /// Enabled entries, in id order
    pub fn enabled_entries(&self) -> impl Iterator<Item = (&str, &EntryConfig)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .map(|(id, entry)| (id.as_str(), entry))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (id, entry) in &self.entries {
            let url = reqwest::Url::parse(&entry.url).map_err(|e| ConfigError::InvalidEntry {
                id: id.clone(),
                reason: format!("invalid url '{}': {}", entry.url, e),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidEntry {
                    id: id.clone(),
                    reason: format!("unsupported url scheme '{}'", url.scheme()),
                });
            }
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid entry '{id}': {reason}")]
    InvalidEntry { id: String, reason: String },
}
