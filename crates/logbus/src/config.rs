// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    DEFAULT_AMQP_URL, DEFAULT_LOG_FILE, DEFAULT_LOG_PATH, DEFAULT_MAX_CONCURRENCY,
};
use crate::consumer_pool::PoolConfig;
use crate::errors::ConfigError;
use crate::render::HostTag;
use crate::rotation::FileSinkConfig;
use crate::routing::{RoutingKey, RoutingKeyResolver, DEFAULT_CATEGORIES};
use crate::topology::{QueueSpec, SubscriptionPlan};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_FILE_ENV: &str = "LOGBUS_CONFIG";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration of the collector process.
///
/// File keys keep the names of the legacy `conf.json` (`logFile`, `logPath`, `maxSize`,
/// `maxBackups`, `maxAge`, `rabbitMQUrl`); unknown keys such as `rollOver` are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectorConfig {
    /// File name of the rotating sink
    pub log_file: String,
    /// Directory of the rotating sink
    pub log_path: String,
    /// Megabytes before the sink rotates, 0 for unlimited
    pub max_size: u64,
    /// Rotated files kept, 0 for unlimited
    pub max_backups: usize,
    /// Days a rotated file is kept, 0 for unlimited
    pub max_age: u64,
    #[serde(rename = "rabbitMQUrl")]
    pub amqp_url: String,
    /// Shared queue name; an exclusive broker-named queue is used when unset
    pub queue: Option<String>,
    /// Patterns the shared queue is bound to
    pub patterns: Vec<String>,
    /// When set, one durable queue per level replaces the shared queue
    pub per_level: Vec<String>,
    /// Levels routed under their own name
    pub categories: Vec<String>,
    pub host_tags: Vec<HostTag>,
    pub max_concurrency: usize,
    /// Also print rendered lines to stdout
    pub echo_stdout: bool,
    pub log_level: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            log_file: DEFAULT_LOG_FILE.to_string(),
            log_path: DEFAULT_LOG_PATH.to_string(),
            max_size: 100,
            max_backups: 7,
            max_age: 30,
            amqp_url: DEFAULT_AMQP_URL.to_string(),
            queue: None,
            patterns: vec!["#".to_string()],
            per_level: Vec::new(),
            categories: default_categories(),
            host_tags: Vec::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            echo_stdout: false,
            log_level: "info".to_string(),
        }
    }
}

impl CollectorConfig {
    /// Defaults overridden by `LOGBUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file. Keys missing from the file keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// The file named by `LOGBUS_CONFIG` when set, otherwise the defaults, with
    /// environment overrides applied on top.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => read_json(Path::new(&path))?,
            _ => Self::default(),
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(log_file) = env_string("LOGBUS_LOG_FILE") {
            self.log_file = log_file;
        }
        if let Some(log_path) = env_string("LOGBUS_LOG_PATH") {
            self.log_path = log_path;
        }
        if let Some(max_size) = env_parse("LOGBUS_MAX_SIZE")? {
            self.max_size = max_size;
        }
        if let Some(max_backups) = env_parse("LOGBUS_MAX_BACKUPS")? {
            self.max_backups = max_backups;
        }
        if let Some(max_age) = env_parse("LOGBUS_MAX_AGE")? {
            self.max_age = max_age;
        }
        if let Some(url) = env_string("LOGBUS_AMQP_URL") {
            self.amqp_url = url;
        }
        if let Some(queue) = env_string("LOGBUS_QUEUE") {
            self.queue = Some(queue);
        }
        if let Some(patterns) = env_list("LOGBUS_PATTERNS") {
            self.patterns = patterns;
        }
        if let Some(levels) = env_list("LOGBUS_PER_LEVEL") {
            self.per_level = levels;
        }
        if let Some(categories) = env_list("LOGBUS_CATEGORIES") {
            self.categories = categories;
        }
        if let Some(max_concurrency) = env_parse("LOGBUS_MAX_CONCURRENCY")? {
            self.max_concurrency = max_concurrency;
        }
        if let Some(echo) = env_bool("LOGBUS_ECHO_STDOUT") {
            self.echo_stdout = echo;
        }
        if let Some(log_level) = env_string("LOGBUS_LOG_LEVEL") {
            self.log_level = log_level.to_lowercase();
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_file.trim().is_empty() {
            return Err(ConfigError::Invalid("logFile cannot be empty".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "maxConcurrency must be greater than 0".to_string(),
            ));
        }
        validate_amqp_url(&self.amqp_url)?;
        validate_log_level(&self.log_level)?;

        if self.per_level.is_empty() && self.patterns.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one binding pattern or per-level queue is required".to_string(),
            ));
        }
        if let Some(queue) = &self.queue {
            if queue.trim().is_empty() {
                return Err(ConfigError::Invalid("queue cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn file_sink(&self) -> FileSinkConfig {
        let directory = if self.log_path.is_empty() {
            DEFAULT_LOG_PATH
        } else {
            self.log_path.as_str()
        };
        FileSinkConfig {
            path: PathBuf::from(directory).join(&self.log_file),
            max_size_mb: self.max_size,
            max_backups: self.max_backups,
            max_age_days: self.max_age,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> RoutingKeyResolver {
        RoutingKeyResolver::new(self.categories.iter().map(String::as_str))
    }

    #[must_use]
    pub fn subscription_plan(&self) -> SubscriptionPlan {
        if !self.per_level.is_empty() {
            return SubscriptionPlan::PerLevel {
                levels: self.per_level.clone(),
            };
        }
        let queue = match &self.queue {
            Some(name) => QueueSpec::named(name.as_str(), true),
            None => QueueSpec::anonymous(),
        };
        SubscriptionPlan::SharedQueue {
            queue,
            patterns: self.patterns.iter().map(|p| RoutingKey::from(p.as_str())).collect(),
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrency: self.max_concurrency,
            ..PoolConfig::default()
        }
    }
}

/// Configuration of a producer such as `logbus-emit`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProducerConfig {
    /// Logical server name, the first half of the `Host` field
    pub server: String,
    #[serde(rename = "rabbitMQUrl")]
    pub amqp_url: String,
    pub categories: Vec<String>,
    /// Mirror published events to the local log output
    pub echo_locally: bool,
    pub log_level: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            server: "logbus".to_string(),
            amqp_url: DEFAULT_AMQP_URL.to_string(),
            categories: default_categories(),
            echo_locally: false,
            log_level: "info".to_string(),
        }
    }
}

impl ProducerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(server) = env_string("LOGBUS_SERVER") {
            config.server = server;
        }
        if let Some(url) = env_string("LOGBUS_AMQP_URL") {
            config.amqp_url = url;
        }
        if let Some(categories) = env_list("LOGBUS_CATEGORIES") {
            config.categories = categories;
        }
        if let Some(echo) = env_bool("LOGBUS_ECHO_LOCALLY") {
            config.echo_locally = echo;
        }
        if let Some(log_level) = env_string("LOGBUS_LOG_LEVEL") {
            config.log_level = log_level.to_lowercase();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid("server cannot be empty".to_string()));
        }
        validate_amqp_url(&self.amqp_url)?;
        validate_log_level(&self.log_level)
    }

    #[must_use]
    pub fn resolver(&self) -> RoutingKeyResolver {
        RoutingKeyResolver::new(self.categories.iter().map(String::as_str))
    }
}

fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| (*c).to_string()).collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn validate_amqp_url(url: &str) -> Result<(), ConfigError> {
    if url.starts_with("amqp://") || url.starts_with("amqps://") {
        return Ok(());
    }
    Err(ConfigError::Invalid(format!(
        "Invalid broker URL '{url}'. Must start with amqp:// or amqps://"
    )))
}

fn validate_log_level(log_level: &str) -> Result<(), ConfigError> {
    if VALID_LOG_LEVELS.contains(&log_level) {
        return Ok(());
    }
    Err(ConfigError::Invalid(format!(
        "Invalid log level '{log_level}'. Must be one of: trace, debug, info, warn, error"
    )))
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} has invalid value '{value}'"))),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|value| value.to_lowercase() != "false")
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}
