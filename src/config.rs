//! Run configuration: defaults, then a JSON file, then environment variables.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::RetryPolicy;

pub const DEFAULT_API_URL: &str = "https://api.braintrust.dev";
pub const DEFAULT_OPENAPI_URL: &str =
    "https://raw.githubusercontent.com/braintrustdata/braintrust-openapi/main/openapi/spec.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgConfig {
    pub api_key: String,
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl OrgConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: default_url(),
        }
    }

    fn normalize(&mut self, field: &'static str) -> Result<(), ConfigError> {
        self.api_key = self.api_key.trim().to_string();
        if self.api_key.is_empty() {
            return Err(invalid(field, "API key cannot be empty"));
        }
        self.url = self.url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&self.url).map_err(|err| invalid(field, err.to_string()))?;
        Ok(())
    }
}

/// What to do when no create schema is known for a resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPolicy {
    /// Send every serialized field and log a warning.
    #[default]
    PassThrough,
    /// Refuse to create the resource.
    FailClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub retry_attempts: u32,
    /// Base backoff delay in seconds.
    pub retry_delay: f64,
    /// Resources processed between checkpoint saves inside a batch.
    pub checkpoint_interval: usize,
    pub schema_policy: SchemaPolicy,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry_attempts: 3,
            retry_delay: 1.0,
            checkpoint_interval: 50,
            schema_policy: SchemaPolicy::default(),
        }
    }
}

impl MigrationSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_secs_f64(self.retry_delay.max(0.0)),
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.batch_size) {
            return Err(invalid("batch_size", "must be between 1 and 1000"));
        }
        if self.retry_attempts > 10 {
            return Err(invalid("retry_attempts", "must be between 0 and 10"));
        }
        if !(0.1..=30.0).contains(&self.retry_delay) {
            return Err(invalid("retry_delay", "must be between 0.1 and 30 seconds"));
        }
        if self.checkpoint_interval == 0 {
            return Err(invalid("checkpoint_interval", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(invalid("log_format", format!("unknown format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
            file: None,
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl LoggingConfig {
    /// Lower-cases the level and maps `warning`/`critical` onto tracing levels.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        let level = self.level.trim().to_ascii_lowercase();
        let level = match level.as_str() {
            "warning" => "warn".to_string(),
            "critical" => "error".to_string(),
            _ => level,
        };
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "log_level",
                format!("must be one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        self.level = level;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub source: OrgConfig,
    pub destination: OrgConfig,
    #[serde(default)]
    pub migration: MigrationSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,
    #[serde(default)]
    pub project_names: Option<Vec<String>>,
    #[serde(default = "default_openapi_url")]
    pub openapi_spec_url: Option<String>,
    #[serde(default)]
    pub openapi_spec_path: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_resources() -> Vec<String> {
    vec!["all".to_string()]
}

fn default_openapi_url() -> Option<String> {
    Some(DEFAULT_OPENAPI_URL.to_string())
}

/// Source of environment values; tests pass a map instead of the process env.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|value| !value.trim().is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &dyn EnvSource,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, format!("could not parse '{raw}'"))),
        None => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn new(source: OrgConfig, destination: OrgConfig) -> Self {
        Self {
            source,
            destination,
            migration: MigrationSettings::default(),
            logging: LoggingConfig::default(),
            state_dir: default_state_dir(),
            resources: default_resources(),
            project_names: None,
            openapi_spec_url: default_openapi_url(),
            openapi_spec_path: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Builds a config from environment variables alone.
    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let source = env
            .get("BT_SOURCE_API_KEY")
            .ok_or(ConfigError::Missing("BT_SOURCE_API_KEY"))?;
        let destination = env
            .get("BT_DEST_API_KEY")
            .ok_or(ConfigError::Missing("BT_DEST_API_KEY"))?;
        let mut config = Config::new(OrgConfig::new(source), OrgConfig::new(destination));
        config.apply_env(env)?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the environment, then overlays env values.
    pub fn load(path: Option<&Path>, env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let mut config = Self::from_file(path)?;
                config.apply_env(env)?;
                config
            }
            None => Self::from_env(env)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &dyn EnvSource) -> Result<(), ConfigError> {
        if let Some(key) = env.get("BT_SOURCE_API_KEY") {
            self.source.api_key = key;
        }
        if let Some(key) = env.get("BT_DEST_API_KEY") {
            self.destination.api_key = key;
        }
        if let Some(url) = env.get("BT_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(url) = env.get("BT_DEST_URL") {
            self.destination.url = url;
        }
        if let Some(value) = parse_env(env, "MIGRATION_BATCH_SIZE")? {
            self.migration.batch_size = value;
        }
        if let Some(value) = parse_env(env, "MIGRATION_RETRY_ATTEMPTS")? {
            self.migration.retry_attempts = value;
        }
        if let Some(value) = parse_env(env, "MIGRATION_RETRY_DELAY")? {
            self.migration.retry_delay = value;
        }
        if let Some(value) = parse_env(env, "MIGRATION_CHECKPOINT_INTERVAL")? {
            self.migration.checkpoint_interval = value;
        }
        if let Some(level) = env.get("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = parse_env(env, "LOG_FORMAT")? {
            self.logging.format = format;
        }
        if let Some(dir) = env.get("MIGRATION_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(projects) = env.get("MIGRATION_PROJECTS") {
            self.project_names = Some(split_list(&projects));
        }
        if let Some(resources) = env.get("MIGRATION_RESOURCES") {
            self.resources = split_list(&resources);
        }
        Ok(())
    }

    pub fn set_resources(&mut self, raw: &str) {
        self.resources = split_list(&raw.to_ascii_lowercase());
    }

    pub fn set_projects(&mut self, raw: &str) {
        let projects = split_list(raw);
        self.project_names = (!projects.is_empty()).then_some(projects);
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.source.normalize("source")?;
        self.destination.normalize("destination")?;
        self.migration.validate()?;
        self.logging.normalize()?;
        if self.resources.is_empty() {
            self.resources = default_resources();
        }
        Ok(())
    }

    /// True when `resource_type` is selected by the resource filter.
    pub fn includes_resource(&self, resource_type: &str) -> bool {
        self.resources
            .iter()
            .any(|selected| selected == "all" || selected == resource_type)
    }
}
