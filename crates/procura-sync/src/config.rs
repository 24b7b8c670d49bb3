//! Pipeline configuration: a YAML file with environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use procura_adapters::SourceEndpoint;
use procura_core::check_object_id;
use procura_storage::{BackoffPolicy, HttpClientConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::normalize::DEFAULT_EXPECTED_TABLES;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value `{value}` for {var}")]
    Env { var: &'static str, value: String },
    #[error("config key `{0}` is missing or empty")]
    Missing(&'static str),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub root_dir: PathBuf,
    #[serde(default)]
    pub sources: Vec<SourceEndpoint>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default = "default_listing_timeout_secs")]
    pub listing_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_expected_tables")]
    pub expected_tables: Vec<String>,
}

fn default_max_workers() -> usize {
    4
}

fn default_window_days() -> i64 {
    120
}

fn default_listing_timeout_secs() -> u64 {
    60
}

fn default_download_timeout_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("procura/{}", env!("CARGO_PKG_VERSION"))
}

fn default_expected_tables() -> Vec<String> {
    DEFAULT_EXPECTED_TABLES.iter().map(|s| s.to_string()).collect()
}

impl PipelineConfig {
    /// Read `path`, apply `PROCURA_*` overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Path from `PROCURA_CONFIG`, falling back to `./config.yaml`.
    pub fn path_from_env() -> PathBuf {
        std::env::var("PROCURA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PROCURA_ROOT_DIR") {
            self.root_dir = PathBuf::from(root);
        }
        if let Some(value) = lookup("PROCURA_MAX_WORKERS") {
            self.max_workers = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "PROCURA_MAX_WORKERS",
                value,
            })?;
        }
        if let Some(value) = lookup("PROCURA_WINDOW_DAYS") {
            self.window_days = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "PROCURA_WINDOW_DAYS",
                value,
            })?;
        }
        if let Some(user_agent) = lookup("PROCURA_USER_AGENT") {
            self.user_agent = user_agent;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("root_dir"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::Missing("sources"));
        }
        for source in &self.sources {
            if source.name.trim().is_empty() || source.api_endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source `{}` needs both a name and an api_endpoint",
                    source.name
                )));
            }
            if check_object_id(&source.name).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "source name `{}` must be a single path component",
                    source.name
                )));
            }
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.window_days < 0 {
            return Err(ConfigError::Invalid("window_days must not be negative".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            listing_timeout: Duration::from_secs(self.listing_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::fixed(
                self.retry.max_attempts,
                Duration::from_secs(self.retry.delay_secs),
            ),
        }
    }
}
