//! Dispatcher configuration.
//!
//! Loaded from an optional TOML file, then overridden by `PLANSIGHT_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file) yields a working local setup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use plansight_ai::{ModelType, RetentionPolicy, RetryPolicy};
use plansight_observability::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: &'static str, value: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Recognition worker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub base_url: String,
    /// Bearer token sent on every call, if set.
    pub api_token: Option<String>,
    /// Path (or absolute URL) overrides keyed by model name, e.g.
    /// `text_extraction = "/ocr"`.
    pub endpoints: HashMap<String, String>,
    /// Default wall-clock limit for one attempt (default: 300s)
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_token: None,
            endpoints: HashMap::new(),
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn endpoint_override(&self, model_type: ModelType) -> Option<&str> {
        self.endpoints.get(model_type.as_str()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Attempts one tenant may have in flight at once (default: 3)
    pub max_concurrent_jobs: usize,
    /// Identifier recorded on jobs this process starts.
    pub worker_id: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            worker_id: "plansight-dispatcher".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduling pass interval when nothing wakes the loop (default: 5s)
    pub poll_interval_secs: u64,
    /// Jobs considered per pass.
    pub batch_size: usize,
    /// Processing jobs older than this, with no live attempt, are failed as
    /// interrupted. Defaults to twice the worker timeout when unset.
    pub stale_after_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 20,
            stale_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL. The in-memory store is used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl AppConfig {
    /// Load `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `PLANSIGHT_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PLANSIGHT_WORKER_URL") {
            self.worker.base_url = url;
        }
        if let Some(token) = lookup("PLANSIGHT_WORKER_TOKEN") {
            self.worker.api_token = Some(token);
        }
        if let Some(secs) = parse_override(&lookup, "PLANSIGHT_WORKER_TIMEOUT_SECS")? {
            self.worker.request_timeout_secs = secs;
        }
        if let Some(max) = parse_override(&lookup, "PLANSIGHT_MAX_CONCURRENT_JOBS")? {
            self.execution.max_concurrent_jobs = max;
        }
        if let Some(id) = lookup("PLANSIGHT_WORKER_ID") {
            self.execution.worker_id = id;
        }
        if let Some(secs) = parse_override(&lookup, "PLANSIGHT_POLL_INTERVAL_SECS")? {
            self.scheduler.poll_interval_secs = secs;
        }
        if let Some(attempts) = parse_override(&lookup, "PLANSIGHT_MAX_ATTEMPTS")? {
            self.retry.default_max_attempts = attempts;
        }
        if let Some(url) = lookup("PLANSIGHT_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            self.database.url = Some(url);
        }
        if let Some(format) = parse_override(&lookup, "PLANSIGHT_LOG_FORMAT")? {
            self.logging.format = format;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        self.scheduler
            .stale_after_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.worker.request_timeout() * 2)
    }
}

fn parse_override<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride { key, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml("").unwrap();

        assert_eq!(config.execution.max_concurrent_jobs, 3);
        assert_eq!(config.worker.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.stale_after(), Duration::from_secs(600));
        assert_eq!(config.retry.default_max_attempts, 3);
        assert_eq!(config.retention.read_log_limit, 50);
        assert!(config.database.url.is_none());
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn toml_sections_are_read() {
        let config = AppConfig::from_toml(
            r#"
            [worker]
            base_url = "http://gpu-box:9000"
            request_timeout_secs = 60

            [worker.endpoints]
            text_extraction = "/ocr"

            [retry]
            base_delay = 5
            strategy = "linear"

            [scheduler]
            stale_after_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.base_url, "http://gpu-box:9000");
        assert_eq!(
            config.worker.endpoint_override(ModelType::TextExtraction),
            Some("/ocr")
        );
        assert_eq!(config.retry.base_delay, Duration::from_secs(5));
        assert_eq!(config.stale_after(), Duration::from_secs(30));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            ("PLANSIGHT_WORKER_URL", "http://override:1"),
            ("PLANSIGHT_MAX_CONCURRENT_JOBS", "7"),
            ("DATABASE_URL", "postgres://localhost/plansight"),
            ("PLANSIGHT_LOG_FORMAT", "pretty"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.worker.base_url, "http://override:1");
        assert_eq!(config.execution.max_concurrent_jobs, 7);
        assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/plansight"));
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == "PLANSIGHT_POLL_INTERVAL_SECS").then(|| "soon".to_string()))
            .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidOverride { key: "PLANSIGHT_POLL_INTERVAL_SECS", .. }));
    }
}
