use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required setting: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────────────────────────

/// How concluded traces reach the ingestion sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoggerMode {
    /// Traces accumulate and are ingested on flush.
    #[default]
    Batch,
    /// Every step is pushed to a worker pool as it happens.
    Streaming,
}

impl LoggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoggerMode::Batch => "batch",
            LoggerMode::Streaming => "streaming",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(LoggerMode::Batch),
            "streaming" => Ok(LoggerMode::Streaming),
            other => Err(ConfigError::InvalidValue {
                field: "mode",
                value: other.to_string(),
            }),
        }
    }
}

/// What the streaming queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// The submitting caller waits for a free slot.
    #[default]
    Block,
    /// The new event is discarded and a warning is logged.
    Drop,
    /// The queue is unbounded.
    Grow,
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Structs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff before the given retry (1-based), doubling up to the ceiling.
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub backpressure: Backpressure,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            backpressure: Backpressure::default(),
        }
    }
}

/// Settings for a trace logger and its ingestion sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub log_stream: Option<String>,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub mode: LoggerMode,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// SQLite file used by the local trace store.
    #[serde(default)]
    pub local_store: Option<PathBuf>,
    /// Metric names resolved against the backend at flush time.
    #[serde(default)]
    pub metrics: Vec<String>,
}

impl LoggerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Reads `.env` if present, then the `SPANWISE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self {
            project: env::var("SPANWISE_PROJECT").ok(),
            log_stream: env::var("SPANWISE_LOG_STREAM").ok(),
            experiment_id: env::var("SPANWISE_EXPERIMENT_ID").ok(),
            api_url: env::var("SPANWISE_API_URL").ok(),
            api_key: env::var("SPANWISE_API_KEY").ok(),
            ..Self::default()
        };

        if let Ok(mode) = env::var("SPANWISE_MODE") {
            config.mode = LoggerMode::parse(&mode)?;
        }

        Ok(config)
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_log_stream(mut self, log_stream: impl Into<String>) -> Self {
        self.log_stream = Some(log_stream.into());
        self
    }

    pub fn with_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    pub fn with_api(mut self, url: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self.api_key = Some(key.into());
        self
    }

    pub fn with_mode(mut self, mode: LoggerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_local_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_store = Some(path.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Vec<String>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Checks the settings a remote sink needs. A custom ingestion hook
    /// replaces the remote sink, so project and log stream become optional.
    pub fn validate(&self, has_ingestion_hook: bool) -> Result<(), ConfigError> {
        if self.streaming.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "streaming.workers",
                value: "0".to_string(),
            });
        }
        if self.streaming.queue_capacity == 0 && self.streaming.backpressure != Backpressure::Grow {
            return Err(ConfigError::InvalidValue {
                field: "streaming.queue_capacity",
                value: "0".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                value: "0".to_string(),
            });
        }
        if has_ingestion_hook {
            return Ok(());
        }
        if self.project.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingField("project"));
        }
        if self.log_stream.is_none() && self.experiment_id.is_none() {
            return Err(ConfigError::MissingField("log_stream"));
        }
        Ok(())
    }
}

/// Settings for the callback observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Model or tool error codes that force-commit the partial trace.
    #[serde(default = "default_fatal_status_codes")]
    pub fatal_status_codes: Vec<u16>,
    /// Flush the logger as soon as a trace is committed.
    #[serde(default = "default_true")]
    pub ingest_on_commit: bool,
    /// Label recorded as `integration` metadata on every run.
    #[serde(default = "default_integration")]
    pub integration: String,
}

fn default_fatal_status_codes() -> Vec<u16> {
    vec![401, 403, 429]
}

fn default_true() -> bool {
    true
}

fn default_integration() -> String {
    "adk".to_string()
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            fatal_status_codes: default_fatal_status_codes(),
            ingest_on_commit: true,
            integration: default_integration(),
        }
    }
}

impl ObserverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fatal_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.fatal_status_codes = codes;
        self
    }

    pub fn with_ingest_on_commit(mut self, enabled: bool) -> Self {
        self.ingest_on_commit = enabled;
        self
    }

    pub fn with_integration(mut self, integration: impl Into<String>) -> Self {
        self.integration = integration.into();
        self
    }

    pub fn is_fatal(&self, status_code: u16) -> bool {
        self.fatal_status_codes.contains(&status_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_config_defaults() {
        let config: LoggerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.mode, LoggerMode::Batch);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.streaming.workers, 4);
        assert_eq!(config.streaming.queue_capacity, 256);
        assert_eq!(config.streaming.backpressure, Backpressure::Block);
    }

    #[test]
    fn test_parse_streaming_config() {
        let config: LoggerConfig = serde_json::from_str(
            r#"{
                "project": "p",
                "log_stream": "s",
                "mode": "streaming",
                "streaming": { "workers": 2, "backpressure": "drop" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, LoggerMode::Streaming);
        assert_eq!(config.streaming.workers, 2);
        assert_eq!(config.streaming.queue_capacity, 256);
        assert_eq!(config.streaming.backpressure, Backpressure::Drop);
        assert!(config.validate(false).is_ok());
    }

    #[test]
    fn test_validate_requires_project_without_hook() {
        let config = LoggerConfig::new().with_log_stream("s");
        assert!(matches!(
            config.validate(false),
            Err(ConfigError::MissingField("project"))
        ));
        assert!(config.validate(true).is_ok());

        let config = LoggerConfig::new().with_project("p");
        assert!(matches!(
            config.validate(false),
            Err(ConfigError::MissingField("log_stream"))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = LoggerConfig::new().with_streaming(StreamingConfig {
            workers: 0,
            ..StreamingConfig::default()
        });
        assert!(matches!(
            config.validate(true),
            Err(ConfigError::InvalidValue { field: "streaming.workers", .. })
        ));
    }

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff_ms(1), 100);
        assert_eq!(retry.backoff_ms(2), 200);
        assert_eq!(retry.backoff_ms(3), 350);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(LoggerMode::parse("Streaming").unwrap(), LoggerMode::Streaming);
        assert!(LoggerMode::parse("bogus").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("spanwise-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("logger.json");
        fs::write(&path, r#"{"project": "demo", "log_stream": "dev", "metrics": ["correctness"]}"#)
            .unwrap();

        let config = LoggerConfig::from_file(&path).unwrap();
        assert_eq!(config.project.as_deref(), Some("demo"));
        assert_eq!(config.metrics, vec!["correctness".to_string()]);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_observer_config_fatal_codes() {
        let config = ObserverConfig::default();
        assert!(config.is_fatal(429));
        assert!(config.is_fatal(401));
        assert!(!config.is_fatal(500));
        assert!(config.ingest_on_commit);
    }
}
