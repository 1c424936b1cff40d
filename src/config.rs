//! Configuration for the producer, worker and aggregator processes.
//!
//! Configuration is read from a YAML file (`config.yaml` by default). String
//! values of the form `${VAR}` are replaced with the value of the environment
//! variable `VAR` before parsing, and a few environment variables override
//! the file afterwards:
//!
//! - `QUIZ_FORGE_QUEUE_URL`: queue service base URL
//! - `QUIZ_FORGE_LLM_API_KEY`: API key for the generation provider
//! - `QUIZ_FORGE_LLM_PROVIDER`: generation provider (`mock` or `openai`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

/// Default configuration file name, resolved against the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Upper bound for every duration setting, in seconds (one day).
pub const MAX_DURATION_SECS: f64 = 86_400.0;

/// Queue service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueServiceConfig {
    /// Base URL of the queue service (e.g. "http://localhost:8080").
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: f64,
}

impl Default for QueueServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_secs: 10.0,
        }
    }
}

impl QueueServiceConfig {
    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }
}

/// Local filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for extracted page files.
    pub pages_dir: PathBuf,
    /// Directory for per-unit result payloads.
    pub results_dir: PathBuf,
    /// Directory for job manifests.
    pub metadata_dir: PathBuf,
    /// Directory for exported decks.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pages_dir: PathBuf::from("./storage/pages"),
            results_dir: PathBuf::from("./storage/results"),
            metadata_dir: PathBuf::from("./storage/metadata"),
            output_dir: PathBuf::from("./output"),
        }
    }
}

/// Generation provider selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    /// Deterministic offline generator.
    Mock,
    /// Any OpenAI-compatible chat completions endpoint.
    Openai,
}

impl std::str::FromStr for LlmProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mock" => Ok(LlmProviderKind::Mock),
            "openai" | "openai-compatible" | "litellm" => Ok(LlmProviderKind::Openai),
            other => Err(ConfigError::InvalidValue {
                key: "llm.provider".to_string(),
                message: format!("unknown provider '{}', expected 'mock' or 'openai'", other),
            }),
        }
    }
}

/// Generation service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    /// Base URL of the OpenAI-compatible API.
    pub api_base: String,
    /// API key; required for every provider except `mock`.
    pub api_key: Option<String>,
    pub model: String,
    pub max_questions_per_page: usize,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Mock,
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_questions_per_page: 3,
            temperature: 0.3,
        }
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds to sleep after an empty dequeue.
    pub poll_interval_secs: f64,
    /// Maximum result submission attempts on transient errors.
    pub max_retries: u32,
    /// Linear backoff unit in seconds between submission attempts.
    pub retry_backoff_secs: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2.0,
            max_retries: 3,
            retry_backoff_secs: 2.0,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    /// Linear retry schedule for result submission.
    pub fn retry_policy(&self) -> BackoffPolicy {
        let unit = Duration::from_secs_f64(self.retry_backoff_secs);
        let cap = unit.saturating_mul(self.max_retries.max(1));
        BackoffPolicy::linear(unit, cap)
    }
}

/// Aggregator completion-poll settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// First delay between status polls, in seconds.
    pub poll_base_secs: f64,
    /// Ceiling for the delay between status polls, in seconds.
    pub poll_max_secs: f64,
    /// Multiplier applied after each non-terminal poll.
    pub poll_factor: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_base_secs: 1.0,
            poll_max_secs: 30.0,
            poll_factor: 2.0,
        }
    }
}

impl AggregatorConfig {
    /// Exponential poll schedule.
    pub fn poll_policy(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            Duration::from_secs_f64(self.poll_base_secs),
            self.poll_factor,
            Duration::from_secs_f64(self.poll_max_secs),
        )
    }
}

/// Exported deck settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeckConfig {
    pub name: String,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            name: "Quiz Forge".to_string(),
        }
    }
}

/// Top-level configuration shared by all process roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub queue_service: QueueServiceConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub worker: WorkerConfig,
    pub aggregator: AggregatorConfig,
    pub deck: DeckConfig,
}

impl AppConfig {
    /// Load configuration for a CLI invocation.
    ///
    /// A missing file at the default path yields defaults; a missing file that
    /// was asked for explicitly is an error. Environment overrides are applied
    /// and the result validated in both cases.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    tracing::debug!("No config.yaml found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file without applying overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content, |key| std::env::var(key).ok())
    }

    /// Parse YAML text, substituting `${VAR}` values through `lookup`.
    pub fn from_yaml_str<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        if raw.is_null() {
            return Err(ConfigError::ValidationFailed(
                "configuration file is empty".to_string(),
            ));
        }
        let substituted = substitute_env_vars(raw, &lookup);
        Ok(serde_yaml::from_value(substituted)?)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("QUIZ_FORGE_QUEUE_URL") {
            self.queue_service.base_url = url;
        }
        if let Some(key) = lookup("QUIZ_FORGE_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(provider) = lookup("QUIZ_FORGE_LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        Ok(())
    }

    /// Strip the trailing slash from the queue URL and drop blank API keys.
    pub fn normalize(&mut self) {
        let trimmed = self.queue_service.base_url.trim_end_matches('/').to_string();
        self.queue_service.base_url = trimmed;
        if self
            .llm
            .api_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            self.llm.api_key = None;
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_service.base_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_service.base_url cannot be empty".to_string(),
            ));
        }

        check_secs("queue_service.request_timeout_secs", self.queue_service.request_timeout_secs)?;

        if self.llm.provider != LlmProviderKind::Mock && self.llm.api_key.is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "llm.api_key is required for provider '{:?}'",
                self.llm.provider
            )));
        }

        if self.llm.model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "llm.model cannot be empty".to_string(),
            ));
        }

        if self.llm.max_questions_per_page == 0 {
            return Err(ConfigError::ValidationFailed(
                "llm.max_questions_per_page must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::ValidationFailed(
                "llm.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        check_secs("worker.poll_interval_secs", self.worker.poll_interval_secs)?;

        check_secs("worker.retry_backoff_secs", self.worker.retry_backoff_secs)?;

        check_secs("aggregator.poll_base_secs", self.aggregator.poll_base_secs)?;

        check_secs("aggregator.poll_max_secs", self.aggregator.poll_max_secs)?;
        if self.aggregator.poll_max_secs < self.aggregator.poll_base_secs {
            return Err(ConfigError::ValidationFailed(
                "aggregator.poll_max_secs cannot be below aggregator.poll_base_secs".to_string(),
            ));
        }

        if !(self.aggregator.poll_factor.is_finite() && self.aggregator.poll_factor >= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "aggregator.poll_factor must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Duration settings must be positive, finite and at most [`MAX_DURATION_SECS`].
fn check_secs(key: &str, value: f64) -> Result<(), ConfigError> {
    let in_range = value > 0.0 && value <= MAX_DURATION_SECS;
    if in_range && Duration::try_from_secs_f64(value).is_ok() {
        return Ok(());
    }
    Err(ConfigError::ValidationFailed(format!(
        "{} must be greater than 0 and at most {} seconds, got {}",
        key, MAX_DURATION_SECS, value
    )))
}

/// Replace `${VAR}` strings anywhere in the tree. Unset variables become null.
fn substitute_env_vars<F>(value: serde_yaml::Value, lookup: &F) -> serde_yaml::Value
where
    F: Fn(&str) -> Option<String>,
{
    use serde_yaml::Value;

    match value {
        Value::String(s) => match s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            Some(var) => lookup(var).map(Value::String).unwrap_or(Value::Null),
            None => Value::String(s),
        },
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, substitute_env_vars(v, lookup)))
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(
            items
                .into_iter()
                .map(|v| substitute_env_vars(v, lookup))
                .collect(),
        ),
        other => other,
    }
}
