use serde::{ Deserialize, Serialize };
use std::fmt;
use std::fs;
use std::io;
use std::path::{ Path, PathBuf };
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use crate::llm::ollama::DEFAULT_HOST;

/// What the pipeline does with a record that failed terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run at the first failed record.
    #[default]
    Abort,
    /// Drop the record from the output and continue.
    Skip,
    /// Write the record unchanged with an `error` object and continue.
    Annotate,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseFailurePolicyError {
    message: String,
}

impl fmt::Display for ParseFailurePolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseFailurePolicyError {}

impl FromStr for FailurePolicy {
    type Err = ParseFailurePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "skip" => Ok(FailurePolicy::Skip),
            "annotate" => Ok(FailurePolicy::Annotate),
            _ =>
                Err(ParseFailurePolicyError {
                    message: format!("Invalid failure policy: '{}' (expected abort, skip or annotate)", s),
                }),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::Skip => "skip",
            FailurePolicy::Annotate => "annotate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())] Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())] Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid config value for `{field}`: {reason}")] Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Run-wide settings. Built once before processing starts and shared
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub api_host: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub batch_size: usize,
    pub retry_attempts: u32,
    /// Seconds.
    pub timeout: f64,
    pub retry_delay_ms: u64,
    pub multi_turn: bool,
    pub on_failure: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: DEFAULT_HOST.to_string(),
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 2048,
            batch_size: 10,
            retry_attempts: 3,
            timeout: 120.0,
            retry_delay_ms: 2000,
            multi_turn: false,
            on_failure: FailurePolicy::Abort,
        }
    }
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct Overrides {
    api_host: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_tokens: Option<u32>,
    batch_size: Option<usize>,
    retry_attempts: Option<u32>,
    timeout: Option<f64>,
    retry_delay_ms: Option<u64>,
    multi_turn: Option<bool>,
    on_failure: Option<FailurePolicy>,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct OllamaSettings {
    api_host: Option<String>,
    request_options: Overrides,
}

#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct MultiTurnSection {
    enabled: Option<bool>,
}

// Accepts both flat keys and the sectioned template layout.
#[derive(Deserialize, Default, Debug)]
#[serde(default)]
struct ConfigFile {
    ollama_settings: OllamaSettings,
    script_settings: Overrides,
    multi_turn_conversation: MultiTurnSection,
    #[serde(flatten)]
    flat: Overrides,
}

impl Config {
    /// Defaults overlaid with `path` when given. Not validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(path) = path {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            config.merge_json(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(config)
    }

    pub fn merge_json(&mut self, json: &str) -> Result<(), serde_json::Error> {
        let file: ConfigFile = serde_json::from_str(json)?;
        self.apply(file.flat);
        self.apply(file.ollama_settings.request_options);
        if let Some(host) = file.ollama_settings.api_host {
            self.api_host = host;
        }
        self.apply(file.script_settings);
        if let Some(enabled) = file.multi_turn_conversation.enabled {
            self.multi_turn = enabled;
        }
        Ok(())
    }

    fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.api_host {
            self.api_host = v;
        }
        if let Some(v) = o.temperature {
            self.temperature = v;
        }
        if let Some(v) = o.top_p {
            self.top_p = v;
        }
        if let Some(v) = o.top_k {
            self.top_k = v;
        }
        if let Some(v) = o.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = o.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = o.retry_attempts {
            self.retry_attempts = v;
        }
        if let Some(v) = o.timeout {
            self.timeout = v;
        }
        if let Some(v) = o.retry_delay_ms {
            self.retry_delay_ms = v;
        }
        if let Some(v) = o.multi_turn {
            self.multi_turn = v;
        }
        if let Some(v) = o.on_failure {
            self.on_failure = v;
        }
    }

    /// Range-checks every field and normalizes `api_host`.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        check_unit_range("temperature", self.temperature)?;
        check_unit_range("top_p", self.top_p)?;
        if self.top_k == 0 {
            return Err(invalid("top_k", "must be a positive integer"));
        }
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens", "must be a positive integer"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be a positive integer"));
        }
        if self.timeout <= 0.0 || Duration::try_from_secs_f64(self.timeout).is_err() {
            return Err(invalid("timeout", format!("must be a positive number of seconds, got {}", self.timeout)));
        }
        self.api_host = normalize_host(&self.api_host)?;
        Ok(())
    }

    /// Saturates for values `validate` would reject.
    pub fn timeout_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout).unwrap_or(Duration::MAX)
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }

    /// Total backend calls per record; at least one call is always made.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

fn check_unit_range(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, format!("must be between 0.0 and 1.0, got {}", value)));
    }
    Ok(())
}

// OLLAMA_HOST is commonly set without a scheme, e.g. `0.0.0.0:11434`.
fn normalize_host(host: &str) -> Result<String, ConfigError> {
    let host = host.trim();
    let candidate = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };
    let url = Url::parse(&candidate).map_err(|e|
        invalid("api_host", format!("'{}' is not a valid URL: {}", host, e))
    )?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("api_host", format!("unsupported scheme '{}'", url.scheme())));
    }
    Ok(candidate.trim_end_matches('/').to_string())
}
