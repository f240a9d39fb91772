//! Runtime settings: provider credentials, retry policy, pipeline sizes.
//!
//! Settings come from the environment ([`Settings::from_env`]) or a JSON file
//! ([`Settings::from_json_file`]); every field has a default so a file only
//! needs to name what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{gemini, openai, ChatModel};
use crate::plan::DEFAULT_MIN_DESCRIPTION_LEN;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provider {
    #[default]
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
}

impl std::str::FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Provider::Gemini),
            "openai" => Ok(Provider::OpenAi),
            _ => Err(()),
        }
    }
}

fn default_gemini_base_url() -> String {
    gemini::DEFAULT_BASE_URL.to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_openai_base_url() -> String {
    openai::DEFAULT_BASE_URL.to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_gemini_base_url(),
            model: default_gemini_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
            organization: None,
            model: default_openai_model(),
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.delay_ms))
    }
}

/// Sizes for the three-stage plan pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanGenerationConfig {
    /// Plans requested in the first candidate round.
    pub candidate_count: usize,
    /// Refined sets smaller than this are backfilled from unused candidates.
    pub floor: usize,
    /// Hard cap on returned plans.
    pub ceiling: usize,
    /// Rows each candidate is executed against.
    pub sample_rows: usize,
    pub min_description_len: usize,
}

impl Default for PlanGenerationConfig {
    fn default() -> Self {
        Self {
            candidate_count: 12,
            floor: 4,
            ceiling: 12,
            sample_rows: 200,
            min_description_len: DEFAULT_MIN_DESCRIPTION_LEN,
        }
    }
}

impl PlanGenerationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidate_count == 0 {
            return Err(ConfigError::Invalid("candidate_count must be positive".into()));
        }
        if self.floor > self.ceiling {
            return Err(ConfigError::Invalid(format!(
                "floor ({}) exceeds ceiling ({})",
                self.floor, self.ceiling
            )));
        }
        if self.sample_rows == 0 {
            return Err(ConfigError::Invalid("sample_rows must be positive".into()));
        }
        Ok(())
    }
}

fn default_timeout_seconds() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub gemini: GeminiSettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub plans: PlanGenerationConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            gemini: GeminiSettings::default(),
            openai: OpenAiSettings::default(),
            timeout_seconds: default_timeout_seconds(),
            retry: RetrySettings::default(),
            plans: PlanGenerationConfig::default(),
        }
    }
}

impl Settings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`; unset and blank variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut settings = Settings::default();

        if let Some(value) = var("INSIGHT_PROVIDER") {
            settings.provider = value.parse().map_err(|_| ConfigError::InvalidVar {
                name: "INSIGHT_PROVIDER",
                value,
            })?;
        }

        settings.gemini.api_key = var("GEMINI_API_KEY");
        if let Some(url) = var("GEMINI_BASE_URL") {
            settings.gemini.base_url = url;
        }
        if let Some(model) = var("GEMINI_MODEL") {
            settings.gemini.model = model;
        }

        settings.openai.api_key = var("OPENAI_API_KEY");
        settings.openai.organization = var("OPENAI_ORGANIZATION");
        if let Some(url) = var("OPENAI_BASE_URL") {
            settings.openai.base_url = url;
        }
        if let Some(model) = var("OPENAI_MODEL") {
            settings.openai.model = model;
        }

        if let Some(value) = var("INSIGHT_TIMEOUT_SECONDS") {
            settings.timeout_seconds = parse_var("INSIGHT_TIMEOUT_SECONDS", value)?;
        }
        if let Some(value) = var("INSIGHT_RETRY_ATTEMPTS") {
            settings.retry.attempts = parse_var("INSIGHT_RETRY_ATTEMPTS", value)?;
        }
        if let Some(value) = var("INSIGHT_RETRY_DELAY_MS") {
            settings.retry.delay_ms = parse_var("INSIGHT_RETRY_DELAY_MS", value)?;
        }

        settings.plans.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.plans.validate()?;
        Ok(settings)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    /// Model of the selected provider.
    pub fn chat_model(&self) -> ChatModel {
        match self.provider {
            Provider::Gemini => ChatModel::gemini(&self.gemini.model),
            Provider::OpenAi => ChatModel::openai(&self.openai.model),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidVar { name, value })
}
