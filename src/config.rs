//! Engine configuration: provider routes, pool sizing, timeouts, and
//! scoring thresholds.
//!
//! Everything is serde-loadable from a JSON file, with env overrides for
//! the knobs operators actually turn. API keys never appear in the file,
//! only the env var names that hold them.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{GatewayConfig, ProviderRoute};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_parallelism() -> usize {
    5
}

fn default_unit_timeout_secs() -> u64 {
    120
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_max_rate_limit_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_context_budget_tokens() -> usize {
    1_500
}

fn default_neutral_band() -> f64 {
    0.05
}

fn default_summary_max_chars() -> usize {
    400
}

/// Thresholds for the {high, medium, low} priority classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityThresholds {
    /// Score at or above this with adequate confidence is high priority.
    pub high_score: f64,
    /// Minimum confidence for a high classification.
    pub high_confidence: f64,
    /// Score at or above this is at least medium priority.
    pub medium_score: f64,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            high_score: 0.7,
            high_confidence: 0.6,
            medium_score: 0.4,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Configured completion backends.
    pub routes: Vec<ProviderRoute>,
    /// Default provider priority order (route names). Units may override.
    pub default_priority: Vec<String>,
    /// Concurrent in-flight provider calls within a segment.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Hard wall-clock timeout for one unit, gateway fallback included.
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
    /// Per-provider-call timeout.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Same-provider retry budget on rate limits.
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Exponential backoff base delay.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Token budget for dependency context in a unit prompt. Converted to
    /// characters at roughly 4 chars per token.
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,
    /// Half-width of the stable band around 0.5 for trend classification.
    #[serde(default = "default_neutral_band")]
    pub neutral_band: f64,
    /// Priority classification thresholds.
    #[serde(default)]
    pub priority_thresholds: PriorityThresholds,
    /// Length cap on per-unit context summaries.
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            default_priority: Vec::new(),
            parallelism: default_parallelism(),
            unit_timeout_secs: default_unit_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            context_budget_tokens: default_context_budget_tokens(),
            neutral_band: default_neutral_band(),
            priority_thresholds: PriorityThresholds::default(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, then apply env overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env();
        config.check()?;
        Ok(config)
    }

    /// Build from the environment alone: a single OpenAI-compatible route
    /// described by MERIDIAN_BASE_URL / MERIDIAN_API_KEY_ENV /
    /// MERIDIAN_MODEL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("MERIDIAN_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key_env =
            std::env::var("MERIDIAN_API_KEY_ENV").unwrap_or_else(|_| "OPENAI_API_KEY".to_string());
        let model =
            std::env::var("MERIDIAN_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let mut config = Self {
            routes: vec![ProviderRoute::new("default", base_url, api_key_env, model)],
            default_priority: vec!["default".to_string()],
            ..Self::default()
        };
        config.apply_env();
        config.check()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MERIDIAN_PARALLELISM") {
            if let Ok(n) = v.parse() {
                self.parallelism = n;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_UNIT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.unit_timeout_secs = n;
            }
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("no provider routes configured".into()));
        }
        if self.default_priority.is_empty() {
            return Err(ConfigError::Invalid("default_priority is empty".into()));
        }
        for name in &self.default_priority {
            if !self.routes.iter().any(|r| &r.name == name) {
                return Err(ConfigError::Invalid(format!(
                    "default_priority names unknown route {name}"
                )));
            }
        }
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid("parallelism must be >= 1".into()));
        }
        Ok(())
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Character budget for dependency context, ~4 chars per token.
    pub fn context_budget_chars(&self) -> usize {
        self.context_budget_tokens * 4
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_rate_limit_retries: self.max_rate_limit_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}
