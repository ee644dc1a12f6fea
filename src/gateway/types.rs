//! Core types for the provider gateway.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage tracking and debugging.
///
/// Every request through the gateway carries attribution so we know which
/// analysis run it belongs to and which code path triggered it.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Analysis job this request is part of.
    pub job_id: Option<Uuid>,
    /// Which code path made this call, for debugging.
    /// Use a static string like "dispatch::run_unit".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

// =============================================================================
// PROVIDER ROUTES
// =============================================================================

/// One configured completion backend.
///
/// Providers are configuration rows, not code branches: adding a backend
/// means adding a route, never a new match arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRoute {
    /// Unique route name referenced by priority lists, e.g. "openai-fast".
    pub name: String,
    /// Base URL of an OpenAI-compatible chat completions API.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model identifier sent in the request body.
    pub model: String,
}

impl ProviderRoute {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key_env: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key_env: api_key_env.into(),
            model: model.into(),
        }
    }

    /// Resolve the API key from the environment.
    pub fn api_key(&self) -> Result<String, super::error::ProviderError> {
        std::env::var(&self.api_key_env).map_err(|_| {
            super::error::ProviderError::config(format!("{} not set", self.api_key_env))
        })
    }
}

// =============================================================================
// COMPLETION TYPES
// =============================================================================

/// Per-call completion options.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Per-call timeout enforced by the gateway.
    pub timeout: Duration,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: Some(2048),
            temperature: 0.3,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Request for a text completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt (persona), if any.
    pub system: Option<String>,
    /// User prompt.
    pub user: String,
    /// Call options.
    pub options: CompletionOptions,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl CompletionRequest {
    pub fn new(user: impl Into<String>, attribution: Attribution) -> Self {
        Self {
            system: None,
            user: user.into(),
            options: CompletionOptions::default(),
            attribution,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Total prompt characters, for input-size guards.
    pub fn prompt_chars(&self) -> usize {
        self.system.as_deref().map_or(0, str::len) + self.user.len()
    }
}

/// A completed text generation.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Input tokens consumed, if reported.
    pub input_tokens: u32,
    /// Output tokens generated, if reported.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
}

/// Result of a fallback chain: the completion plus which provider served it.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub completion: Completion,
    /// Route name of the provider that produced the completion.
    pub provider: String,
    /// Total provider calls issued across the chain, retries included.
    pub attempts: u32,
}
