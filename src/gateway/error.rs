//! Error types for the provider gateway.

use std::time::Duration;
use thiserror::Error;

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Why a single provider failed. Collected in order when the whole
/// priority list is exhausted.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    /// Provider route name, e.g. "openai-fast".
    pub provider: String,
    /// Short error code from [`ProviderError::code`].
    pub code: &'static str,
    /// Human-readable reason.
    pub reason: String,
}

/// Errors that can occur when calling providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rate limited - the gateway retries this same provider with backoff.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    /// Request timed out - fall through to the next provider.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Provider returned an error response.
    #[error("{provider} error: {message}")]
    Provider {
        provider: String,
        message: String,
        context: Option<ErrorContext>,
    },

    /// The provider answered but the completion is unusable (empty or
    /// malformed text). Treated like a provider error for fallback.
    #[error("invalid response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, etc.).
    #[error("configuration error: {0}")]
    Config(String),

    /// Every provider in the priority list failed. Carries the ordered
    /// per-provider failure reasons for diagnostics.
    #[error("all {} providers exhausted", failures.len())]
    Exhausted { failures: Vec<ProviderFailure> },
}

impl ProviderError {
    /// Create a rate limited error.
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after,
            context: None,
        }
    }

    /// Create a rate limited error with context.
    pub fn rate_limited_with_context(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            context: None,
        }
    }

    /// Create a provider error with context.
    pub fn provider_with_context(
        provider: impl Into<String>,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            context: Some(context),
        }
    }

    /// Create an invalid response error.
    pub fn invalid_response(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the same provider should be retried before falling through.
    /// Only rate limits are retried in place; timeouts and provider errors
    /// fall through to the next provider immediately.
    pub fn retry_same_provider(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Get a short error code for logging and failure records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::Provider { .. } => "provider_error",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
            Self::Exhausted { .. } => "exhausted",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::Provider { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}
