//! OpenAI-compatible chat completions adapter.
//!
//! Every configured provider speaks the same wire shape; vendor differences
//! live entirely in the [`ProviderRoute`] (base URL, key, model).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::{Completion, CompletionRequest, ProviderRoute};

// =============================================================================
// TRAIT
// =============================================================================

/// A single completion backend. One implementation per wire protocol;
/// one instance per configured provider route.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Route name, used by priority lists and failure records.
    fn name(&self) -> &str;

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError>;
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

/// Retry-after applied to remote rate limits that don't specify one.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// HTTP adapter for one OpenAI-compatible provider route.
#[derive(Debug, Clone)]
pub struct ChatAdapter {
    client: reqwest::Client,
    route: ProviderRoute,
}

impl ChatAdapter {
    /// Create an adapter for a route, resolving the API key from the
    /// environment.
    pub fn from_route(route: ProviderRoute) -> Result<Self, ProviderError> {
        let api_key = route.api_key()?;
        Self::with_key(route, api_key)
    }

    /// Create an adapter with an explicit API key (tests, local mocks).
    pub fn with_key(route: ProviderRoute, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = api_key.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            // Generous transport-level ceiling; the per-call timeout is
            // enforced by the gateway around each attempt.
            .timeout(Duration::from_secs(180))
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, route })
    }

    pub fn route(&self) -> &ProviderRoute {
        &self.route
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.route.base_url)
    }

    fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<String>,
}

// =============================================================================
// BACKEND IMPL
// =============================================================================

#[async_trait]
impl CompletionBackend for ChatAdapter {
    fn name(&self) -> &str {
        &self.route.name
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        if req.prompt_chars() > MAX_INPUT_CHARS {
            return Err(ProviderError::provider(
                self.name(),
                format!(
                    "input too large: {} chars (max {MAX_INPUT_CHARS})",
                    req.prompt_chars()
                ),
            ));
        }

        let start = Instant::now();

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &req.system {
            messages.push(ApiMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ApiMessage {
            role: "user",
            content: &req.user,
        });

        let api_req = ChatApiRequest {
            model: &self.route.model,
            messages,
            temperature: req.options.temperature,
            max_tokens: req.options.max_tokens,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());
        let retry_after = Self::retry_after(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    self.name(),
                    format!("response too large: {new_len} bytes"),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = if let Some(id) = &request_id {
            ctx.with_request_id(id)
        } else {
            ctx
        };

        if !status.is_success() {
            let (message, ctx) = match serde_json::from_str::<ChatApiResponse>(&body) {
                Ok(parsed) => match parsed.error {
                    Some(error) => {
                        let message = error.message.unwrap_or_default();
                        let ctx = match error.code {
                            Some(code) => ctx.with_code(code),
                            None => ctx,
                        };
                        (message, ctx)
                    }
                    None => (format!("HTTP {}", status.as_u16()), ctx),
                },
                Err(_) => (format!("HTTP {}", status.as_u16()), ctx),
            };

            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited_with_context(retry_after, ctx),
                _ => ProviderError::provider_with_context(self.name(), message, ctx),
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::invalid_response(self.name(), format!("invalid JSON: {e}"))
        })?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::provider(
                self.name(),
                error.message.unwrap_or_default(),
            ));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::invalid_response(self.name(), "no choices in response"))?;

        let mut text = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::invalid_response(
                self.name(),
                "empty completion content",
            ));
        }

        if text.len() > MAX_RESPONSE_LEN {
            text.truncate(MAX_RESPONSE_LEN);
        }

        let usage = parsed.usage.unwrap_or(Usage {
            prompt_tokens: None,
            completion_tokens: None,
        });

        Ok(Completion {
            text,
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            latency: start.elapsed(),
        })
    }
}
