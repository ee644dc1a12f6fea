//! Provider gateway: uniform access to N text-completion backends with
//! per-call timeout, bounded rate-limit retry, and priority-ordered fallback.

pub mod adapter;
pub mod error;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

pub use adapter::{ChatAdapter, CompletionBackend};
pub use error::{ErrorContext, ProviderError, ProviderFailure};
pub use types::*;
pub use usage::{NoopUsageSink, ProviderCallRecord, StderrUsageSink, UsageCounters, UsageSink};

/// Gateway-facing trait so callers (and tests) can swap the whole
/// fallback chain behind one seam.
#[async_trait::async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Attempt providers in the caller-supplied priority order and return
    /// the first usable completion along with the provider that served it.
    async fn complete_with_fallback(
        &self,
        req: &CompletionRequest,
        priority: &[String],
    ) -> Result<FallbackOutcome, ProviderError>;
}

/// Retry and backoff parameters.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Same-provider retries after a rate limit before falling through.
    pub max_rate_limit_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_base_delay: Duration,
    /// Backoff cap.
    pub retry_max_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff: base × 2^attempt, capped.
fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let delay = base.saturating_mul(2u32.saturating_pow(attempt));
    delay.min(cap)
}

/// The production gateway: an ordered set of backends, process-wide usage
/// counters, and a usage sink.
pub struct ProviderGateway {
    backends: Vec<Arc<dyn CompletionBackend>>,
    counters: Arc<UsageCounters>,
    sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

impl ProviderGateway {
    /// Build from configured routes, resolving API keys from the environment.
    pub fn from_routes(
        routes: &[ProviderRoute],
        sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Result<Self, ProviderError> {
        let mut backends: Vec<Arc<dyn CompletionBackend>> = Vec::with_capacity(routes.len());
        for route in routes {
            backends.push(Arc::new(ChatAdapter::from_route(route.clone())?));
        }
        Ok(Self::with_backends(backends, sink, config))
    }

    /// Build from preconstructed backends (tests, custom adapters).
    pub fn with_backends(
        backends: Vec<Arc<dyn CompletionBackend>>,
        sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        let counters = Arc::new(UsageCounters::for_providers(
            backends.iter().map(|b| b.name().to_string()),
        ));
        Self {
            backends,
            counters,
            sink,
            config,
        }
    }

    /// Process-wide usage counters, shared with observers.
    pub fn counters(&self) -> Arc<UsageCounters> {
        Arc::clone(&self.counters)
    }

    fn backend(&self, name: &str) -> Option<&Arc<dyn CompletionBackend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    /// One attempt against one backend, under the per-call timeout.
    async fn attempt(
        &self,
        backend: &Arc<dyn CompletionBackend>,
        req: &CompletionRequest,
    ) -> Result<Completion, ProviderError> {
        self.counters.record_call(backend.name());

        let result = match timeout(req.options.timeout, backend.complete(req)).await {
            Ok(inner) => inner,
            Err(_) => Err(ProviderError::Timeout(req.options.timeout)),
        };

        match &result {
            Ok(completion) => {
                self.counters.record_success(
                    backend.name(),
                    u64::from(completion.input_tokens + completion.output_tokens),
                );
                self.sink
                    .record(
                        ProviderCallRecord::new(backend.name(), "", req.attribution.caller)
                            .tokens(completion.input_tokens, completion.output_tokens)
                            .latency(completion.latency.as_millis() as u64)
                            .job(req.attribution.job_id),
                    )
                    .await;
            }
            Err(err) => {
                if matches!(err, ProviderError::RateLimited { .. }) {
                    self.counters.record_rate_limited(backend.name());
                } else {
                    self.counters.record_failure(backend.name());
                }
                self.sink
                    .record(
                        ProviderCallRecord::new(backend.name(), "", req.attribution.caller)
                            .job(req.attribution.job_id)
                            .error(err.code()),
                    )
                    .await;
            }
        }

        result
    }

    /// Run the full rate-limit retry loop against one backend.
    ///
    /// Returns the completion, or the last error once the retry budget for
    /// this provider is spent. `attempts` counts every call issued.
    async fn attempt_with_retries(
        &self,
        backend: &Arc<dyn CompletionBackend>,
        req: &CompletionRequest,
        attempts: &mut u32,
    ) -> Result<Completion, ProviderError> {
        let mut last_error = None;

        for retry in 0..=self.config.max_rate_limit_retries {
            *attempts += 1;
            match self.attempt(backend, req).await {
                Ok(completion) => return Ok(completion),
                Err(err) => {
                    if !err.retry_same_provider() || retry == self.config.max_rate_limit_retries {
                        return Err(err);
                    }
                    let delay = backoff_delay(
                        self.config.retry_base_delay,
                        retry,
                        self.config.retry_max_delay,
                    );
                    debug!(
                        provider = backend.name(),
                        retry, ?delay, "rate limited, backing off"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider(backend.name(), "retry loop exhausted")))
    }
}

#[async_trait::async_trait]
impl CompletionGateway for ProviderGateway {
    async fn complete_with_fallback(
        &self,
        req: &CompletionRequest,
        priority: &[String],
    ) -> Result<FallbackOutcome, ProviderError> {
        if priority.is_empty() {
            return Err(ProviderError::config("empty provider priority list"));
        }

        let mut failures = Vec::new();
        let mut attempts = 0u32;

        for name in priority {
            let Some(backend) = self.backend(name) else {
                failures.push(ProviderFailure {
                    provider: name.clone(),
                    code: "config_error",
                    reason: format!("no backend configured for route {name}"),
                });
                continue;
            };

            match self.attempt_with_retries(backend, req, &mut attempts).await {
                Ok(completion) => {
                    return Ok(FallbackOutcome {
                        completion,
                        provider: name.clone(),
                        attempts,
                    });
                }
                Err(err) => {
                    warn!(provider = %name, code = err.code(), "provider failed, falling through");
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        code: err.code(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Err(ProviderError::Exhausted { failures })
    }
}
