//! Usage tracking: process-wide per-provider counters plus the UsageSink seam.
//!
//! The counters are the only state shared across concurrent unit dispatches.
//! They are plain atomics, so concurrent workers never contend on a lock.
//! The sink decouples call records from any storage backend:
//! - CLI tools use NoopUsageSink or StderrUsageSink
//! - Tests use NoopUsageSink or a recording mock

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call for logging.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider route name.
    pub provider: String,
    /// Model used.
    pub model: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Analysis job this call belongs to (if any).
    pub job_id: Option<Uuid>,
    /// Latency in milliseconds.
    pub latency_ms: u64,
    /// Call status.
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<&'static str>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// When the call was made.
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            job_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn job(mut self, job_id: Option<Uuid>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: &'static str) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code);
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {
        // Discard
    }
}

/// Usage sink that writes to stderr as JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        eprintln!(
            r#"{{"provider":"{}","model":"{}","tokens":{},"latency_ms":{},"status":"{}","caller":"{}"}}"#,
            record.provider,
            record.model,
            record.input_tokens + record.output_tokens,
            record.latency_ms,
            record.status.as_str(),
            record.caller,
        );
    }
}

// =============================================================================
// PROCESS-WIDE COUNTERS
// =============================================================================

/// Per-provider atomic counters.
#[derive(Debug, Default)]
pub struct ProviderCounters {
    pub calls: AtomicU64,
    pub successes: AtomicU64,
    pub rate_limited: AtomicU64,
    pub failures: AtomicU64,
    pub total_tokens: AtomicU64,
}

/// Immutable snapshot of one provider's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCountersSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub failures: u64,
    pub total_tokens: u64,
}

/// Process-wide usage counters keyed by provider route name.
///
/// The key set is fixed at construction (one entry per configured route),
/// so lookups never require a write lock and increments are lock-free.
#[derive(Debug)]
pub struct UsageCounters {
    providers: HashMap<String, ProviderCounters>,
}

impl UsageCounters {
    /// Create counters for a fixed set of provider route names.
    pub fn for_providers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let providers = names
            .into_iter()
            .map(|n| (n.into(), ProviderCounters::default()))
            .collect();
        Self { providers }
    }

    fn get(&self, provider: &str) -> Option<&ProviderCounters> {
        self.providers.get(provider)
    }

    /// Record an issued call before the result is known.
    pub fn record_call(&self, provider: &str) {
        if let Some(c) = self.get(provider) {
            c.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success(&self, provider: &str, tokens: u64) {
        if let Some(c) = self.get(provider) {
            c.successes.fetch_add(1, Ordering::Relaxed);
            c.total_tokens.fetch_add(tokens, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limited(&self, provider: &str) {
        if let Some(c) = self.get(provider) {
            c.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, provider: &str) {
        if let Some(c) = self.get(provider) {
            c.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot a provider's counters, if the provider is known.
    pub fn snapshot(&self, provider: &str) -> Option<ProviderCountersSnapshot> {
        self.get(provider).map(|c| ProviderCountersSnapshot {
            calls: c.calls.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            total_tokens: c.total_tokens.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_per_provider() {
        let counters = UsageCounters::for_providers(["a", "b"]);
        counters.record_call("a");
        counters.record_call("a");
        counters.record_success("a", 120);
        counters.record_rate_limited("a");
        counters.record_call("b");
        counters.record_failure("b");

        let a = counters.snapshot("a").unwrap();
        assert_eq!(a.calls, 2);
        assert_eq!(a.successes, 1);
        assert_eq!(a.rate_limited, 1);
        assert_eq!(a.total_tokens, 120);

        let b = counters.snapshot("b").unwrap();
        assert_eq!(b.calls, 1);
        assert_eq!(b.failures, 1);
    }

    #[test]
    fn test_unknown_provider_is_ignored() {
        let counters = UsageCounters::for_providers(["a"]);
        counters.record_call("nope");
        assert!(counters.snapshot("nope").is_none());
    }

    #[test]
    fn test_call_record_builder() {
        let rec = ProviderCallRecord::new("openai-fast", "gpt-4o-mini", "test")
            .tokens(10, 20)
            .latency(42)
            .error("timeout");
        assert_eq!(rec.status, CallStatus::Error);
        assert_eq!(rec.error_code, Some("timeout"));
        assert_eq!(rec.input_tokens + rec.output_tokens, 30);
    }
}
