//! Agent dispatcher: runs one analysis unit end to end.
//!
//! Builds the persona prompt with dependency context, calls the gateway
//! with fallback under a hard per-unit timeout, extracts metrics, and
//! derives the unit score. `run_unit` never errors: provider exhaustion
//! and empty extractions degrade into a neutral-score result so a single
//! unavailable unit can never abort a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::extract::{ExtractedMetric, RuleSet};
use crate::gateway::{
    Attribution, CompletionGateway, CompletionOptions, CompletionRequest, ProviderError,
};
use crate::prompts::{persona_by_slug, DEFAULT_PERSONA};
use crate::registry::AnalysisUnit;

/// Neutral score used when a unit cannot produce a real one.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Confidence floor applied when a completion yields zero metrics.
pub const AMBIGUOUS_CONFIDENCE: f64 = 0.2;

// =============================================================================
// UNIT RESULTS
// =============================================================================

/// Outcome of one analysis unit. Created exactly once per unit per run
/// and never mutated; corrections require a new run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: String,
    pub factor_id: String,
    pub segment_id: String,
    /// Raw completion text, empty when the unit degraded without a call.
    pub raw_text: String,
    pub metrics: Vec<ExtractedMetric>,
    /// Derived score in [0,1].
    pub score: f64,
    /// Confidence in [0,1]; 0.0 marks an unavailable unit.
    pub confidence: f64,
    /// Human-readable account of how the score came to be.
    pub rationale: String,
    /// Route name of the provider that served the completion, if any.
    pub provider: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// CONTEXT MEMORY
// =============================================================================

/// Append-only, per-unit-keyed store of findings summaries.
///
/// Each unit's summary is written exactly once, after its dispatch joins,
/// and is read-only afterward. Units within a segment never observe each
/// other; only later segments read earlier entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextMemory {
    entries: HashMap<String, String>,
}

impl ContextMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a unit's summary. The first write wins; a second write for
    /// the same unit is ignored, preserving write-once semantics.
    pub fn record(&mut self, unit_id: impl Into<String>, summary: impl Into<String>) {
        self.entries.entry(unit_id.into()).or_insert_with(|| summary.into());
    }

    pub fn get(&self, unit_id: &str) -> Option<&str> {
        self.entries.get(unit_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dependency context block for a unit, most-relevant-first (the
    /// unit's declaration order), truncated to a character budget.
    pub fn excerpt_for(&self, depends_on: &[String], budget_chars: usize) -> String {
        let mut out = String::new();
        for dep in depends_on {
            let Some(summary) = self.get(dep) else {
                continue;
            };
            let line = format!("{dep}: {summary}\n");
            if out.len() + line.len() > budget_chars {
                let remaining = budget_chars.saturating_sub(out.len());
                if remaining > dep.len() + 2 {
                    out.push_str(truncate_chars(&line, remaining));
                    out.push('\n');
                }
                break;
            }
            out.push_str(&line);
        }
        out
    }
}

/// Truncate on a char boundary.
fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

/// Per-run dispatch settings, lifted from [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_priority: Vec<String>,
    pub unit_timeout: Duration,
    pub call_timeout: Duration,
    pub context_budget_chars: usize,
    pub summary_max_chars: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_priority: Vec::new(),
            unit_timeout: Duration::from_secs(120),
            call_timeout: Duration::from_secs(60),
            context_budget_chars: 6_000,
            summary_max_chars: 400,
        }
    }
}

/// Runs analysis units against the gateway.
pub struct AgentDispatcher {
    gateway: Arc<dyn CompletionGateway>,
    rule_sets: Arc<HashMap<String, RuleSet>>,
    settings: DispatchSettings,
}

impl AgentDispatcher {
    pub fn new(
        gateway: Arc<dyn CompletionGateway>,
        rule_sets: Arc<HashMap<String, RuleSet>>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            gateway,
            rule_sets,
            settings,
        }
    }

    /// Run one unit to completion. Never errors; failures degrade into a
    /// neutral result with zero confidence.
    pub async fn run_unit(
        &self,
        unit: &AnalysisUnit,
        query: &str,
        memory: &ContextMemory,
        job_id: Option<Uuid>,
    ) -> UnitResult {
        let persona = persona_by_slug(&unit.persona).unwrap_or(DEFAULT_PERSONA);
        let prior = memory.excerpt_for(&unit.depends_on, self.settings.context_budget_chars);
        let prompt = persona.render(query, &unit.focus, &prior);

        let mut attribution = Attribution::new("dispatch::run_unit");
        if let Some(id) = job_id {
            attribution = attribution.with_job(id);
        }

        let request = CompletionRequest::new(prompt.user, attribution)
            .system(prompt.system)
            .options(CompletionOptions {
                timeout: self.settings.call_timeout,
                ..CompletionOptions::default()
            });

        let priority: &[String] = if unit.provider_priority.is_empty() {
            &self.settings.default_priority
        } else {
            &unit.provider_priority
        };

        let outcome = tokio::time::timeout(
            self.settings.unit_timeout,
            self.gateway.complete_with_fallback(&request, priority),
        )
        .await;

        match outcome {
            Ok(Ok(fallback)) => {
                debug!(
                    unit = %unit.id,
                    provider = %fallback.provider,
                    attempts = fallback.attempts,
                    "unit completed"
                );
                self.score_completion(unit, fallback.completion.text, fallback.provider)
            }
            Ok(Err(err)) => {
                warn!(unit = %unit.id, error = %err, "unit degraded: providers exhausted");
                Self::unavailable(unit, &err)
            }
            Err(_) => {
                warn!(
                    unit = %unit.id,
                    timeout_secs = self.settings.unit_timeout.as_secs(),
                    "unit degraded: wall-clock timeout"
                );
                Self::unavailable_with_reason(
                    unit,
                    format!(
                        "unit timed out after {}s",
                        self.settings.unit_timeout.as_secs()
                    ),
                )
            }
        }
    }

    /// Bounded summary of a result for the context memory.
    pub fn summarize(&self, result: &UnitResult) -> String {
        let mut summary = if result.metrics.is_empty() {
            result.rationale.clone()
        } else {
            let metrics: Vec<String> = result
                .metrics
                .iter()
                .map(|m| format!("{}={:.2} ({})", m.name, m.value, m.unit))
                .collect();
            format!("score {:.2}; {}", result.score, metrics.join(", "))
        };
        if summary.chars().count() > self.settings.summary_max_chars {
            summary = truncate_chars(&summary, self.settings.summary_max_chars).to_string();
        }
        summary
    }

    fn score_completion(
        &self,
        unit: &AnalysisUnit,
        text: String,
        provider: String,
    ) -> UnitResult {
        let Some(rules) = self.rule_sets.get(&unit.id) else {
            // validate() compiles a rule set for every unit, so this only
            // happens when a dispatcher is built from a foreign registry.
            return Self::unavailable_with_reason(unit, "no compiled rules for unit".to_string());
        };

        let metrics = rules.extract(&text);

        if metrics.is_empty() {
            return UnitResult {
                unit_id: unit.id.clone(),
                factor_id: unit.factor_id.clone(),
                segment_id: unit.segment_id.clone(),
                raw_text: text,
                metrics,
                score: NEUTRAL_SCORE,
                confidence: AMBIGUOUS_CONFIDENCE,
                rationale: "no extractable metric; neutral fallback applied".to_string(),
                provider: Some(provider),
                timestamp: Utc::now(),
            };
        }

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut confidence_sum = 0.0;
        for metric in &metrics {
            let weight = rules.metric_weight(&metric.name);
            weighted_sum += metric.normalized * weight;
            weight_total += weight;
            confidence_sum += metric.confidence;
        }
        let score = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            metrics.iter().map(|m| m.normalized).sum::<f64>() / metrics.len() as f64
        };

        // Fewer metrics than the rules can produce means thinner evidence.
        let expected = rules.expected_metric_count().max(1);
        let coverage = (metrics.len() as f64 / expected as f64).min(1.0);
        let confidence = (confidence_sum / metrics.len() as f64) * coverage;

        let rationale = format!(
            "{} of {} expected metrics extracted; confidence-weighted score {:.3}",
            metrics.len(),
            expected,
            score
        );

        UnitResult {
            unit_id: unit.id.clone(),
            factor_id: unit.factor_id.clone(),
            segment_id: unit.segment_id.clone(),
            raw_text: text,
            metrics,
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            rationale,
            provider: Some(provider),
            timestamp: Utc::now(),
        }
    }

    fn unavailable(unit: &AnalysisUnit, err: &ProviderError) -> UnitResult {
        Self::unavailable_with_reason(unit, err.to_string())
    }

    fn unavailable_with_reason(unit: &AnalysisUnit, reason: String) -> UnitResult {
        UnitResult {
            unit_id: unit.id.clone(),
            factor_id: unit.factor_id.clone(),
            segment_id: unit.segment_id.clone(),
            raw_text: String::new(),
            metrics: Vec::new(),
            score: NEUTRAL_SCORE,
            confidence: 0.0,
            rationale: format!("analysis unavailable: {reason}"),
            provider: None,
            timestamp: Utc::now(),
        }
    }
}
