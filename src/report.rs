//! The engine's sole external output contract: the result document
//! consumed by reporting and persistence layers.
//!
//! The shape is stable. Maps are BTreeMaps so serialization order is
//! deterministic for a given run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::UnitResult;
use crate::scoring::{
    FactorScore, OverallScores, Priority, SegmentScore, Synthesis, Trend,
};

/// One leaf layer in the report tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerReport {
    pub score: f64,
    pub confidence: f64,
    /// How the score was derived, e.g. "weighted metric mean".
    pub calculation_method: String,
    /// Extracted metrics in raw form.
    pub supporting_data: Value,
    /// Provider routes that served this layer.
    pub data_sources: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorReport {
    pub score: f64,
    pub confidence: f64,
    pub summary: String,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub layers: BTreeMap<String, LayerReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReport {
    pub score: f64,
    pub confidence: f64,
    pub trend: Trend,
    pub priority: Priority,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub factors: BTreeMap<String, FactorReport>,
}

/// The full score report for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDocument {
    pub query: String,
    /// Caller-supplied context, passed through untouched.
    pub context: BTreeMap<String, Value>,
    /// Overall score rescaled to [0,100] for the reporting layer.
    pub overall_score: f64,
    pub overall_confidence: f64,
    pub segments: BTreeMap<String, SegmentReport>,
    pub meta_scores: BTreeMap<String, f64>,
    pub executive_summary: String,
    pub key_recommendations: Vec<String>,
    pub competitive_advantages: Vec<String>,
    pub risk_factors: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ResultDocument {
    /// Assemble the document from already-aggregated pieces. Only segments
    /// that finished aggregation appear; an aborted run yields a partial
    /// but internally consistent tree.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        query: String,
        context: BTreeMap<String, Value>,
        segments: &[SegmentScore],
        factors: &[FactorScore],
        units: &[UnitResult],
        overall: &OverallScores,
        synthesis: Synthesis,
    ) -> Self {
        let mut segment_reports = BTreeMap::new();
        for segment in segments {
            let mut factor_reports = BTreeMap::new();
            for factor in factors
                .iter()
                .filter(|f| segment.factor_ids.contains(&f.factor_id))
            {
                let mut layers = BTreeMap::new();
                for unit in units.iter().filter(|u| u.factor_id == factor.factor_id) {
                    layers.insert(unit.unit_id.clone(), layer_report(unit));
                }
                factor_reports.insert(
                    factor.factor_id.clone(),
                    FactorReport {
                        score: factor.score,
                        confidence: factor.confidence,
                        summary: factor.summary.clone(),
                        key_insights: factor.key_insights.clone(),
                        recommendations: factor.recommendations.clone(),
                        layers,
                    },
                );
            }
            segment_reports.insert(
                segment.segment_id.clone(),
                SegmentReport {
                    score: segment.score,
                    confidence: segment.confidence,
                    trend: segment.trend,
                    priority: segment.priority,
                    key_insights: segment.key_insights.clone(),
                    recommendations: segment.recommendations.clone(),
                    factors: factor_reports,
                },
            );
        }

        Self {
            query,
            context,
            overall_score: overall.score * 100.0,
            overall_confidence: overall.confidence,
            segments: segment_reports,
            meta_scores: overall.meta_scores.clone(),
            executive_summary: synthesis.executive_summary,
            key_recommendations: synthesis.key_recommendations,
            competitive_advantages: synthesis.competitive_advantages,
            risk_factors: synthesis.risk_factors,
            generated_at: Utc::now(),
        }
    }
}

fn layer_report(unit: &UnitResult) -> LayerReport {
    let calculation_method = if unit.provider.is_none() {
        "neutral fallback (providers unavailable)".to_string()
    } else if unit.metrics.is_empty() {
        "neutral fallback (no extractable metric)".to_string()
    } else {
        "weighted metric mean".to_string()
    };

    LayerReport {
        score: unit.score,
        confidence: unit.confidence,
        calculation_method,
        supporting_data: serde_json::to_value(&unit.metrics).unwrap_or(Value::Null),
        data_sources: unit.provider.iter().cloned().collect(),
        summary: unit.rationale.clone(),
    }
}
