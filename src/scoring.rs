//! Hierarchical score aggregation: units roll up to factors, factors to
//! segments, segments to the overall result, plus declarative meta-score
//! projections.
//!
//! Everything here is a pure function of its inputs. Children are sorted
//! by id before accumulation, so any input ordering produces bit-identical
//! output. Confidence acts as the aggregation weight; a missing or
//! degraded child shows up as reduced confidence, never as a hidden gap.
//!
//! Confidence penalty convention: a level's confidence is the sum of child
//! confidences over the *expected* child count (absent children count as
//! zero), multiplied by resolved/expected where a child is resolved when
//! its confidence is above zero. Removing a child can therefore never
//! raise confidence.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::PriorityThresholds;
use crate::dispatch::{UnitResult, NEUTRAL_SCORE};
use crate::registry::{FactorDef, MetaScoreSpec, SegmentDef};

// =============================================================================
// CLASSIFICATIONS
// =============================================================================

/// Direction of a segment relative to the neutral midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// Attention classification over (score, confidence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Classify a score against the stable band around the 0.5 midpoint.
pub fn classify_trend(score: f64, neutral_band: f64) -> Trend {
    if score > NEUTRAL_SCORE + neutral_band {
        Trend::Up
    } else if score < NEUTRAL_SCORE - neutral_band {
        Trend::Down
    } else {
        Trend::Stable
    }
}

/// Classify priority. Zero confidence is always Low: a number nobody
/// stands behind deserves no attention ranking.
pub fn classify_priority(score: f64, confidence: f64, t: &PriorityThresholds) -> Priority {
    if confidence <= 0.0 {
        Priority::Low
    } else if score >= t.high_score && confidence >= t.high_confidence {
        Priority::High
    } else if score >= t.medium_score {
        Priority::Medium
    } else {
        Priority::Low
    }
}

// =============================================================================
// SCORE TYPES
// =============================================================================

/// Aggregated score for one factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorScore {
    pub factor_id: String,
    pub factor_name: String,
    pub score: f64,
    pub confidence: f64,
    /// Contributing unit ids, sorted.
    pub unit_ids: Vec<String>,
    pub summary: String,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Aggregated score for one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentScore {
    pub segment_id: String,
    pub segment_name: String,
    pub score: f64,
    pub confidence: f64,
    /// Contributing factor ids, sorted.
    pub factor_ids: Vec<String>,
    pub trend: Trend,
    pub priority: Priority,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Top of the hierarchy: overall score plus meta-score projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallScores {
    /// Overall score in [0,1]; the report layer rescales to [0,100].
    pub score: f64,
    pub confidence: f64,
    /// Named projections, ordered by name for stable serialization.
    pub meta_scores: BTreeMap<String, f64>,
}

/// Narrative synthesis derived from already-aggregated segment scores.
/// No provider calls happen at this stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub executive_summary: String,
    pub key_recommendations: Vec<String>,
    pub competitive_advantages: Vec<String>,
    pub risk_factors: Vec<String>,
}

// =============================================================================
// ACCUMULATION
// =============================================================================

/// Confidence-weighted mean with an optional per-child weight, guarding
/// the all-zero-weight case with an unweighted mean.
fn weighted_mean(children: &[(f64, f64)]) -> f64 {
    if children.is_empty() {
        return NEUTRAL_SCORE;
    }
    let numerator: f64 = children.iter().map(|(score, weight)| score * weight).sum();
    let denominator: f64 = children.iter().map(|(_, weight)| weight).sum();
    if denominator > 0.0 {
        numerator / denominator
    } else {
        children.iter().map(|(score, _)| score).sum::<f64>() / children.len() as f64
    }
}

/// Confidence of a level: Σ(child confidence) / expected, further scaled
/// by resolved/expected. `expected` is the registered child count and is
/// never below the provided count.
fn level_confidence(confidences: &[f64], expected: usize) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    let expected_f = expected.max(confidences.len()) as f64;
    let sum: f64 = confidences.iter().sum();
    let resolved = confidences.iter().filter(|c| **c > 0.0).count() as f64;
    (sum / expected_f) * (resolved / expected_f)
}

// =============================================================================
// AGGREGATION
// =============================================================================

/// Roll unit results up to a factor score.
///
/// `expected_units` is the number of units the taxonomy registers for
/// this factor; units that never produced a result penalize confidence.
pub fn aggregate_factor(
    factor: &FactorDef,
    units: &[&UnitResult],
    expected_units: usize,
) -> FactorScore {
    let mut sorted: Vec<&UnitResult> = units.to_vec();
    sorted.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

    let children: Vec<(f64, f64)> = sorted.iter().map(|u| (u.score, u.confidence)).collect();
    let score = weighted_mean(&children);
    let confidences: Vec<f64> = sorted.iter().map(|u| u.confidence).collect();
    let confidence = level_confidence(&confidences, expected_units);

    let unit_ids: Vec<String> = sorted.iter().map(|u| u.unit_id.clone()).collect();
    let resolved = sorted.iter().filter(|u| u.confidence > 0.0).count();

    let summary = format!(
        "{} scored {:.2} (confidence {:.2}) from {} of {} layers",
        factor.name, score, confidence, resolved, expected_units
    );

    let mut key_insights = Vec::new();
    let mut recommendations = Vec::new();
    if let Some(best) = sorted
        .iter()
        .filter(|u| u.confidence > 0.0)
        .max_by(|a, b| a.score.total_cmp(&b.score))
    {
        key_insights.push(format!(
            "Strongest layer: {} at {:.2}",
            best.unit_id, best.score
        ));
    }
    if let Some(worst) = sorted
        .iter()
        .filter(|u| u.confidence > 0.0)
        .min_by(|a, b| a.score.total_cmp(&b.score))
    {
        if worst.score < 0.4 {
            key_insights.push(format!(
                "Weakest layer: {} at {:.2}",
                worst.unit_id, worst.score
            ));
            recommendations.push(format!(
                "Address weakness in {} within {}",
                worst.unit_id, factor.name
            ));
        }
    }
    if resolved < expected_units {
        key_insights.push(format!(
            "Partial coverage: {} of {} layers resolved",
            resolved, expected_units
        ));
    }

    FactorScore {
        factor_id: factor.id.clone(),
        factor_name: factor.name.clone(),
        score: score.clamp(0.0, 1.0),
        confidence: confidence.clamp(0.0, 1.0),
        unit_ids,
        summary,
        key_insights,
        recommendations,
    }
}

/// Aggregation thresholds threaded down from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct AggregationSettings {
    pub neutral_band: f64,
    pub thresholds: PriorityThresholds,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            neutral_band: 0.05,
            thresholds: PriorityThresholds::default(),
        }
    }
}

/// Roll factor scores up to a segment score. `weights` holds the
/// per-factor business-importance weights; factors absent from the map
/// weigh 1.0.
pub fn aggregate_segment(
    segment: &SegmentDef,
    factors: &[FactorScore],
    weights: &HashMap<String, f64>,
    expected_factors: usize,
    settings: &AggregationSettings,
) -> SegmentScore {
    let mut sorted: Vec<&FactorScore> = factors.iter().collect();
    sorted.sort_by(|a, b| a.factor_id.cmp(&b.factor_id));

    let children: Vec<(f64, f64)> = sorted
        .iter()
        .map(|f| {
            let importance = weights.get(&f.factor_id).copied().unwrap_or(1.0);
            (f.score, f.confidence * importance)
        })
        .collect();
    let score = weighted_mean(&children);
    let confidences: Vec<f64> = sorted.iter().map(|f| f.confidence).collect();
    let confidence = level_confidence(&confidences, expected_factors);

    let trend = classify_trend(score, settings.neutral_band);
    let priority = classify_priority(score, confidence, &settings.thresholds);

    let mut key_insights = Vec::new();
    let mut recommendations = Vec::new();
    for factor in &sorted {
        if factor.confidence <= 0.0 {
            continue;
        }
        if factor.score >= 0.6 {
            key_insights.push(format!(
                "{} is a strength at {:.2}",
                factor.factor_name, factor.score
            ));
        } else if factor.score <= 0.4 {
            key_insights.push(format!(
                "{} is a weakness at {:.2}",
                factor.factor_name, factor.score
            ));
            recommendations.push(format!("Invest in improving {}", factor.factor_name));
        }
    }
    if key_insights.is_empty() && !sorted.is_empty() {
        key_insights.push(format!(
            "{} shows balanced mid-range performance",
            segment.name
        ));
    }

    SegmentScore {
        segment_id: segment.id.clone(),
        segment_name: segment.name.clone(),
        score: score.clamp(0.0, 1.0),
        confidence: confidence.clamp(0.0, 1.0),
        factor_ids: sorted.iter().map(|f| f.factor_id.clone()).collect(),
        trend,
        priority,
        key_insights,
        recommendations,
    }
}

/// Roll segment scores up to the overall score and compute meta-score
/// projections over the full factor set.
pub fn aggregate_overall(
    segments: &[SegmentScore],
    all_factors: &[FactorScore],
    specs: &[MetaScoreSpec],
    expected_segments: usize,
) -> OverallScores {
    let mut sorted: Vec<&SegmentScore> = segments.iter().collect();
    sorted.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));

    let children: Vec<(f64, f64)> = sorted.iter().map(|s| (s.score, s.confidence)).collect();
    let score = weighted_mean(&children);
    let confidences: Vec<f64> = sorted.iter().map(|s| s.confidence).collect();
    let confidence = level_confidence(&confidences, expected_segments);

    let mut meta_scores = BTreeMap::new();
    for spec in specs {
        meta_scores.insert(spec.name.clone(), meta_score(spec, all_factors));
    }

    OverallScores {
        score: score.clamp(0.0, 1.0),
        confidence: confidence.clamp(0.0, 1.0),
        meta_scores,
    }
}

/// One declarative projection: weighted mean over the named factors,
/// inverted when the declaration says so. Factors not yet aggregated (aborted
/// runs) simply do not contribute; an empty intersection is neutral.
fn meta_score(spec: &MetaScoreSpec, factors: &[FactorScore]) -> f64 {
    let mut ids = spec.factor_ids.clone();
    ids.sort_unstable();

    let children: Vec<(f64, f64)> = ids
        .iter()
        .filter_map(|id| {
            factors.iter().find(|f| &f.factor_id == id).map(|f| {
                let weight = spec.weights.get(id).copied().unwrap_or(1.0);
                (f.score, weight)
            })
        })
        .collect();

    if children.is_empty() {
        return NEUTRAL_SCORE;
    }

    let value = weighted_mean(&children).clamp(0.0, 1.0);
    if spec.invert {
        1.0 - value
    } else {
        value
    }
}

// =============================================================================
// SYNTHESIS
// =============================================================================

/// Band label for the executive summary.
fn verdict(score: f64) -> &'static str {
    if score >= 0.7 {
        "strong"
    } else if score >= 0.55 {
        "favorable"
    } else if score >= 0.45 {
        "mixed"
    } else if score >= 0.3 {
        "challenging"
    } else {
        "unfavorable"
    }
}

/// Deterministic narrative synthesis from already-aggregated scores.
pub fn synthesize(query: &str, segments: &[SegmentScore], overall: &OverallScores) -> Synthesis {
    let mut sorted: Vec<&SegmentScore> = segments.iter().collect();
    sorted.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));

    let executive_summary = format!(
        "Assessment of \"{}\": overall outlook is {} (score {:.1}/100, confidence {:.2}) across {} analyzed segments.",
        query,
        verdict(overall.score),
        overall.score * 100.0,
        overall.confidence,
        sorted.len()
    );

    let mut key_recommendations: Vec<String> = Vec::new();
    let mut competitive_advantages = Vec::new();
    let mut risk_factors = Vec::new();

    for segment in &sorted {
        if segment.confidence <= 0.0 {
            continue;
        }
        if segment.score >= 0.6 {
            competitive_advantages.push(format!(
                "{} ({:.2}, {:?} trend)",
                segment.segment_name, segment.score, segment.trend
            ));
        } else if segment.score <= 0.4 {
            risk_factors.push(format!(
                "{} underperforms at {:.2}",
                segment.segment_name, segment.score
            ));
        }
        key_recommendations.extend(segment.recommendations.iter().cloned());
    }

    if key_recommendations.is_empty() {
        key_recommendations.push(match verdict(overall.score) {
            "strong" | "favorable" => "Proceed; monitor the lowest-confidence segments".to_string(),
            "mixed" => "Proceed with caution; deepen analysis where confidence is low".to_string(),
            _ => "Reassess the opportunity before committing resources".to_string(),
        });
    }

    Synthesis {
        executive_summary,
        key_recommendations,
        competitive_advantages,
        risk_factors,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn unit(id: &str, score: f64, confidence: f64) -> UnitResult {
        UnitResult {
            unit_id: id.into(),
            factor_id: "f".into(),
            segment_id: "s".into(),
            raw_text: String::new(),
            metrics: Vec::new(),
            score,
            confidence,
            rationale: String::new(),
            provider: None,
            timestamp: Utc::now(),
        }
    }

    fn factor_def(id: &str) -> FactorDef {
        FactorDef {
            id: id.into(),
            segment_id: "s".into(),
            name: format!("Factor {id}"),
            weight: 1.0,
        }
    }

    fn segment_def(id: &str) -> SegmentDef {
        SegmentDef {
            id: id.into(),
            name: format!("Segment {id}"),
        }
    }

    fn factor_score(id: &str, score: f64, confidence: f64) -> FactorScore {
        FactorScore {
            factor_id: id.into(),
            factor_name: format!("Factor {id}"),
            score,
            confidence,
            unit_ids: Vec::new(),
            summary: String::new(),
            key_insights: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn test_factor_confidence_weighted_mean() {
        // Units (0.8, 0.9), (0.6, 0.5), (0.5, 0.0 unavailable):
        // score = (0.8*0.9 + 0.6*0.5 + 0) / (0.9 + 0.5) = 1.02 / 1.4
        // confidence = (1.4 / 3) * (2 / 3)
        let u1 = unit("u1", 0.8, 0.9);
        let u2 = unit("u2", 0.6, 0.5);
        let u3 = unit("u3", 0.5, 0.0);
        let score = aggregate_factor(&factor_def("f"), &[&u1, &u2, &u3], 3);

        assert!((score.score - 1.02 / 1.4).abs() < 1e-12);
        assert!((score.confidence - (1.4 / 3.0) * (2.0 / 3.0)).abs() < 1e-12);
        assert_eq!(score.unit_ids, vec!["u1", "u2", "u3"]);
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let u1 = unit("u1", 0.8, 0.9);
        let u2 = unit("u2", 0.6, 0.5);
        let u3 = unit("u3", 0.5, 0.0);

        let forward = aggregate_factor(&factor_def("f"), &[&u1, &u2, &u3], 3);
        let reversed = aggregate_factor(&factor_def("f"), &[&u3, &u2, &u1], 3);

        assert_eq!(forward.score.to_bits(), reversed.score.to_bits());
        assert_eq!(forward.confidence.to_bits(), reversed.confidence.to_bits());
        assert_eq!(forward.unit_ids, reversed.unit_ids);
        assert_eq!(forward.key_insights, reversed.key_insights);
    }

    #[test]
    fn test_removing_a_unit_never_raises_confidence() {
        let units = [
            unit("u1", 0.8, 0.9),
            unit("u2", 0.6, 0.5),
            unit("u3", 0.5, 0.0),
            unit("u4", 0.7, 0.3),
        ];
        let all: Vec<&UnitResult> = units.iter().collect();
        let full = aggregate_factor(&factor_def("f"), &all, 4);

        for skip in 0..units.len() {
            let subset: Vec<&UnitResult> = units
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, u)| u)
                .collect();
            let partial = aggregate_factor(&factor_def("f"), &subset, 4);
            assert!(
                partial.confidence <= full.confidence + 1e-12,
                "dropping unit {} raised confidence {} -> {}",
                units[skip].unit_id,
                full.confidence,
                partial.confidence
            );
        }
    }

    #[test]
    fn test_all_zero_confidence_falls_back_to_unweighted_mean() {
        let u1 = unit("u1", 0.2, 0.0);
        let u2 = unit("u2", 0.8, 0.0);
        let score = aggregate_factor(&factor_def("f"), &[&u1, &u2], 2);
        assert!((score.score - 0.5).abs() < 1e-12);
        assert_eq!(score.confidence, 0.0);
    }

    #[test]
    fn test_empty_factor_defaults() {
        let score = aggregate_factor(&factor_def("f"), &[], 0);
        assert_eq!(score.score, NEUTRAL_SCORE);
        assert_eq!(score.confidence, 0.0);
    }

    #[test]
    fn test_empty_segment_defaults() {
        let score = aggregate_segment(
            &segment_def("s"),
            &[],
            &HashMap::new(),
            0,
            &AggregationSettings::default(),
        );
        assert_eq!(score.score, NEUTRAL_SCORE);
        assert_eq!(score.confidence, 0.0);
        assert_eq!(score.priority, Priority::Low);
        assert_eq!(score.trend, Trend::Stable);
    }

    #[test]
    fn test_segment_importance_weights_shift_score() {
        let strong = factor_score("a", 0.9, 0.8);
        let weak = factor_score("b", 0.3, 0.8);
        let uniform = aggregate_segment(
            &segment_def("s"),
            &[strong.clone(), weak.clone()],
            &HashMap::new(),
            2,
            &AggregationSettings::default(),
        );
        let weights = HashMap::from([("a".to_string(), 3.0)]);
        let tilted = aggregate_segment(
            &segment_def("s"),
            &[strong, weak],
            &weights,
            2,
            &AggregationSettings::default(),
        );
        assert!((uniform.score - 0.6).abs() < 1e-12);
        assert!(tilted.score > uniform.score);
    }

    #[test]
    fn test_trend_band() {
        assert_eq!(classify_trend(0.60, 0.05), Trend::Up);
        assert_eq!(classify_trend(0.53, 0.05), Trend::Stable);
        assert_eq!(classify_trend(0.47, 0.05), Trend::Stable);
        assert_eq!(classify_trend(0.40, 0.05), Trend::Down);
    }

    #[test]
    fn test_priority_thresholds() {
        let t = PriorityThresholds::default();
        assert_eq!(classify_priority(0.8, 0.7, &t), Priority::High);
        // High score without confidence backing is only medium.
        assert_eq!(classify_priority(0.8, 0.3, &t), Priority::Medium);
        assert_eq!(classify_priority(0.5, 0.9, &t), Priority::Medium);
        assert_eq!(classify_priority(0.2, 0.9, &t), Priority::Low);
        assert_eq!(classify_priority(0.9, 0.0, &t), Priority::Low);
    }

    #[test]
    fn test_meta_score_weighted_and_inverted() {
        let factors = vec![factor_score("risk_a", 0.8, 0.9), factor_score("risk_b", 0.4, 0.9)];
        let plain = MetaScoreSpec {
            name: "health".into(),
            factor_ids: vec!["risk_a".into(), "risk_b".into()],
            weights: HashMap::new(),
            invert: false,
        };
        let inverted = MetaScoreSpec {
            name: "exposure".into(),
            factor_ids: vec!["risk_a".into(), "risk_b".into()],
            weights: HashMap::new(),
            invert: true,
        };
        let overall = aggregate_overall(&[], &factors, &[plain, inverted], 0);
        let health = overall.meta_scores["health"];
        let exposure = overall.meta_scores["exposure"];
        assert!((health - 0.6).abs() < 1e-12);
        assert!((exposure - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_meta_score_missing_factors_neutral() {
        let spec = MetaScoreSpec {
            name: "ghost".into(),
            factor_ids: vec!["absent".into()],
            weights: HashMap::new(),
            invert: false,
        };
        let overall = aggregate_overall(&[], &[], &[spec], 0);
        assert_eq!(overall.meta_scores["ghost"], NEUTRAL_SCORE);
    }

    #[test]
    fn test_overall_penalizes_missing_segments() {
        let seg = |id: &str, score: f64, conf: f64| SegmentScore {
            segment_id: id.into(),
            segment_name: id.into(),
            score,
            confidence: conf,
            factor_ids: Vec::new(),
            trend: Trend::Stable,
            priority: Priority::Medium,
            key_insights: Vec::new(),
            recommendations: Vec::new(),
        };
        let full = aggregate_overall(
            &[seg("a", 0.7, 0.8), seg("b", 0.6, 0.8)],
            &[],
            &[],
            2,
        );
        let partial = aggregate_overall(&[seg("a", 0.7, 0.8)], &[], &[], 2);
        assert!(partial.confidence < full.confidence);
        assert!((partial.score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_synthesis_collects_advantages_and_risks() {
        let seg = |id: &str, name: &str, score: f64| SegmentScore {
            segment_id: id.into(),
            segment_name: name.into(),
            score,
            confidence: 0.8,
            factor_ids: Vec::new(),
            trend: classify_trend(score, 0.05),
            priority: Priority::Medium,
            key_insights: Vec::new(),
            recommendations: vec![format!("Fix {name}")],
        };
        let segments = vec![seg("m", "Market", 0.75), seg("p", "Product", 0.3)];
        let overall = aggregate_overall(&segments, &[], &[], 2);
        let synthesis = synthesize("enter the EV market?", &segments, &overall);

        assert!(synthesis.executive_summary.contains("enter the EV market?"));
        assert_eq!(synthesis.competitive_advantages.len(), 1);
        assert!(synthesis.competitive_advantages[0].contains("Market"));
        assert_eq!(synthesis.risk_factors.len(), 1);
        assert!(synthesis.risk_factors[0].contains("Product"));
        assert!(!synthesis.key_recommendations.is_empty());
    }
}
