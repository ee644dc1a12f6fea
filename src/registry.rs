//! Static analysis taxonomy: segments contain factors, factors contain
//! units (layers). Each unit carries its persona, extraction rules, and
//! dependency hints.
//!
//! The registry is loaded once at process start and validated before any
//! run; a misconfigured taxonomy is the only fatal error class. Personas
//! and rules are declarative data so the taxonomy can grow without
//! recompilation.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::{ExtractError, ExtractionRule, Normalizer, RuleSet};

// =============================================================================
// TAXONOMY TYPES
// =============================================================================

/// Top-level grouping of factors, e.g. a business dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDef {
    /// Unique segment id, e.g. "market".
    pub id: String,
    /// Display name.
    pub name: String,
}

fn default_factor_weight() -> f64 {
    1.0
}

/// Named grouping of units within a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorDef {
    /// Unique factor id, e.g. "market_size_growth".
    pub id: String,
    /// Parent segment id.
    pub segment_id: String,
    /// Display name.
    pub name: String,
    /// Business-importance weight used when aggregating factors into the
    /// segment score. Uniform (1.0) unless the taxonomy says otherwise.
    #[serde(default = "default_factor_weight")]
    pub weight: f64,
}

/// Smallest analyzable item: one LLM call, one extraction pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisUnit {
    /// Unique unit id, e.g. "market_growth_rate".
    pub id: String,
    /// Parent factor id.
    pub factor_id: String,
    /// Parent segment id.
    pub segment_id: String,
    /// Persona key resolved against the prompt library, e.g. "market_research".
    pub persona: String,
    /// What this unit should analyze, interpolated into the prompt.
    pub focus: String,
    /// Ordered extraction rules; first match per metric name wins.
    pub rules: Vec<ExtractionRule>,
    /// Units whose context summaries should be fed into this unit's prompt.
    /// Dependencies only reach across segments; units within a segment run
    /// concurrently and never see each other.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-unit provider priority override. Empty means the engine default.
    #[serde(default)]
    pub provider_priority: Vec<String>,
}

/// Declarative cross-cutting projection over factor scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaScoreSpec {
    /// Name under which the value appears in the result document.
    pub name: String,
    /// Factors whose scores feed this projection.
    pub factor_ids: Vec<String>,
    /// Optional per-factor weights, keyed by factor id. Uniform when absent.
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    /// When true the projection reports 1 - weighted mean, so a high value
    /// means high exposure.
    #[serde(default)]
    pub invert: bool,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("duplicate id in taxonomy: {0}")]
    DuplicateId(String),

    #[error("unit {unit} references unknown factor {factor}")]
    UnknownFactor { unit: String, factor: String },

    #[error("factor {factor} references unknown segment {segment}")]
    UnknownSegment { factor: String, segment: String },

    #[error("unit {unit} declares segment {declared} but its factor belongs to {actual}")]
    SegmentMismatch {
        unit: String,
        declared: String,
        actual: String,
    },

    #[error("unit {unit} depends on unknown unit {dependency}")]
    UnknownDependency { unit: String, dependency: String },

    #[error("meta-score {name} references unknown factor {factor}")]
    MetaScoreUnknownFactor { name: String, factor: String },

    #[error("unit {unit} has no extraction rules")]
    NoRules { unit: String },

    #[error("unit {unit}: {source}")]
    BadRule {
        unit: String,
        #[source]
        source: ExtractError,
    },

    #[error("failed to parse taxonomy JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

// =============================================================================
// REGISTRY
// =============================================================================

/// The full static taxonomy plus meta-score declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub segments: Vec<SegmentDef>,
    pub factors: Vec<FactorDef>,
    pub units: Vec<AnalysisUnit>,
    #[serde(default)]
    pub meta_scores: Vec<MetaScoreSpec>,
}

impl Registry {
    /// Parse an externalized taxonomy. Callers must still `validate()`.
    pub fn from_json(json: &str) -> Result<Self, TaxonomyError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Segment visit order, as configured. Later segments' prompts may
    /// reference earlier segments' context memory.
    pub fn segment_order(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn segment(&self, id: &str) -> Option<&SegmentDef> {
        self.segments.iter().find(|s| s.id == id)
    }

    pub fn factor(&self, id: &str) -> Option<&FactorDef> {
        self.factors.iter().find(|f| f.id == id)
    }

    pub fn unit(&self, id: &str) -> Option<&AnalysisUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Factors of one segment, in declaration order.
    pub fn factors_of(&self, segment_id: &str) -> Vec<&FactorDef> {
        self.factors
            .iter()
            .filter(|f| f.segment_id == segment_id)
            .collect()
    }

    /// Units of one factor, in declaration order.
    pub fn units_of_factor(&self, factor_id: &str) -> Vec<&AnalysisUnit> {
        self.units
            .iter()
            .filter(|u| u.factor_id == factor_id)
            .collect()
    }

    /// Units of one segment, in declaration order.
    pub fn units_of_segment(&self, segment_id: &str) -> Vec<&AnalysisUnit> {
        self.units
            .iter()
            .filter(|u| u.segment_id == segment_id)
            .collect()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Per-factor weight map for a segment, keyed by factor id.
    pub fn factor_weights(&self, segment_id: &str) -> HashMap<String, f64> {
        self.factors_of(segment_id)
            .into_iter()
            .map(|f| (f.id.clone(), f.weight))
            .collect()
    }

    /// Check referential integrity and compile every unit's rule set.
    ///
    /// Returns the compiled rule sets keyed by unit id so rule compilation
    /// happens exactly once. Any failure here aborts the run before a
    /// single provider call is made.
    pub fn validate(&self) -> Result<HashMap<String, RuleSet>, TaxonomyError> {
        let mut ids: HashSet<&str> = HashSet::new();
        for id in self
            .segments
            .iter()
            .map(|s| s.id.as_str())
            .chain(self.factors.iter().map(|f| f.id.as_str()))
            .chain(self.units.iter().map(|u| u.id.as_str()))
        {
            if !ids.insert(id) {
                return Err(TaxonomyError::DuplicateId(id.to_string()));
            }
        }

        let segment_ids: HashSet<&str> = self.segments.iter().map(|s| s.id.as_str()).collect();
        let factor_ids: HashSet<&str> = self.factors.iter().map(|f| f.id.as_str()).collect();
        let unit_ids: HashSet<&str> = self.units.iter().map(|u| u.id.as_str()).collect();

        for factor in &self.factors {
            if !segment_ids.contains(factor.segment_id.as_str()) {
                return Err(TaxonomyError::UnknownSegment {
                    factor: factor.id.clone(),
                    segment: factor.segment_id.clone(),
                });
            }
        }

        let mut rule_sets = HashMap::with_capacity(self.units.len());
        for unit in &self.units {
            let factor = self.factor(&unit.factor_id).ok_or_else(|| {
                TaxonomyError::UnknownFactor {
                    unit: unit.id.clone(),
                    factor: unit.factor_id.clone(),
                }
            })?;
            if factor.segment_id != unit.segment_id {
                return Err(TaxonomyError::SegmentMismatch {
                    unit: unit.id.clone(),
                    declared: unit.segment_id.clone(),
                    actual: factor.segment_id.clone(),
                });
            }
            for dep in &unit.depends_on {
                if !unit_ids.contains(dep.as_str()) {
                    return Err(TaxonomyError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            if unit.rules.is_empty() {
                return Err(TaxonomyError::NoRules {
                    unit: unit.id.clone(),
                });
            }
            let rules = RuleSet::compile(&unit.rules).map_err(|source| TaxonomyError::BadRule {
                unit: unit.id.clone(),
                source,
            })?;
            rule_sets.insert(unit.id.clone(), rules);
        }

        for spec in &self.meta_scores {
            for factor in &spec.factor_ids {
                if !factor_ids.contains(factor.as_str()) {
                    return Err(TaxonomyError::MetaScoreUnknownFactor {
                        name: spec.name.clone(),
                        factor: factor.clone(),
                    });
                }
            }
        }

        Ok(rule_sets)
    }

    /// The built-in five-segment strategic analysis taxonomy.
    pub fn builtin() -> Self {
        builtin::registry()
    }
}

// =============================================================================
// BUILT-IN TAXONOMY
// =============================================================================

mod builtin {
    use super::*;

    fn segment(id: &str, name: &str) -> SegmentDef {
        SegmentDef {
            id: id.into(),
            name: name.into(),
        }
    }

    fn factor(id: &str, segment_id: &str, name: &str, weight: f64) -> FactorDef {
        FactorDef {
            id: id.into(),
            segment_id: segment_id.into(),
            name: name.into(),
            weight,
        }
    }

    struct UnitSpec<'a> {
        id: &'a str,
        factor_id: &'a str,
        segment_id: &'a str,
        persona: &'a str,
        focus: &'a str,
        rules: Vec<ExtractionRule>,
        depends_on: Vec<&'a str>,
    }

    fn unit(spec: UnitSpec<'_>) -> AnalysisUnit {
        AnalysisUnit {
            id: spec.id.into(),
            factor_id: spec.factor_id.into(),
            segment_id: spec.segment_id.into(),
            persona: spec.persona.into(),
            focus: spec.focus.into(),
            rules: spec.rules,
            depends_on: spec.depends_on.into_iter().map(String::from).collect(),
            provider_priority: Vec::new(),
        }
    }

    /// Shared 1-5 keyword ladder used by sentiment-style units.
    fn strength_ladder(metric: &str) -> ExtractionRule {
        ExtractionRule::keyword_scale(
            metric,
            vec![
                ("very strong", 5.0),
                ("very positive", 5.0),
                ("strong", 4.0),
                ("positive", 4.0),
                ("moderate", 3.0),
                ("neutral", 3.0),
                ("weak", 2.0),
                ("negative", 2.0),
                ("very weak", 1.0),
                ("very negative", 1.0),
            ],
            Normalizer::Ordinal { max: 5.0 },
        )
    }

    fn rating_rule(metric: &str) -> ExtractionRule {
        ExtractionRule::regex(
            metric,
            r"(\d(?:\.\d+)?)\s*(?:/|out of)\s*5",
            Normalizer::Ordinal { max: 5.0 },
        )
    }

    fn percent_rule(metric: &str, pattern: &str, range_max: f64) -> ExtractionRule {
        ExtractionRule::regex(metric, pattern, Normalizer::Percent { range_max })
    }

    pub(super) fn registry() -> Registry {
        let segments = vec![
            segment("consumer", "Consumer"),
            segment("market", "Market"),
            segment("product", "Product"),
            segment("brand", "Brand"),
            segment("experience", "Experience"),
        ];

        let factors = vec![
            factor("consumer_demand", "consumer", "Consumer Demand & Need", 1.2),
            factor("consumer_loyalty", "consumer", "Consumer Loyalty & Retention", 1.0),
            factor("market_size_growth", "market", "Market Size & Growth", 1.5),
            factor("market_risks", "market", "Market Risks & Challenges", 1.0),
            factor("product_differentiation", "product", "Product Differentiation", 1.2),
            factor("product_quality", "product", "Product Quality & Assurance", 1.0),
            factor("brand_awareness", "brand", "Brand Awareness & Recognition", 1.0),
            factor("brand_positioning", "brand", "Brand Positioning Strategy", 1.0),
            factor("experience_satisfaction", "experience", "Customer Satisfaction", 1.2),
            factor("experience_engagement", "experience", "Engagement & Adoption", 1.0),
        ];

        let units = vec![
            unit(UnitSpec {
                id: "purchase_intent",
                factor_id: "consumer_demand",
                segment_id: "consumer",
                persona: "consumer_insights",
                focus: "stated and implied purchase intent for the offering",
                rules: vec![
                    percent_rule(
                        "purchase_intent",
                        r"(\d+(?:\.\d+)?)\s*%\s*(?:of (?:consumers|respondents|customers)\s*)?(?:express|show|indicate|report)?\s*(?:purchase intent|intent to (?:buy|purchase))",
                        100.0,
                    ),
                    strength_ladder("purchase_intent"),
                ],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "unmet_needs",
                factor_id: "consumer_demand",
                segment_id: "consumer",
                persona: "consumer_insights",
                focus: "unmet needs and pain points the offering addresses",
                rules: vec![rating_rule("need_fit"), strength_ladder("need_fit")],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "repeat_purchase",
                factor_id: "consumer_loyalty",
                segment_id: "consumer",
                persona: "consumer_insights",
                focus: "repeat purchase behavior and churn risk",
                rules: vec![
                    percent_rule(
                        "repeat_rate",
                        r"(\d+(?:\.\d+)?)\s*%\s*(?:repeat|retention|repurchase)",
                        100.0,
                    ),
                    strength_ladder("repeat_rate"),
                ],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "market_size",
                factor_id: "market_size_growth",
                segment_id: "market",
                persona: "market_research",
                focus: "total and serviceable addressable market size",
                rules: vec![ExtractionRule::regex(
                    "market_size",
                    r"\$(\d+(?:,\d{3})*(?:\.\d+)?)\s*(?:billion|million|trillion|[bmt]\b)",
                    Normalizer::Monetary {
                        ceiling_usd: 100e9,
                    },
                )],
                depends_on: vec!["purchase_intent"],
            }),
            unit(UnitSpec {
                id: "market_growth_rate",
                factor_id: "market_size_growth",
                segment_id: "market",
                persona: "market_research",
                focus: "annual market growth rate and future projections",
                rules: vec![percent_rule(
                    "growth_rate",
                    r"(\d+(?:\.\d+)?)\s*%\s*(?:annually|annual growth|cagr|growth)",
                    50.0,
                )],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "competitive_threats",
                factor_id: "market_risks",
                segment_id: "market",
                persona: "competitor_analysis",
                focus: "competitive threats and barriers to entry",
                rules: vec![rating_rule("threat_level"), strength_ladder("threat_level")],
                depends_on: vec!["market_size"],
            }),
            unit(UnitSpec {
                id: "market_volatility",
                factor_id: "market_risks",
                segment_id: "market",
                persona: "trend_analysis",
                focus: "macroeconomic exposure and market volatility",
                rules: vec![rating_rule("volatility"), strength_ladder("volatility")],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "unique_selling_points",
                factor_id: "product_differentiation",
                segment_id: "product",
                persona: "competitor_analysis",
                focus: "unique selling points versus the closest competitors",
                rules: vec![
                    rating_rule("differentiation"),
                    strength_ladder("differentiation"),
                ],
                depends_on: vec!["competitive_threats"],
            }),
            unit(UnitSpec {
                id: "feature_completeness",
                factor_id: "product_differentiation",
                segment_id: "product",
                persona: "competitor_analysis",
                focus: "feature completeness relative to category expectations",
                rules: vec![
                    rating_rule("feature_coverage"),
                    strength_ladder("feature_coverage"),
                ],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "defect_rate",
                factor_id: "product_quality",
                segment_id: "product",
                persona: "consumer_insights",
                focus: "reported quality issues and defect rates",
                rules: vec![
                    percent_rule(
                        "issue_rate",
                        r"(\d+(?:\.\d+)?)\s*%\s*(?:defect|return|complaint|issue)",
                        20.0,
                    ),
                    strength_ladder("quality_perception"),
                ],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "brand_recall",
                factor_id: "brand_awareness",
                segment_id: "brand",
                persona: "market_research",
                focus: "unaided recall and share of voice",
                rules: vec![
                    percent_rule(
                        "brand_recall",
                        r"(\d+(?:\.\d+)?)\s*%\s*(?:unaided |aided )?(?:recall|recognition|awareness)",
                        100.0,
                    ),
                    strength_ladder("brand_recall"),
                ],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "positioning_clarity",
                factor_id: "brand_positioning",
                segment_id: "brand",
                persona: "trend_analysis",
                focus: "positioning clarity and target-audience alignment",
                rules: vec![
                    rating_rule("positioning"),
                    strength_ladder("positioning"),
                ],
                depends_on: vec!["unique_selling_points"],
            }),
            unit(UnitSpec {
                id: "pricing_power",
                factor_id: "brand_positioning",
                segment_id: "brand",
                persona: "pricing_research",
                focus: "pricing power and perceived value for money",
                rules: vec![
                    rating_rule("pricing_power"),
                    strength_ladder("pricing_power"),
                ],
                depends_on: vec!["market_size"],
            }),
            unit(UnitSpec {
                id: "satisfaction_score",
                factor_id: "experience_satisfaction",
                segment_id: "experience",
                persona: "consumer_insights",
                focus: "overall satisfaction and advocacy potential",
                rules: vec![
                    ExtractionRule::regex(
                        "nps",
                        r"(?:nps|net promoter score)\s*(?:of|is|at)?\s*(\d+(?:\.\d+)?)",
                        Normalizer::Percent { range_max: 100.0 },
                    ),
                    rating_rule("satisfaction"),
                    strength_ladder("satisfaction"),
                ],
                depends_on: vec![],
            }),
            unit(UnitSpec {
                id: "engagement_depth",
                factor_id: "experience_engagement",
                segment_id: "experience",
                persona: "trend_analysis",
                focus: "usage frequency and feature adoption",
                rules: vec![
                    percent_rule(
                        "adoption_rate",
                        r"(\d+(?:\.\d+)?)\s*%\s*(?:adoption|active|engagement)",
                        100.0,
                    ),
                    strength_ladder("adoption_rate"),
                ],
                depends_on: vec!["satisfaction_score"],
            }),
        ];

        let meta_scores = vec![
            MetaScoreSpec {
                name: "risk_index".into(),
                factor_ids: vec!["market_risks".into(), "product_quality".into()],
                weights: HashMap::new(),
                // High index means high exposure.
                invert: true,
            },
            MetaScoreSpec {
                name: "demand_index".into(),
                factor_ids: vec![
                    "consumer_demand".into(),
                    "market_size_growth".into(),
                    "experience_engagement".into(),
                ],
                weights: HashMap::from([("market_size_growth".into(), 1.5)]),
                invert: false,
            },
        ];

        Registry {
            segments,
            factors,
            units,
            meta_scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_taxonomy_validates() {
        let registry = Registry::builtin();
        let rule_sets = registry.validate().expect("builtin taxonomy must be valid");
        assert_eq!(rule_sets.len(), registry.unit_count());
        assert_eq!(
            registry.segment_order(),
            vec!["consumer", "market", "product", "brand", "experience"]
        );
    }

    #[test]
    fn test_builtin_dependencies_reach_backward_only() {
        // Units may only depend on units from earlier segments: within a
        // segment everything runs concurrently.
        let registry = Registry::builtin();
        let order = registry.segment_order();
        let rank = |segment: &str| order.iter().position(|s| *s == segment).unwrap();
        for unit in &registry.units {
            for dep in &unit.depends_on {
                let dep_unit = registry.unit(dep).unwrap();
                assert!(
                    rank(&dep_unit.segment_id) < rank(&unit.segment_id),
                    "{} depends on {} in a non-earlier segment",
                    unit.id,
                    dep.as_str(),
                );
            }
        }
    }

    #[test]
    fn test_unknown_factor_rejected() {
        let mut registry = Registry::builtin();
        registry.units[0].factor_id = "nope".into();
        assert!(matches!(
            registry.validate(),
            Err(TaxonomyError::UnknownFactor { .. })
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = Registry::builtin();
        let dup = registry.units[0].id.clone();
        registry.units[1].id = dup;
        assert!(matches!(
            registry.validate(),
            Err(TaxonomyError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut registry = Registry::builtin();
        registry.units[0].depends_on.push("ghost_unit".into());
        assert!(matches!(
            registry.validate(),
            Err(TaxonomyError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_meta_score_unknown_factor_rejected() {
        let mut registry = Registry::builtin();
        registry.meta_scores.push(MetaScoreSpec {
            name: "bad".into(),
            factor_ids: vec!["ghost_factor".into()],
            weights: HashMap::new(),
            invert: false,
        });
        assert!(matches!(
            registry.validate(),
            Err(TaxonomyError::MetaScoreUnknownFactor { .. })
        ));
    }

    #[test]
    fn test_taxonomy_roundtrips_as_json() {
        let registry = Registry::builtin();
        let json = serde_json::to_string(&registry).unwrap();
        let back = Registry::from_json(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.unit_count(), registry.unit_count());
    }

    #[test]
    fn test_factor_weights_keyed_by_id() {
        let registry = Registry::builtin();
        let weights = registry.factor_weights("market");
        assert_eq!(weights.len(), 2);
        assert!((weights["market_size_growth"] - 1.5).abs() < 1e-9);
    }
}
