//! Metric extraction: declarative rules that turn free-text completions
//! into typed, unit-normalized metrics.
//!
//! Rules are data, not code. Each analysis unit declares an ordered rule
//! list; the first rule that matches a metric name wins, later rules for
//! the same name are skipped. A metric absent from the text yields no
//! entry at all — absence is distinguishable from a measured zero.
//! Extraction is deterministic and side-effect free.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// RULE DECLARATIONS
// =============================================================================

/// Pattern half of an extraction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RulePattern {
    /// Regex with the value in the first capture group.
    Regex { pattern: String },
    /// Keyword ladder: the first keyword found in the text (case
    /// insensitive) maps to its declared raw value.
    KeywordScale { keywords: Vec<KeywordLevel> },
}

/// One rung of a keyword ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordLevel {
    pub keyword: String,
    pub value: f64,
}

/// Normalization descriptor mapping a captured raw value into [0,1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Normalizer {
    /// Ordinal scale, e.g. 1-5 ratings divide by 5.
    Ordinal { max: f64 },
    /// Percentage scaled against an assumed maximum range.
    Percent { range_max: f64 },
    /// Monetary magnitude scaled against a reference ceiling in USD.
    /// Unit suffixes (million/billion/trillion) are applied before scaling.
    Monetary { ceiling_usd: f64 },
    /// Value is already in [0,1].
    Identity,
}

impl Normalizer {
    /// Native unit label retained on extracted metrics.
    pub fn unit_label(&self) -> &'static str {
        match self {
            Normalizer::Ordinal { .. } => "ordinal",
            Normalizer::Percent { .. } => "percent",
            Normalizer::Monetary { .. } => "usd",
            Normalizer::Identity => "scalar",
        }
    }

    /// Map a raw value to [0,1], clamped.
    pub fn apply(&self, raw: f64) -> f64 {
        let normalized = match self {
            Normalizer::Ordinal { max } | Normalizer::Percent { range_max: max } => {
                if *max == 0.0 {
                    0.0
                } else {
                    raw / max
                }
            }
            Normalizer::Monetary { ceiling_usd } => {
                if *ceiling_usd == 0.0 {
                    0.0
                } else {
                    raw / ceiling_usd
                }
            }
            Normalizer::Identity => raw,
        };
        normalized.clamp(0.0, 1.0)
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_base_confidence() -> f64 {
    0.7
}

/// One declarative extraction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    /// Metric name this rule produces.
    pub metric: String,
    /// Pattern to match against the completion text.
    pub pattern: RulePattern,
    /// Normalization into [0,1].
    pub normalize: Normalizer,
    /// Weight of this metric in the unit score.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Confidence assigned when the rule matches.
    #[serde(default = "default_base_confidence")]
    pub base_confidence: f64,
}

impl ExtractionRule {
    /// Convenience constructor for regex rules.
    pub fn regex(
        metric: impl Into<String>,
        pattern: impl Into<String>,
        normalize: Normalizer,
    ) -> Self {
        Self {
            metric: metric.into(),
            pattern: RulePattern::Regex {
                pattern: pattern.into(),
            },
            normalize,
            weight: default_weight(),
            base_confidence: default_base_confidence(),
        }
    }

    /// Convenience constructor for keyword-scale rules.
    pub fn keyword_scale(
        metric: impl Into<String>,
        keywords: Vec<(&str, f64)>,
        normalize: Normalizer,
    ) -> Self {
        Self {
            metric: metric.into(),
            pattern: RulePattern::KeywordScale {
                keywords: keywords
                    .into_iter()
                    .map(|(keyword, value)| KeywordLevel {
                        keyword: keyword.into(),
                        value,
                    })
                    .collect(),
            },
            normalize,
            weight: default_weight(),
            base_confidence: default_base_confidence(),
        }
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn confidence(mut self, base_confidence: f64) -> Self {
        self.base_confidence = base_confidence;
        self
    }
}

// =============================================================================
// EXTRACTED METRICS
// =============================================================================

/// A metric extracted from one completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMetric {
    /// Metric name from the rule declaration.
    pub name: String,
    /// Raw value in its native unit (USD, percentage, ordinal).
    pub value: f64,
    /// Native unit label.
    pub unit: String,
    /// Value normalized into [0,1]; the only number used for aggregation.
    pub normalized: f64,
    /// Confidence in this extraction.
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid regex for metric {metric}: {source}")]
    InvalidPattern {
        metric: String,
        source: regex::Error,
    },
}

// =============================================================================
// EXTRACTOR
// =============================================================================

/// Monetary suffix multipliers (case-insensitive match on the rule's
/// surrounding text).
const MONETARY_MULTIPLIERS: &[(&str, f64)] = &[
    ("trillion", 1e12),
    ("billion", 1e9),
    ("million", 1e6),
];

enum CompiledPattern {
    Regex(Regex),
    KeywordScale(Vec<KeywordLevel>),
}

struct CompiledRule {
    rule: ExtractionRule,
    pattern: CompiledPattern,
}

/// Compiled extraction rules for one analysis unit.
///
/// Compilation happens once at registry load; extraction is pure.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile a unit's rule declarations. Invalid regexes surface here,
    /// at load time, never during a run.
    pub fn compile(rules: &[ExtractionRule]) -> Result<Self, ExtractError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = match &rule.pattern {
                RulePattern::Regex { pattern } => {
                    let re = Regex::new(&format!("(?i){pattern}")).map_err(|source| {
                        ExtractError::InvalidPattern {
                            metric: rule.metric.clone(),
                            source,
                        }
                    })?;
                    CompiledPattern::Regex(re)
                }
                RulePattern::KeywordScale { keywords } => {
                    CompiledPattern::KeywordScale(keywords.clone())
                }
            };
            compiled.push(CompiledRule {
                rule: rule.clone(),
                pattern,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Number of distinct metric names the rules can produce. Used by the
    /// dispatcher to scale confidence down when fewer are found.
    pub fn expected_metric_count(&self) -> usize {
        let mut names: Vec<&str> = self.rules.iter().map(|c| c.rule.metric.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.len()
    }

    /// Declared weight for a metric name (first declaration wins).
    pub fn metric_weight(&self, name: &str) -> f64 {
        self.rules
            .iter()
            .find(|c| c.rule.metric == name)
            .map_or(1.0, |c| c.rule.weight)
    }

    /// Run the rules against a completion text.
    ///
    /// Rules are tried in declared order; the first match per metric name
    /// wins. A metric no rule matches produces no entry.
    pub fn extract(&self, text: &str) -> Vec<ExtractedMetric> {
        let mut metrics: Vec<ExtractedMetric> = Vec::new();
        let mut seen: HashMap<&str, ()> = HashMap::new();

        for compiled in &self.rules {
            let name = compiled.rule.metric.as_str();
            if seen.contains_key(name) {
                continue;
            }

            let raw = match &compiled.pattern {
                CompiledPattern::Regex(re) => re.captures(text).and_then(|caps| {
                    let value: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
                    let raw = match compiled.rule.normalize {
                        Normalizer::Monetary { .. } => {
                            value * monetary_multiplier(caps.get(0).map_or("", |m| m.as_str()))
                        }
                        _ => value,
                    };
                    Some(raw)
                }),
                CompiledPattern::KeywordScale(keywords) => {
                    let lowered = text.to_lowercase();
                    keywords
                        .iter()
                        .find(|k| lowered.contains(&k.keyword.to_lowercase()))
                        .map(|k| k.value)
                }
            };

            if let Some(raw) = raw {
                seen.insert(name, ());
                metrics.push(ExtractedMetric {
                    name: name.to_string(),
                    value: raw,
                    unit: compiled.rule.normalize.unit_label().to_string(),
                    normalized: compiled.rule.normalize.apply(raw),
                    confidence: compiled.rule.base_confidence.clamp(0.0, 1.0),
                });
            }
        }

        metrics
    }
}

/// Single-letter magnitude suffix directly after a digit: "$4.2B", "$310M".
static MAGNITUDE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\d\s*([bmt])\b").expect("static regex"));

/// Multiplier for the monetary unit suffix found in the matched text.
/// Defaults to 1.0 when no suffix is present (value already in USD).
fn monetary_multiplier(matched: &str) -> f64 {
    let lowered = matched.to_lowercase();
    for (suffix, multiplier) in MONETARY_MULTIPLIERS {
        if lowered.contains(suffix) {
            return *multiplier;
        }
    }
    if let Some(caps) = MAGNITUDE_SUFFIX.captures(&lowered) {
        return match &caps[1] {
            "t" => 1e12,
            "b" => 1e9,
            _ => 1e6,
        };
    }
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn growth_rule() -> ExtractionRule {
        ExtractionRule::regex(
            "growth_rate",
            r"(\d+(?:\.\d+)?)\s*%\s*(?:annually|cagr|growth|annual growth)",
            Normalizer::Percent { range_max: 50.0 },
        )
    }

    #[test]
    fn test_percent_rule_against_range() {
        // "Market growing at 15% annually" with growth_rate% / 50% => 0.30
        let rules = RuleSet::compile(&[growth_rule()]).unwrap();
        let metrics = rules.extract("Market growing at 15% annually");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "growth_rate");
        assert!((metrics[0].value - 15.0).abs() < 1e-9);
        assert!((metrics[0].normalized - 0.30).abs() < 1e-9);
        assert_eq!(metrics[0].unit, "percent");
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let rules = RuleSet::compile(&[growth_rule()]).unwrap();
        let text = "The segment shows 12.5% CAGR through 2030.";
        let first = rules.extract(text);
        let second = rules.extract(text);
        assert_eq!(first, second);
    }

    #[test]
    fn test_absence_yields_no_metric() {
        let rules = RuleSet::compile(&[growth_rule()]).unwrap();
        let metrics = rules.extract("No quantitative figures were given.");
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_first_match_per_metric_wins() {
        let strict = ExtractionRule::regex(
            "market_size",
            r"TAM of \$(\d+(?:\.\d+)?)\s*billion",
            Normalizer::Monetary { ceiling_usd: 10e9 },
        );
        let loose = ExtractionRule::regex(
            "market_size",
            r"\$(\d+(?:\.\d+)?)\s*billion",
            Normalizer::Monetary { ceiling_usd: 100e9 },
        );
        let rules = RuleSet::compile(&[strict, loose]).unwrap();
        let metrics = rules.extract("TAM of $5 billion, SAM of $2 billion");
        assert_eq!(metrics.len(), 1);
        // The strict rule matched; its normalizer applies.
        assert!((metrics[0].value - 5e9).abs() < 1.0);
        assert!((metrics[0].normalized - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_monetary_suffix_multipliers() {
        assert_eq!(monetary_multiplier("$3 billion market"), 1e9);
        assert_eq!(monetary_multiplier("$2.5 trillion"), 1e12);
        assert_eq!(monetary_multiplier("worth $40 million"), 1e6);
        assert_eq!(monetary_multiplier("$4.2B"), 1e9);
        assert_eq!(monetary_multiplier("$42"), 1.0);
    }

    #[test]
    fn test_keyword_scale_ladder() {
        let rule = ExtractionRule::keyword_scale(
            "sentiment",
            vec![
                ("very positive", 5.0),
                ("positive", 4.0),
                ("neutral", 3.0),
                ("negative", 2.0),
                ("very negative", 1.0),
            ],
            Normalizer::Ordinal { max: 5.0 },
        );
        let rules = RuleSet::compile(&[rule]).unwrap();

        let metrics = rules.extract("Overall consumer sentiment is Very Positive this quarter.");
        assert_eq!(metrics.len(), 1);
        assert!((metrics[0].value - 5.0).abs() < 1e-9);
        assert!((metrics[0].normalized - 1.0).abs() < 1e-9);

        let metrics = rules.extract("Feedback has been negative overall.");
        assert!((metrics[0].value - 2.0).abs() < 1e-9);
        assert!((metrics[0].normalized - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_normalization_clamps_to_unit_interval() {
        let rule = ExtractionRule::regex(
            "growth_rate",
            r"(\d+(?:\.\d+)?)\s*% growth",
            Normalizer::Percent { range_max: 50.0 },
        );
        let rules = RuleSet::compile(&[rule]).unwrap();
        let metrics = rules.extract("An implausible 400% growth claim.");
        assert_eq!(metrics[0].normalized, 1.0);
    }

    #[test]
    fn test_comma_separated_values_parse() {
        let rule = ExtractionRule::regex(
            "revenue",
            r"\$(\d+(?:,\d{3})*(?:\.\d+)?)\s*million",
            Normalizer::Monetary { ceiling_usd: 10e9 },
        );
        let rules = RuleSet::compile(&[rule]).unwrap();
        let metrics = rules.extract("Revenue reached $1,250 million last year.");
        assert!((metrics[0].value - 1.25e9).abs() < 1.0);
    }

    #[test]
    fn test_invalid_regex_fails_at_compile_time() {
        let rule = ExtractionRule::regex("broken", r"(\d+", Normalizer::Identity);
        assert!(RuleSet::compile(&[rule]).is_err());
    }

    #[test]
    fn test_expected_metric_count_dedups_names() {
        let rules = RuleSet::compile(&[
            ExtractionRule::regex("a", r"(\d+) apples", Normalizer::Identity),
            ExtractionRule::regex("a", r"(\d+) fruit", Normalizer::Identity),
            ExtractionRule::regex("b", r"(\d+) bananas", Normalizer::Identity),
        ])
        .unwrap();
        assert_eq!(rules.expected_metric_count(), 2);
    }

    #[test]
    fn test_rule_declarations_roundtrip_as_json() {
        let rule = growth_rule().weight(0.8).confidence(0.9);
        let json = serde_json::to_string(&rule).unwrap();
        let back: ExtractionRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metric, "growth_rate");
        assert!((back.weight - 0.8).abs() < 1e-9);
        assert!((back.base_confidence - 0.9).abs() < 1e-9);
    }
}
