//! Orchestration workflow: walks the taxonomy segment by segment,
//! dispatches units through a bounded worker pool, aggregates
//! incrementally, and synthesizes the final document.
//!
//! Segments are strictly sequential so later prompts can draw on earlier
//! segments' context memory. Units within a segment run concurrently and
//! never observe each other. Individual unit failures are absorbed by the
//! dispatcher; the only fatal error is a misconfigured taxonomy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatch::{AgentDispatcher, ContextMemory, DispatchSettings, UnitResult};
use crate::gateway::CompletionGateway;
use crate::registry::{Registry, TaxonomyError};
use crate::report::ResultDocument;
use crate::scoring::{
    aggregate_factor, aggregate_overall, aggregate_segment, synthesize, AggregationSettings,
    FactorScore, SegmentScore,
};

// =============================================================================
// STAGES & STATE
// =============================================================================

/// Pipeline stage. `Errored` is reachable only through taxonomy
/// misconfiguration; unit-level failures never escalate here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "detail", rename_all = "snake_case")]
pub enum WorkflowStage {
    Idle,
    SegmentAnalysis(String),
    Aggregating,
    Synthesizing,
    Completed,
    Aborted,
    Errored(String),
}

/// Snapshot of a run in progress. Every stage transition produces a
/// fully-populated copy for observers, never an in-place patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub stage: WorkflowStage,
    /// Monotonically growing set; a completed unit is never re-entered.
    pub completed_units: BTreeSet<String>,
    pub total_units: usize,
    pub unit_results: HashMap<String, UnitResult>,
    pub context_memory: ContextMemory,
    pub factor_scores: Vec<FactorScore>,
    pub segment_scores: Vec<SegmentScore>,
    pub error: Option<String>,
}

impl WorkflowState {
    fn new(total_units: usize) -> Self {
        Self {
            stage: WorkflowStage::Idle,
            completed_units: BTreeSet::new(),
            total_units,
            unit_results: HashMap::new(),
            context_memory: ContextMemory::new(),
            factor_scores: Vec::new(),
            segment_scores: Vec::new(),
            error: None,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        100.0 * self.completed_units.len() as f64 / self.total_units as f64
    }
}

// =============================================================================
// OBSERVATION
// =============================================================================

/// Hook for progress reporting. Implementations must be cheap; they run
/// inline with the controller.
pub trait ProgressObserver: Send + Sync {
    fn on_stage(&self, _state: &WorkflowState) {}
    fn on_unit_completed(&self, _result: &UnitResult) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

// =============================================================================
// WORKFLOW
// =============================================================================

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("taxonomy misconfigured: {0}")]
    Taxonomy(#[from] TaxonomyError),
}

/// Result of a run that reached a terminal stage other than `Errored`.
/// An aborted run carries a partial but internally consistent document.
pub struct RunOutcome {
    pub document: ResultDocument,
    pub state: WorkflowState,
}

/// One logical controller per run.
pub struct Workflow {
    registry: Arc<Registry>,
    gateway: Arc<dyn CompletionGateway>,
    config: EngineConfig,
    cancel: Arc<AtomicBool>,
    observer: Arc<dyn ProgressObserver>,
}

impl Workflow {
    pub fn new(
        registry: Arc<Registry>,
        gateway: Arc<dyn CompletionGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Handle for cooperative cancellation. Setting it aborts the run at
    /// the next unit or segment boundary; in-flight provider calls are
    /// dropped within one timeout cycle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn transition(&self, state: &mut WorkflowState, stage: WorkflowStage) {
        state.stage = stage;
        self.observer.on_stage(state);
    }

    /// Run the full pipeline. Fails only on taxonomy misconfiguration;
    /// every other failure mode degrades into the document.
    pub async fn run(
        &self,
        query: &str,
        context: BTreeMap<String, Value>,
        job_id: Option<Uuid>,
    ) -> Result<RunOutcome, WorkflowError> {
        let mut state = WorkflowState::new(self.registry.unit_count());

        let rule_sets = match self.registry.validate() {
            Ok(sets) => sets,
            Err(err) => {
                state.error = Some(err.to_string());
                self.transition(&mut state, WorkflowStage::Errored(err.to_string()));
                return Err(err.into());
            }
        };

        let dispatcher = AgentDispatcher::new(
            Arc::clone(&self.gateway),
            Arc::new(rule_sets),
            DispatchSettings {
                default_priority: self.config.default_priority.clone(),
                unit_timeout: self.config.unit_timeout(),
                call_timeout: self.config.call_timeout(),
                context_budget_chars: self.config.context_budget_chars(),
                summary_max_chars: self.config.summary_max_chars,
            },
        );

        let aggregation = AggregationSettings {
            neutral_band: self.config.neutral_band,
            thresholds: self.config.priority_thresholds,
        };

        self.transition(&mut state, WorkflowStage::Idle);

        let mut aborted = false;
        let order: Vec<String> = self
            .registry
            .segment_order()
            .into_iter()
            .map(String::from)
            .collect();

        for segment_id in &order {
            if self.cancelled() {
                aborted = true;
                break;
            }

            self.transition(&mut state, WorkflowStage::SegmentAnalysis(segment_id.clone()));
            info!(segment = %segment_id, "segment analysis started");

            let units = self.registry.units_of_segment(segment_id);
            // Units read a frozen view of memory; summaries from this
            // segment land only after the pool joins.
            let memory = state.context_memory.clone();

            let unit_futures: Vec<_> = units
                .iter()
                .map(|unit| {
                    let dispatcher = &dispatcher;
                    let memory = &memory;
                    async move { dispatcher.run_unit(unit, query, memory, job_id).await }
                })
                .collect();
            let mut pool =
                stream::iter(unit_futures).buffer_unordered(self.config.parallelism);

            let mut segment_results: Vec<UnitResult> = Vec::with_capacity(units.len());
            while let Some(result) = pool.next().await {
                self.observer.on_unit_completed(&result);
                segment_results.push(result);
                if self.cancelled() {
                    aborted = true;
                    break;
                }
            }
            drop(pool);

            if aborted {
                // The interrupted segment is never aggregated; completed
                // prior segments keep their scores.
                warn!(segment = %segment_id, "run cancelled mid-segment");
                for result in segment_results {
                    state.completed_units.insert(result.unit_id.clone());
                    state.unit_results.insert(result.unit_id.clone(), result);
                }
                break;
            }

            // Deterministic merge order regardless of completion order.
            segment_results.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
            for result in segment_results {
                let summary = dispatcher.summarize(&result);
                state.context_memory.record(&result.unit_id, summary);
                state.completed_units.insert(result.unit_id.clone());
                state.unit_results.insert(result.unit_id.clone(), result);
            }

            self.aggregate_segment_scores(&mut state, segment_id, &aggregation);
            self.observer.on_stage(&state);
        }

        if self.cancelled() {
            aborted = true;
        }

        if !aborted {
            self.transition(&mut state, WorkflowStage::Aggregating);
        }

        let overall = aggregate_overall(
            &state.segment_scores,
            &state.factor_scores,
            &self.registry.meta_scores,
            self.registry.segments.len(),
        );

        if !aborted {
            self.transition(&mut state, WorkflowStage::Synthesizing);
        }

        let synthesis = synthesize(query, &state.segment_scores, &overall);

        let units: Vec<UnitResult> = state.unit_results.values().cloned().collect();
        let document = ResultDocument::assemble(
            query.to_string(),
            context,
            &state.segment_scores,
            &state.factor_scores,
            &units,
            &overall,
            synthesis,
        );

        let terminal = if aborted {
            WorkflowStage::Aborted
        } else {
            WorkflowStage::Completed
        };
        self.transition(&mut state, terminal);
        info!(
            completed = state.completed_units.len(),
            total = state.total_units,
            aborted,
            "run finished"
        );

        Ok(RunOutcome { document, state })
    }

    /// Incremental aggregation for one just-finished segment.
    fn aggregate_segment_scores(
        &self,
        state: &mut WorkflowState,
        segment_id: &str,
        settings: &AggregationSettings,
    ) {
        let Some(segment) = self.registry.segment(segment_id) else {
            return;
        };

        let factors = self.registry.factors_of(segment_id);
        let mut factor_scores = Vec::with_capacity(factors.len());
        for factor in &factors {
            let expected = self.registry.units_of_factor(&factor.id).len();
            let units: Vec<&UnitResult> = state
                .unit_results
                .values()
                .filter(|u| u.factor_id == factor.id)
                .collect();
            factor_scores.push(aggregate_factor(factor, &units, expected));
        }

        let weights = self.registry.factor_weights(segment_id);
        let segment_score =
            aggregate_segment(segment, &factor_scores, &weights, factors.len(), settings);

        state.factor_scores.extend(factor_scores);
        state.segment_scores.push(segment_score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::extract::{ExtractionRule, Normalizer};
    use crate::gateway::{
        Completion, CompletionRequest, FallbackOutcome, ProviderError, ProviderRoute,
    };
    use crate::registry::{AnalysisUnit, FactorDef, SegmentDef};

    struct FixedGateway;

    #[async_trait]
    impl CompletionGateway for FixedGateway {
        async fn complete_with_fallback(
            &self,
            _req: &CompletionRequest,
            _priority: &[String],
        ) -> Result<FallbackOutcome, ProviderError> {
            Ok(FallbackOutcome {
                completion: Completion {
                    text: "Market growing at 20% annually, rated 4/5 overall.".into(),
                    input_tokens: 5,
                    output_tokens: 9,
                    latency: Duration::from_millis(1),
                },
                provider: "fast".into(),
                attempts: 1,
            })
        }
    }

    fn tiny_registry() -> Registry {
        let rules = vec![
            ExtractionRule::regex(
                "growth_rate",
                r"(\d+(?:\.\d+)?)\s*%\s*annually",
                Normalizer::Percent { range_max: 50.0 },
            ),
            ExtractionRule::regex(
                "rating",
                r"(\d(?:\.\d+)?)\s*/\s*5",
                Normalizer::Ordinal { max: 5.0 },
            ),
        ];
        Registry {
            segments: vec![
                SegmentDef {
                    id: "alpha".into(),
                    name: "Alpha".into(),
                },
                SegmentDef {
                    id: "beta".into(),
                    name: "Beta".into(),
                },
            ],
            factors: vec![
                FactorDef {
                    id: "fa".into(),
                    segment_id: "alpha".into(),
                    name: "Factor A".into(),
                    weight: 1.0,
                },
                FactorDef {
                    id: "fb".into(),
                    segment_id: "beta".into(),
                    name: "Factor B".into(),
                    weight: 1.0,
                },
            ],
            units: vec![
                AnalysisUnit {
                    id: "ua1".into(),
                    factor_id: "fa".into(),
                    segment_id: "alpha".into(),
                    persona: "market_research".into(),
                    focus: "growth".into(),
                    rules: rules.clone(),
                    depends_on: vec![],
                    provider_priority: vec![],
                },
                AnalysisUnit {
                    id: "ua2".into(),
                    factor_id: "fa".into(),
                    segment_id: "alpha".into(),
                    persona: "market_research".into(),
                    focus: "size".into(),
                    rules: rules.clone(),
                    depends_on: vec![],
                    provider_priority: vec![],
                },
                AnalysisUnit {
                    id: "ub1".into(),
                    factor_id: "fb".into(),
                    segment_id: "beta".into(),
                    persona: "trend_analysis".into(),
                    focus: "adoption".into(),
                    rules,
                    depends_on: vec!["ua1".into()],
                    provider_priority: vec![],
                },
            ],
            meta_scores: vec![],
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            routes: vec![ProviderRoute::new("fast", "http://x", "K", "m")],
            default_priority: vec!["fast".into()],
            parallelism: 2,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_full_run_completes_and_aggregates() {
        let workflow = Workflow::new(
            Arc::new(tiny_registry()),
            Arc::new(FixedGateway),
            test_config(),
        );
        let outcome = workflow.run("q", BTreeMap::new(), None).await.unwrap();

        assert_eq!(outcome.state.stage, WorkflowStage::Completed);
        assert_eq!(outcome.state.completed_units.len(), 3);
        assert_eq!(outcome.state.segment_scores.len(), 2);
        assert_eq!(outcome.document.segments.len(), 2);
        // growth 20/50 = 0.4, rating 4/5 = 0.8, unweighted -> 0.6 per unit.
        let alpha = &outcome.document.segments["alpha"];
        assert!((alpha.factors["fa"].layers["ua1"].score - 0.6).abs() < 1e-9);
        assert!((outcome.state.percent_complete() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_dependency_context_flows_between_segments() {
        struct Recording {
            seen: std::sync::Mutex<Vec<String>>,
        }

        #[async_trait]
        impl CompletionGateway for Recording {
            async fn complete_with_fallback(
                &self,
                req: &CompletionRequest,
                _priority: &[String],
            ) -> Result<FallbackOutcome, ProviderError> {
                self.seen.lock().unwrap().push(req.user.clone());
                Ok(FallbackOutcome {
                    completion: Completion {
                        text: "Growing 10% annually.".into(),
                        input_tokens: 1,
                        output_tokens: 1,
                        latency: Duration::from_millis(1),
                    },
                    provider: "fast".into(),
                    attempts: 1,
                })
            }
        }

        let gateway = Arc::new(Recording {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let workflow = Workflow::new(Arc::new(tiny_registry()), gateway.clone(), test_config());
        workflow.run("q", BTreeMap::new(), None).await.unwrap();

        let prompts = gateway.seen.lock().unwrap();
        // ub1 depends on ua1, so the beta-segment prompt carries prior findings.
        let beta_prompt = prompts.iter().find(|p| p.contains("adoption")).unwrap();
        assert!(beta_prompt.contains("prior_findings"));
        assert!(beta_prompt.contains("ua1"));
    }

    #[tokio::test]
    async fn test_invalid_taxonomy_errors_before_any_call() {
        let mut registry = tiny_registry();
        registry.units[0].factor_id = "ghost".into();

        struct Panicking;

        #[async_trait]
        impl CompletionGateway for Panicking {
            async fn complete_with_fallback(
                &self,
                _req: &CompletionRequest,
                _priority: &[String],
            ) -> Result<FallbackOutcome, ProviderError> {
                panic!("gateway must not be reached");
            }
        }

        let workflow = Workflow::new(Arc::new(registry), Arc::new(Panicking), test_config());
        let err = workflow.run("q", BTreeMap::new(), None).await;
        assert!(matches!(err, Err(WorkflowError::Taxonomy(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_start_yields_empty_aborted_document() {
        let workflow = Workflow::new(
            Arc::new(tiny_registry()),
            Arc::new(FixedGateway),
            test_config(),
        );
        workflow.cancel_handle().store(true, Ordering::SeqCst);
        let outcome = workflow.run("q", BTreeMap::new(), None).await.unwrap();

        assert_eq!(outcome.state.stage, WorkflowStage::Aborted);
        assert!(outcome.document.segments.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_prior_segments() {
        // Cancel as soon as the first beta-segment unit completes: alpha
        // stays fully aggregated, beta never gets a segment score.
        struct CancelOnBeta {
            cancel: Arc<AtomicBool>,
        }

        impl ProgressObserver for CancelOnBeta {
            fn on_unit_completed(&self, result: &UnitResult) {
                if result.segment_id == "beta" {
                    self.cancel.store(true, Ordering::SeqCst);
                }
            }
        }

        let workflow = Workflow::new(
            Arc::new(tiny_registry()),
            Arc::new(FixedGateway),
            test_config(),
        );
        let cancel = workflow.cancel_handle();
        let workflow = workflow.with_observer(Arc::new(CancelOnBeta { cancel }));

        let outcome = workflow.run("q", BTreeMap::new(), None).await.unwrap();

        assert_eq!(outcome.state.stage, WorkflowStage::Aborted);
        assert!(outcome.document.segments.contains_key("alpha"));
        assert!(!outcome.document.segments.contains_key("beta"));
        assert_eq!(outcome.state.segment_scores.len(), 1);
        // Overall confidence is penalized for the missing segment.
        assert!(outcome.document.overall_confidence < 1.0);
    }
}
