#![forbid(unsafe_code)]

//! # meridian
//!
//! Strategic analysis orchestration and hierarchical scoring.
//!
//! A free-text strategic question is decomposed over a static taxonomy
//! (layers → factors → segments). Each leaf layer is answered by an
//! LLM call through a fallback-capable provider gateway; declarative
//! rules extract typed metrics from the free-text answer; pure
//! aggregation rolls scores and confidence bottom-up into a single
//! result document with trends, priorities, and named meta-scores.
//!
//! Individual unit failures degrade to neutral scores instead of
//! aborting: a run always ends Completed (or Aborted on explicit
//! cancellation) unless the taxonomy itself is invalid.

pub mod config;
pub mod dispatch;
pub mod extract;
pub mod gateway;
pub mod job;
pub mod prompts;
pub mod registry;
pub mod report;
pub mod scoring;
pub mod workflow;

pub use config::EngineConfig;
pub use dispatch::{AgentDispatcher, ContextMemory, UnitResult};
pub use gateway::{
    Attribution, ChatAdapter, CompletionGateway, ProviderError, ProviderGateway, ProviderRoute,
    UsageSink,
};
pub use job::{JobManager, JobStatus, MemoryResultStore, ResultStore};
pub use registry::{AnalysisUnit, MetaScoreSpec, Registry, TaxonomyError};
pub use report::ResultDocument;
pub use scoring::{
    aggregate_factor, aggregate_overall, aggregate_segment, FactorScore, OverallScores, Priority,
    SegmentScore, Trend,
};
pub use workflow::{ProgressObserver, RunOutcome, Workflow, WorkflowStage, WorkflowState};
