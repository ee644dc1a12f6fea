//! Inbound job interface: submit a query, poll status, fetch the result.
//!
//! Each submission runs one workflow on a spawned task. Results cross the
//! persistence boundary as opaque serialized documents; the in-memory
//! store is the default and tests' backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::gateway::CompletionGateway;
use crate::registry::Registry;
use crate::report::ResultDocument;
use crate::workflow::{ProgressObserver, Workflow, WorkflowStage, WorkflowState};

// =============================================================================
// STATUS
// =============================================================================

/// Poll-friendly view of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub stage: WorkflowStage,
    pub percent_complete: f64,
    pub completed_units: usize,
    pub total_units: usize,
}

impl JobStatus {
    fn pending(total_units: usize) -> Self {
        Self {
            stage: WorkflowStage::Idle,
            percent_complete: 0.0,
            completed_units: 0,
            total_units,
        }
    }

    fn from_state(state: &WorkflowState) -> Self {
        Self {
            stage: state.stage.clone(),
            percent_complete: state.percent_complete(),
            completed_units: state.completed_units.len(),
            total_units: state.total_units,
        }
    }
}

// =============================================================================
// PERSISTENCE BOUNDARY
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Opaque result persistence. The engine only needs serializability.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, job_id: Uuid, document: &ResultDocument) -> Result<(), StoreError>;
    async fn get(&self, job_id: Uuid) -> Result<Option<ResultDocument>, StoreError>;
    async fn put_status(&self, job_id: Uuid, status: &JobStatus) -> Result<(), StoreError>;
}

/// In-memory store: documents held as opaque JSON values.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    documents: Mutex<HashMap<Uuid, Value>>,
    statuses: Mutex<HashMap<Uuid, Value>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, job_id: Uuid, document: &ResultDocument) -> Result<(), StoreError> {
        let value = serde_json::to_value(document)?;
        self.documents.lock().unwrap().insert(job_id, value);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<ResultDocument>, StoreError> {
        let value = self.documents.lock().unwrap().get(&job_id).cloned();
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn put_status(&self, job_id: Uuid, status: &JobStatus) -> Result<(), StoreError> {
        let value = serde_json::to_value(status)?;
        self.statuses.lock().unwrap().insert(job_id, value);
        Ok(())
    }
}

// =============================================================================
// JOB MANAGER
// =============================================================================

struct JobHandle {
    cancel: Arc<AtomicBool>,
    status: Arc<RwLock<JobStatus>>,
}

/// Live status bridge from the workflow observer to pollers.
struct StatusObserver {
    status: Arc<RwLock<JobStatus>>,
}

impl ProgressObserver for StatusObserver {
    fn on_stage(&self, state: &WorkflowState) {
        *self.status.write().unwrap() = JobStatus::from_state(state);
    }
}

/// Submits runs and tracks them to completion.
pub struct JobManager {
    registry: Arc<Registry>,
    gateway: Arc<dyn CompletionGateway>,
    config: EngineConfig,
    store: Arc<dyn ResultStore>,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
}

impl JobManager {
    pub fn new(
        registry: Arc<Registry>,
        gateway: Arc<dyn CompletionGateway>,
        config: EngineConfig,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            registry,
            gateway,
            config,
            store,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a run and return its id immediately.
    pub fn submit(self: &Arc<Self>, query: String, context: BTreeMap<String, Value>) -> Uuid {
        let job_id = Uuid::new_v4();
        let status = Arc::new(RwLock::new(JobStatus::pending(self.registry.unit_count())));

        let workflow = Workflow::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.gateway),
            self.config.clone(),
        )
        .with_observer(Arc::new(StatusObserver {
            status: Arc::clone(&status),
        }));

        let cancel = workflow.cancel_handle();
        self.jobs.lock().unwrap().insert(
            job_id,
            JobHandle {
                cancel,
                status: Arc::clone(&status),
            },
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match workflow.run(&query, context, Some(job_id)).await {
                Ok(outcome) => {
                    if let Err(err) = manager.store.put(job_id, &outcome.document).await {
                        error!(%job_id, %err, "failed to persist result document");
                    }
                    let final_status = JobStatus::from_state(&outcome.state);
                    if let Err(err) = manager.store.put_status(job_id, &final_status).await {
                        error!(%job_id, %err, "failed to persist job status");
                    }
                }
                Err(err) => {
                    // Taxonomy failure: structured reason, no document.
                    error!(%job_id, %err, "run failed");
                    let errored = {
                        let mut status = status.write().unwrap();
                        status.stage = WorkflowStage::Errored(err.to_string());
                        status.clone()
                    };
                    if let Err(err) = manager.store.put_status(job_id, &errored).await {
                        error!(%job_id, %err, "failed to persist job status");
                    }
                }
            }
        });

        job_id
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|h| h.status.read().unwrap().clone())
    }

    /// Completed or aborted-but-partial document; `None` while running.
    pub async fn result(&self, job_id: Uuid) -> Result<Option<ResultDocument>, StoreError> {
        self.store.get(job_id).await
    }

    /// Request cooperative cancellation. Returns false for unknown jobs.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.jobs.lock().unwrap().get(&job_id) {
            Some(handle) => {
                handle.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}
