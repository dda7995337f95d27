//! Common stage signature and the instrumentation wrapper applied to every stage.

use crate::error::{OrchestrationError, Result};
use crate::lifecycle::{JobStatus, TerminalStatus};
use crate::store::{JobPatch, JobRecord, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use pitwall_training::{BackendJobRef, BackendJobStatus, JobId, JobRequest, StreamRef};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info_span, warn};
use uuid::Uuid;

/// Identifier for one execution of a job's workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// State carried through an execution, independent of the job store.
///
/// Resource references live here as well as in the store so the finalizer
/// can clean up even when a store write failed.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub request: JobRequest,
    /// Last status this execution persisted; the expected status for its next write.
    pub status: JobStatus,
    pub stream: Option<StreamRef>,
    pub backend_job: Option<BackendJobRef>,
    pub backend_status: Option<BackendJobStatus>,
    /// Intended terminal status, once known.
    pub outcome: Option<TerminalStatus>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline: Option<Instant>,
    /// A stop-job call has already been issued for the backend job.
    pub stop_sent: bool,
    pub next_wait: Duration,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(request: JobRequest) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            request,
            status: JobStatus::Queued,
            stream: None,
            backend_job: None,
            backend_status: None,
            outcome: None,
            error: None,
            started_at: None,
            deadline: None,
            stop_sent: false,
            next_wait: Duration::ZERO,
        }
    }

    /// Rebuilds a context from a persisted record.
    #[must_use]
    pub fn from_record(record: &JobRecord) -> Self {
        let mut ctx = Self::new(record.request.clone());
        ctx.status = record.status;
        ctx.stream.clone_from(&record.stream_ref);
        ctx.backend_job.clone_from(&record.backend_job_ref);
        ctx.backend_status = record.backend_status;
        ctx.started_at = record.started_at;
        ctx
    }

    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.request.job_id
    }

    /// Records a failure unless a cancellation was already decided.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.outcome != Some(TerminalStatus::Canceled) {
            self.outcome = Some(TerminalStatus::Failed);
            self.error = Some(message.into());
        }
    }

    /// Writes `patch` conditional on the last status this execution persisted.
    pub async fn persist(&mut self, store: &dyn JobStore, patch: JobPatch) -> Result<JobRecord> {
        let record = store.update(self.job_id(), self.status, patch).await?;
        self.status = record.status;
        Ok(record)
    }
}

/// One step of the workflow.
#[async_trait]
pub trait Stage: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut ExecutionContext) -> Result<Self::Output>;
}

/// Runs a stage inside a tracing span, timing it and turning a panic into
/// `StagePanicked` so the caller can still route the execution to cleanup.
pub async fn instrumented<S: Stage>(stage: &S, ctx: &mut ExecutionContext) -> Result<S::Output> {
    let span = info_span!(
        "stage",
        stage = stage.name(),
        job_id = %ctx.job_id(),
        execution_id = %ctx.execution_id
    );
    let started = Instant::now();

    let result = AssertUnwindSafe(stage.run(ctx))
        .catch_unwind()
        .instrument(span.clone())
        .await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => {
            debug!(parent: &span, elapsed_ms, "Stage completed");
            Ok(output)
        }
        Ok(Err(e)) => {
            warn!(parent: &span, elapsed_ms, error = %e, "Stage failed");
            Err(e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(parent: &span, elapsed_ms, panic = %message, "Stage panicked");
            Err(OrchestrationError::StagePanicked { stage: stage.name(), message })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
