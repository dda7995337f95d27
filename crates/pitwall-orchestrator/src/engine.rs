//! Orchestrator engine.
//!
//! Runs each admitted job as its own tokio task that walks the workflow state
//! machine: Initializing, then Monitoring (poll, wait, poll, ...), then
//! Finalizing. Every error raised before Finalizing routes into Finalizing, so
//! cleanup runs on every exit path. The wait between polls is a timer
//! suspension; no task is busy while a job trains.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result, StoreError};
use crate::lifecycle::{JobStatus, MonitorPhase, TerminalStatus, Trigger, WorkflowState};
use crate::progress::WorkflowProgress;
use crate::stage::{ExecutionContext, ExecutionId, instrumented};
use crate::stages::{Finalizer, Initializer, Monitor, PollOutcome};
use crate::store::{JobPatch, JobRecord, JobStore};
use crate::usage::ComputeUsage;
use async_trait::async_trait;
use chrono::Utc;
use pitwall_training::{JobId, JobRequest, StreamService, TrainingBackend};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

const MAX_CANCEL_ATTEMPTS: u32 = 5;

/// External collaborators injected into the orchestrator and its stages.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn JobStore>,
    pub backend: Arc<dyn TrainingBackend>,
    pub streams: Arc<dyn StreamService>,
    pub usage: Arc<dyn ComputeUsage>,
}

/// Starts workflow executions. Implemented by [`Orchestrator`]; the
/// dispatcher depends only on this.
#[async_trait]
pub trait ExecutionStarter: Send + Sync {
    /// Starts an execution for the request. Fails with
    /// `ExecutionAlreadyExists` if the job already has one.
    async fn start_execution(&self, request: JobRequest) -> Result<ExecutionId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationOutcome {
    /// The job had not started; its record is now `Canceled`.
    CanceledWhileQueued,
    /// The flag is set; the monitor will stop the job at its next poll.
    Requested,
    NotCancelable(JobStatus),
}

struct ExecutionHandle {
    execution_id: ExecutionId,
    outcome: watch::Receiver<Option<TerminalStatus>>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    usage: Arc<dyn ComputeUsage>,
    initializer: Initializer,
    monitor: Monitor,
    finalizer: Finalizer,
    progress: WorkflowProgress,
    /// Executions still running in this orchestrator. Removed once they end.
    executions: Mutex<HashMap<JobId, ExecutionHandle>>,
    shutdown: CancellationToken,
}

/// State-machine engine sequencing initializer, monitor and finalizer.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field(
                "executions",
                &self.inner.executions.try_lock().map(|e| e.len()).unwrap_or(0),
            )
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    #[must_use]
    pub fn new(collaborators: Collaborators, config: &OrchestratorConfig) -> Self {
        let Collaborators { store, backend, streams, usage } = collaborators;
        let initializer = Initializer::new(
            Arc::clone(&store),
            Arc::clone(&streams),
            Arc::clone(&backend),
            config.backend.settings(),
            config.backend.layout(),
            config.stream.retention_hours,
        );
        let monitor = Monitor::new(Arc::clone(&store), Arc::clone(&backend), config.monitor.clone());
        let finalizer = Finalizer::new(
            Arc::clone(&store),
            streams,
            backend,
            Arc::clone(&usage),
            config.finalizer.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                store,
                usage,
                initializer,
                monitor,
                finalizer,
                progress: WorkflowProgress::new(),
                executions: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn progress(&self) -> &WorkflowProgress {
        &self.inner.progress
    }

    pub async fn execution_id(&self, job_id: &JobId) -> Option<ExecutionId> {
        self.inner.executions.lock().await.get(job_id).map(|h| h.execution_id)
    }

    /// Waits until the job's execution reaches a terminal state.
    ///
    /// A job with no running execution here is answered from its record.
    /// Returns `Canceled` if the execution was suspended by [`Self::shutdown`]
    /// or the record is not terminal.
    pub async fn wait_for(&self, job_id: &JobId) -> Result<TerminalStatus> {
        let handle = self
            .inner
            .executions
            .lock()
            .await
            .get(job_id)
            .map(|h| h.outcome.clone());
        let Some(mut rx) = handle else {
            return self.recorded_outcome(job_id).await;
        };
        let outcome = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestrationError::Canceled)?;
        outcome.ok_or(OrchestrationError::Canceled)
    }

    async fn recorded_outcome(&self, job_id: &JobId) -> Result<TerminalStatus> {
        let record = self
            .inner
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
        TerminalStatus::try_from(record.status).map_err(|_| {
            debug!(job_id = %job_id, status = %record.status, "No running execution and record not terminal");
            OrchestrationError::Canceled
        })
    }

    /// Stops all executions at their next wait boundary, leaving their
    /// records in place for [`Self::recover`].
    pub fn shutdown(&self) {
        info!("Orchestrator shutdown requested");
        self.inner.shutdown.cancel();
    }

    /// Requests cancellation of a job.
    ///
    /// A queued job is canceled on the spot. A running job gets its
    /// `cancel_requested` flag set and is stopped by the monitor.
    pub async fn request_cancellation(&self, job_id: &JobId) -> Result<CancellationOutcome> {
        let store = &self.inner.store;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let record = store
                .get(job_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;

            let result = match record.status {
                JobStatus::Queued => {
                    let patch = JobPatch::new()
                        .status(JobStatus::Canceled)
                        .cancel_requested(true)
                        .ended_at(Utc::now());
                    store
                        .update(job_id, JobStatus::Queued, patch)
                        .await
                        .map(|_| CancellationOutcome::CanceledWhileQueued)
                }
                JobStatus::Initializing | JobStatus::InProgress => store
                    .update(job_id, record.status, JobPatch::new().cancel_requested(true))
                    .await
                    .map(|_| CancellationOutcome::Requested),
                status => {
                    info!(job_id = %job_id, status = %status, "Job is not cancelable");
                    return Ok(CancellationOutcome::NotCancelable(status));
                }
            };

            match result {
                Ok(CancellationOutcome::CanceledWhileQueued) => {
                    info!(job_id = %job_id, "Job canceled while queued");
                    self.release_reservation(&record).await;
                    return Ok(CancellationOutcome::CanceledWhileQueued);
                }
                Ok(outcome) => {
                    info!(job_id = %job_id, status = %record.status, "Cancellation requested");
                    return Ok(outcome);
                }
                Err(StoreError::Conflict { actual, .. }) if attempt < MAX_CANCEL_ATTEMPTS => {
                    debug!(job_id = %job_id, actual = %actual, attempt, "Cancellation raced a status change, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn release_reservation(&self, record: &JobRecord) {
        let minutes = f64::from(record.request.termination.max_time_in_minutes);
        if let Err(e) = self.inner.usage.settle(&record.profile_id, minutes, 0.0).await {
            warn!(job_id = %record.job_id, error = %e, "Failed to release compute reservation");
        }
    }

    /// Resumes every active job that has no live execution, picking up from
    /// the status persisted in the job store.
    pub async fn recover(&self) -> Result<Vec<JobId>> {
        let active = self.inner.store.list_active().await?;
        let mut executions = self.inner.executions.lock().await;
        let mut resumed = Vec::new();

        for record in active {
            if executions.contains_key(&record.job_id) {
                continue;
            }
            let mut ctx = ExecutionContext::from_record(&record);
            let state = match record.status {
                JobStatus::Queued => WorkflowState::Queued,
                JobStatus::Initializing if record.backend_job_ref.is_some() => {
                    let started_at = record.started_at.unwrap_or_else(Utc::now);
                    let patch = JobPatch::new().status(JobStatus::InProgress).started_at(started_at);
                    if let Err(e) = ctx.persist(self.inner.store.as_ref(), patch).await {
                        warn!(job_id = %record.job_id, error = %e, "Could not resume job, skipping");
                        continue;
                    }
                    ctx.started_at = Some(started_at);
                    WorkflowState::Monitoring(MonitorPhase::Poll)
                }
                JobStatus::Initializing => {
                    ctx.fail("interrupted during initialization");
                    WorkflowState::Finalizing
                }
                JobStatus::InProgress => WorkflowState::Monitoring(MonitorPhase::Poll),
                JobStatus::Stopping => {
                    ctx.stop_sent = true;
                    ctx.outcome = Some(if record.cancel_requested {
                        TerminalStatus::Canceled
                    } else {
                        TerminalStatus::Completed
                    });
                    WorkflowState::Finalizing
                }
                JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => continue,
            };

            info!(
                job_id = %record.job_id,
                status = %record.status,
                resume_state = %state,
                "Resuming execution"
            );
            self.spawn(&mut executions, ctx, state).await;
            resumed.push(record.job_id);
        }
        Ok(resumed)
    }

    async fn spawn(
        &self,
        executions: &mut HashMap<JobId, ExecutionHandle>,
        ctx: ExecutionContext,
        state: WorkflowState,
    ) -> ExecutionId {
        let (tx, rx) = watch::channel(None);
        let execution_id = ctx.execution_id;
        let job_id = ctx.job_id().clone();
        executions.insert(job_id.clone(), ExecutionHandle { execution_id, outcome: rx });

        self.inner
            .progress
            .execution_started(job_id.clone(), execution_id.to_string())
            .await;
        let span = info_span!("execution", job_id = %job_id, execution_id = %execution_id);
        tokio::spawn(drive(Arc::clone(&self.inner), ctx, state, tx).instrument(span));
        execution_id
    }
}

#[async_trait]
impl ExecutionStarter for Orchestrator {
    async fn start_execution(&self, request: JobRequest) -> Result<ExecutionId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestrationError::Canceled);
        }
        let job_id = request.job_id.clone();
        let mut executions = self.inner.executions.lock().await;
        if executions.contains_key(&job_id) {
            return Err(OrchestrationError::ExecutionAlreadyExists(job_id));
        }

        let ctx = match self.inner.store.get(&job_id).await? {
            None => {
                let record = JobRecord::queued(request.clone());
                match self.inner.store.create(record).await {
                    Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                ExecutionContext::new(request)
            }
            Some(record) if record.status == JobStatus::Queued => ExecutionContext::from_record(&record),
            Some(record) => {
                debug!(job_id = %job_id, status = %record.status, "Record already past Queued");
                return Err(OrchestrationError::ExecutionAlreadyExists(job_id));
            }
        };

        let execution_id = self.spawn(&mut executions, ctx, WorkflowState::Queued).await;
        info!(job_id = %job_id, execution_id = %execution_id, "Execution started");
        Ok(execution_id)
    }
}

/// Routes a stage error into Finalizing.
fn route_error(ctx: &mut ExecutionContext, state: WorkflowState, err: &OrchestrationError) -> Trigger {
    warn!(state = %state, error = %err, "Stage error, routing to finalizer");
    ctx.fail(err.to_string());
    Trigger::Errored
}

/// Drops the handle of an execution that has ended. Receivers already handed
/// out by `wait_for` keep the last outcome.
async fn release_handle(inner: &Inner, job_id: &JobId, execution_id: ExecutionId) {
    let mut executions = inner.executions.lock().await;
    if executions.get(job_id).is_some_and(|h| h.execution_id == execution_id) {
        executions.remove(job_id);
    }
}

async fn drive(
    inner: Arc<Inner>,
    mut ctx: ExecutionContext,
    mut state: WorkflowState,
    outcome_tx: watch::Sender<Option<TerminalStatus>>,
) {
    let job_id = ctx.job_id().clone();
    loop {
        inner.progress.state_entered(job_id.clone(), state);

        let trigger = match state {
            WorkflowState::Queued => Trigger::Started,
            WorkflowState::Initializing => match instrumented(&inner.initializer, &mut ctx).await {
                Ok(()) => Trigger::Initialized,
                Err(e) => route_error(&mut ctx, state, &e),
            },
            WorkflowState::Monitoring(MonitorPhase::Poll) => {
                let result = instrumented(&inner.monitor, &mut ctx).await;
                if let Some(status) = ctx.backend_status {
                    inner.progress.poll_observed(job_id.clone(), status);
                }
                match result {
                    Ok(PollOutcome::Continue(wait)) => {
                        ctx.next_wait = wait;
                        Trigger::StillRunning
                    }
                    Ok(PollOutcome::Done) => Trigger::MonitorDone,
                    Err(e) => route_error(&mut ctx, state, &e),
                }
            }
            WorkflowState::Monitoring(MonitorPhase::Wait) => {
                tokio::select! {
                    () = tokio::time::sleep(ctx.next_wait) => Trigger::WaitElapsed,
                    () = inner.shutdown.cancelled() => {
                        info!("Execution suspended by shutdown");
                        inner.progress.execution_suspended().await;
                        release_handle(&inner, &job_id, ctx.execution_id).await;
                        return;
                    }
                }
            }
            WorkflowState::Finalizing => {
                let status = match instrumented(&inner.finalizer, &mut ctx).await {
                    Ok(status) => status,
                    Err(e) => {
                        error!(
                            error = %e,
                            stream = ?ctx.stream.as_ref().map(|s| s.arn.as_str()),
                            backend_job = ?ctx.backend_job.as_ref().map(|j| j.arn.as_str()),
                            stop_sent = ctx.stop_sent,
                            "Finalizer failed, job record left non-terminal"
                        );
                        TerminalStatus::Failed
                    }
                };
                Trigger::Finalized(status)
            }
            WorkflowState::Terminal(status) => {
                let error = (status == TerminalStatus::Failed).then(|| ctx.error.clone()).flatten();
                info!(status = %status, "Execution finished");
                inner.progress.job_finished(job_id.clone(), status, error).await;
                outcome_tx.send_replace(Some(status));
                release_handle(&inner, &job_id, ctx.execution_id).await;
                return;
            }
        };

        state = match state.on(trigger) {
            Some(next) => next,
            None => {
                error!(state = %state, trigger = ?trigger, "Invalid workflow transition");
                ctx.fail(format!("invalid workflow transition from {state}"));
                if state == WorkflowState::Finalizing {
                    WorkflowState::Terminal(TerminalStatus::Failed)
                } else {
                    WorkflowState::Finalizing
                }
            }
        };
    }
}
