use crate::config::MonitorConfig;
use crate::error::{OrchestrationError, Result, StoreError};
use crate::lifecycle::{JobStatus, TerminalStatus};
use crate::stage::{ExecutionContext, Stage};
use crate::store::{JobPatch, JobStore};
use async_trait::async_trait;
use chrono::Utc;
use pitwall_training::{BackendJobRef, BackendJobStatus, JobDescription, SimulationHeartbeat, TrainingBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one monitor poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Job still running; wait this long before the next poll.
    Continue(Duration),
    /// Monitoring is over; `ctx.outcome` holds the intended status.
    Done,
}

/// Polls the backend job once per invocation.
///
/// Checks for a cancellation request and the runtime limit before describing
/// the job, so both are honoured within one poll interval. A failed
/// simulation heartbeat stops the backend job and fails the execution.
pub struct Monitor {
    store: Arc<dyn JobStore>,
    backend: Arc<dyn TrainingBackend>,
    config: MonitorConfig,
}

impl Monitor {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, backend: Arc<dyn TrainingBackend>, config: MonitorConfig) -> Self {
        Self { store, backend, config }
    }

    fn deadline(&self, ctx: &mut ExecutionContext) -> Instant {
        if let Some(deadline) = ctx.deadline {
            return deadline;
        }
        let max_runtime = ctx.request.termination.max_runtime();
        let elapsed = ctx
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .unwrap_or_default();
        let deadline = Instant::now() + max_runtime.saturating_sub(elapsed);
        ctx.deadline = Some(deadline);
        deadline
    }

    async fn stop(&self, ctx: &mut ExecutionContext, job: &BackendJobRef, outcome: TerminalStatus) -> Result<PollOutcome> {
        ctx.outcome = Some(outcome);
        if !ctx.stop_sent {
            self.backend.stop_job(job).await?;
            ctx.stop_sent = true;
        }
        ctx.persist(self.store.as_ref(), JobPatch::new().status(JobStatus::Stopping))
            .await?;
        Ok(PollOutcome::Done)
    }

    /// Describes the job, retrying transient errors with a fixed backoff.
    async fn describe(&self, job: &BackendJobRef) -> Result<JobDescription> {
        let attempts = self.config.describe_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.backend.describe_job(job).await {
                Ok(description) => return Ok(description),
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(attempt, error = %e, "Describe failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(OrchestrationError::TransientInfra(format!(
                        "describe-job failed after {attempts} attempts: {e}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Stage for Monitor {
    type Output = PollOutcome;

    fn name(&self) -> &'static str {
        "monitor"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> Result<PollOutcome> {
        let job = ctx.backend_job.clone().ok_or_else(|| {
            OrchestrationError::InvalidTransition("monitoring a job that was never started".to_string())
        })?;
        let deadline = self.deadline(ctx);

        let record = self
            .store
            .get(ctx.job_id())
            .await?
            .ok_or_else(|| StoreError::NotFound(ctx.job_id().clone()))?;
        if record.cancel_requested {
            info!(backend_job = %job, "Cancellation requested, stopping backend job");
            return self.stop(ctx, &job, TerminalStatus::Canceled).await;
        }

        if Instant::now() >= deadline {
            warn!(
                backend_job = %job,
                max_time_in_minutes = ctx.request.termination.max_time_in_minutes,
                "Runtime limit reached, stopping backend job"
            );
            return self.stop(ctx, &job, TerminalStatus::Completed).await;
        }

        let description = self.describe(&job).await?;
        ctx.backend_status = Some(description.status);
        ctx.persist(
            self.store.as_ref(),
            JobPatch::new()
                .backend_status(description.status)
                .last_polled_at(Utc::now())
                .metrics(description.metrics.clone()),
        )
        .await?;
        debug!(backend_status = ?description.status, "Backend job polled");

        match description.status {
            BackendJobStatus::InProgress | BackendJobStatus::Stopping => {
                if let Some(reason) = description.simulation.as_ref().and_then(SimulationHeartbeat::failure) {
                    warn!(backend_job = %job, reason, "Simulation failed, stopping backend job");
                    ctx.fail(format!("Simulation job failed: {reason}"));
                    return self.stop(ctx, &job, TerminalStatus::Failed).await;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                Ok(PollOutcome::Continue(self.config.poll_interval().min(remaining)))
            }
            BackendJobStatus::Completed => {
                ctx.outcome = Some(TerminalStatus::Completed);
                Ok(PollOutcome::Done)
            }
            // Stopped without a cancellation from us: stopped at its own runtime limit.
            BackendJobStatus::Stopped => {
                if ctx.outcome.is_none() {
                    ctx.outcome = Some(TerminalStatus::Completed);
                }
                Ok(PollOutcome::Done)
            }
            BackendJobStatus::Failed => {
                let message = description
                    .message
                    .unwrap_or_else(|| "training job failed without a reason".to_string());
                ctx.fail(message);
                Ok(PollOutcome::Done)
            }
        }
    }
}
