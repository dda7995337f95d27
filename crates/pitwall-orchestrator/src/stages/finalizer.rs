use crate::config::FinalizerConfig;
use crate::error::{OrchestrationError, Result, StoreError};
use crate::lifecycle::TerminalStatus;
use crate::stage::{ExecutionContext, Stage};
use crate::store::{JobPatch, JobRecord, JobStore};
use crate::usage::ComputeUsage;
use async_trait::async_trait;
use chrono::Utc;
use pitwall_training::{JobDescription, StreamRef, StreamService, TrainingBackend};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Releases everything the job provisioned and writes its terminal status.
///
/// Secondary cleanup (stopping a stray backend job, deleting the stream,
/// settling compute usage) is best-effort: failures are logged and never
/// change the terminal status. Backend and stream cleanup use the references
/// carried by the execution, so they run even when the job store is down.
pub struct Finalizer {
    store: Arc<dyn JobStore>,
    streams: Arc<dyn StreamService>,
    backend: Arc<dyn TrainingBackend>,
    usage: Arc<dyn ComputeUsage>,
    config: FinalizerConfig,
}

impl Finalizer {
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        streams: Arc<dyn StreamService>,
        backend: Arc<dyn TrainingBackend>,
        usage: Arc<dyn ComputeUsage>,
        config: FinalizerConfig,
    ) -> Self {
        Self { store, streams, backend, usage, config }
    }

    async fn stop_unterminated(&self, ctx: &mut ExecutionContext) {
        let Some(job) = &ctx.backend_job else { return };
        let finished = ctx.backend_status.is_some_and(|status| status.is_terminal());
        if finished || ctx.stop_sent {
            return;
        }
        match self.backend.stop_job(job).await {
            Ok(()) => {
                info!(backend_job = %job, "Stopped unterminated backend job");
                ctx.stop_sent = true;
            }
            Err(e) => warn!(backend_job = %job, error = %e, "Failed to stop unterminated backend job"),
        }
    }

    async fn final_description(&self, ctx: &ExecutionContext) -> Option<JobDescription> {
        let job = ctx.backend_job.as_ref()?;
        match self.backend.describe_job(job).await {
            Ok(description) => Some(description),
            Err(e) => {
                warn!(backend_job = %job, error = %e, "Final describe failed");
                None
            }
        }
    }

    /// Deletes the stream, retrying transient failures. `NotFound` counts as deleted.
    async fn delete_stream(&self, stream: &StreamRef) {
        let attempts = self.config.delete_retries.max(1);
        for attempt in 1..=attempts {
            match self.streams.delete_stream(stream).await {
                Ok(()) => {
                    info!(stream = %stream, "Telemetry stream deleted");
                    return;
                }
                Err(e) if e.is_not_found() => {
                    debug!(stream = %stream, "Telemetry stream already deleted");
                    return;
                }
                Err(e) if attempt < attempts => {
                    debug!(stream = %stream, attempt, error = %e, "Stream delete failed, retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                }
                Err(e) => {
                    error!(
                        stream = %stream,
                        attempts,
                        error = %e,
                        "Stream delete failed, resource leaked"
                    );
                }
            }
        }
    }

    async fn current_record(&self, ctx: &ExecutionContext) -> Result<JobRecord> {
        self.store
            .get(ctx.job_id())
            .await?
            .ok_or_else(|| StoreError::NotFound(ctx.job_id().clone()).into())
    }

    async fn settle_usage(&self, ctx: &ExecutionContext, training_seconds: Option<u64>) {
        let minutes_queued = f64::from(ctx.request.termination.max_time_in_minutes);
        let minutes_used = training_seconds.map_or(0.0, |s| s as f64 / 60.0);
        if let Err(e) = self
            .usage
            .settle(&ctx.request.profile_id, minutes_queued, minutes_used)
            .await
        {
            warn!(profile_id = %ctx.request.profile_id, error = %e, "Failed to settle compute usage");
        }
    }
}

#[async_trait]
impl Stage for Finalizer {
    type Output = TerminalStatus;

    fn name(&self) -> &'static str {
        "finalizer"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> Result<TerminalStatus> {
        self.stop_unterminated(ctx).await;
        let description = self.final_description(ctx).await;

        // The stream held by the execution is released before the store is touched.
        if let Some(stream) = ctx.stream.clone() {
            self.delete_stream(&stream).await;
        }

        let mut record = self.current_record(ctx).await?;
        if ctx.stream.is_none() {
            if let Some(stream) = record.stream_ref.clone() {
                self.delete_stream(&stream).await;
            }
        }

        let mut intended = ctx.outcome.unwrap_or(TerminalStatus::Failed);
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            if let Ok(status) = TerminalStatus::try_from(record.status) {
                info!(status = %status, "Job already terminal, leaving record unchanged");
                return Ok(status);
            }

            if !record.status.can_transition_to(intended.into()) {
                ctx.fail(format!("job cannot finish as {intended} from {}", record.status));
                intended = TerminalStatus::Failed;
            }

            let training_seconds = description.as_ref().and_then(|d| d.training_time_seconds);
            let ended_at = Utc::now();
            let duration = training_seconds.unwrap_or_else(|| {
                ctx.started_at
                    .and_then(|started| (ended_at - started).to_std().ok())
                    .map_or(0, |elapsed| elapsed.as_secs())
            });

            let mut patch = JobPatch::new()
                .status(intended.into())
                .ended_at(ended_at)
                .duration_seconds(duration);
            if let Some(d) = &description {
                patch = patch.backend_status(d.status);
            }
            match intended {
                TerminalStatus::Failed => {
                    let message = ctx.error.clone().unwrap_or_else(|| "job failed".to_string());
                    patch = patch.error_message(message);
                }
                TerminalStatus::Completed => {
                    if let Some(location) = description.as_ref().and_then(|d| d.artifact_location.clone()) {
                        patch = patch.artifact_location(location);
                    }
                }
                TerminalStatus::Canceled => {}
            }

            match self.store.update(ctx.job_id(), record.status, patch).await {
                Ok(updated) => {
                    ctx.status = updated.status;
                    self.settle_usage(ctx, training_seconds).await;
                    info!(status = %intended, duration_seconds = duration, "Job finalized");
                    return Ok(intended);
                }
                Err(StoreError::Conflict { actual, .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    debug!(actual = %actual, attempt, "Record changed during finalization, re-reading");
                    record = self.current_record(ctx).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestrationError::Store(StoreError::Unavailable(format!(
            "could not write terminal status for {}",
            ctx.job_id()
        ))))
    }
}
