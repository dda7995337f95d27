use crate::error::{OrchestrationError, Result, StoreError};
use crate::lifecycle::JobStatus;
use crate::stage::{ExecutionContext, Stage};
use crate::store::{JobPatch, JobStore};
use async_trait::async_trait;
use chrono::Utc;
use pitwall_training::{ArtifactLayout, BackendJobSpec, BackendSettings, StreamService, TrainingBackend};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates the telemetry stream and starts the backend job.
pub struct Initializer {
    store: Arc<dyn JobStore>,
    streams: Arc<dyn StreamService>,
    backend: Arc<dyn TrainingBackend>,
    settings: BackendSettings,
    layout: ArtifactLayout,
    retention_hours: u32,
}

impl Initializer {
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        streams: Arc<dyn StreamService>,
        backend: Arc<dyn TrainingBackend>,
        settings: BackendSettings,
        layout: ArtifactLayout,
        retention_hours: u32,
    ) -> Self {
        Self { store, streams, backend, settings, layout, retention_hours }
    }

    /// Moves the record out of `Queued`. The dispatcher may have done it already.
    async fn claim(&self, ctx: &mut ExecutionContext) -> Result<()> {
        match ctx.status {
            JobStatus::Queued => {}
            JobStatus::Initializing => return Ok(()),
            other => {
                return Err(OrchestrationError::InvalidTransition(format!(
                    "cannot initialize a job that is {other}"
                )));
            }
        }
        let patch = JobPatch::new().status(JobStatus::Initializing);
        match ctx.persist(self.store.as_ref(), patch).await {
            Ok(_) => Ok(()),
            Err(OrchestrationError::Store(StoreError::Conflict {
                actual: JobStatus::Initializing,
                ..
            })) => {
                ctx.status = JobStatus::Initializing;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Stage for Initializer {
    type Output = ();

    fn name(&self) -> &'static str {
        "initializer"
    }

    async fn run(&self, ctx: &mut ExecutionContext) -> Result<()> {
        self.claim(ctx).await?;

        // The stream reference goes into the execution context before anything
        // else can fail, so the finalizer always sees it.
        let stream = match &ctx.stream {
            Some(stream) => stream.clone(),
            None => {
                let stream = self
                    .streams
                    .create_stream(ctx.job_id().as_str(), self.retention_hours)
                    .await?;
                ctx.stream = Some(stream.clone());
                info!(stream = %stream, "Telemetry stream created");
                ctx.persist(self.store.as_ref(), JobPatch::new().stream_ref(stream.clone()))
                    .await?;
                stream
            }
        };

        let spec = BackendJobSpec::from_request(&ctx.request, &self.settings, &self.layout, &stream)?;
        debug!(job_name = %spec.job_name, max_runtime_seconds = spec.max_runtime_seconds, "Starting backend job");
        let job = self.backend.start_job(&spec).await?;
        ctx.backend_job = Some(job.clone());
        info!(backend_job = %job, "Backend job started");

        let started_at = Utc::now();
        ctx.started_at = Some(started_at);
        ctx.persist(
            self.store.as_ref(),
            JobPatch::new()
                .status(JobStatus::InProgress)
                .backend_job_ref(job)
                .started_at(started_at),
        )
        .await?;
        Ok(())
    }
}
