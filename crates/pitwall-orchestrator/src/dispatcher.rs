//! Admission control for queued job requests.
//!
//! The dispatcher handles one message per call. It guards against
//! redelivery, checks the quota and starts an execution. A declined request
//! leaves no trace in the job store and surfaces as `QuotaExceeded` so the
//! queue redelivers it later.

use crate::config::DispatcherConfig;
use crate::engine::ExecutionStarter;
use crate::error::{OrchestrationError, Result, StoreError};
use crate::lifecycle::JobStatus;
use crate::stage::ExecutionId;
use crate::store::{JobPatch, JobStore};
use pitwall_training::{JobRequest, QuotaService};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the dispatcher did with a request. Every variant acknowledges the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started(ExecutionId),
    /// A live execution already owns the job.
    AlreadyDispatched,
    AlreadyFinished(JobStatus),
    /// The job was canceled before it started.
    Discarded,
}

pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    quota: Arc<dyn QuotaService>,
    starter: Arc<dyn ExecutionStarter>,
    config: DispatcherConfig,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        quota: Arc<dyn QuotaService>,
        starter: Arc<dyn ExecutionStarter>,
        config: DispatcherConfig,
    ) -> Self {
        Self { store, quota, starter, config }
    }

    /// Parses a raw queue message body and dispatches it.
    pub async fn handle_message(&self, body: &str) -> Result<DispatchOutcome> {
        let request = JobRequest::from_json(body)?;
        self.dispatch(request).await
    }

    pub async fn dispatch(&self, request: JobRequest) -> Result<DispatchOutcome> {
        let job_id = request.job_id.clone();

        if let Some(record) = self.store.get(&job_id).await? {
            match record.status {
                JobStatus::Canceled => {
                    info!(job_id = %job_id, "Job canceled before dispatch, discarding message");
                    return Ok(DispatchOutcome::Discarded);
                }
                status if status.is_terminal() => {
                    info!(job_id = %job_id, status = %status, "Job already finished, ignoring redelivery");
                    return Ok(DispatchOutcome::AlreadyFinished(status));
                }
                JobStatus::Queued => {
                    debug!(job_id = %job_id, "Job record queued, eligible for dispatch");
                }
                status => {
                    info!(job_id = %job_id, status = %status, "Job already dispatched, ignoring redelivery");
                    return Ok(DispatchOutcome::AlreadyDispatched);
                }
            }
        }

        let delay = self.config.admission_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let snapshot = self
            .quota
            .snapshot()
            .await
            .map_err(|e| OrchestrationError::TransientInfra(format!("quota check failed: {e}")))?;
        if !snapshot.has_capacity() {
            info!(
                job_id = %job_id,
                in_flight = snapshot.in_flight,
                ceiling = snapshot.ceiling,
                "No training capacity, declining job"
            );
            return Err(OrchestrationError::QuotaExceeded {
                in_flight: snapshot.in_flight,
                ceiling: snapshot.ceiling,
            });
        }

        let execution_id = match self.starter.start_execution(request).await {
            Ok(id) => id,
            Err(OrchestrationError::ExecutionAlreadyExists(_)) => {
                info!(job_id = %job_id, "Execution already exists, ignoring redelivery");
                return Ok(DispatchOutcome::AlreadyDispatched);
            }
            Err(e) => return Err(e),
        };

        // The execution may already have claimed the record itself.
        let patch = JobPatch::new().status(JobStatus::Initializing);
        match self.store.update(&job_id, JobStatus::Queued, patch).await {
            Ok(_) | Err(StoreError::Conflict { .. }) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to mark job initializing"),
        }

        info!(job_id = %job_id, execution_id = %execution_id, "Job admitted");
        Ok(DispatchOutcome::Started(execution_id))
    }
}
