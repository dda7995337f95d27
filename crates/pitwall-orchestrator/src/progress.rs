//! Progress reporting for workflow executions.
//!
//! Broadcasts execution events to any subscriber and keeps a running tally
//! of job outcomes.

use crate::lifecycle::{TerminalStatus, WorkflowState};
use pitwall_training::{BackendJobStatus, JobId};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Workflow event types.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// An execution was started for a job.
    ExecutionStarted { job_id: JobId, execution_id: String },
    /// An execution entered a new state.
    StateEntered { job_id: JobId, state: WorkflowState },
    /// The monitor observed a backend status.
    PollObserved { job_id: JobId, status: BackendJobStatus },
    /// The job reached a terminal status.
    JobFinished {
        job_id: JobId,
        status: TerminalStatus,
        error: Option<String>,
    },
}

/// Outcome metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkflowMetrics {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// Progress reporter shared by the orchestrator and its executions.
#[derive(Debug, Clone)]
pub struct WorkflowProgress {
    broadcast_tx: broadcast::Sender<WorkflowEvent>,
    metrics: Arc<Mutex<WorkflowMetrics>>,
}

impl WorkflowProgress {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        Self {
            broadcast_tx,
            metrics: Arc::new(Mutex::new(WorkflowMetrics::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.broadcast_tx.subscribe()
    }

    pub async fn snapshot(&self) -> WorkflowMetrics {
        *self.metrics.lock().await
    }

    fn emit(&self, event: WorkflowEvent) {
        debug!(event = ?event, "Workflow event");
        let _ = self.broadcast_tx.send(event);
    }

    pub async fn execution_started(&self, job_id: JobId, execution_id: String) {
        self.metrics.lock().await.active += 1;
        self.emit(WorkflowEvent::ExecutionStarted { job_id, execution_id });
    }

    pub fn state_entered(&self, job_id: JobId, state: WorkflowState) {
        self.emit(WorkflowEvent::StateEntered { job_id, state });
    }

    pub fn poll_observed(&self, job_id: JobId, status: BackendJobStatus) {
        self.emit(WorkflowEvent::PollObserved { job_id, status });
    }

    pub async fn job_finished(&self, job_id: JobId, status: TerminalStatus, error: Option<String>) {
        {
            let mut metrics = self.metrics.lock().await;
            metrics.active = metrics.active.saturating_sub(1);
            match status {
                TerminalStatus::Completed => metrics.completed += 1,
                TerminalStatus::Failed => metrics.failed += 1,
                TerminalStatus::Canceled => metrics.canceled += 1,
            }
        }
        self.emit(WorkflowEvent::JobFinished { job_id, status, error });
    }

    /// An execution stopped without finishing (orchestrator shutdown).
    pub async fn execution_suspended(&self) {
        let mut metrics = self.metrics.lock().await;
        metrics.active = metrics.active.saturating_sub(1);
    }
}

impl Default for WorkflowProgress {
    fn default() -> Self {
        Self::new()
    }
}
