use crate::error::TrainingResult;
use crate::spec::BackendJobSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque handle to a job started on the training backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendJobRef {
    pub name: String,
    pub arn: String,
}

impl std::fmt::Display for BackendJobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.arn)
    }
}

/// Status as reported by the backend's describe-job call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendJobStatus {
    InProgress,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl BackendJobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// State reported by the simulation paired with a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Initializing,
    Running,
    Completed,
    Failed,
}

/// Last heartbeat written by the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationHeartbeat {
    #[serde(rename = "jobStatus")]
    pub status: SimulationStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl SimulationHeartbeat {
    /// The failure reason, if the simulation reports `Failed`.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        (self.status == SimulationStatus::Failed)
            .then(|| self.message.as_deref().unwrap_or("no reason given"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub status: BackendJobStatus,
    /// Failure reason, present when the backend reports `Failed`.
    pub message: Option<String>,
    pub training_time_seconds: Option<u64>,
    pub artifact_location: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// `None` until the simulation has written its first heartbeat.
    #[serde(default)]
    pub simulation: Option<SimulationHeartbeat>,
}

impl JobDescription {
    #[must_use]
    pub fn with_status(status: BackendJobStatus) -> Self {
        Self {
            status,
            message: None,
            training_time_seconds: None,
            artifact_location: None,
            metrics: BTreeMap::new(),
            simulation: None,
        }
    }
}

/// Client for the managed compute service that runs training jobs.
#[async_trait]
pub trait TrainingBackend: Send + Sync {
    fn id(&self) -> &'static str;

    /// Starts a job. A `Rejected` error means the backend refused it
    /// (for example because its own instance limit is reached).
    async fn start_job(&self, spec: &BackendJobSpec) -> TrainingResult<BackendJobRef>;

    async fn describe_job(&self, job: &BackendJobRef) -> TrainingResult<JobDescription>;

    /// Requests a stop. Stopping a job that already finished is not an error.
    async fn stop_job(&self, job: &BackendJobRef) -> TrainingResult<()>;
}
