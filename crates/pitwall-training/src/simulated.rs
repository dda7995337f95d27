//! In-memory stand-ins for the training backend, stream service and quota
//! service. Used by tests and by `pitwall simulate`.

use crate::backend::{
    BackendJobRef, BackendJobStatus, JobDescription, SimulationHeartbeat, SimulationStatus, TrainingBackend,
};
use crate::error::{TrainingError, TrainingResult};
use crate::quota::QuotaService;
use crate::spec::BackendJobSpec;
use crate::stream::{StreamRef, StreamService};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

const SECONDS_PER_POLL: u64 = 60;

#[derive(Debug)]
struct SimulatedJob {
    spec: BackendJobSpec,
    status: BackendJobStatus,
    polls: u32,
    stop_calls: u32,
}

#[derive(Debug, Default)]
struct BackendState {
    jobs: HashMap<String, SimulatedJob>,
    start_calls: u32,
    describe_calls: u32,
    describe_failures_left: u32,
    quota_failures_left: u32,
}

/// Training backend that advances a job one step per describe call.
///
/// A job reports `InProgress` until it has been described `polls_to_complete`
/// times, then settles on its scripted outcome. A stop request moves the job
/// to `Stopping` and the next describe reports `Stopped`. Starts beyond the
/// ceiling are rejected the way a real backend enforces its instance limit.
#[derive(Debug)]
pub struct SimulatedBackend {
    polls_to_complete: u32,
    failure: Option<String>,
    simulation_failure: Option<(u32, String)>,
    reject_starts: Option<String>,
    ceiling: u32,
    external_in_flight: u32,
    state: Mutex<BackendState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            polls_to_complete: 1,
            failure: None,
            simulation_failure: None,
            reject_starts: None,
            ceiling: 2,
            external_in_flight: 0,
            state: Mutex::new(BackendState::default()),
        }
    }

    #[must_use]
    pub fn with_polls_to_complete(mut self, polls: u32) -> Self {
        self.polls_to_complete = polls.max(1);
        self
    }

    /// Jobs end `Failed` with `message` instead of `Completed`.
    #[must_use]
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// The simulation heartbeat reports `Failed` with `message` once a job
    /// has been described `after_polls` times. The training job itself keeps
    /// running until it is stopped.
    #[must_use]
    pub fn with_simulation_failure(mut self, after_polls: u32, message: impl Into<String>) -> Self {
        self.simulation_failure = Some((after_polls, message.into()));
        self
    }

    /// Every start-job call is rejected with `message`.
    #[must_use]
    pub fn with_rejected_starts(mut self, message: impl Into<String>) -> Self {
        self.reject_starts = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_ceiling(mut self, ceiling: u32) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Jobs owned by someone else that count against the ceiling.
    #[must_use]
    pub fn with_external_in_flight(mut self, count: u32) -> Self {
        self.external_in_flight = count;
        self
    }

    /// The next `times` describe calls fail with a transient error.
    pub async fn fail_next_describes(&self, times: u32) {
        self.state.lock().await.describe_failures_left = times;
    }

    /// The next `times` quota lookups fail with a transient error.
    pub async fn fail_next_quota_checks(&self, times: u32) {
        self.state.lock().await.quota_failures_left = times;
    }

    pub async fn start_calls(&self) -> u32 {
        self.state.lock().await.start_calls
    }

    pub async fn describe_calls(&self) -> u32 {
        self.state.lock().await.describe_calls
    }

    pub async fn stop_calls(&self, job_name: &str) -> u32 {
        self.state.lock().await.jobs.get(job_name).map_or(0, |job| job.stop_calls)
    }

    pub async fn status_of(&self, job_name: &str) -> Option<BackendJobStatus> {
        self.state.lock().await.jobs.get(job_name).map(|job| job.status)
    }

    pub async fn spec_of(&self, job_name: &str) -> Option<BackendJobSpec> {
        self.state.lock().await.jobs.get(job_name).map(|job| job.spec.clone())
    }

    fn running(state: &BackendState) -> u32 {
        state.jobs.values().filter(|job| !job.status.is_terminal()).count() as u32
    }

    fn describe(&self, job: &SimulatedJob) -> JobDescription {
        let mut description = JobDescription::with_status(job.status);
        description.training_time_seconds = Some(u64::from(job.polls) * SECONDS_PER_POLL);
        description.metrics.insert("episodes".to_string(), f64::from(job.polls) * 10.0);
        match job.status {
            BackendJobStatus::Failed => description.message.clone_from(&self.failure),
            BackendJobStatus::Completed | BackendJobStatus::Stopped => {
                description.artifact_location =
                    Some(format!("{}/{}/output/model.tar.gz", job.spec.output_location, job.spec.job_name));
            }
            BackendJobStatus::InProgress | BackendJobStatus::Stopping => {}
        }
        description.simulation = Some(self.heartbeat(job));
        description
    }

    fn heartbeat(&self, job: &SimulatedJob) -> SimulationHeartbeat {
        let status = match (&self.simulation_failure, job.status) {
            (Some((after, _)), _) if job.polls >= *after => SimulationStatus::Failed,
            (_, BackendJobStatus::InProgress | BackendJobStatus::Stopping) => SimulationStatus::Running,
            _ => SimulationStatus::Completed,
        };
        let message = match (&self.simulation_failure, status) {
            (Some((_, message)), SimulationStatus::Failed) => Some(message.clone()),
            _ => None,
        };
        SimulationHeartbeat { status, message }
    }
}

#[async_trait]
impl TrainingBackend for SimulatedBackend {
    fn id(&self) -> &'static str {
        "simulated"
    }

    async fn start_job(&self, spec: &BackendJobSpec) -> TrainingResult<BackendJobRef> {
        let mut state = self.state.lock().await;
        state.start_calls += 1;

        if let Some(message) = &self.reject_starts {
            return Err(TrainingError::Rejected(message.clone()));
        }
        if state.jobs.contains_key(&spec.job_name) {
            return Err(TrainingError::Rejected(format!("job {} already exists", spec.job_name)));
        }
        if self.external_in_flight + Self::running(&state) >= self.ceiling {
            return Err(TrainingError::Rejected(format!(
                "training instance limit of {} reached",
                self.ceiling
            )));
        }

        debug!(job_name = %spec.job_name, "Simulated job started");
        state.jobs.insert(
            spec.job_name.clone(),
            SimulatedJob {
                spec: spec.clone(),
                status: BackendJobStatus::InProgress,
                polls: 0,
                stop_calls: 0,
            },
        );
        Ok(BackendJobRef {
            name: spec.job_name.clone(),
            arn: format!("simulated:training-job/{}", spec.job_name),
        })
    }

    async fn describe_job(&self, job: &BackendJobRef) -> TrainingResult<JobDescription> {
        let mut state = self.state.lock().await;
        state.describe_calls += 1;
        if state.describe_failures_left > 0 {
            state.describe_failures_left -= 1;
            return Err(TrainingError::Transient("describe-job throttled".to_string()));
        }

        let polls_to_complete = self.polls_to_complete;
        let outcome = if self.failure.is_some() {
            BackendJobStatus::Failed
        } else {
            BackendJobStatus::Completed
        };
        let sim = state
            .jobs
            .get_mut(&job.name)
            .ok_or_else(|| TrainingError::NotFound(format!("training job {}", job.name)))?;

        match sim.status {
            BackendJobStatus::InProgress => {
                sim.polls += 1;
                if sim.polls >= polls_to_complete {
                    sim.status = outcome;
                }
            }
            BackendJobStatus::Stopping => sim.status = BackendJobStatus::Stopped,
            _ => {}
        }
        Ok(self.describe(sim))
    }

    async fn stop_job(&self, job: &BackendJobRef) -> TrainingResult<()> {
        let mut state = self.state.lock().await;
        let sim = state
            .jobs
            .get_mut(&job.name)
            .ok_or_else(|| TrainingError::NotFound(format!("training job {}", job.name)))?;
        sim.stop_calls += 1;
        if sim.status == BackendJobStatus::InProgress {
            sim.status = BackendJobStatus::Stopping;
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaService for SimulatedBackend {
    async fn in_flight_count(&self) -> TrainingResult<u32> {
        let mut state = self.state.lock().await;
        if state.quota_failures_left > 0 {
            state.quota_failures_left -= 1;
            return Err(TrainingError::Transient("quota service unavailable".to_string()));
        }
        Ok(self.external_in_flight + Self::running(&state))
    }

    async fn ceiling(&self) -> TrainingResult<u32> {
        Ok(self.ceiling)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    live: HashSet<String>,
    created: HashMap<String, u32>,
    deleted: HashMap<String, u32>,
    delete_failures_left: u32,
}

/// Stream service that tracks create and delete calls per stream name.
#[derive(Debug, Default)]
pub struct SimulatedStreams {
    fail_creates: Option<String>,
    state: Mutex<StreamState>,
}

impl SimulatedStreams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_failing_creates(mut self, message: impl Into<String>) -> Self {
        self.fail_creates = Some(message.into());
        self
    }

    /// The next `times` delete calls fail with a transient error.
    pub async fn fail_next_deletes(&self, times: u32) {
        self.state.lock().await.delete_failures_left = times;
    }

    pub async fn created(&self, name: &str) -> u32 {
        self.state.lock().await.created.get(name).copied().unwrap_or(0)
    }

    /// Successful deletes only; NotFound and transient failures are not counted.
    pub async fn deleted(&self, name: &str) -> u32 {
        self.state.lock().await.deleted.get(name).copied().unwrap_or(0)
    }

    pub async fn live_streams(&self) -> Vec<String> {
        let mut live: Vec<String> = self.state.lock().await.live.iter().cloned().collect();
        live.sort();
        live
    }
}

#[async_trait]
impl StreamService for SimulatedStreams {
    async fn create_stream(&self, name: &str, retention_hours: u32) -> TrainingResult<StreamRef> {
        if let Some(message) = &self.fail_creates {
            return Err(TrainingError::Transient(message.clone()));
        }
        let mut state = self.state.lock().await;
        if !state.live.insert(name.to_string()) {
            return Err(TrainingError::Rejected(format!("stream {name} already exists")));
        }
        *state.created.entry(name.to_string()).or_default() += 1;
        debug!(stream = %name, retention_hours, "Simulated stream created");
        Ok(StreamRef { name: name.to_string(), arn: format!("simulated:stream/{name}") })
    }

    async fn delete_stream(&self, stream: &StreamRef) -> TrainingResult<()> {
        let mut state = self.state.lock().await;
        if state.delete_failures_left > 0 {
            state.delete_failures_left -= 1;
            return Err(TrainingError::Transient("delete-stream throttled".to_string()));
        }
        if !state.live.remove(&stream.name) {
            return Err(TrainingError::NotFound(format!("stream {}", stream.name)));
        }
        *state.deleted.entry(stream.name.clone()).or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::BackendResources;
    use std::collections::BTreeMap;

    fn spec(name: &str) -> BackendJobSpec {
        BackendJobSpec {
            job_name: name.to_string(),
            role: "role".to_string(),
            training_image: "image".to_string(),
            resources: BackendResources {
                instance_type: "ml.c5.4xlarge".to_string(),
                instance_count: 1,
                volume_size_gb: 20,
            },
            output_location: "s3://bucket/out".to_string(),
            max_runtime_seconds: 600,
            hyperparameters: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_job_completes_after_polls() {
        let backend = SimulatedBackend::new().with_polls_to_complete(2);
        let job = backend.start_job(&spec("a")).await.unwrap();

        let first = backend.describe_job(&job).await.unwrap();
        assert_eq!(first.status, BackendJobStatus::InProgress);
        let second = backend.describe_job(&job).await.unwrap();
        assert_eq!(second.status, BackendJobStatus::Completed);
        assert_eq!(second.training_time_seconds, Some(120));
        assert!(second.artifact_location.is_some());
    }

    #[tokio::test]
    async fn test_stop_moves_to_stopped() {
        let backend = SimulatedBackend::new().with_polls_to_complete(10);
        let job = backend.start_job(&spec("a")).await.unwrap();
        backend.stop_job(&job).await.unwrap();
        assert_eq!(backend.status_of("a").await, Some(BackendJobStatus::Stopping));

        let description = backend.describe_job(&job).await.unwrap();
        assert_eq!(description.status, BackendJobStatus::Stopped);
        assert_eq!(backend.stop_calls("a").await, 1);
    }

    #[tokio::test]
    async fn test_hard_limit_rejects_starts() {
        let backend = SimulatedBackend::new().with_ceiling(1);
        backend.start_job(&spec("a")).await.unwrap();
        let err = backend.start_job(&spec("b")).await.unwrap_err();
        assert!(matches!(err, TrainingError::Rejected(_)));
        assert_eq!(backend.in_flight_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_describe_failures() {
        let backend = SimulatedBackend::new();
        let job = backend.start_job(&spec("a")).await.unwrap();
        backend.fail_next_describes(1).await;
        assert!(backend.describe_job(&job).await.unwrap_err().is_transient());
        assert!(backend.describe_job(&job).await.is_ok());
    }

    #[tokio::test]
    async fn test_simulation_failure_in_heartbeat() {
        let backend = SimulatedBackend::new()
            .with_polls_to_complete(10)
            .with_simulation_failure(2, "simulation crashed");
        let job = backend.start_job(&spec("a")).await.unwrap();

        let first = backend.describe_job(&job).await.unwrap();
        assert_eq!(first.simulation.unwrap().status, SimulationStatus::Running);
        let second = backend.describe_job(&job).await.unwrap();
        assert_eq!(second.status, BackendJobStatus::InProgress);
        assert_eq!(second.simulation.unwrap().failure(), Some("simulation crashed"));
    }

    #[tokio::test]
    async fn test_stream_delete_is_tracked() {
        let streams = SimulatedStreams::new();
        let stream = streams.create_stream("job-1", 24).await.unwrap();
        streams.delete_stream(&stream).await.unwrap();

        let again = streams.delete_stream(&stream).await.unwrap_err();
        assert!(again.is_not_found());
        assert_eq!(streams.created("job-1").await, 1);
        assert_eq!(streams.deleted("job-1").await, 1);
        assert!(streams.live_streams().await.is_empty());
    }
}
