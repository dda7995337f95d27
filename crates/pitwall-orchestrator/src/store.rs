//! Job Store: the persisted lifecycle record of every job.
//!
//! All writes are keyed by job id and conditional on the status the writer
//! expects, so a monitor update cannot clobber a concurrent cancellation and
//! vice versa. The store doubles as the checkpoint that `recover` resumes from.

use crate::error::{StoreError, StoreResult};
use crate::lifecycle::JobStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pitwall_training::{BackendJobRef, BackendJobStatus, JobId, JobRequest, StreamRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Persisted lifecycle record for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub model_id: String,
    pub profile_id: String,
    pub status: JobStatus,
    /// Snapshot of the request, used to resume the job after a restart.
    pub request: JobRequest,
    pub backend_job_ref: Option<BackendJobRef>,
    pub stream_ref: Option<StreamRef>,
    pub backend_status: Option<BackendJobStatus>,
    /// Set only on `Failed`.
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub metrics: BTreeMap<String, f64>,
    pub artifact_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
}

impl JobRecord {
    /// A fresh `Queued` record for an admitted request.
    #[must_use]
    pub fn queued(request: JobRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: request.job_id.clone(),
            model_id: request.model_id.clone(),
            profile_id: request.profile_id.clone(),
            status: JobStatus::Queued,
            request,
            backend_job_ref: None,
            stream_ref: None,
            backend_status: None,
            error_message: None,
            cancel_requested: false,
            metrics: BTreeMap::new(),
            artifact_location: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
            last_polled_at: None,
            duration_seconds: None,
        }
    }
}

/// A partial update to a job record. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub backend_job_ref: Option<BackendJobRef>,
    pub stream_ref: Option<StreamRef>,
    pub backend_status: Option<BackendJobStatus>,
    pub error_message: Option<String>,
    pub cancel_requested: Option<bool>,
    pub metrics: Option<BTreeMap<String, f64>>,
    pub artifact_location: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
}

impl JobPatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn backend_job_ref(mut self, job: BackendJobRef) -> Self {
        self.backend_job_ref = Some(job);
        self
    }

    #[must_use]
    pub fn stream_ref(mut self, stream: StreamRef) -> Self {
        self.stream_ref = Some(stream);
        self
    }

    #[must_use]
    pub fn backend_status(mut self, status: BackendJobStatus) -> Self {
        self.backend_status = Some(status);
        self
    }

    #[must_use]
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn cancel_requested(mut self, requested: bool) -> Self {
        self.cancel_requested = Some(requested);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn artifact_location(mut self, location: impl Into<String>) -> Self {
        self.artifact_location = Some(location.into());
        self
    }

    #[must_use]
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    #[must_use]
    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    #[must_use]
    pub fn last_polled_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_polled_at = Some(at);
        self
    }

    #[must_use]
    pub fn duration_seconds(mut self, seconds: u64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// Applies the patch, enforcing the status state machine.
    pub fn apply(self, record: &mut JobRecord) -> StoreResult<()> {
        if let Some(to) = self.status {
            if !record.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition { from: record.status, to });
            }
            record.status = to;
        }
        if let Some(job) = self.backend_job_ref {
            record.backend_job_ref = Some(job);
        }
        if let Some(stream) = self.stream_ref {
            record.stream_ref = Some(stream);
        }
        if let Some(status) = self.backend_status {
            record.backend_status = Some(status);
        }
        if let Some(message) = self.error_message {
            record.error_message = Some(message);
        }
        if let Some(requested) = self.cancel_requested {
            record.cancel_requested = requested;
        }
        if let Some(metrics) = self.metrics {
            record.metrics = metrics;
        }
        if let Some(location) = self.artifact_location {
            record.artifact_location = Some(location);
        }
        if let Some(at) = self.started_at {
            record.started_at = Some(at);
        }
        if let Some(at) = self.ended_at {
            record.ended_at = Some(at);
        }
        if let Some(at) = self.last_polled_at {
            record.last_polled_at = Some(at);
        }
        if let Some(seconds) = self.duration_seconds {
            record.duration_seconds = Some(seconds);
        }
        record.updated_at = Utc::now();
        Ok(())
    }
}

/// Keyed persistence for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>>;

    /// Creates a record. Fails with `AlreadyExists` if one is present.
    async fn create(&self, record: JobRecord) -> StoreResult<()>;

    /// Conditional update: succeeds only if the record is currently `expected`.
    async fn update(&self, job_id: &JobId, expected: JobStatus, patch: JobPatch) -> StoreResult<JobRecord>;

    /// All records in a non-terminal status.
    async fn list_active(&self) -> StoreResult<Vec<JobRecord>>;
}

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<JobId, JobRecord>,
    history: HashMap<JobId, Vec<JobStatus>>,
}

/// In-memory job store. Records every status a job passes through.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses the job has been written with, in order, without repeats.
    pub async fn status_history(&self, job_id: &JobId) -> Vec<JobStatus> {
        self.inner.read().await.history.get(job_id).cloned().unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.inner.read().await.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        records
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.inner.read().await.records.get(job_id).cloned())
    }

    async fn create(&self, record: JobRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.job_id) {
            return Err(StoreError::AlreadyExists(record.job_id));
        }
        debug!(job_id = %record.job_id, status = %record.status, "Job record created");
        inner.history.insert(record.job_id.clone(), vec![record.status]);
        inner.records.insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn update(&self, job_id: &JobId, expected: JobStatus, patch: JobPatch) -> StoreResult<JobRecord> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;

        if record.status != expected {
            warn!(
                job_id = %job_id,
                expected = %expected,
                actual = %record.status,
                "Conditional write rejected"
            );
            return Err(StoreError::Conflict {
                job_id: job_id.clone(),
                expected,
                actual: record.status,
            });
        }

        let mut updated = record.clone();
        patch.apply(&mut updated)?;
        let from = record.status;
        *record = updated.clone();

        if from != updated.status {
            debug!(job_id = %job_id, from = %from, to = %updated.status, "Job status transition");
            inner.history.entry(job_id.clone()).or_default().push(updated.status);
        }
        Ok(updated)
    }

    async fn list_active(&self) -> StoreResult<Vec<JobRecord>> {
        let inner = self.inner.read().await;
        let mut active: Vec<JobRecord> = inner
            .records
            .values()
            .filter(|record| !record.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitwall_training::{Race, TerminationConditions, TrackConfig, TrackDirection};

    fn record(id: &str) -> JobRecord {
        JobRecord::queued(JobRequest {
            job_id: JobId::parse(id).unwrap(),
            model_id: "model-1".to_string(),
            profile_id: "profile-1".to_string(),
            race: Race::TimeTrial,
            track: TrackConfig {
                track_id: "reinvent_base".to_string(),
                track_direction: TrackDirection::Clockwise,
            },
            termination: TerminationConditions { max_time_in_minutes: 10, max_laps: None },
            requested_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let store = InMemoryJobStore::new();
        store.create(record("job-1")).await.unwrap();
        let err = store.create(record("job-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = InMemoryJobStore::new();
        let id = JobId::parse("job-1").unwrap();
        store.create(record("job-1")).await.unwrap();

        let updated = store
            .update(&id, JobStatus::Queued, JobPatch::new().status(JobStatus::Initializing))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Initializing);

        let err = store
            .update(&id, JobStatus::Queued, JobPatch::new().status(JobStatus::Initializing))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict { expected: JobStatus::Queued, actual: JobStatus::Initializing, .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let store = InMemoryJobStore::new();
        let id = JobId::parse("job-1").unwrap();
        store.create(record("job-1")).await.unwrap();

        let err = store
            .update(&id, JobStatus::Queued, JobPatch::new().status(JobStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_history_and_active_listing() {
        let store = InMemoryJobStore::new();
        let id = JobId::parse("job-1").unwrap();
        store.create(record("job-1")).await.unwrap();
        store.create(record("job-2")).await.unwrap();

        store
            .update(&id, JobStatus::Queued, JobPatch::new().status(JobStatus::Canceled))
            .await
            .unwrap();

        assert_eq!(
            store.status_history(&id).await,
            vec![JobStatus::Queued, JobStatus::Canceled]
        );
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_id.as_str(), "job-2");
    }

    #[tokio::test]
    async fn test_missing_record() {
        let store = InMemoryJobStore::new();
        let id = JobId::parse("nope").unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        let err = store.update(&id, JobStatus::Queued, JobPatch::new()).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
    }
}
