use crate::error::{TrainingError, TrainingResult};
use crate::job::JobRequest;

/// Object-store layout for a model's training artifacts.
///
/// Everything for a model lives under `<root>/<profile_id>/<model_id>/...`;
/// per-job outputs go under `.../training/<job_id>/`.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: String,
}

impl ArtifactLayout {
    #[must_use]
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self { root: root.trim_end_matches('/').to_string() }
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    #[must_use]
    pub fn model_dir(&self, profile_id: &str, model_id: &str) -> String {
        format!("{}/{profile_id}/{model_id}", self.root)
    }

    #[must_use]
    pub fn reward_function(&self, request: &JobRequest) -> String {
        format!("{}/reward_function.py", self.model_dir(&request.profile_id, &request.model_id))
    }

    #[must_use]
    pub fn model_metadata(&self, request: &JobRequest) -> String {
        format!("{}/model_metadata.json", self.model_dir(&request.profile_id, &request.model_id))
    }

    /// Where the backend writes checkpoints and the final model.
    #[must_use]
    pub fn training_artifacts(&self, request: &JobRequest) -> String {
        format!("{}/training-artifacts", self.model_dir(&request.profile_id, &request.model_id))
    }

    #[must_use]
    pub fn job_dir(&self, request: &JobRequest) -> String {
        format!(
            "{}/training/{}",
            self.model_dir(&request.profile_id, &request.model_id),
            request.job_id
        )
    }

    #[must_use]
    pub fn metrics(&self, request: &JobRequest) -> String {
        format!("{}/metrics.json", self.job_dir(request))
    }

    #[must_use]
    pub fn sim_trace(&self, request: &JobRequest) -> String {
        format!("{}/sim-trace", self.job_dir(request))
    }
}

/// A `scheme://bucket/key` location split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUri {
    pub bucket: String,
    pub key: String,
}

impl ArtifactUri {
    pub fn parse(uri: &str) -> TrainingResult<Self> {
        let (_, rest) = uri
            .split_once("://")
            .ok_or_else(|| TrainingError::invalid(format!("artifact location '{uri}' has no scheme")))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(TrainingError::invalid(format!("artifact location '{uri}' has no bucket")));
        }
        Ok(Self { bucket: bucket.to_string(), key: key.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, Race, TerminationConditions, TrackConfig, TrackDirection};

    fn request() -> JobRequest {
        JobRequest {
            job_id: JobId::parse("job-1").unwrap(),
            model_id: "model-1".to_string(),
            profile_id: "profile-1".to_string(),
            race: Race::TimeTrial,
            track: TrackConfig {
                track_id: "reinvent_base".to_string(),
                track_direction: TrackDirection::Clockwise,
            },
            termination: TerminationConditions { max_time_in_minutes: 30, max_laps: None },
            requested_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new("s3://artifacts/models/");
        let request = request();

        assert_eq!(layout.root(), "s3://artifacts/models");
        assert_eq!(
            layout.reward_function(&request),
            "s3://artifacts/models/profile-1/model-1/reward_function.py"
        );
        assert_eq!(
            layout.metrics(&request),
            "s3://artifacts/models/profile-1/model-1/training/job-1/metrics.json"
        );
    }

    #[test]
    fn test_artifact_uri_parse() {
        let uri = ArtifactUri::parse("s3://artifacts/models/p/m").unwrap();
        assert_eq!(uri.bucket, "artifacts");
        assert_eq!(uri.key, "models/p/m");

        let bare = ArtifactUri::parse("s3://artifacts").unwrap();
        assert_eq!(bare.key, "");

        assert!(ArtifactUri::parse("artifacts/models").is_err());
        assert!(ArtifactUri::parse("s3:///models").is_err());
    }
}
