use crate::error::TrainingResult;
use crate::job::{JobRequest, Race, TrackDirection};
use crate::layout::{ArtifactLayout, ArtifactUri};
use crate::stream::StreamRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SIMULATION_LAUNCH_FILE: &str = "distributed_training.launch.py";
const OBSTACLE_TYPE: &str = "box_obstacle";

/// Deployment-wide settings for start-job calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub role: String,
    pub training_image: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub volume_size_gb: u32,
    pub region: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            role: "pitwall-training-role".to_string(),
            training_image: "pitwall/trainer:latest".to_string(),
            instance_type: "ml.c5.4xlarge".to_string(),
            instance_count: 1,
            volume_size_gb: 20,
            region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResources {
    pub instance_type: String,
    pub instance_count: u32,
    pub volume_size_gb: u32,
}

/// A complete start-job request for the training backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendJobSpec {
    pub job_name: String,
    pub role: String,
    pub training_image: String,
    pub resources: BackendResources,
    pub output_location: String,
    pub max_runtime_seconds: u64,
    pub hyperparameters: BTreeMap<String, String>,
}

impl BackendJobSpec {
    /// Translates a job request into the backend's start-job shape.
    ///
    /// The stream reference is passed through as `kinesis_stream_name` so the
    /// simulation publishes telemetry to the stream created for this job.
    pub fn from_request(
        request: &JobRequest,
        settings: &BackendSettings,
        layout: &ArtifactLayout,
        stream: &StreamRef,
    ) -> TrainingResult<Self> {
        let output_location = layout.training_artifacts(request);
        let output = ArtifactUri::parse(&output_location)?;

        let mut hp = BTreeMap::new();
        hp.insert("aws_region".to_string(), settings.region.clone());
        hp.insert("world_name".to_string(), request.track.track_id.clone());
        hp.insert(
            "track_direction_clockwise".to_string(),
            (request.track.track_direction == TrackDirection::Clockwise).to_string(),
        );
        hp.insert("race_type".to_string(), request.race_type().to_string());
        hp.insert("kinesis_stream_name".to_string(), stream.name.clone());
        hp.insert("reward_function_s3_source".to_string(), layout.reward_function(request));
        hp.insert("model_metadata_s3_key".to_string(), layout.model_metadata(request));
        hp.insert("metrics_s3_location".to_string(), layout.metrics(request));
        hp.insert("simtrace_s3_location".to_string(), layout.sim_trace(request));
        hp.insert("s3_bucket".to_string(), output.bucket);
        hp.insert("s3_prefix".to_string(), output.key);
        hp.insert("simulation_launch_file".to_string(), SIMULATION_LAUNCH_FILE.to_string());

        if let Some(laps) = request.termination.max_laps {
            hp.insert("number_of_trials".to_string(), laps.to_string());
        }

        if let Race::ObjectAvoidance(config) = &request.race {
            hp.insert("obstacle_type".to_string(), OBSTACLE_TYPE.to_string());
            hp.insert("number_of_obstacles".to_string(), config.number_of_objects.to_string());
            hp.insert(
                "randomize_obstacle_locations".to_string(),
                config.randomize_locations().to_string(),
            );
            if !config.randomize_locations() {
                let positions: Vec<String> = config
                    .object_positions
                    .iter()
                    .map(|p| format!("{}, {}", p.track_percentage, p.lane_number))
                    .collect();
                hp.insert("object_positions".to_string(), serde_json::to_string(&positions)?);
            }
        }

        Ok(Self {
            job_name: request.job_id.to_string(),
            role: settings.role.clone(),
            training_image: settings.training_image.clone(),
            resources: BackendResources {
                instance_type: settings.instance_type.clone(),
                instance_count: settings.instance_count,
                volume_size_gb: settings.volume_size_gb,
            },
            output_location,
            max_runtime_seconds: request.termination.max_runtime().as_secs(),
            hyperparameters: hp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        JobId, ObjectAvoidanceConfig, ObjectPosition, TerminationConditions, TrackConfig,
    };

    fn request(race: Race) -> JobRequest {
        JobRequest {
            job_id: JobId::parse("job-7").unwrap(),
            model_id: "model-1".to_string(),
            profile_id: "profile-1".to_string(),
            race,
            track: TrackConfig {
                track_id: "reinvent_base".to_string(),
                track_direction: TrackDirection::CounterClockwise,
            },
            termination: TerminationConditions { max_time_in_minutes: 45, max_laps: Some(3) },
            requested_at: chrono::Utc::now(),
        }
    }

    fn stream() -> StreamRef {
        StreamRef { name: "job-7".to_string(), arn: "stream/job-7".to_string() }
    }

    #[test]
    fn test_time_trial_spec() {
        let layout = ArtifactLayout::new("s3://bucket/models");
        let spec = BackendJobSpec::from_request(
            &request(Race::TimeTrial),
            &BackendSettings::default(),
            &layout,
            &stream(),
        )
        .unwrap();

        assert_eq!(spec.job_name, "job-7");
        assert_eq!(spec.max_runtime_seconds, 45 * 60);
        assert_eq!(spec.hyperparameters["world_name"], "reinvent_base");
        assert_eq!(spec.hyperparameters["track_direction_clockwise"], "false");
        assert_eq!(spec.hyperparameters["kinesis_stream_name"], "job-7");
        assert_eq!(spec.hyperparameters["s3_bucket"], "bucket");
        assert_eq!(spec.hyperparameters["s3_prefix"], "models/profile-1/model-1/training-artifacts");
        assert_eq!(spec.hyperparameters["number_of_trials"], "3");
        assert!(!spec.hyperparameters.contains_key("number_of_obstacles"));
    }

    #[test]
    fn test_object_avoidance_spec() {
        let layout = ArtifactLayout::new("s3://bucket/models");
        let config = ObjectAvoidanceConfig {
            number_of_objects: 2,
            object_positions: vec![
                ObjectPosition { lane_number: -1, track_percentage: 0.2 },
                ObjectPosition { lane_number: 1, track_percentage: 0.5 },
            ],
        };
        let spec = BackendJobSpec::from_request(
            &request(Race::ObjectAvoidance(config)),
            &BackendSettings::default(),
            &layout,
            &stream(),
        )
        .unwrap();

        assert_eq!(spec.hyperparameters["race_type"], "OBJECT_AVOIDANCE");
        assert_eq!(spec.hyperparameters["number_of_obstacles"], "2");
        assert_eq!(spec.hyperparameters["randomize_obstacle_locations"], "false");
        assert_eq!(spec.hyperparameters["object_positions"], r#"["0.2, -1","0.5, 1"]"#);
    }

    #[test]
    fn test_bad_artifact_root_is_rejected() {
        let layout = ArtifactLayout::new("no-scheme");
        let result = BackendJobSpec::from_request(
            &request(Race::TimeTrial),
            &BackendSettings::default(),
            &layout,
            &stream(),
        );
        assert!(result.is_err());
    }
}
