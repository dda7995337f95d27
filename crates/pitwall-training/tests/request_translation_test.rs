//! Integration tests for request parsing and start-job translation

use pitwall_training::{
    ArtifactLayout, BackendJobSpec, BackendSettings, Race, SimulatedBackend, SimulatedStreams,
    StreamService, TrainingBackend, TrainingError,
};
use pitwall_training::JobRequest;
use serde_json::json;

fn object_avoidance_body() -> String {
    json!({
        "jobId": "oa-job",
        "modelId": "model-9",
        "profileId": "profile-3",
        "raceType": "OBJECT_AVOIDANCE",
        "trackConfig": { "trackId": "jyllandsringen", "trackDirection": "CLOCKWISE" },
        "terminationConditions": { "maxTimeInMinutes": 120 },
        "objectAvoidanceConfig": { "numberOfObjects": 3 },
        "requestedAt": "2026-03-01T12:00:00Z"
    })
    .to_string()
}

#[test]
fn test_wire_message_to_spec() {
    let request = JobRequest::from_json(&object_avoidance_body()).unwrap();
    assert!(matches!(request.race, Race::ObjectAvoidance(_)));

    let layout = ArtifactLayout::new("s3://pitwall-models");
    let stream = pitwall_training::StreamRef {
        name: "oa-job".to_string(),
        arn: "stream/oa-job".to_string(),
    };
    let spec =
        BackendJobSpec::from_request(&request, &BackendSettings::default(), &layout, &stream).unwrap();

    assert_eq!(spec.max_runtime_seconds, 7200);
    assert_eq!(spec.hyperparameters["randomize_obstacle_locations"], "true");
    assert_eq!(spec.hyperparameters["number_of_obstacles"], "3");
    assert!(!spec.hyperparameters.contains_key("object_positions"));
    assert!(!spec.hyperparameters.contains_key("number_of_trials"));
    assert_eq!(
        spec.hyperparameters["model_metadata_s3_key"],
        "s3://pitwall-models/profile-3/model-9/model_metadata.json"
    );
}

#[test]
fn test_malformed_messages_are_invalid_requests() {
    for body in ["", "{}", "[1,2]", r#"{"jobId":"x"}"#] {
        let err = JobRequest::from_json(body).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidRequest(_)), "body {body:?} gave {err}");
    }
}

#[tokio::test]
async fn test_simulated_services_run_a_job() {
    let request = JobRequest::from_json(&object_avoidance_body()).unwrap();
    let backend = SimulatedBackend::new().with_polls_to_complete(1);
    let streams = SimulatedStreams::new();

    let stream = streams.create_stream(request.job_id.as_str(), 24).await.unwrap();
    let spec = BackendJobSpec::from_request(
        &request,
        &BackendSettings::default(),
        &ArtifactLayout::new("s3://pitwall-models"),
        &stream,
    )
    .unwrap();
    let job = backend.start_job(&spec).await.unwrap();
    let description = backend.describe_job(&job).await.unwrap();

    assert!(description.status.is_terminal());
    streams.delete_stream(&stream).await.unwrap();
    assert_eq!(streams.deleted("oa-job").await, 1);
}
