use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

const TIME_TRIAL: &str = r#"{"jobId":"cli-job-1","modelId":"model-1","profileId":"profile-1","raceType":"TIME_TRIAL","trackConfig":{"trackId":"reinvent_base","trackDirection":"CLOCKWISE"},"terminationConditions":{"maxTimeInMinutes":20,"maxLaps":3},"requestedAt":"2026-03-01T12:00:00Z"}"#;

const OBJECT_AVOIDANCE: &str = r#"{"jobId":"cli-job-2","modelId":"model-2","profileId":"profile-1","raceType":"OBJECT_AVOIDANCE","trackConfig":{"trackId":"reinvent_base","trackDirection":"COUNTER_CLOCKWISE"},"terminationConditions":{"maxTimeInMinutes":30},"objectAvoidanceConfig":{"numberOfObjects":2,"objectPositions":[{"laneNumber":1,"trackPercentage":0.3},{"laneNumber":-1,"trackPercentage":0.1}]},"requestedAt":"2026-03-01T12:05:00Z"}"#;

fn file_with(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn pitwall() -> Command {
    let mut cmd = Command::cargo_bin("pitwall").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_version() {
    pitwall().arg("--version").assert().success().stdout(predicate::str::contains("pitwall 0.1.0"));
}

#[test]
fn test_validate_accepts_request() {
    let file = file_with(TIME_TRIAL);
    pitwall()
        .arg("validate")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Job request cli-job-1 is valid"));
}

#[test]
fn test_validate_json_output() {
    let file = file_with(OBJECT_AVOIDANCE);
    pitwall()
        .args(["validate", "--json"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\": true"))
        .stdout(predicate::str::contains("\"raceType\": \"OBJECT_AVOIDANCE\""))
        .stdout(predicate::str::contains("\"maxRuntimeSeconds\": 1800"));
}

#[test]
fn test_validate_rejects_short_runtime() {
    let file = file_with(&TIME_TRIAL.replace("\"maxTimeInMinutes\":20", "\"maxTimeInMinutes\":5"));
    pitwall()
        .arg("validate")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("maxTimeInMinutes"));
}

#[test]
fn test_validate_missing_file() {
    pitwall()
        .args(["validate", "/nonexistent/request.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read job request"));
}

#[test]
fn test_spec_uses_configured_backend() {
    let request = file_with(OBJECT_AVOIDANCE);
    let config = file_with("[backend]\ntraining_image = \"registry.local/trainer:7\"\n");
    pitwall()
        .arg("--config")
        .arg(config.path())
        .args(["spec", "--stream", "live-feed"])
        .arg(request.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("registry.local/trainer:7"))
        .stdout(predicate::str::contains("\"max_runtime_seconds\": 1800"))
        .stdout(predicate::str::contains("live-feed"))
        .stdout(predicate::str::contains("0.1, -1"));
}

#[test]
fn test_spec_env_override() {
    let request = file_with(TIME_TRIAL);
    pitwall()
        .env("PITWALL_TRAINING_IMAGE", "env/trainer:9")
        .arg("spec")
        .arg(request.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("env/trainer:9"));
}

#[test]
fn test_invalid_config_is_reported() {
    let request = file_with(TIME_TRIAL);
    let config = file_with("[backend]\nrole = \"\"\n");
    pitwall()
        .arg("--config")
        .arg(config.path())
        .arg("spec")
        .arg(request.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_simulate_runs_jobs_end_to_end() {
    let dir = TempDir::new().unwrap();
    let requests = dir.path().join("requests.jsonl");
    std::fs::write(&requests, format!("{TIME_TRIAL}\n{OBJECT_AVOIDANCE}\nnot json\n")).unwrap();
    let config = dir.path().join("pitwall.toml");
    std::fs::write(&config, "[dispatcher]\nadmission_delay_ms = 0\n\n[monitor]\nretry_backoff_ms = 1\n").unwrap();

    pitwall()
        .arg("--config")
        .arg(&config)
        .args(["simulate", "--polls-to-complete", "2", "--poll-interval-ms", "5", "--json"])
        .arg(&requests)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"completed\": 2"))
        .stdout(predicate::str::contains("\"status\": \"COMPLETED\""))
        .stdout(predicate::str::contains("\"messageId\": 3"));
}

#[test]
fn test_simulate_reports_backend_failures() {
    let requests = file_with(TIME_TRIAL);
    pitwall()
        .env("PITWALL_ADMISSION_DELAY_MS", "0")
        .args(["simulate", "--poll-interval-ms", "5", "--fail-with", "reward function raised"])
        .arg(requests.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("reward function raised"));
}
