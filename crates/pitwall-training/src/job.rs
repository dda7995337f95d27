use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest training run the backend accepts.
pub const MIN_TIME_IN_MINUTES: u32 = 10;
/// Longest training run the backend accepts (24 hours).
pub const MAX_TIME_IN_MINUTES: u32 = 1440;
/// Job ids double as backend job names, so they share the backend's length limit.
pub const MAX_JOB_ID_LEN: usize = 63;

const MAX_OBJECTS: u32 = 6;
const FIRST_OBJECT_BUFFER: f64 = 0.07;
const LAST_OBJECT_BUFFER: f64 = 0.9;
const MIN_OBJECT_DISTANCE: f64 = 0.13;

/// Identifier for a training job.
///
/// The same value names the backend job, the telemetry stream and the
/// orchestrator execution, so it is restricted to `[A-Za-z0-9-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn parse(value: impl Into<String>) -> TrainingResult<Self> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_JOB_ID_LEN {
            return Err(TrainingError::invalid(format!(
                "jobId must be 1-{MAX_JOB_ID_LEN} characters"
            )));
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(TrainingError::invalid(format!(
                "jobId '{value}' may only contain ASCII letters, digits and '-'"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaceType {
    TimeTrial,
    ObjectAvoidance,
}

impl RaceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimeTrial => "TIME_TRIAL",
            Self::ObjectAvoidance => "OBJECT_AVOIDANCE",
        }
    }
}

impl std::fmt::Display for RaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackDirection {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackConfig {
    pub track_id: String,
    pub track_direction: TrackDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationConditions {
    pub max_time_in_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_laps: Option<u32>,
}

impl TerminationConditions {
    #[must_use]
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_time_in_minutes) * 60)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if !(MIN_TIME_IN_MINUTES..=MAX_TIME_IN_MINUTES).contains(&self.max_time_in_minutes) {
            return Err(TrainingError::invalid(format!(
                "maxTimeInMinutes must be between {MIN_TIME_IN_MINUTES} and {MAX_TIME_IN_MINUTES}"
            )));
        }
        if self.max_laps == Some(0) {
            return Err(TrainingError::invalid("maxLaps must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPosition {
    pub lane_number: i32,
    pub track_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectAvoidanceConfig {
    pub number_of_objects: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_positions: Vec<ObjectPosition>,
}

impl ObjectAvoidanceConfig {
    /// Obstacles are placed randomly unless explicit positions were given.
    #[must_use]
    pub fn randomize_locations(&self) -> bool {
        self.object_positions.is_empty()
    }

    /// Validates obstacle count and placement, sorting positions along the track.
    pub fn validate(&mut self) -> TrainingResult<()> {
        if self.number_of_objects == 0 || self.number_of_objects > MAX_OBJECTS {
            return Err(TrainingError::invalid(format!(
                "numberOfObjects must be between 1 and {MAX_OBJECTS}"
            )));
        }
        if self.object_positions.is_empty() {
            return Ok(());
        }
        if self.object_positions.len() != self.number_of_objects as usize {
            return Err(TrainingError::invalid(
                "objectPositions must contain exactly numberOfObjects entries",
            ));
        }
        if self.object_positions.iter().any(|p| !p.track_percentage.is_finite()) {
            return Err(TrainingError::invalid("trackPercentage must be a finite number"));
        }
        if self.object_positions.iter().any(|p| p.lane_number != -1 && p.lane_number != 1) {
            return Err(TrainingError::invalid("laneNumber must be -1 or 1"));
        }

        self.object_positions.sort_by(|a, b| a.track_percentage.total_cmp(&b.track_percentage));

        let first = self.object_positions[0].track_percentage;
        let last = self.object_positions[self.object_positions.len() - 1].track_percentage;
        if first < FIRST_OBJECT_BUFFER {
            return Err(TrainingError::invalid("first obstacle position is too close to the start"));
        }
        if last > LAST_OBJECT_BUFFER {
            return Err(TrainingError::invalid("last obstacle position is too close to the finish"));
        }
        let too_close = self
            .object_positions
            .windows(2)
            .any(|w| w[1].track_percentage - w[0].track_percentage < MIN_OBJECT_DISTANCE);
        if too_close {
            return Err(TrainingError::invalid("obstacles must be at least 0.13 of the track apart"));
        }
        Ok(())
    }
}

/// Race scenario. Object avoidance carries its obstacle layout; time trials carry nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Race {
    TimeTrial,
    ObjectAvoidance(ObjectAvoidanceConfig),
}

impl Race {
    #[must_use]
    pub const fn race_type(&self) -> RaceType {
        match self {
            Self::TimeTrial => RaceType::TimeTrial,
            Self::ObjectAvoidance(_) => RaceType::ObjectAvoidance,
        }
    }
}

/// JSON shape of a queued job request, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequestMessage {
    pub job_id: String,
    pub model_id: String,
    pub profile_id: String,
    pub race_type: RaceType,
    pub track_config: TrackConfig,
    pub termination_conditions: TerminationConditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_avoidance_config: Option<ObjectAvoidanceConfig>,
    pub requested_at: DateTime<Utc>,
}

/// A validated, immutable request for one training job.
///
/// Deserializing goes through [`JobRequestMessage`] and rejects anything that
/// does not validate, so a `JobRequest` in hand is always well-formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobRequestMessage", into = "JobRequestMessage")]
pub struct JobRequest {
    pub job_id: JobId,
    pub model_id: String,
    pub profile_id: String,
    pub race: Race,
    pub track: TrackConfig,
    pub termination: TerminationConditions,
    pub requested_at: DateTime<Utc>,
}

impl JobRequest {
    /// Parses a queue message body. Every failure is an `InvalidRequest`.
    pub fn from_json(body: &str) -> TrainingResult<Self> {
        let message: JobRequestMessage =
            serde_json::from_str(body).map_err(|e| TrainingError::InvalidRequest(e.to_string()))?;
        Self::try_from(message)
    }

    pub fn to_json(&self) -> TrainingResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub const fn race_type(&self) -> RaceType {
        self.race.race_type()
    }
}

impl TryFrom<JobRequestMessage> for JobRequest {
    type Error = TrainingError;

    fn try_from(message: JobRequestMessage) -> Result<Self, Self::Error> {
        let job_id = JobId::parse(message.job_id)?;
        if message.model_id.trim().is_empty() {
            return Err(TrainingError::invalid("modelId is required"));
        }
        if message.profile_id.trim().is_empty() {
            return Err(TrainingError::invalid("profileId is required"));
        }
        if message.track_config.track_id.trim().is_empty() {
            return Err(TrainingError::invalid("trackConfig.trackId is required"));
        }
        message.termination_conditions.validate()?;

        let race = match (message.race_type, message.object_avoidance_config) {
            (RaceType::TimeTrial, None) => Race::TimeTrial,
            (RaceType::TimeTrial, Some(_)) => {
                return Err(TrainingError::invalid(
                    "objectAvoidanceConfig is only allowed for OBJECT_AVOIDANCE races",
                ));
            }
            (RaceType::ObjectAvoidance, Some(mut config)) => {
                config.validate()?;
                Race::ObjectAvoidance(config)
            }
            (RaceType::ObjectAvoidance, None) => {
                return Err(TrainingError::invalid(
                    "objectAvoidanceConfig is required for OBJECT_AVOIDANCE races",
                ));
            }
        };

        Ok(Self {
            job_id,
            model_id: message.model_id,
            profile_id: message.profile_id,
            race,
            track: message.track_config,
            termination: message.termination_conditions,
            requested_at: message.requested_at,
        })
    }
}

impl From<JobRequest> for JobRequestMessage {
    fn from(request: JobRequest) -> Self {
        let race_type = request.race.race_type();
        let object_avoidance_config = match request.race {
            Race::TimeTrial => None,
            Race::ObjectAvoidance(config) => Some(config),
        };
        Self {
            job_id: request.job_id.into(),
            model_id: request.model_id,
            profile_id: request.profile_id,
            race_type,
            track_config: request.track,
            termination_conditions: request.termination,
            object_avoidance_config,
            requested_at: request.requested_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn time_trial() -> serde_json::Value {
        json!({
            "jobId": "job-1",
            "modelId": "model-1",
            "profileId": "profile-1",
            "raceType": "TIME_TRIAL",
            "trackConfig": { "trackId": "reinvent_base", "trackDirection": "CLOCKWISE" },
            "terminationConditions": { "maxTimeInMinutes": 60 },
            "requestedAt": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn test_parse_time_trial() {
        let request = JobRequest::from_json(&time_trial().to_string()).unwrap();
        assert_eq!(request.job_id.as_str(), "job-1");
        assert_eq!(request.race, Race::TimeTrial);
        assert_eq!(request.termination.max_runtime(), Duration::from_secs(3600));
    }

    #[test]
    fn test_unknown_race_type_is_rejected() {
        let mut body = time_trial();
        body["raceType"] = json!("HEAD_TO_HEAD");
        let err = JobRequest::from_json(&body.to_string()).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidRequest(_)));
    }

    #[test]
    fn test_time_trial_with_obstacles_is_rejected() {
        let mut body = time_trial();
        body["objectAvoidanceConfig"] = json!({ "numberOfObjects": 2 });
        assert!(JobRequest::from_json(&body.to_string()).is_err());
    }

    #[test]
    fn test_object_avoidance_requires_config() {
        let mut body = time_trial();
        body["raceType"] = json!("OBJECT_AVOIDANCE");
        let err = JobRequest::from_json(&body.to_string()).unwrap_err();
        assert!(err.to_string().contains("objectAvoidanceConfig is required"));
    }

    #[test]
    fn test_object_positions_are_sorted_and_checked() {
        let mut body = time_trial();
        body["raceType"] = json!("OBJECT_AVOIDANCE");
        body["objectAvoidanceConfig"] = json!({
            "numberOfObjects": 2,
            "objectPositions": [
                { "laneNumber": 1, "trackPercentage": 0.6 },
                { "laneNumber": -1, "trackPercentage": 0.2 }
            ]
        });
        let request = JobRequest::from_json(&body.to_string()).unwrap();
        let Race::ObjectAvoidance(config) = &request.race else {
            panic!("expected object avoidance");
        };
        assert!((config.object_positions[0].track_percentage - 0.2).abs() < f64::EPSILON);
        assert!(!config.randomize_locations());
    }

    #[test]
    fn test_object_positions_too_close() {
        let mut config = ObjectAvoidanceConfig {
            number_of_objects: 2,
            object_positions: vec![
                ObjectPosition { lane_number: 1, track_percentage: 0.30 },
                ObjectPosition { lane_number: 1, track_percentage: 0.35 },
            ],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_object_count_limits() {
        let mut config = ObjectAvoidanceConfig { number_of_objects: 7, object_positions: vec![] };
        assert!(config.validate().is_err());
        config.number_of_objects = 3;
        assert!(config.validate().is_ok());
        assert!(config.randomize_locations());
    }

    #[test]
    fn test_termination_bounds() {
        let too_short = TerminationConditions { max_time_in_minutes: 5, max_laps: None };
        assert!(too_short.validate().is_err());
        let zero_laps = TerminationConditions { max_time_in_minutes: 30, max_laps: Some(0) };
        assert!(zero_laps.validate().is_err());
        let ok = TerminationConditions { max_time_in_minutes: 1440, max_laps: Some(3) };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_job_id_rules() {
        assert!(JobId::parse("abc-123").is_ok());
        assert!(JobId::parse("").is_err());
        assert!(JobId::parse("has space").is_err());
        assert!(JobId::parse("x".repeat(64)).is_err());
    }

    #[test]
    fn test_serialized_request_keeps_wire_shape() {
        let request = JobRequest::from_json(&time_trial().to_string()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(value["raceType"], "TIME_TRIAL");
        assert!(value.get("objectAvoidanceConfig").is_none());
    }
}
