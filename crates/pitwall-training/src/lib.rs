//! Pitwall Training
//!
//! Domain types and external-service clients for training jobs:
//! - Parsing and validating queued job requests (`JobRequest`)
//! - Translating a request into a backend start-job spec (`BackendJobSpec`)
//! - Client traits for the training backend, stream service and quota service
//! - Simulated in-memory implementations of those clients

pub mod backend;
pub mod error;
pub mod job;
pub mod layout;
pub mod quota;
pub mod simulated;
pub mod spec;
pub mod stream;

pub use backend::{
    BackendJobRef, BackendJobStatus, JobDescription, SimulationHeartbeat, SimulationStatus, TrainingBackend,
};
pub use error::{TrainingError, TrainingResult};
pub use job::{
    JobId, JobRequest, JobRequestMessage, ObjectAvoidanceConfig, ObjectPosition, Race, RaceType,
    TerminationConditions, TrackConfig, TrackDirection,
};
pub use layout::{ArtifactLayout, ArtifactUri};
pub use quota::{FixedQuota, QuotaService, QuotaSnapshot};
pub use simulated::{SimulatedBackend, SimulatedStreams};
pub use spec::{BackendJobSpec, BackendResources, BackendSettings};
pub use stream::{StreamRef, StreamService};
