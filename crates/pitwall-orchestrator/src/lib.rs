//! Training job orchestrator for Pitwall.
//!
//! Admits queued job requests against the training quota and drives each
//! admitted job through a state machine: Initializing, Monitoring and
//! Finalizing. The job store doubles as the checkpoint executions resume from.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod progress;
pub mod queue;
pub mod stage;
pub mod stages;
pub mod store;
pub mod usage;

pub use config::{
    BackendConfig, DispatcherConfig, FinalizerConfig, MonitorConfig, OrchestratorConfig, StreamConfig,
};
pub use dispatcher::{DispatchOutcome, JobDispatcher};
pub use engine::{CancellationOutcome, Collaborators, ExecutionStarter, Orchestrator};
pub use error::{MessageDisposition, OrchestrationError, Result, StoreError, StoreResult};
pub use lifecycle::{JobStatus, MonitorPhase, TerminalStatus, Trigger, WorkflowState};
pub use progress::{WorkflowEvent, WorkflowMetrics, WorkflowProgress};
pub use queue::{DeadLetter, InMemoryJobQueue, JobQueue, QueueMessage, QueueWorker, QueueWorkerConfig};
pub use stage::{ExecutionContext, ExecutionId, Stage, instrumented};
pub use stages::{Finalizer, Initializer, Monitor, PollOutcome};
pub use store::{InMemoryJobStore, JobPatch, JobRecord, JobStore};
pub use usage::{ComputeUsage, InMemoryComputeUsage, UsageSnapshot};
