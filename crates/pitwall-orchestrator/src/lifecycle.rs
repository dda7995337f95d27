//! Job and workflow state machines.
//!
//! `JobStatus` is the persisted status of a job record. `WorkflowState` is the
//! in-memory state of one execution, driven by `Trigger`s.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Admitted for execution, nothing provisioned yet.
    Queued,
    /// Stream and backend job are being created.
    Initializing,
    /// Backend job is running.
    InProgress,
    /// A stop was requested on the backend job.
    Stopping,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Checks if a record in this status may move to `to`.
    ///
    /// Terminal statuses are absorbing. A non-terminal status may be
    /// rewritten with itself (idempotent upserts from the monitor).
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm is a distinct transition rule
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (a, _) if a.is_terminal() => false,
            (a, b) if a == b => true,
            (Self::Queued, Self::Initializing | Self::Failed | Self::Canceled) => true,
            (Self::Initializing, Self::InProgress | Self::Failed | Self::Canceled) => true,
            (Self::InProgress, Self::Stopping | Self::Completed | Self::Failed | Self::Canceled) => {
                true
            }
            (Self::Stopping, Self::Completed | Self::Failed | Self::Canceled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Initializing => "INITIALIZING",
            Self::InProgress => "IN_PROGRESS",
            Self::Stopping => "STOPPING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// The three ways an execution can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Canceled,
}

impl From<TerminalStatus> for JobStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => Self::Completed,
            TerminalStatus::Failed => Self::Failed,
            TerminalStatus::Canceled => Self::Canceled,
        }
    }
}

impl TryFrom<JobStatus> for TerminalStatus {
    type Error = JobStatus;

    fn try_from(status: JobStatus) -> Result<Self, Self::Error> {
        match status {
            JobStatus::Completed => Ok(Self::Completed),
            JobStatus::Failed => Ok(Self::Failed),
            JobStatus::Canceled => Ok(Self::Canceled),
            other => Err(other),
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        JobStatus::from(*self).fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Poll,
    Wait,
}

/// State of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Queued,
    Initializing,
    Monitoring(MonitorPhase),
    Finalizing,
    Terminal(TerminalStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Started,
    Initialized,
    /// The backend job is still running.
    StillRunning,
    WaitElapsed,
    /// Backend reached a terminal status, the time limit hit, or a cancel was observed.
    MonitorDone,
    /// Any error raised by initialization or monitoring.
    Errored,
    Finalized(TerminalStatus),
}

impl WorkflowState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Applies an event. Returns `None` if the event is not valid in this state.
    #[must_use]
    pub fn on(self, event: Trigger) -> Option<Self> {
        use MonitorPhase::{Poll, Wait};
        use Trigger as E;

        let next = match (self, event) {
            (Self::Queued, E::Started) => Self::Initializing,
            (Self::Initializing, E::Initialized) => Self::Monitoring(Poll),
            (Self::Monitoring(Poll), E::StillRunning) => Self::Monitoring(Wait),
            (Self::Monitoring(Wait), E::WaitElapsed) => Self::Monitoring(Poll),
            (Self::Monitoring(_), E::MonitorDone) => Self::Finalizing,
            (Self::Queued | Self::Initializing | Self::Monitoring(_), E::Errored) => Self::Finalizing,
            (Self::Finalizing, E::Finalized(status)) => Self::Terminal(status),
            _ => return None,
        };
        Some(next)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Monitoring(MonitorPhase::Poll) => "monitoring.poll",
            Self::Monitoring(MonitorPhase::Wait) => "monitoring.wait",
            Self::Finalizing => "finalizing",
            Self::Terminal(_) => "terminal",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Initializing));
        assert!(JobStatus::Initializing.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::InProgress));
    }

    #[test]
    fn test_terminal_is_absorbing() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobStatus::Queued));
            assert!(!terminal.can_transition_to(JobStatus::InProgress));
            assert!(!terminal.can_transition_to(terminal));
        }
    }

    #[test]
    fn test_no_regression() {
        assert!(!JobStatus::InProgress.can_transition_to(JobStatus::Initializing));
        assert!(!JobStatus::Stopping.can_transition_to(JobStatus::InProgress));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::InProgress));
    }

    #[test]
    fn test_workflow_poll_wait_loop() {
        let state = WorkflowState::Queued
            .on(Trigger::Started)
            .and_then(|s| s.on(Trigger::Initialized))
            .and_then(|s| s.on(Trigger::StillRunning))
            .and_then(|s| s.on(Trigger::WaitElapsed))
            .unwrap();
        assert_eq!(state, WorkflowState::Monitoring(MonitorPhase::Poll));

        let done = state.on(Trigger::MonitorDone).unwrap();
        assert_eq!(done, WorkflowState::Finalizing);
        let end = done.on(Trigger::Finalized(TerminalStatus::Completed)).unwrap();
        assert!(end.is_terminal());
    }

    #[test]
    fn test_errors_route_to_finalizing() {
        assert_eq!(
            WorkflowState::Initializing.on(Trigger::Errored),
            Some(WorkflowState::Finalizing)
        );
        assert_eq!(
            WorkflowState::Monitoring(MonitorPhase::Wait).on(Trigger::Errored),
            Some(WorkflowState::Finalizing)
        );
        assert_eq!(WorkflowState::Finalizing.on(Trigger::Errored), None);
        assert_eq!(
            WorkflowState::Terminal(TerminalStatus::Failed).on(Trigger::Started),
            None
        );
    }

    #[test]
    fn test_terminal_conversion() {
        assert_eq!(TerminalStatus::try_from(JobStatus::Canceled), Ok(TerminalStatus::Canceled));
        assert_eq!(TerminalStatus::try_from(JobStatus::Stopping), Err(JobStatus::Stopping));
        assert_eq!(JobStatus::from(TerminalStatus::Failed).to_string(), "FAILED");
    }
}
