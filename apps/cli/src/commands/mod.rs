//! Command implementations for the Pitwall CLI.

pub mod simulate;
pub mod spec;
pub mod validate;

use anyhow::Context;
use pitwall_training::JobRequest;
use std::path::Path;

/// Reads and validates a job request file.
pub(crate) fn read_request(path: &Path) -> anyhow::Result<JobRequest> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job request {}", path.display()))?;
    JobRequest::from_json(&body).with_context(|| format!("{} is not a valid job request", path.display()))
}
