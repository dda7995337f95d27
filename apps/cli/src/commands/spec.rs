//! Backend start-job spec preview.

use pitwall_orchestrator::OrchestratorConfig;
use pitwall_training::{BackendJobSpec, StreamRef};
use std::path::Path;

/// Execute the spec command.
///
/// Prints the start-job spec the initializer would send for this request.
pub fn execute(path: &Path, stream: Option<String>, config: &OrchestratorConfig) -> anyhow::Result<()> {
    let request = super::read_request(path)?;
    let name = stream.unwrap_or_else(|| request.job_id.to_string());
    let stream = StreamRef {
        arn: format!("preview:stream/{name}"),
        name,
    };

    let spec = BackendJobSpec::from_request(
        &request,
        &config.backend.settings(),
        &config.backend.layout(),
        &stream,
    )?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}
