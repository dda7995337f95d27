//! Job request validation command.

use colored::Colorize;
use pitwall_training::{JobRequest, Race, TrackDirection};
use serde_json::json;
use std::path::Path;

/// Execute the validate command.
///
/// Fails with the validation error if the request is malformed.
pub fn execute(path: &Path, json: bool) -> anyhow::Result<()> {
    let request = super::read_request(path)?;

    if json {
        output_json(&request)?;
    } else {
        output_human(&request);
    }
    Ok(())
}

fn output_json(request: &JobRequest) -> anyhow::Result<()> {
    let output = json!({
        "valid": true,
        "jobId": request.job_id,
        "raceType": request.race_type(),
        "maxRuntimeSeconds": request.termination.max_runtime().as_secs(),
        "request": request,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn output_human(request: &JobRequest) {
    let direction = match request.track.track_direction {
        TrackDirection::Clockwise => "clockwise",
        TrackDirection::CounterClockwise => "counter-clockwise",
    };

    println!("{}", "pitwall validate".bold().cyan());
    println!();
    println!("  {} {}", "✓".green(), format!("Job request {} is valid", request.job_id).bold());
    println!();
    println!("  {:<14} {}", "Model", request.model_id);
    println!("  {:<14} {}", "Profile", request.profile_id);
    println!("  {:<14} {}", "Race", request.race_type());
    println!("  {:<14} {} ({})", "Track", request.track.track_id, direction);
    println!("  {:<14} {} min", "Max time", request.termination.max_time_in_minutes);
    if let Some(laps) = request.termination.max_laps {
        println!("  {:<14} {}", "Max laps", laps);
    }
    if let Race::ObjectAvoidance(config) = &request.race {
        let placement = if config.randomize_locations() { "random" } else { "fixed" };
        println!("  {:<14} {} ({})", "Obstacles", config.number_of_objects, placement);
    }
    println!();
}
