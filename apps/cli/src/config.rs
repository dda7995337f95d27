//! Orchestrator configuration loading for the CLI.

use anyhow::Context;
use pitwall_orchestrator::OrchestratorConfig;
use std::path::Path;
use tracing::debug;

/// Loads the configuration file if present, then applies `PITWALL_*`
/// environment overrides and validates the result.
///
/// A missing file yields the defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match path {
        Some(path) if path.exists() => OrchestratorConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        Some(path) => {
            debug!(path = %path.display(), "Config file not found, using defaults");
            OrchestratorConfig::default()
        }
        None => OrchestratorConfig::default(),
    };

    config.apply_env_overrides().context("Invalid environment override")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
