//! Orchestrator configuration.
//!
//! Loaded from TOML; every section and field is optional and falls back to
//! its default. Environment overrides are applied after the file.

use crate::error::{OrchestrationError, Result};
use pitwall_training::{ArtifactLayout, BackendSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_POLL_INTERVAL_SECS: &str = "PITWALL_POLL_INTERVAL_SECS";
pub const ENV_ADMISSION_DELAY_MS: &str = "PITWALL_ADMISSION_DELAY_MS";
pub const ENV_TRAINING_IMAGE: &str = "PITWALL_TRAINING_IMAGE";
pub const ENV_ROLE: &str = "PITWALL_ROLE";
pub const ENV_ARTIFACT_ROOT: &str = "PITWALL_ARTIFACT_ROOT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub dispatcher: DispatcherConfig,
    pub monitor: MonitorConfig,
    pub finalizer: FinalizerConfig,
    pub stream: StreamConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Pause before the quota check so the previously dispatched job has
    /// time to claim its instance.
    pub admission_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { admission_delay_ms: 4000 }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub const fn admission_delay(&self) -> Duration {
        Duration::from_millis(self.admission_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Sub-second interval, used only when `poll_interval_secs` is 0.
    pub poll_interval_ms: Option<u64>,
    /// Describe attempts per poll before giving up.
    pub describe_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            poll_interval_ms: None,
            describe_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        match (self.poll_interval_secs, self.poll_interval_ms) {
            (0, Some(ms)) => Duration::from_millis(ms),
            (secs, _) => Duration::from_secs(secs),
        }
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizerConfig {
    pub delete_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self { delete_retries: 3, retry_backoff_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub retention_hours: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { retention_hours: 24 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub role: String,
    pub training_image: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub volume_size_gb: u32,
    pub region: String,
    pub artifact_root: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let settings = BackendSettings::default();
        Self {
            role: settings.role,
            training_image: settings.training_image,
            instance_type: settings.instance_type,
            instance_count: settings.instance_count,
            volume_size_gb: settings.volume_size_gb,
            region: settings.region,
            artifact_root: "s3://pitwall-artifacts/models".to_string(),
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn settings(&self) -> BackendSettings {
        BackendSettings {
            role: self.role.clone(),
            training_image: self.training_image.clone(),
            instance_type: self.instance_type.clone(),
            instance_count: self.instance_count,
            volume_size_gb: self.volume_size_gb,
            region: self.region.clone(),
        }
    }

    #[must_use]
    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(self.artifact_root.clone())
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestrationError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| OrchestrationError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OrchestrationError::Config(e.to_string()))
    }

    /// Applies `PITWALL_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `PITWALL_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_POLL_INTERVAL_SECS) {
            self.monitor.poll_interval_secs = parse_number(ENV_POLL_INTERVAL_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_ADMISSION_DELAY_MS) {
            self.dispatcher.admission_delay_ms = parse_number(ENV_ADMISSION_DELAY_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_TRAINING_IMAGE) {
            self.backend.training_image = value;
        }
        if let Some(value) = lookup(ENV_ROLE) {
            self.backend.role = value;
        }
        if let Some(value) = lookup(ENV_ARTIFACT_ROOT) {
            self.backend.artifact_root = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval().is_zero() {
            return Err(OrchestrationError::Config("monitor poll interval must be > 0".to_string()));
        }
        if self.monitor.describe_retries == 0 {
            return Err(OrchestrationError::Config("monitor.describe_retries must be >= 1".to_string()));
        }
        if self.finalizer.delete_retries == 0 {
            return Err(OrchestrationError::Config("finalizer.delete_retries must be >= 1".to_string()));
        }
        for (name, value) in [
            ("backend.training_image", &self.backend.training_image),
            ("backend.role", &self.backend.role),
            ("backend.artifact_root", &self.backend.artifact_root),
        ] {
            if value.trim().is_empty() {
                return Err(OrchestrationError::Config(format!("{name} must not be empty")));
            }
        }
        if !self.backend.artifact_root.contains("://") {
            return Err(OrchestrationError::Config(
                "backend.artifact_root must be a scheme://bucket/prefix location".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestrationError::Config(format!("{key} must be a number, got '{value}'")))
}
