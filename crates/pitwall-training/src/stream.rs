use crate::error::TrainingResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Handle to a live telemetry stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    pub name: String,
    pub arn: String,
}

impl std::fmt::Display for StreamRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.arn)
    }
}

#[async_trait]
pub trait StreamService: Send + Sync {
    async fn create_stream(&self, name: &str, retention_hours: u32) -> TrainingResult<StreamRef>;

    /// Deletes a stream. Returns `NotFound` if it is already gone.
    async fn delete_stream(&self, stream: &StreamRef) -> TrainingResult<()>;
}
