//! Compute-minute ledger per profile.
//!
//! Minutes are reserved ("queued") when a job is requested and settled by the
//! finalizer once the backend reports how long the job actually trained.

use crate::error::StoreResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub minutes_queued: f64,
    pub minutes_used: f64,
}

#[async_trait]
pub trait ComputeUsage: Send + Sync {
    async fn reserve(&self, profile_id: &str, minutes: f64) -> StoreResult<UsageSnapshot>;

    /// Releases `minutes_queued` from the reservation and charges what was
    /// used, never more than was reserved.
    async fn settle(&self, profile_id: &str, minutes_queued: f64, minutes_used: f64) -> StoreResult<UsageSnapshot>;

    async fn usage(&self, profile_id: &str) -> StoreResult<UsageSnapshot>;
}

#[derive(Debug, Default)]
pub struct InMemoryComputeUsage {
    profiles: Mutex<HashMap<String, UsageSnapshot>>,
}

impl InMemoryComputeUsage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ComputeUsage for InMemoryComputeUsage {
    async fn reserve(&self, profile_id: &str, minutes: f64) -> StoreResult<UsageSnapshot> {
        let mut profiles = self.profiles.lock().await;
        let entry = profiles.entry(profile_id.to_string()).or_default();
        entry.minutes_queued += minutes;
        Ok(*entry)
    }

    async fn settle(&self, profile_id: &str, minutes_queued: f64, minutes_used: f64) -> StoreResult<UsageSnapshot> {
        let mut profiles = self.profiles.lock().await;
        let entry = profiles.entry(profile_id.to_string()).or_default();
        entry.minutes_queued = (entry.minutes_queued - minutes_queued).max(0.0);
        entry.minutes_used += minutes_queued.min(minutes_used);
        debug!(
            profile_id = %profile_id,
            minutes_queued = entry.minutes_queued,
            minutes_used = entry.minutes_used,
            "Compute usage settled"
        );
        Ok(*entry)
    }

    async fn usage(&self, profile_id: &str) -> StoreResult<UsageSnapshot> {
        Ok(self.profiles.lock().await.get(profile_id).copied().unwrap_or_default())
    }
}
