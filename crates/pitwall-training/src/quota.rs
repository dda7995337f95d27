use crate::error::TrainingResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Point-in-time view of backend capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub in_flight: u32,
    pub ceiling: u32,
}

impl QuotaSnapshot {
    #[must_use]
    pub const fn has_capacity(&self) -> bool {
        self.in_flight < self.ceiling
    }
}

/// Reports how many jobs are running and how many are allowed.
#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn in_flight_count(&self) -> TrainingResult<u32>;

    async fn ceiling(&self) -> TrainingResult<u32>;

    async fn snapshot(&self) -> TrainingResult<QuotaSnapshot> {
        let (in_flight, ceiling) = tokio::try_join!(self.in_flight_count(), self.ceiling())?;
        Ok(QuotaSnapshot { in_flight, ceiling })
    }
}

/// Quota with a fixed ceiling and a fixed in-flight count.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuota {
    pub in_flight: u32,
    pub ceiling: u32,
}

#[async_trait]
impl QuotaService for FixedQuota {
    async fn in_flight_count(&self) -> TrainingResult<u32> {
        Ok(self.in_flight)
    }

    async fn ceiling(&self) -> TrainingResult<u32> {
        Ok(self.ceiling)
    }
}
