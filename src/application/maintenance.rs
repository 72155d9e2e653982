//! Bulk cache deletion. Destructive and unconditional; there is no recovery path.

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::application::cache::CacheStore;
use crate::application::repos::RepoError;

pub const DEFAULT_SWEEP_HOURS: u64 = 168;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub hours: u64,
    pub removed: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSweepReport {
    pub event_code: String,
    pub removed: u64,
    pub message: String,
}

#[derive(Clone)]
pub struct MaintenanceService {
    cache: CacheStore,
}

impl MaintenanceService {
    pub fn new(cache: CacheStore) -> Self {
        Self { cache }
    }

    /// Delete all rows older than `hours`, independent of the freshness window.
    pub async fn sweep_older_than(&self, hours: u64) -> Result<SweepReport, RepoError> {
        info!(
            target = "eventmirror::maintenance",
            hours, "removing cache entries older than cutoff"
        );
        let age = Duration::from_secs(hours.saturating_mul(3600));
        let removed = self.cache.delete_older_than(age).await?;

        Ok(SweepReport {
            hours,
            removed,
            message: format!(
                "Cache cleanup completed. Removed {removed} entries older than {hours} hours."
            ),
        })
    }

    /// Delete all rows of `event_code` regardless of age.
    pub async fn sweep_event(&self, event_code: &str) -> Result<EventSweepReport, RepoError> {
        info!(
            target = "eventmirror::maintenance",
            event_code, "removing cache entries for event"
        );
        let removed = self.cache.delete_by_event(event_code).await?;

        Ok(EventSweepReport {
            event_code: event_code.to_string(),
            removed,
            message: format!("Removed {removed} cache entries for event {event_code}."),
        })
    }
}
