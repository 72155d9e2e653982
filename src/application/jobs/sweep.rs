//! Cron job removing cache rows past the retention period.

use std::str::FromStr;
use std::time::Duration;

use apalis::prelude::*;
use apalis_cron::Schedule;
use time::OffsetDateTime;

use super::context::SweepContext;

/// Marker struct for the cron-triggered sweep.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct SweepCacheJob;

impl From<chrono::DateTime<chrono::Utc>> for SweepCacheJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

/// Sweep errors are logged and swallowed so the schedule keeps ticking.
pub async fn process_sweep_cache_job(
    _job: SweepCacheJob,
    ctx: Data<SweepContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx.maintenance.sweep_older_than(ctx.retention_hours).await {
        Ok(report) if report.removed > 0 => {
            tracing::info!(
                target = "eventmirror::jobs::sweep",
                removed = report.removed,
                hours = report.hours,
                "Swept expired cache entries"
            );
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(
                target = "eventmirror::jobs::sweep",
                error = %err,
                "Failed to sweep cache entries"
            );
        }
    }

    if let Some(jobs) = &ctx.fetch_jobs {
        let age = Duration::from_secs(ctx.retention_hours.saturating_mul(3600));
        let cutoff = OffsetDateTime::now_utc() - age;
        if let Err(err) = jobs.purge_fetch_results_before(cutoff).await {
            tracing::warn!(
                target = "eventmirror::jobs::sweep",
                error = %err,
                "Failed to purge uncollected fetch results"
            );
        }
    }

    Ok(())
}

/// Parse a six-field cron expression (seconds first).
pub fn sweep_schedule(expression: &str) -> Result<Schedule, String> {
    Schedule::from_str(expression).map_err(|err| format!("invalid cron expression: {err}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Mutex;

    use super::*;
    use crate::application::cache::CacheStore;
    use crate::application::maintenance::MaintenanceService;
    use crate::application::repos::{CacheRepo, CachedResponse, RepoError};
    use crate::domain::identity::CacheIdentity;

    #[test]
    fn hourly_schedule_parses() {
        let schedule = sweep_schedule("0 0 * * * *").expect("valid expression");
        let upcoming: Vec<_> = schedule.upcoming(chrono::Utc).take(3).collect();
        assert_eq!(upcoming.len(), 3);
    }

    #[test]
    fn malformed_schedule_is_rejected() {
        assert!(sweep_schedule("every hour").is_err());
    }

    #[derive(Default)]
    struct CutoffRepo {
        cutoffs: Mutex<Vec<OffsetDateTime>>,
    }

    #[async_trait]
    impl CacheRepo for CutoffRepo {
        async fn find_fresh(
            &self,
            _identity: &CacheIdentity,
            _fresh_since: OffsetDateTime,
        ) -> Result<Option<CachedResponse>, RepoError> {
            Ok(None)
        }

        async fn upsert(&self, _identity: &CacheIdentity, _response: &Value) -> Result<(), RepoError> {
            Ok(())
        }

        async fn delete_created_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
            self.cutoffs.lock().await.push(cutoff);
            Ok(3)
        }

        async fn delete_by_event(&self, _event_code: &str) -> Result<u64, RepoError> {
            Ok(0)
        }

        async fn health_check(&self) -> Result<(), RepoError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sweep_uses_retention_cutoff() {
        let repo = Arc::new(CutoffRepo::default());
        let cache = CacheStore::new(repo.clone(), Duration::from_secs(24 * 3600));
        let ctx = SweepContext {
            maintenance: MaintenanceService::new(cache),
            retention_hours: 2,
            fetch_jobs: None,
        };
        let before = OffsetDateTime::now_utc();

        process_sweep_cache_job(SweepCacheJob, Data::new(ctx))
            .await
            .expect("sweep never fails the job");

        let cutoffs = repo.cutoffs.lock().await;
        assert_eq!(cutoffs.len(), 1);
        let age = before - cutoffs[0];
        assert!(age >= time::Duration::hours(2) - time::Duration::seconds(1));
        assert!(age <= time::Duration::hours(2) + time::Duration::seconds(1));
    }
}
