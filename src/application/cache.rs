//! Fail-open cache store over a [`CacheRepo`].
//!
//! Read errors degrade to a miss and write errors degrade to "not cached";
//! neither reaches the request that triggered them. Deletions report their
//! errors because maintenance callers need to know whether rows were removed.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::application::repos::{CacheRepo, RepoError};
use crate::domain::identity::CacheIdentity;
use crate::domain::payload::{freshness_cutoff, is_empty_payload};

const TARGET: &str = "eventmirror::cache";

/// Result of a cache write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Stored,
    SkippedEmpty,
    Failed,
}

#[derive(Clone)]
pub struct CacheStore {
    repo: Arc<dyn CacheRepo>,
    expiration: Duration,
}

impl CacheStore {
    pub fn new(repo: Arc<dyn CacheRepo>, expiration: Duration) -> Self {
        Self { repo, expiration }
    }

    /// Fresh response for `identity`, or `None` on miss, stale row, or storage error.
    pub async fn lookup(&self, identity: &CacheIdentity) -> Option<Value> {
        let cutoff = freshness_cutoff(OffsetDateTime::now_utc(), self.expiration);

        match self.repo.find_fresh(identity, cutoff).await {
            Ok(Some(hit)) => {
                counter!("eventmirror_cache_hit_total").increment(1);
                debug!(
                    target = TARGET,
                    identity = %identity,
                    created_at = %hit.created_at,
                    "cache hit"
                );
                Some(hit.response)
            }
            Ok(None) => {
                counter!("eventmirror_cache_miss_total").increment(1);
                debug!(target = TARGET, identity = %identity, "cache miss");
                None
            }
            Err(err) => {
                counter!("eventmirror_cache_read_error_total").increment(1);
                error!(
                    target = TARGET,
                    identity = %identity,
                    error = %err,
                    "cache read failed; treating as miss"
                );
                None
            }
        }
    }

    /// Write `response` for `identity`. Empty payloads are never persisted.
    pub async fn upsert(&self, identity: &CacheIdentity, response: &Value) -> UpsertOutcome {
        if is_empty_payload(response) {
            counter!("eventmirror_cache_write_skipped_total").increment(1);
            warn!(
                target = TARGET,
                identity = %identity,
                "skipping cache write for empty response"
            );
            return UpsertOutcome::SkippedEmpty;
        }

        match self.repo.upsert(identity, response).await {
            Ok(()) => {
                counter!("eventmirror_cache_write_total").increment(1);
                debug!(target = TARGET, identity = %identity, "cache write");
                UpsertOutcome::Stored
            }
            Err(err) => {
                counter!("eventmirror_cache_write_error_total").increment(1);
                error!(
                    target = TARGET,
                    identity = %identity,
                    error = %err,
                    "cache write failed"
                );
                UpsertOutcome::Failed
            }
        }
    }

    /// Delete every row older than `age`, regardless of object type.
    pub async fn delete_older_than(&self, age: Duration) -> Result<u64, RepoError> {
        let cutoff = OffsetDateTime::now_utc() - age;
        let removed = self.repo.delete_created_before(cutoff).await?;
        info!(
            target = TARGET,
            removed,
            cutoff = %cutoff,
            "deleted cache rows older than cutoff"
        );
        Ok(removed)
    }

    /// Delete every row belonging to `event_code`.
    pub async fn delete_by_event(&self, event_code: &str) -> Result<u64, RepoError> {
        let removed = self.repo.delete_by_event(event_code).await?;
        info!(target = TARGET, removed, event_code, "deleted event cache rows");
        Ok(removed)
    }

    pub async fn health_check(&self) -> Result<(), RepoError> {
        self.repo.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::application::repos::CachedResponse;
    use crate::domain::identity::QueryParams;

    #[derive(Default)]
    struct RecordingRepo {
        writes: Mutex<Vec<Value>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheRepo for RecordingRepo {
        async fn find_fresh(
            &self,
            _identity: &CacheIdentity,
            _fresh_since: OffsetDateTime,
        ) -> Result<Option<CachedResponse>, RepoError> {
            if self.fail {
                return Err(RepoError::Timeout);
            }
            Ok(self.writes.lock().await.last().map(|response| CachedResponse {
                response: response.clone(),
                created_at: OffsetDateTime::now_utc(),
            }))
        }

        async fn upsert(&self, _identity: &CacheIdentity, response: &Value) -> Result<(), RepoError> {
            if self.fail {
                return Err(RepoError::from_persistence("connection reset"));
            }
            self.writes.lock().await.push(response.clone());
            Ok(())
        }

        async fn delete_created_before(&self, _cutoff: OffsetDateTime) -> Result<u64, RepoError> {
            Ok(0)
        }

        async fn delete_by_event(&self, _event_code: &str) -> Result<u64, RepoError> {
            Ok(0)
        }

        async fn health_check(&self) -> Result<(), RepoError> {
            Ok(())
        }
    }

    fn identity() -> CacheIdentity {
        CacheIdentity::new(
            "Registration",
            "ACME",
            Some("EV1".into()),
            Some("R100".into()),
            QueryParams::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_payloads_are_never_written() {
        let repo = Arc::new(RecordingRepo::default());
        let store = CacheStore::new(repo.clone(), Duration::from_secs(3600));

        for empty in [Value::Null, json!({}), json!([]), json!("")] {
            assert_eq!(
                store.upsert(&identity(), &empty).await,
                UpsertOutcome::SkippedEmpty
            );
        }
        assert!(repo.writes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn storage_errors_fail_open() {
        let repo = Arc::new(RecordingRepo {
            fail: true,
            ..Default::default()
        });
        let store = CacheStore::new(repo, Duration::from_secs(3600));

        assert_eq!(store.lookup(&identity()).await, None);
        assert_eq!(
            store.upsert(&identity(), &json!({"a": 1})).await,
            UpsertOutcome::Failed
        );
    }

    #[tokio::test]
    async fn stored_payload_is_returned() {
        let repo = Arc::new(RecordingRepo::default());
        let store = CacheStore::new(repo, Duration::from_secs(3600));

        assert_eq!(
            store.upsert(&identity(), &json!({"a": 1})).await,
            UpsertOutcome::Stored
        );
        assert_eq!(store.lookup(&identity()).await, Some(json!({"a": 1})));
    }
}
