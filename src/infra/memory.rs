//! Process-local [`CacheRepo`] for single-node deployments and tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use time::OffsetDateTime;

use crate::application::repos::{CacheRepo, CachedResponse, RepoError};
use crate::domain::identity::CacheIdentity;

#[derive(Clone, Default)]
pub struct MemoryCacheRepo {
    entries: Arc<DashMap<CacheIdentity, CachedResponse>>,
}

impl MemoryCacheRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row with an explicit timestamp, replacing any existing one.
    pub fn upsert_at(&self, identity: &CacheIdentity, response: Value, created_at: OffsetDateTime) {
        self.entries.insert(
            identity.clone(),
            CachedResponse {
                response,
                created_at,
            },
        );
    }

    pub fn get(&self, identity: &CacheIdentity) -> Option<CachedResponse> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheRepo for MemoryCacheRepo {
    async fn find_fresh(
        &self,
        identity: &CacheIdentity,
        fresh_since: OffsetDateTime,
    ) -> Result<Option<CachedResponse>, RepoError> {
        Ok(self
            .entries
            .get(identity)
            .filter(|entry| entry.created_at >= fresh_since)
            .map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, identity: &CacheIdentity, response: &Value) -> Result<(), RepoError> {
        self.upsert_at(identity, response.clone(), OffsetDateTime::now_utc());
        Ok(())
    }

    async fn delete_created_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.created_at >= cutoff);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn delete_by_event(&self, event_code: &str) -> Result<u64, RepoError> {
        let before = self.entries.len();
        self.entries
            .retain(|identity, _| identity.event_code.as_deref() != Some(event_code));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;

    use super::*;
    use crate::domain::identity::QueryParams;

    fn identity(event: Option<&str>, identifier: Option<&str>) -> CacheIdentity {
        CacheIdentity::new(
            "Registration",
            "ACME",
            event.map(str::to_string),
            identifier.map(str::to_string),
            QueryParams::new().with("includeList", "profile_questions"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let repo = MemoryCacheRepo::new();
        let id = identity(None, None);
        repo.upsert(&id, &json!({"v": 1})).await.unwrap();
        repo.upsert(&id, &json!({"v": 2})).await.unwrap();

        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get(&id).unwrap().response, json!({"v": 2}));
    }

    #[tokio::test]
    async fn stale_rows_are_not_returned() {
        let repo = MemoryCacheRepo::new();
        let id = identity(Some("EV1"), Some("R1"));
        let now = OffsetDateTime::now_utc();
        repo.upsert_at(&id, json!({"v": 1}), now - Duration::hours(25));

        let found = repo.find_fresh(&id, now - Duration::hours(24)).await.unwrap();
        assert!(found.is_none());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn event_sweep_leaves_other_events() {
        let repo = MemoryCacheRepo::new();
        repo.upsert(&identity(Some("EV1"), Some("R1")), &json!(1)).await.unwrap();
        repo.upsert(&identity(Some("EV1"), Some("R2")), &json!(2)).await.unwrap();
        repo.upsert(&identity(Some("EV2"), Some("R1")), &json!(3)).await.unwrap();
        repo.upsert(&identity(None, None), &json!(4)).await.unwrap();

        assert_eq!(repo.delete_by_event("EV1").await.unwrap(), 2);
        assert_eq!(repo.len(), 2);
    }

    #[tokio::test]
    async fn age_sweep_counts_removed_rows() {
        let repo = MemoryCacheRepo::new();
        let now = OffsetDateTime::now_utc();
        repo.upsert_at(&identity(Some("EV1"), Some("R1")), json!(1), now - Duration::hours(200));
        repo.upsert_at(&identity(Some("EV1"), Some("R2")), json!(2), now - Duration::hours(1));

        let removed = repo
            .delete_created_before(now - Duration::hours(168))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repo.len(), 1);
    }
}
