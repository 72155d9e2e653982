use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use eventmirror::application::cache::CacheStore;
use eventmirror::application::fetch::{FetchError, FetchJob, Fetcher, QueueStatus};
use eventmirror::application::hydration::HydrationService;
use eventmirror::application::maintenance::MaintenanceService;
use eventmirror::application::repos::{CacheRepo, CachedResponse, RepoError};
use eventmirror::application::resolver::RequestResolver;
use eventmirror::domain::hydration::{
    EntityStatus, EventHydrationReport, SkipReason, SubRequestStatus,
};
use eventmirror::domain::identity::{CacheIdentity, QueryParams};
use eventmirror::infra::memory::MemoryCacheRepo;

const ACCOUNT: &str = "ACME";

/// Fetcher that answers from a script and records every identity it was asked for.
#[derive(Default)]
struct ScriptedFetcher {
    calls: Mutex<Vec<CacheIdentity>>,
    failing_objects: HashSet<&'static str>,
    /// Registration codes whose sub-requests all time out.
    failing_identifiers: HashSet<&'static str>,
    empty_objects: HashSet<&'static str>,
    registrants: Vec<&'static str>,
}

impl ScriptedFetcher {
    fn with_registrants(registrants: Vec<&'static str>) -> Self {
        Self {
            registrants,
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<CacheIdentity> {
        self.calls.lock().await.clone()
    }

    fn fails_for(&self, identity: &CacheIdentity) -> bool {
        if self.failing_objects.contains(identity.object.as_str()) {
            return true;
        }
        let reg_code = identity
            .identifier_code
            .as_deref()
            .or_else(|| identity.query_params.get("registrationCode"));
        reg_code.is_some_and(|code| self.failing_identifiers.contains(code))
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn submit(&self, job: FetchJob) -> Result<Option<Value>, FetchError> {
        let identity = job.identity;
        self.calls.lock().await.push(identity.clone());

        if self.fails_for(&identity) {
            return Err(FetchError::Timeout {
                identity: identity.to_string(),
                timeout: Duration::from_millis(5),
            });
        }
        if self.empty_objects.contains(identity.object.as_str()) {
            return Ok(Some(json!([])));
        }

        match identity.object.as_str() {
            "RegistrationList" => {
                let list: Vec<Value> = self
                    .registrants
                    .iter()
                    .map(|code| json!({ "registrationCode": code }))
                    .collect();
                Ok(Some(json!({ "registrationList": list })))
            }
            "Missing" => Ok(None),
            _ => Ok(Some(json!({
                "object": identity.object,
                "id": identity.identifier_code,
                "params": identity.query_params.canonical(),
            }))),
        }
    }

    async fn status(&self) -> QueueStatus {
        QueueStatus {
            backend: "scripted",
            ready: true,
            active: 0,
            waiting: 0,
            delayed: 0,
            concurrency: 1,
            estimated_wait_seconds: 0,
        }
    }
}

/// Records what the cache holds for `watched` whenever registrant discovery runs.
struct CacheObservingFetcher {
    inner: ScriptedFetcher,
    cache: CacheStore,
    watched: CacheIdentity,
    observed: Mutex<Vec<Option<Value>>>,
}

#[async_trait]
impl Fetcher for CacheObservingFetcher {
    async fn submit(&self, job: FetchJob) -> Result<Option<Value>, FetchError> {
        if job.identity.object == "RegistrationList" {
            let seen = self.cache.lookup(&self.watched).await;
            self.observed.lock().await.push(seen);
        }
        self.inner.submit(job).await
    }

    async fn status(&self) -> QueueStatus {
        self.inner.status().await
    }
}

/// Cache backend that serves reads but rejects every write.
#[derive(Default)]
struct WriteRejectingRepo {
    inner: MemoryCacheRepo,
}

#[async_trait]
impl CacheRepo for WriteRejectingRepo {
    async fn find_fresh(
        &self,
        identity: &CacheIdentity,
        fresh_since: OffsetDateTime,
    ) -> Result<Option<CachedResponse>, RepoError> {
        self.inner.find_fresh(identity, fresh_since).await
    }

    async fn upsert(&self, _identity: &CacheIdentity, _response: &Value) -> Result<(), RepoError> {
        Err(RepoError::from_persistence("disk full"))
    }

    async fn delete_created_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        self.inner.delete_created_before(cutoff).await
    }

    async fn delete_by_event(&self, event_code: &str) -> Result<u64, RepoError> {
        self.inner.delete_by_event(event_code).await
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        self.inner.health_check().await
    }
}

fn identity(object: &str, event: Option<&str>, id: Option<&str>) -> CacheIdentity {
    CacheIdentity::new(
        object,
        ACCOUNT,
        event.map(str::to_string),
        id.map(str::to_string),
        QueryParams::new(),
    )
    .expect("valid identity")
}

fn store(repo: &Arc<MemoryCacheRepo>) -> CacheStore {
    CacheStore::new(repo.clone(), Duration::from_secs(24 * 3600))
}

#[tokio::test]
async fn miss_fetches_once_then_serves_from_cache() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let resolver = RequestResolver::new(store(&repo), fetcher.clone());
    let id = identity("Registration", Some("EV1"), Some("100"));

    let first = resolver.resolve(&id).await.expect("first resolve");
    let second = resolver.resolve(&id).await.expect("second resolve");

    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(fetcher.calls().await.len(), 1);
    assert_eq!(repo.len(), 1);
}

#[tokio::test]
async fn absent_upstream_data_is_not_cached() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let resolver = RequestResolver::new(store(&repo), fetcher.clone());
    let id = identity("Missing", Some("EV1"), None);

    assert_eq!(resolver.resolve(&id).await.expect("resolve"), None);
    assert_eq!(resolver.resolve(&id).await.expect("resolve"), None);

    assert!(repo.is_empty());
    assert_eq!(fetcher.calls().await.len(), 2);
}

#[tokio::test]
async fn stale_rows_are_refetched() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let resolver = RequestResolver::new(store(&repo), fetcher.clone());
    let id = identity("Event", Some("EV1"), None);

    repo.upsert_at(
        &id,
        json!({ "stale": true }),
        OffsetDateTime::now_utc() - time::Duration::hours(48),
    );

    let fresh = resolver.resolve(&id).await.expect("resolve").expect("payload");
    assert_eq!(fresh["object"], "Event");
    assert_eq!(fetcher.calls().await.len(), 1);
    assert_eq!(repo.len(), 1);
}

#[tokio::test]
async fn entity_hydration_reports_each_sub_request() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher {
        failing_objects: HashSet::from(["Accommodation"]),
        ..Default::default()
    });
    let hydration = HydrationService::new(store(&repo), fetcher.clone(), ACCOUNT);

    let report = hydration.hydrate_entity("EV1", "100-1").await;

    assert_eq!(report.results.len(), 7);
    assert_eq!(report.count(|s| matches!(s, SubRequestStatus::Cached)), 6);
    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].request.object, "Accommodation");
    assert_eq!(repo.len(), 6);

    let again = hydration.hydrate_entity("EV1", "100-1").await;
    assert_eq!(
        again.count(|s| matches!(s, SubRequestStatus::Skipped { .. })),
        6
    );
}

#[tokio::test]
async fn event_hydration_deduplicates_registrants() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher::with_registrants(vec!["1", "2", "1"]));
    let hydration = HydrationService::new(store(&repo), fetcher.clone(), ACCOUNT);

    match hydration.hydrate_event("EV1").await {
        EventHydrationReport::Completed { results, .. } => {
            let ids: Vec<_> = results.iter().map(|r| r.entity_id.as_str()).collect();
            assert_eq!(ids, ["1", "2"]);
            assert!(
                results
                    .iter()
                    .all(|r| matches!(r.status, EntityStatus::Hydrated { .. }))
            );
        }
        other => panic!("unexpected report: {other:?}"),
    }
    assert_eq!(repo.len(), 14);
}

#[tokio::test]
async fn event_hydration_isolates_a_failing_registrant() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher {
        failing_identifiers: HashSet::from(["B"]),
        ..ScriptedFetcher::with_registrants(vec!["A", "B", "C"])
    });
    let hydration = HydrationService::new(store(&repo), fetcher.clone(), ACCOUNT);

    match hydration.hydrate_event("EV1").await {
        EventHydrationReport::Completed {
            total,
            hydrated,
            failed,
            results,
            ..
        } => {
            assert_eq!((total, hydrated, failed), (3, 2, 1));
            let by_id = |id: &str| {
                results
                    .iter()
                    .find(|r| r.entity_id == id)
                    .map(|r| r.status.clone())
                    .expect("registrant in report")
            };
            assert!(matches!(by_id("A"), EntityStatus::Hydrated { .. }));
            assert!(matches!(by_id("B"), EntityStatus::Failed { .. }));
            assert!(matches!(by_id("C"), EntityStatus::Hydrated { .. }));
        }
        other => panic!("unexpected report: {other:?}"),
    }

    let cache = store(&repo);
    assert!(cache.lookup(&identity("Registration", Some("EV1"), Some("A"))).await.is_some());
    assert!(cache.lookup(&identity("Registration", Some("EV1"), Some("B"))).await.is_none());
    assert!(cache.lookup(&identity("Registration", Some("EV1"), Some("C"))).await.is_some());
    assert_eq!(repo.len(), 14);
}

#[tokio::test]
async fn event_without_registrants_reports_no_work() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let hydration = HydrationService::new(store(&repo), fetcher, ACCOUNT);

    let report = hydration.hydrate_event("EV1").await;
    assert!(matches!(report, EventHydrationReport::NoWork { .. }));
    assert!(repo.is_empty());
}

#[tokio::test]
async fn reset_clears_event_rows_before_rehydrating() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher::with_registrants(vec!["7"]));
    let cache = store(&repo);
    let hydration = HydrationService::new(cache.clone(), fetcher.clone(), ACCOUNT);

    let old = identity("Registration", Some("EV1"), Some("7"));
    repo.upsert_at(&old, json!({ "version": "old" }), OffsetDateTime::now_utc());
    let other_event = identity("Registration", Some("EV2"), Some("7"));
    repo.upsert_at(&other_event, json!({ "version": "kept" }), OffsetDateTime::now_utc());

    let report = hydration.reset_event("EV1").await.expect("reset");

    assert_eq!(report.event_clear_result.removed, 1);
    let refreshed = cache.lookup(&old).await.expect("rehydrated row");
    assert_eq!(refreshed["object"], "Registration");
    assert!(cache.lookup(&other_event).await.is_some());
}

#[tokio::test]
async fn reset_deletes_before_discovery_runs() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let cache = store(&repo);
    let old = identity("Registration", Some("EV1"), Some("7"));
    repo.upsert_at(&old, json!({ "version": "old" }), OffsetDateTime::now_utc());

    let fetcher = Arc::new(CacheObservingFetcher {
        inner: ScriptedFetcher::with_registrants(vec!["7"]),
        cache: cache.clone(),
        watched: old.clone(),
        observed: Mutex::new(Vec::new()),
    });
    let hydration = HydrationService::new(cache.clone(), fetcher.clone(), ACCOUNT);

    hydration.reset_event("EV1").await.expect("reset");

    assert_eq!(*fetcher.observed.lock().await, vec![None]);
    let refreshed = cache.lookup(&old).await.expect("rehydrated row");
    assert_eq!(refreshed["object"], "Registration");
}

#[tokio::test]
async fn failed_cache_write_is_reported_as_failure() {
    let cache = CacheStore::new(
        Arc::new(WriteRejectingRepo::default()),
        Duration::from_secs(3600),
    );
    let hydration = HydrationService::new(cache, Arc::new(ScriptedFetcher::default()), ACCOUNT);

    let report = hydration.hydrate_entity("EV1", "100-1").await;

    assert_eq!(report.count(|s| matches!(s, SubRequestStatus::Cached)), 0);
    assert_eq!(report.failures().count(), 7);
    assert!(report.results.iter().all(|outcome| matches!(
        &outcome.status,
        SubRequestStatus::Failed { error } if error == "cache write failed"
    )));
}

#[tokio::test]
async fn empty_payload_is_skipped_not_cached() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let fetcher = Arc::new(ScriptedFetcher {
        empty_objects: HashSet::from(["Accommodation"]),
        ..Default::default()
    });
    let hydration = HydrationService::new(store(&repo), fetcher, ACCOUNT);

    let report = hydration.hydrate_entity("EV1", "100-1").await;

    let accommodation = report
        .results
        .iter()
        .find(|outcome| outcome.request.object == "Accommodation")
        .expect("accommodation sub-request");
    assert_eq!(
        accommodation.status,
        SubRequestStatus::Skipped {
            reason: SkipReason::NoData
        }
    );
    assert_eq!(report.count(|s| matches!(s, SubRequestStatus::Cached)), 6);
    assert_eq!(repo.len(), 6);
}

#[tokio::test]
async fn maintenance_sweeps_by_age() {
    let repo = Arc::new(MemoryCacheRepo::new());
    let maintenance = MaintenanceService::new(store(&repo));

    let now = OffsetDateTime::now_utc();
    repo.upsert_at(&identity("Event", Some("EV1"), None), json!({"a": 1}), now - time::Duration::hours(10));
    repo.upsert_at(&identity("Event", Some("EV2"), None), json!({"a": 2}), now);

    let report = maintenance.sweep_older_than(5).await.expect("sweep");
    assert_eq!(report.hours, 5);
    assert_eq!(report.removed, 1);
    assert_eq!(repo.len(), 1);
}
