use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use httpmock::prelude::*;
use serde_json::json;

use eventmirror::application::fetch::{Fetcher, RetryPolicy, UpstreamResponse, UpstreamTransport};
use eventmirror::domain::identity::{CacheIdentity, QueryParams};
use eventmirror::infra::upstream::{MemoryFetchPool, UpstreamClient, UpstreamCredentials};

/// Transport that holds each attempt open and tracks how many overlap.
#[derive(Default)]
struct SlowTransport {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl UpstreamTransport for SlowTransport {
    async fn attempt(&self, identity: &CacheIdentity) -> UpstreamResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        UpstreamResponse::Payload(json!({ "id": identity.identifier_code }))
    }

    fn describe(&self, identity: &CacheIdentity) -> String {
        identity.upstream_path()
    }
}

fn identity(id: &str) -> CacheIdentity {
    CacheIdentity::new(
        "Registration",
        "ACME",
        Some("EV1".to_string()),
        Some(id.to_string()),
        QueryParams::new(),
    )
    .expect("valid identity")
}

fn policy(max_wait: Duration) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(10),
        multiplier: 2,
        max_wait,
        max_attempts: NonZeroU32::new(8).expect("non-zero"),
        job_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn concurrent_attempts_never_exceed_the_ceiling() {
    let transport = Arc::new(SlowTransport::default());
    let pool = Arc::new(MemoryFetchPool::new(
        transport.clone(),
        policy(Duration::from_secs(1)),
        3,
    ));

    let requests = (0..12).map(|n| {
        let pool = pool.clone();
        async move { pool.fetch(&identity(&n.to_string())).await }
    });
    let results = join_all(requests).await;

    assert!(results.iter().all(|r| matches!(r, Ok(Some(_)))));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 12);
    assert!(transport.peak.load(Ordering::SeqCst) <= 3);

    let status = pool.status().await;
    assert_eq!(status.backend, "memory");
    assert_eq!((status.active, status.waiting, status.delayed), (0, 0, 0));
}

fn client(server: &MockServer) -> UpstreamClient {
    UpstreamClient::new(
        &server.base_url(),
        "certainExternal/service/v1",
        UpstreamCredentials {
            username: "svc".to_string(),
            password: "secret".to_string(),
        },
        Duration::from_secs(2),
    )
    .expect("client")
}

#[tokio::test]
async fn persistent_rate_limit_gives_up_within_the_wait_budget() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/certainExternal/service/v1/Registration/ACME/EV1/9");
            then.status(429);
        })
        .await;

    let pool = MemoryFetchPool::new(
        Arc::new(client(&server)),
        policy(Duration::from_millis(100)),
        2,
    );

    let started = Instant::now();
    let result = pool.fetch(&identity("9")).await.expect("fetch completes");
    let elapsed = started.elapsed();

    assert_eq!(result, None);
    // 10 + 20 + 40 ms of backoff; the next 80 ms delay would exceed the budget.
    assert!(elapsed >= Duration::from_millis(70));
    assert!(elapsed < Duration::from_secs(2));
}
