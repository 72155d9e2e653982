use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use metrics::gauge;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::application::fetch::{
    AttemptVerdict, FetchError, FetchJob, Fetcher, QueueStatus, RetryPolicy, UpstreamTransport,
    estimated_wait_seconds,
};

const TARGET: &str = "eventmirror::fetch::pool";

#[derive(Default)]
struct PoolCounters {
    active: AtomicUsize,
    waiting: AtomicUsize,
    delayed: AtomicUsize,
}

/// Increments a counter for as long as it lives, mirroring it into a gauge.
struct Slot<'a> {
    counter: &'a AtomicUsize,
    gauge: &'static str,
}

impl<'a> Slot<'a> {
    fn enter(counter: &'a AtomicUsize, gauge: &'static str) -> Self {
        let value = counter.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!(gauge).set(value as f64);
        Self { counter, gauge }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let value = self.counter.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        gauge!(self.gauge).set(value as f64);
    }
}

/// In-process [`Fetcher`] capping simultaneous upstream calls with a semaphore.
///
/// A permit is held only while an HTTP attempt is in flight; backoff sleeps
/// happen outside admission so rate-limited jobs do not starve others.
#[derive(Clone)]
pub struct MemoryFetchPool {
    transport: Arc<dyn UpstreamTransport>,
    policy: RetryPolicy,
    permits: Arc<Semaphore>,
    concurrency: usize,
    counters: Arc<PoolCounters>,
}

impl MemoryFetchPool {
    pub fn new(transport: Arc<dyn UpstreamTransport>, policy: RetryPolicy, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            transport,
            policy,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn run(&self, mut job: FetchJob) -> Result<Option<Value>, FetchError> {
        let url = self.transport.describe(&job.identity);
        loop {
            let response = {
                let waiting = Slot::enter(&self.counters.waiting, "eventmirror_fetch_waiting");
                let permit = self
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(FetchError::queue)?;
                drop(waiting);
                let _active = Slot::enter(&self.counters.active, "eventmirror_fetch_active");
                let response = self.transport.attempt(&job.identity).await;
                drop(permit);
                response
            };
            job.attempts += 1;

            match self.policy.judge(&job, &url, response) {
                AttemptVerdict::Done(result) => return Ok(result),
                AttemptVerdict::RetryAfter(delay) => {
                    let _delayed = Slot::enter(&self.counters.delayed, "eventmirror_fetch_delayed");
                    sleep(delay).await;
                    job = job.rescheduled(delay);
                }
            }
        }
    }
}

#[async_trait]
impl Fetcher for MemoryFetchPool {
    async fn submit(&self, job: FetchJob) -> Result<Option<Value>, FetchError> {
        let identity = job.identity.to_string();
        match timeout(self.policy.job_timeout, self.run(job)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target = TARGET,
                    identity = %identity,
                    timeout_ms = self.policy.job_timeout.as_millis() as u64,
                    "upstream fetch timed out"
                );
                metrics::counter!("eventmirror_fetch_timeout_total").increment(1);
                Err(FetchError::Timeout {
                    identity,
                    timeout: self.policy.job_timeout,
                })
            }
        }
    }

    async fn status(&self) -> QueueStatus {
        let waiting = self.counters.waiting.load(Ordering::Acquire);
        QueueStatus {
            backend: "memory",
            ready: !self.permits.is_closed(),
            active: self.counters.active.load(Ordering::Acquire),
            waiting,
            delayed: self.counters.delayed.load(Ordering::Acquire),
            concurrency: self.concurrency,
            estimated_wait_seconds: estimated_wait_seconds(waiting),
        }
    }
}
