//! Durable fetch queue backed by apalis Postgres storage.
//!
//! Each queue entry carries its attempt count and accumulated backoff. A
//! rate-limited attempt is not slept through inside the worker: the entry is
//! pushed back with a future `run_at`, freeing the worker slot until the
//! backoff elapses. The final outcome is written to a hand-back table that the
//! submitter polls.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use apalis::prelude::{Data, Error as ApalisError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::{
    fetch::{
        AttemptVerdict, FetchError, FetchJob, Fetcher, QueueStatus, RetryPolicy,
        estimated_wait_seconds,
    },
    repos::{FetchJobsRepo, RepoError},
};

use super::context::{FetchWorkerContext, job_failed};

/// Namespace of the fetch jobs inside the apalis storage.
pub const FETCH_JOB_NAMESPACE: &str = "eventmirror::FetchUpstream";

/// apalis-level attempts per queue entry; rate-limit retries are new entries.
const STORAGE_MAX_ATTEMPTS: i32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchJobPayload {
    pub ticket: Uuid,
    pub job: FetchJob,
}

/// Worker entry point: one upstream attempt per queue entry.
pub async fn process_fetch_job(
    payload: FetchJobPayload,
    context: Data<FetchWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;
    let FetchJobPayload { ticket, mut job } = payload;

    job.attempts += 1;
    let url = ctx.transport.describe(&job.identity);
    let response = ctx.transport.attempt(&job.identity).await;

    match ctx.policy.judge(&job, &url, response) {
        AttemptVerdict::Done(result) => {
            ctx.jobs
                .store_fetch_result(ticket, result.as_ref())
                .await
                .map_err(job_failed)?;
        }
        AttemptVerdict::RetryAfter(delay) => {
            let run_at = OffsetDateTime::now_utc() + delay;
            let next = FetchJobPayload {
                ticket,
                job: job.rescheduled(delay),
            };
            let payload = serde_json::to_value(&next)
                .map_err(|err| job_failed(RepoError::from_persistence(err)))?;
            ctx.jobs
                .enqueue_fetch_job(payload, run_at, STORAGE_MAX_ATTEMPTS)
                .await
                .map_err(job_failed)?;
        }
    }

    Ok(())
}

/// [`Fetcher`] that submits jobs to the durable queue and waits for their result.
pub struct DurableFetchQueue {
    jobs: Arc<dyn FetchJobsRepo>,
    policy: RetryPolicy,
    concurrency: usize,
    poll_interval: Duration,
    ready: Arc<AtomicBool>,
}

impl DurableFetchQueue {
    pub fn new(
        jobs: Arc<dyn FetchJobsRepo>,
        policy: RetryPolicy,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            jobs,
            policy,
            concurrency,
            poll_interval,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Accept submissions; called once the worker monitor is running.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn mark_stopped(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn await_result(&self, ticket: Uuid) -> Result<Option<Value>, FetchError> {
        loop {
            if let Some(result) = self
                .jobs
                .take_fetch_result(ticket)
                .await
                .map_err(FetchError::queue)?
            {
                return Ok(result);
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Fetcher for DurableFetchQueue {
    async fn submit(&self, job: FetchJob) -> Result<Option<Value>, FetchError> {
        if !self.is_ready() {
            return Err(FetchError::NotReady);
        }

        let ticket = Uuid::new_v4();
        let identity = job.identity.to_string();
        let payload = serde_json::to_value(FetchJobPayload { ticket, job })
            .map_err(FetchError::queue)?;
        let job_id = self
            .jobs
            .enqueue_fetch_job(payload, OffsetDateTime::now_utc(), STORAGE_MAX_ATTEMPTS)
            .await
            .map_err(FetchError::queue)?;
        debug!(
            target = "eventmirror::fetch::durable",
            job_id = %job_id,
            ticket = %ticket,
            identity = %identity,
            "queued upstream fetch"
        );

        match timeout(self.policy.job_timeout, self.await_result(ticket)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target = "eventmirror::fetch::durable",
                    job_id = %job_id,
                    identity = %identity,
                    "durable fetch timed out"
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
        let counts = match self.jobs.fetch_queue_counts().await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(
                    target = "eventmirror::fetch::durable",
                    error = %err,
                    "failed to read queue counts"
                );
                Default::default()
            }
        };
        let waiting = counts.pending as usize;

        QueueStatus {
            backend: "durable",
            ready: self.is_ready(),
            active: counts.running as usize,
            waiting,
            delayed: counts.scheduled as usize,
            concurrency: self.concurrency,
            estimated_wait_seconds: estimated_wait_seconds(waiting),
        }
    }
}
