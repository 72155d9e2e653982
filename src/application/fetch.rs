//! Outbound fetch jobs, the retry policy, and the [`Fetcher`] seam.
//!
//! A [`Fetcher`] is the single admission-control point for upstream calls.
//! Two backends implement it: an in-process bounded pool and a durable
//! Postgres-backed job queue. Callers only see `submit(job) -> outcome`.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::identity::CacheIdentity;

const TARGET: &str = "eventmirror::fetch";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream fetch for `{identity}` exceeded the {timeout:?} job timeout")]
    Timeout {
        identity: String,
        timeout: Duration,
    },
    #[error("fetch queue is not ready to accept jobs")]
    NotReady,
    #[error("fetch queue error: {0}")]
    Queue(String),
}

impl FetchError {
    pub fn queue(message: impl std::fmt::Display) -> Self {
        Self::Queue(message.to_string())
    }
}

/// One outbound upstream call plus its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchJob {
    pub identity: CacheIdentity,
    /// Attempts already made for this job.
    pub attempts: u32,
    /// Total time already spent in backoff.
    #[serde(with = "duration_millis")]
    pub waited: Duration,
}

impl FetchJob {
    pub fn new(identity: CacheIdentity) -> Self {
        Self {
            identity,
            attempts: 0,
            waited: Duration::ZERO,
        }
    }

    /// Record a rate-limited attempt followed by a backoff of `delay`.
    pub fn rescheduled(mut self, delay: Duration) -> Self {
        self.waited += delay;
        self
    }
}

/// Classified result of a single HTTP attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResponse {
    Payload(Value),
    Empty,
    NotFound,
    RateLimited,
    Rejected { status: u16 },
    Unavailable { reason: String },
}

/// Performs one upstream HTTP attempt for a job.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn attempt(&self, identity: &CacheIdentity) -> UpstreamResponse;

    /// Fully-qualified upstream URL for `identity`, used in logs.
    fn describe(&self, identity: &CacheIdentity) -> String;
}

/// What the queue should do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptVerdict {
    Done(Option<Value>),
    RetryAfter(Duration),
}

/// Exponential backoff bounded by a wait budget and an attempt count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_wait: Duration,
    pub max_attempts: NonZeroU32,
    pub job_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            multiplier: 2,
            max_wait: Duration::from_secs(120),
            max_attempts: NonZeroU32::new(8).unwrap_or(NonZeroU32::MIN),
            job_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(retry.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&self, attempts_made: u32, waited: Duration) -> Option<Duration> {
        if attempts_made >= self.max_attempts.get() {
            return None;
        }
        let delay = self.delay_for(attempts_made);
        if waited.saturating_add(delay) > self.max_wait {
            return None;
        }
        Some(delay)
    }

    /// Decide the fate of `job` after an attempt returned `response`.
    ///
    /// `job.attempts` must already count the attempt being judged.
    pub fn judge(&self, job: &FetchJob, url: &str, response: UpstreamResponse) -> AttemptVerdict {
        match response {
            UpstreamResponse::Payload(value) => {
                counter!("eventmirror_upstream_response_total", "class" => "ok").increment(1);
                info!(target = TARGET, url, attempts = job.attempts, "upstream response received");
                AttemptVerdict::Done(Some(value))
            }
            UpstreamResponse::Empty => {
                counter!("eventmirror_upstream_response_total", "class" => "empty").increment(1);
                warn!(target = TARGET, url, "empty upstream response");
                AttemptVerdict::Done(None)
            }
            UpstreamResponse::NotFound => {
                counter!("eventmirror_upstream_response_total", "class" => "not_found")
                    .increment(1);
                warn!(target = TARGET, url, "upstream has no such record");
                AttemptVerdict::Done(None)
            }
            UpstreamResponse::RateLimited => {
                counter!("eventmirror_upstream_response_total", "class" => "rate_limited")
                    .increment(1);
                match self.next_delay(job.attempts, job.waited) {
                    Some(delay) => {
                        counter!("eventmirror_upstream_retry_total").increment(1);
                        warn!(
                            target = TARGET,
                            url,
                            attempt = job.attempts,
                            delay_ms = delay.as_millis() as u64,
                            "upstream rate limit hit; backing off"
                        );
                        AttemptVerdict::RetryAfter(delay)
                    }
                    None => {
                        counter!("eventmirror_upstream_retry_exhausted_total").increment(1);
                        error!(
                            target = TARGET,
                            url,
                            attempts = job.attempts,
                            waited_ms = job.waited.as_millis() as u64,
                            "retry budget exhausted"
                        );
                        AttemptVerdict::Done(None)
                    }
                }
            }
            UpstreamResponse::Rejected { status } => {
                counter!("eventmirror_upstream_response_total", "class" => "rejected")
                    .increment(1);
                error!(target = TARGET, url, status, "non-retriable upstream error");
                AttemptVerdict::Done(None)
            }
            UpstreamResponse::Unavailable { reason } => {
                counter!("eventmirror_upstream_response_total", "class" => "unavailable")
                    .increment(1);
                error!(target = TARGET, url, reason = %reason, "upstream request failed");
                AttemptVerdict::Done(None)
            }
        }
    }
}

/// Snapshot of the admission queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub backend: &'static str,
    pub ready: bool,
    /// Jobs currently holding an admission slot.
    pub active: usize,
    /// Jobs waiting for an admission slot.
    pub waiting: usize,
    /// Jobs sleeping through a backoff delay.
    pub delayed: usize,
    pub concurrency: usize,
    pub estimated_wait_seconds: u64,
}

/// Admission-controlled access to the upstream service.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Run `job` to completion: `Ok(None)` means the upstream had no data.
    async fn submit(&self, job: FetchJob) -> Result<Option<Value>, FetchError>;

    async fn status(&self) -> QueueStatus;

    async fn fetch(&self, identity: &CacheIdentity) -> Result<Option<Value>, FetchError> {
        self.submit(FetchJob::new(identity.clone())).await
    }
}

/// Rough wait estimate assuming two seconds per queued job.
pub fn estimated_wait_seconds(waiting: usize) -> u64 {
    (waiting as u64).saturating_mul(2)
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
