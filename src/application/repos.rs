//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::identity::CacheIdentity;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// A cached upstream response together with its write time.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub response: Value,
    pub created_at: OffsetDateTime,
}

/// Backing store for the `api_cache` relation.
///
/// Implementations enforce uniqueness over the full identity tuple; `upsert`
/// must overwrite an existing row rather than insert a second one.
#[async_trait]
pub trait CacheRepo: Send + Sync {
    /// Newest row for `identity` written at or after `fresh_since`.
    async fn find_fresh(
        &self,
        identity: &CacheIdentity,
        fresh_since: OffsetDateTime,
    ) -> Result<Option<CachedResponse>, RepoError>;

    async fn upsert(&self, identity: &CacheIdentity, response: &Value) -> Result<(), RepoError>;

    /// Remove every row written before `cutoff`, returning the number removed.
    async fn delete_created_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError>;

    /// Remove every row of `event_code` regardless of age.
    async fn delete_by_event(&self, event_code: &str) -> Result<u64, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;
}

#[derive(Debug, Clone)]
pub struct UserCredentialRecord {
    pub username: String,
    /// bcrypt hash in modular crypt format; the salt is embedded.
    pub password_hash: String,
}

#[async_trait]
pub trait UsersRepo: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<UserCredentialRecord>, RepoError>;

    async fn upsert_user(&self, record: UserCredentialRecord) -> Result<(), RepoError>;
}

/// Counts of outstanding durable fetch jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchQueueCounts {
    pub running: u64,
    pub pending: u64,
    pub scheduled: u64,
}

/// Persistence for the durable fetch queue and its hand-back table.
#[async_trait]
pub trait FetchJobsRepo: Send + Sync {
    /// Push a job payload into the queue, eligible for dispatch at `run_at`.
    async fn enqueue_fetch_job(
        &self,
        payload: Value,
        run_at: OffsetDateTime,
        max_attempts: i32,
    ) -> Result<String, RepoError>;

    async fn store_fetch_result(
        &self,
        ticket: Uuid,
        response: Option<&Value>,
    ) -> Result<(), RepoError>;

    /// Remove and return the result for `ticket`; the outer `None` means not yet available.
    async fn take_fetch_result(&self, ticket: Uuid) -> Result<Option<Option<Value>>, RepoError>;

    async fn fetch_queue_counts(&self) -> Result<FetchQueueCounts, RepoError>;

    /// Drop results nobody collected, e.g. after a submitter timed out.
    async fn purge_fetch_results_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError>;
}
