use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::application::{
    fetch::{RetryPolicy, UpstreamTransport},
    maintenance::MaintenanceService,
    repos::FetchJobsRepo,
};

/// Shared context passed to the durable fetch worker.
#[derive(Clone)]
pub struct FetchWorkerContext {
    pub jobs: Arc<dyn FetchJobsRepo>,
    pub transport: Arc<dyn UpstreamTransport>,
    pub policy: RetryPolicy,
}

/// Context for the scheduled cache sweep worker.
#[derive(Clone)]
pub struct SweepContext {
    pub maintenance: MaintenanceService,
    pub retention_hours: u64,
    /// Present when the durable queue is active, so orphaned results are purged too.
    pub fetch_jobs: Option<Arc<dyn FetchJobsRepo>>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}
