mod context;
mod fetch;
mod sweep;

pub use context::{FetchWorkerContext, SweepContext, job_failed};
pub use fetch::{DurableFetchQueue, FETCH_JOB_NAMESPACE, FetchJobPayload, process_fetch_job};
pub use sweep::{SweepCacheJob, process_sweep_cache_job, sweep_schedule};
