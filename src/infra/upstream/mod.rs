//! Outbound access to the upstream event-management API.

mod client;
mod pool;

pub use client::{UpstreamClient, UpstreamCredentials};
pub use pool::MemoryFetchPool;
