//! Application services: caching, admission control, hydration, maintenance.

pub mod cache;
pub mod error;
pub mod fetch;
pub mod hydration;
pub mod jobs;
pub mod maintenance;
pub mod repos;
pub mod resolver;
pub mod users;
