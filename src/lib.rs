//! Caching mirror for an upstream event-management API.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
