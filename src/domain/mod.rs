//! Domain layer types and invariants.

pub mod error;
pub mod hydration;
pub mod identity;
pub mod payload;
