//! Rules over opaque upstream payloads and cache freshness.

use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;

/// An upstream payload that carries no data and must never be cached.
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// An entry written at `created_at` is fresh while `now - created_at <= window`.
pub fn is_fresh(created_at: OffsetDateTime, now: OffsetDateTime, window: Duration) -> bool {
    let age = now - created_at;
    age <= window
}

/// Earliest `created_at` still considered fresh at `now`.
pub fn freshness_cutoff(now: OffsetDateTime, window: Duration) -> OffsetDateTime {
    now - window
}
