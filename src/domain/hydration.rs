//! Hydration plans and the reports produced by hydration runs.

use serde::Serialize;
use serde_json::Value;

use super::identity::QueryParams;

pub const REGISTRATION_LIST_OBJECT: &str = "RegistrationList";

/// One sub-request of a hydration plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubRequest {
    pub object: String,
    pub identifier_code: Option<String>,
    pub query_params: QueryParams,
}

impl SubRequest {
    fn new(object: &str, identifier_code: Option<&str>, query_params: QueryParams) -> Self {
        Self {
            object: object.to_string(),
            identifier_code: identifier_code.map(str::to_string),
            query_params,
        }
    }
}

/// Fixed, ordered list of sub-requests that warm the cache for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationPlan {
    pub entity_id: String,
    pub requests: Vec<SubRequest>,
}

impl HydrationPlan {
    /// Plan for a single registrant of an event.
    pub fn registrant(reg_code: &str) -> Self {
        let reg = Some(reg_code);
        let requests = vec![
            SubRequest::new("Registration", reg, QueryParams::new()),
            SubRequest::new(
                "Registration",
                reg,
                QueryParams::new().with("includeList", "profile_questions"),
            ),
            SubRequest::new(
                "Registration",
                reg,
                QueryParams::new().with("includeList", "registration_questions"),
            ),
            SubRequest::new(
                "Registration",
                reg,
                QueryParams::new()
                    .with("includeList", "travel_questions")
                    .with("max_results", "500"),
            ),
            SubRequest::new(
                "Registration",
                None,
                QueryParams::new()
                    .with("registrationCode", reg_code)
                    .with("includeList", "registration_questions"),
            ),
            SubRequest::new(
                "RegistrationAgenda",
                reg,
                QueryParams::new().with("orderBy", "startDate_asc"),
            ),
            SubRequest::new(
                "Accommodation",
                reg,
                QueryParams::new().with("orderBy", "arrivalDate_asc"),
            ),
        ];

        Self {
            entity_id: reg_code.to_string(),
            requests,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Registration codes accepted on the per-entity hydration route: digits and dashes.
pub fn is_registration_code(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit() || b == b'-')
}

/// Query used to discover the active registrants of an event.
pub fn registrant_discovery_params() -> QueryParams {
    QueryParams::new()
        .with("isActive", "true")
        .with("listFields", "registrationCode")
        .with("isTestMode", "false")
}

/// Extract registrant codes from a `RegistrationList` payload.
///
/// Codes may be strings or numbers upstream; both are rendered as strings.
/// Entries without a usable code are ignored.
pub fn registrant_codes(payload: &Value) -> Vec<String> {
    payload
        .get("registrationList")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| match entry.get("registrationCode") {
                    Some(Value::String(code)) if !code.trim().is_empty() => Some(code.clone()),
                    Some(Value::Number(code)) => Some(code.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyCached,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubRequestStatus {
    Skipped { reason: SkipReason },
    Cached,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubRequestOutcome {
    #[serde(flatten)]
    pub request: SubRequest,
    #[serde(flatten)]
    pub status: SubRequestStatus,
}

/// Outcome of hydrating one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityHydrationReport {
    pub event_code: String,
    pub entity_id: String,
    pub results: Vec<SubRequestOutcome>,
}

impl EntityHydrationReport {
    pub fn failures(&self) -> impl Iterator<Item = &SubRequestOutcome> {
        self.results
            .iter()
            .filter(|outcome| matches!(outcome.status, SubRequestStatus::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn count(&self, predicate: impl Fn(&SubRequestStatus) -> bool) -> usize {
        self.results.iter().filter(|o| predicate(&o.status)).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Hydrated { details: EntityHydrationReport },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    #[serde(flatten)]
    pub status: EntityStatus,
}

impl EntityOutcome {
    pub fn is_hydrated(&self) -> bool {
        matches!(self.status, EntityStatus::Hydrated { .. })
    }
}

/// Outcome of hydrating every entity of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventHydrationReport {
    NoWork {
        event_code: String,
        reason: String,
    },
    Completed {
        event_code: String,
        total: usize,
        hydrated: usize,
        failed: usize,
        results: Vec<EntityOutcome>,
    },
}

impl EventHydrationReport {
    pub fn completed(event_code: &str, results: Vec<EntityOutcome>) -> Self {
        let hydrated = results.iter().filter(|r| r.is_hydrated()).count();
        Self::Completed {
            event_code: event_code.to_string(),
            total: results.len(),
            hydrated,
            failed: results.len() - hydrated,
            results,
        }
    }
}
