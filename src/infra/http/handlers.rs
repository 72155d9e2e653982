use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::Value;

use crate::application::{
    error::{AppError, ErrorReport},
    fetch::QueueStatus,
    hydration::{HydrationService, ResetReport},
    maintenance::{DEFAULT_SWEEP_HOURS, EventSweepReport, SweepReport},
};
use crate::domain::hydration::{
    EntityHydrationReport, EventHydrationReport, is_registration_code,
};
use crate::domain::identity::{CacheIdentity, QueryParams};
use crate::infra::error::InfraError;

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct ResolvePath {
    object: String,
    account: String,
    event: Option<String>,
    identifier: Option<String>,
}

/// Answer a mirrored upstream request from the cache or the upstream.
pub(super) async fn resolve(
    State(state): State<AppState>,
    Path(path): Path<ResolvePath>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Option<Value>>, AppError> {
    let identity = CacheIdentity::new(
        path.object,
        path.account,
        path.event,
        path.identifier,
        params.into_iter().collect::<QueryParams>(),
    )?;
    let response = state.resolver.resolve(&identity).await?;
    Ok(Json(response))
}

pub(super) async fn hydrate_entity(
    State(state): State<AppState>,
    Path((event_code, reg_code)): Path<(String, String)>,
) -> Result<Json<EntityHydrationReport>, AppError> {
    if !is_registration_code(&reg_code) {
        return Err(AppError::validation(format!(
            "registration code `{reg_code}` must contain only digits and dashes"
        )));
    }
    let hydration = require_hydration(&state)?;
    Ok(Json(hydration.hydrate_entity(&event_code, &reg_code).await))
}

pub(super) async fn hydrate_event(
    State(state): State<AppState>,
    Path(event_code): Path<String>,
) -> Result<Json<EventHydrationReport>, AppError> {
    let hydration = require_hydration(&state)?;
    Ok(Json(hydration.hydrate_event(&event_code).await))
}

pub(super) async fn clear_event(
    State(state): State<AppState>,
    Path(event_code): Path<String>,
) -> Result<Json<EventSweepReport>, AppError> {
    Ok(Json(state.maintenance.sweep_event(&event_code).await?))
}

pub(super) async fn clear_all(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(
        state.maintenance.sweep_older_than(DEFAULT_SWEEP_HOURS).await?,
    ))
}

pub(super) async fn clear_older_than(
    State(state): State<AppState>,
    Path(hours): Path<u64>,
) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.maintenance.sweep_older_than(hours).await?))
}

pub(super) async fn refresh_event(
    State(state): State<AppState>,
    Path(event_code): Path<String>,
) -> Result<Json<ResetReport>, AppError> {
    let hydration = require_hydration(&state)?;
    Ok(Json(hydration.reset_event(&event_code).await?))
}

pub(super) async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.resolver.fetcher().status().await)
}

pub(super) async fn health(State(state): State<AppState>) -> Response {
    match state.resolver.cache().health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

fn require_hydration(state: &AppState) -> Result<&HydrationService, AppError> {
    state.hydration.as_ref().ok_or_else(|| {
        AppError::from(InfraError::configuration(
            "hydration requires upstream.default_account_code",
        ))
    })
}
