//! axum HTTP surface: mirrored upstream routes, hydration, maintenance, monitoring.

mod handlers;
mod middleware;
mod state;

pub use state::AppState;

use axum::{Router, middleware as axum_middleware, routing::get};

use middleware::{log_responses, require_basic_auth, set_request_context};

/// Inbound path prefix mirroring the upstream API layout.
pub const MIRROR_PREFIX: &str = "/certainExternal/service/v1";

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            &format!("{MIRROR_PREFIX}/{{object}}/{{account}}"),
            get(handlers::resolve),
        )
        .route(
            &format!("{MIRROR_PREFIX}/{{object}}/{{account}}/{{event}}"),
            get(handlers::resolve),
        )
        .route(
            &format!("{MIRROR_PREFIX}/{{object}}/{{account}}/{{event}}/{{identifier}}"),
            get(handlers::resolve),
        )
        .route("/hydrate/{event}", get(handlers::hydrate_event))
        .route("/hydrate/{event}/{reg_code}", get(handlers::hydrate_entity))
        .route(
            "/maintenance/clear/event/{event}",
            get(handlers::clear_event),
        )
        .route("/maintenance/clear/all", get(handlers::clear_all))
        .route(
            "/maintenance/clear/all/{hours}",
            get(handlers::clear_older_than),
        )
        .route(
            "/maintenance/refresh/event/{event}",
            get(handlers::refresh_event),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ));

    let open = Router::new()
        .route("/monitor/queue-status", get(handlers::queue_status))
        .route("/health", get(handlers::health));

    protected
        .merge(open)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
