//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::control;
use super::handlers;
use super::state::AppState;

/// Create the application router. Unmatched paths are app traffic and go to
/// the session named by the access-code cookie.
pub fn create_router(state: AppState) -> Router {
    let max_body_size = state.registry.settings().max_proxy_body_bytes;

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::launch_session),
        )
        .route("/sessions/import", post(handlers::import_session))
        .route(
            "/sessions/{access_code}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{access_code}/exec", post(handlers::exec_command))
        .route("/sessions/{access_code}/commit", post(handlers::commit_session))
        .route("/sessions/{access_code}/copy-docs", post(handlers::copy_docs))
        .route("/sessions/{access_code}/suspend", post(handlers::suspend_session))
        .route("/reconcile", post(handlers::reconcile))
        .route("/control", get(control::control_ws));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .fallback(handlers::app_fallback)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(trace_layer)
        .with_state(state)
}
