//! HTTP admission surface for the job queue.
//!
//! Stands in for the chat transport: validated requests become queued jobs,
//! and users can look up or cancel their own job.

pub mod error;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, StatusCode};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use editbot_core::params::{ParamDefaults, ParamLimits};

use crate::queue::JobQueue;

/// Shared state for intake handlers. Cheap to clone.
#[derive(Clone)]
pub struct IntakeState {
    pub queue: Arc<JobQueue>,
    pub defaults: Arc<ParamDefaults>,
    pub limits: Arc<ParamLimits>,
}

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}

/// Routes under `/api/v1`.
pub fn api_routes() -> Router<IntakeState> {
    Router::new()
        .route("/jobs", axum::routing::post(handlers::create_job))
        .route("/queue", get(handlers::queue_status))
        .route(
            "/users/{user_id}/job",
            get(handlers::get_user_job).delete(handlers::cancel_user_job),
        )
}

/// Full intake application with the middleware stack.
pub fn router(state: IntakeState, request_timeout: Duration) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_routes())
        // -- Middleware stack (applied bottom-up) --
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}
