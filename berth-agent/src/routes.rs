//! Router assembly.

use crate::auth::auth_middleware;
use crate::handlers::{
    health_handler, operation_status_handler, start_operation_handler, stream_operation_handler,
};
use crate::hub::status_ws_handler;
use crate::state::AppState;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/stacks/{name}/operations", post(start_operation_handler))
        .route("/operations/{id}/stream", get(stream_operation_handler))
        .route("/operations/{id}/status", get(operation_status_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let ws = Router::new()
        .route("/agent/status", get(status_ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .nest("/ws", ws)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
