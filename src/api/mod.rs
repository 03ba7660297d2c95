//! HTTP API for the staff service.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, patch, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use handlers::AppState;

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let staff = Router::new()
        .route("/", post(handlers::create_staff).get(handlers::list_staff))
        .route(
            "/:id",
            get(handlers::get_staff)
                .put(handlers::update_staff)
                .delete(handlers::delete_staff),
        )
        .route("/:id/assign-bus", post(handlers::assign_bus))
        .route("/:id/assign-route", post(handlers::assign_route))
        .route("/:id/unassign-bus", post(handlers::unassign_bus))
        .route("/:id/unassign-route", post(handlers::unassign_route))
        .route("/:id/status", patch(handlers::update_status));

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/staff", staff)
        .fallback(handlers::not_found)
        // State
        .with_state(state)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
