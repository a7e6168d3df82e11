use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub mod attempt;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Metrics endpoint with Basic Auth protection
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/v1", attempt_routes())
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(
                    middlewares::trace::trace_context_middleware,
                ))
                .layer(middleware::from_fn(
                    middlewares::metrics::metrics_middleware,
                )),
        )
}

fn attempt_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/verify-code", post(handlers::sessions::verify_code))
        .route("/sessions", post(handlers::sessions::start_session))
        .route("/sessions/{id}", get(handlers::sessions::get_session))
        .route(
            "/sessions/{id}/audit",
            post(handlers::sessions::record_audit).get(handlers::sessions::audit_trail),
        )
        .route("/sessions/{id}/lock", post(handlers::sessions::lock_session))
        .route(
            "/sessions/{id}/submit",
            post(handlers::sessions::submit_session),
        )
        .route("/subjects/{id}/items", get(handlers::sessions::list_items))
}
