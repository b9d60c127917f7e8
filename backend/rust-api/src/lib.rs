use axum::{
    http::{header, HeaderName, Method},
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(middlewares::trace::TRACE_ID_HEADER),
        ])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        // Metrics endpoint with Basic Auth protection
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/v1/exam-sessions", exam_session_routes().layer(cors))
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn exam_session_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(handlers::sessions::create_session))
        .route("/{id}", get(handlers::sessions::get_session))
        .route("/{id}/start", post(handlers::sessions::start_session))
        .route("/{id}/finish", post(handlers::sessions::finish_session))
        .route("/{id}/cancel", post(handlers::sessions::cancel_session))
        .route("/{id}/leaderboard", get(handlers::sessions::get_leaderboard))
        .route("/{id}/stream", get(handlers::sse::session_stream))
        .route("/{id}/participants", post(handlers::sessions::join_session))
        .route(
            "/{id}/participants/{student_id}/answers",
            post(handlers::sessions::submit_answer),
        )
        .route(
            "/{id}/participants/{student_id}/draft",
            put(handlers::sessions::autosave_draft),
        )
        .route(
            "/{id}/participants/{student_id}/complete",
            post(handlers::sessions::complete_for_student),
        )
}
