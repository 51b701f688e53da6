pub mod candle_engine;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod lazy_engine;
pub mod models;
pub mod openapi;
pub mod types;
pub mod upload;

use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use config::UploadConfig;
use engine::EmotionEngine;
use openapi::ApiDoc;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<dyn EmotionEngine>,
    limits: UploadConfig,
}

impl AppState {
    pub fn new(engine: Arc<dyn EmotionEngine>, limits: UploadConfig) -> Self {
        Self { engine, limits }
    }
}

/// API routes plus generated docs. Metrics are layered on by the binary.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        // upload size is enforced while streaming the file field
        .route(
            "/analyze-emotion",
            post(handlers::analyze_emotion).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
