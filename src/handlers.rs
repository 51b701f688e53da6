use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
};
use metrics::counter;
use std::collections::BTreeMap;

use crate::AppState;
use crate::errors::ApiError;
use crate::types::{EmotionResponse, ErrorResponse, HealthResponse, ServiceInfo};
use crate::upload::read_upload;

pub const SERVICE_NAME: &str = "Face Emotion Detection API";

/// Service information.
#[utoipa::path(
    get,
    path = "/",
    tag = "service",
    responses((status = 200, description = "Static service metadata", body = ServiceInfo))
)]
pub async fn root() -> Json<ServiceInfo> {
    let endpoints = BTreeMap::from([
        ("analyze_emotion".to_string(), "/analyze-emotion (POST)".to_string()),
        ("health".to_string(), "/health (GET)".to_string()),
    ]);
    Json(ServiceInfo {
        message: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        docs: "/docs".to_string(),
        endpoints,
    })
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "service",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
    })
}

/// Detect the dominant emotion on the face in an uploaded image.
#[utoipa::path(
    post,
    path = "/analyze-emotion",
    tag = "emotion",
    summary = "Analyze emotion",
    description = "Upload a JPEG, PNG, BMP, TIFF or WebP image (at most 10 MB by default) in the `file` field.
The most confident face in the image is analyzed and its dominant emotion returned.",
    request_body(
        content_type = "multipart/form-data",
        description = "Image upload in the `file` field"
    ),
    responses(
        (status = 200, description = "Emotion detected", body = EmotionResponse),
        (status = 400, description = "Missing file, unsupported format, file too large, invalid image, or no face detected", body = ErrorResponse),
        (status = 500, description = "Internal error during emotion analysis", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn analyze_emotion(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<EmotionResponse>, ApiError> {
    let result = analyze(&state, multipart).await;
    let outcome = match &result {
        Ok(_) => "success",
        Err(err) => err.code(),
    };
    counter!("emotion_requests_total", "outcome" => outcome).increment(1);
    result
}

async fn analyze(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<EmotionResponse>, ApiError> {
    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!(%rejection, "Request is not a multipart upload");
        ApiError::MissingFile
    })?;

    let upload = read_upload(&mut multipart, state.limits.max_upload_bytes).await?;
    tracing::info!(
        file_name = ?upload.file_name,
        format = ?upload.format,
        size = upload.bytes.len(),
        "Processing emotion analysis request"
    );

    let image = tokio::task::spawn_blocking(move || upload.decode())
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Image decode task failed: {e}")))??;

    // the first request may have to load the models; that is not capped
    state.engine.ready().await?;

    let timeout = state.limits.classify_timeout;
    let scores = tokio::time::timeout(timeout, state.engine.classify(image))
        .await
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("Classification timed out after {timeout:?}")))??;

    let emotion = scores.dominant();
    tracing::debug!(scores = ?scores.iter().collect::<Vec<_>>(), "Emotion scores");
    tracing::info!(%emotion, confidence = scores.get(emotion), "Detected emotion");
    counter!("emotion_detections_total", "emotion" => emotion.as_str()).increment(1);

    Ok(Json(EmotionResponse { emotion }))
}
