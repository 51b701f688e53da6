use utoipa::OpenApi;

use crate::handlers;
use crate::types::{EmotionLabel, EmotionResponse, ErrorResponse, HealthResponse, ServiceInfo};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Face Emotion Detection API",
        description = "Detects the dominant emotion on a face in an uploaded image."
    ),
    paths(handlers::root, handlers::health, handlers::analyze_emotion),
    components(schemas(EmotionLabel, EmotionResponse, ErrorResponse, HealthResponse, ServiceInfo)),
    tags(
        (name = "emotion", description = "Facial emotion analysis"),
        (name = "service", description = "Service metadata and liveness")
    )
)]
pub struct ApiDoc;
