use crate::types::EmotionScores;
use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifyError {
    /// The image decoded fine but the detector found no face in it
    #[error("No face detected in the image")]
    NoFace,

    /// Anything else that went wrong while running the models
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Face detection plus emotion classification for a single image.
#[async_trait]
pub trait EmotionEngine: Send + Sync {
    /// Waits until the engine can serve requests. Engines that load their
    /// models up front are always ready.
    async fn ready(&self) -> Result<(), ClassifyError> {
        Ok(())
    }

    async fn classify(&self, image: DynamicImage) -> Result<EmotionScores, ClassifyError>;
}
