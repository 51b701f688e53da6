use anyhow::{Result, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_nn::ops::softmax;
use hf_hub::{Repo, RepoType, api::tokio::Api};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ModelConfig, WeightsSource};
use crate::engine::{ClassifyError, EmotionEngine};
use crate::models::blazeface::{self, Anchor, BlazeFace, Detection};
use crate::models::emotion_net::{self, EmotionNet};
use crate::types::EmotionScores;

/// BlazeFace detection followed by the expression CNN on the best face.
pub struct CandleEmotionEngine {
    models: Arc<Models>,
}

struct Models {
    detector: BlazeFace,
    anchors: Vec<Anchor>,
    emotion: EmotionNet,
    device: Device,
    min_face_score: f32,
}

impl CandleEmotionEngine {
    /// Both networks share one device. They are small enough that CPU is a
    /// usable fallback, so a missing GPU is logged rather than fatal.
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Running face and emotion models on metal");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Running face and emotion models on CUDA");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "No GPU available, running face and emotion models on CPU (build with `--features cuda` or `metal` for GPU)"
            );
            Ok(Device::Cpu)
        }
    }

    #[tracing::instrument(skip(config), fields(cpu = config.cpu))]
    pub async fn new(config: ModelConfig) -> Result<Self> {
        let device = Self::device(config.cpu)?;

        let detector_file = fetch_weights(&config.detector).await?;
        let emotion_file = fetch_weights(&config.emotion).await?;
        tracing::debug!(detector = %detector_file.display(), emotion = %emotion_file.display(), "Weights resolved");

        let detector = BlazeFace::load(var_builder(&config.detector, &detector_file, &device)?)?;
        let emotion = EmotionNet::load(var_builder(&config.emotion, &emotion_file, &device)?)?;

        Ok(Self {
            models: Arc::new(Models {
                detector,
                anchors: blazeface::gen_anchors(),
                emotion,
                device,
                min_face_score: config.min_face_score,
            }),
        })
    }
}

async fn fetch_weights(source: &WeightsSource) -> Result<PathBuf> {
    match source {
        WeightsSource::Local(path) => {
            if !path.is_file() {
                bail!("Weights file {} does not exist.", path.display());
            }
            Ok(path.clone())
        }
        WeightsSource::Hub {
            repo,
            revision,
            filename,
        } => {
            let repo = Repo::with_revision(repo.clone(), RepoType::Model, revision.clone());
            let api = Api::new()?;
            let api = api.repo(repo);
            Ok(api.get(filename).await?)
        }
    }
}

fn var_builder(source: &WeightsSource, file: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let is_pickle = Path::new(source.file_name())
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "pth" | "pt" | "bin"));

    if is_pickle {
        Ok(VarBuilder::from_pth(file, DType::F32, device)?)
    } else {
        Ok(unsafe { VarBuilder::from_mmaped_safetensors(&[file], DType::F32, device)? })
    }
}

/// Pixel rectangle of a face in the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FaceRegion {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// How the source image was fitted into the square detector input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

fn letterbox(image: &DynamicImage, size: u32) -> (RgbImage, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = size as f32 / width.max(height) as f32;
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);
    let resized = image
        .resize_exact(new_width, new_height, FilterType::Triangle)
        .to_rgb8();

    let pad_x = (size - new_width) / 2;
    let pad_y = (size - new_height) / 2;
    let mut canvas = RgbImage::new(size, size);
    imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

impl Letterbox {
    /// Maps a normalized detection onto the source image, clamped to its bounds.
    fn to_source(&self, d: &Detection, width: u32, height: u32) -> Option<FaceRegion> {
        let size = blazeface::INPUT_SIZE as f32;
        let map_x = |v: f32| ((v * size - self.pad_x) / self.scale).clamp(0.0, width as f32);
        let map_y = |v: f32| ((v * size - self.pad_y) / self.scale).clamp(0.0, height as f32);

        let x = map_x(d.xmin).floor() as u32;
        let y = map_y(d.ymin).floor() as u32;
        let right = map_x(d.xmax).ceil() as u32;
        let bottom = map_y(d.ymax).ceil() as u32;

        let region = FaceRegion {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
        };
        (region.width > 0 && region.height > 0).then_some(region)
    }
}

impl Models {
    fn classify(&self, image: &DynamicImage) -> Result<EmotionScores, ClassifyError> {
        let Some(face) = self.detect_face(image)? else {
            return Err(ClassifyError::NoFace);
        };
        tracing::debug!(?face, "Face detected");
        Ok(self.score_face(image, face)?)
    }

    fn detect_face(&self, image: &DynamicImage) -> Result<Option<FaceRegion>> {
        let size = blazeface::INPUT_SIZE;
        let (canvas, fit) = letterbox(image, size as u32);

        let input = Tensor::from_vec(canvas.into_raw(), (size, size, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 127.5, -1.0)?
            .unsqueeze(0)?;

        let (boxes, logits) = self.detector.forward(&input)?;
        let boxes = boxes.squeeze(0)?.to_vec2::<f32>()?;
        let logits = logits.squeeze(0)?.squeeze(1)?.to_vec1::<f32>()?;

        let Some(detection) =
            blazeface::best_detection(&boxes, &logits, &self.anchors, self.min_face_score)
        else {
            return Ok(None);
        };
        tracing::debug!(score = detection.score, "Best face candidate");

        let (width, height) = image.dimensions();
        Ok(fit.to_source(&detection, width, height))
    }

    fn score_face(&self, image: &DynamicImage, face: FaceRegion) -> Result<EmotionScores> {
        let size = emotion_net::INPUT_SIZE;
        let gray = image
            .crop_imm(face.x, face.y, face.width, face.height)
            .to_luma8();
        let gray = imageops::resize(&gray, size as u32, size as u32, FilterType::Triangle);

        let input = Tensor::from_vec(gray.into_raw(), (1, 1, size, size), &self.device)?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?;

        let logits = self.emotion.forward(&input)?;
        let probs = softmax(&logits, 1)?.squeeze(0)?.to_vec1::<f32>()?;
        EmotionScores::from_probabilities(&probs)
    }
}

#[async_trait]
impl EmotionEngine for CandleEmotionEngine {
    #[tracing::instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    async fn classify(&self, image: DynamicImage) -> Result<EmotionScores, ClassifyError> {
        let models = self.models.clone();
        tokio::task::spawn_blocking(move || models.classify(&image))
            .await
            .map_err(|e| ClassifyError::Failed(e.into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    /// Engine whose networks output constants: every anchor scores 0.5 and
    /// every 16x16-grid anchor predicts a square box of side `box_size`.
    fn constant_engine(min_face_score: f32, box_size: f32) -> CandleEmotionEngine {
        let mut detector_vars = VarMap::new();
        let detector =
            BlazeFace::load(VarBuilder::from_varmap(&detector_vars, DType::F32, &Device::Cpu))
                .unwrap();
        for var in detector_vars.all_vars() {
            var.set(&var.zeros_like().unwrap()).unwrap();
        }
        let mut bias = vec![0f32; 32];
        for anchor in 0..2 {
            bias[anchor * 16 + 2] = box_size * blazeface::INPUT_SIZE as f32;
            bias[anchor * 16 + 3] = box_size * blazeface::INPUT_SIZE as f32;
        }
        detector_vars
            .set_one("regressor_8.bias", Tensor::from_vec(bias, 32, &Device::Cpu).unwrap())
            .unwrap();

        let emotion = EmotionNet::load(VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap();

        CandleEmotionEngine {
            models: Arc::new(Models {
                detector,
                anchors: blazeface::gen_anchors(),
                emotion,
                device: Device::Cpu,
                min_face_score,
            }),
        }
    }

    #[test]
    fn letterbox_centers_wide_images() {
        let image = DynamicImage::new_rgb8(256, 128);
        let (canvas, fit) = letterbox(&image, 128);
        assert_eq!(canvas.dimensions(), (128, 128));
        assert_eq!(fit, Letterbox { scale: 0.5, pad_x: 0.0, pad_y: 32.0 });
    }

    #[test]
    fn detections_map_back_to_source_pixels() {
        let fit = Letterbox { scale: 0.5, pad_x: 0.0, pad_y: 32.0 };
        let d = Detection { xmin: 0.25, ymin: 0.375, xmax: 0.5, ymax: 0.625, score: 0.9 };
        let region = fit.to_source(&d, 256, 128).unwrap();
        assert_eq!(region, FaceRegion { x: 64, y: 32, width: 64, height: 64 });

        // entirely inside the padding band
        let outside = Detection { xmin: 0.1, ymin: 0.0, xmax: 0.2, ymax: 0.2, score: 0.9 };
        assert_eq!(fit.to_source(&outside, 256, 128), None);
    }

    #[tokio::test]
    async fn low_confidence_detector_reports_no_face() {
        let engine = constant_engine(0.75, 0.5);
        let result = engine.classify(DynamicImage::new_rgb8(64, 64)).await;
        assert!(matches!(result, Err(ClassifyError::NoFace)));
    }

    #[tokio::test]
    async fn detected_face_is_classified() {
        let engine = constant_engine(0.5, 0.5);
        let scores = engine.classify(DynamicImage::new_rgb8(64, 48)).await.unwrap();
        // uniform logits, so every label sits at 100 / 7 and the tie goes to the first
        for (_, score) in scores.iter() {
            assert!((score - 100.0 / 7.0).abs() < 1e-3);
        }
        assert_eq!(scores.dominant(), crate::types::EmotionLabel::Angry);
    }

    #[tokio::test]
    async fn degenerate_box_counts_as_no_face() {
        let engine = constant_engine(0.5, 0.0);
        let result = engine.classify(DynamicImage::new_rgb8(64, 48)).await;
        assert!(matches!(result, Err(ClassifyError::NoFace)));
    }

    #[tokio::test]
    async fn missing_local_weights_fail_to_load() {
        let config = ModelConfig {
            detector: WeightsSource::Local(PathBuf::from("/nonexistent/blazeface.pth")),
            emotion: WeightsSource::Local(PathBuf::from("/nonexistent/fer.safetensors")),
            cpu: true,
            min_face_score: 0.75,
        };
        let err = CandleEmotionEngine::new(config).await.err().unwrap();
        assert!(err.to_string().contains("does not exist"));
    }
}
