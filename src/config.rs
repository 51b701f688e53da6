use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// 10 MB, the largest upload `/analyze-emotion` accepts by default.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Face detector weights: a file name inside --detector-repo, or a local path
    #[arg(long, env = "DETECTOR_WEIGHTS", default_value = "blazeface.pth")]
    pub detector_weights: String,

    /// Hugging Face Hub repository holding the face detector weights
    #[arg(long, env = "DETECTOR_REPO")]
    pub detector_repo: Option<String>,

    /// Emotion model weights: a file name inside --emotion-repo, or a local path
    #[arg(
        long,
        env = "EMOTION_WEIGHTS",
        default_value = "facial_expression_model.safetensors"
    )]
    pub emotion_weights: String,

    /// Hugging Face Hub repository holding the emotion model weights
    #[arg(long, env = "EMOTION_REPO")]
    pub emotion_repo: Option<String>,

    /// Model revision/branch on Hugging Face
    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub model_revision: String,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Minimum detector confidence for a face to count as found
    #[arg(long, env = "MIN_FACE_SCORE", default_value = "0.75")]
    pub min_face_score: f32,

    /// Maximum accepted upload size in bytes
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Upper bound on a single classification call, in milliseconds
    #[arg(long, env = "CLASSIFY_TIMEOUT_MS", default_value = "30000")]
    pub classify_timeout_ms: u64,

    /// Load the models at startup instead of on the first request
    #[arg(long, env = "EAGER_LOAD")]
    pub eager_load: bool,

    /// Do not expose Prometheus metrics on /metrics
    #[arg(long, env = "DISABLE_METRICS")]
    pub disable_metrics: bool,
}

/// Where a set of weights comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightsSource {
    Local(PathBuf),
    Hub {
        repo: String,
        revision: String,
        filename: String,
    },
}

impl WeightsSource {
    fn resolve(weights: &str, repo: Option<&String>, revision: &str) -> Self {
        match repo {
            Some(repo) => Self::Hub {
                repo: repo.clone(),
                revision: revision.to_string(),
                filename: weights.to_string(),
            },
            None => Self::Local(PathBuf::from(weights)),
        }
    }

    /// File name the weights will be read from, used to pick the weights format.
    pub fn file_name(&self) -> &str {
        match self {
            Self::Local(path) => path.to_str().unwrap_or_default(),
            Self::Hub { filename, .. } => filename,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub detector: WeightsSource,
    pub emotion: WeightsSource,
    pub cpu: bool,
    pub min_face_score: f32,
}

impl From<&Config> for ModelConfig {
    fn from(config: &Config) -> Self {
        Self {
            detector: WeightsSource::resolve(
                &config.detector_weights,
                config.detector_repo.as_ref(),
                &config.model_revision,
            ),
            emotion: WeightsSource::resolve(
                &config.emotion_weights,
                config.emotion_repo.as_ref(),
                &config.model_revision,
            ),
            cpu: config.cpu_only,
            min_face_score: config.min_face_score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_upload_bytes: usize,
    pub classify_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            classify_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for UploadConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            classify_timeout: Duration::from_millis(config.classify_timeout_ms),
        }
    }
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_limits() {
        let config = Config::parse_from(["emotion-server"]);
        assert_eq!(config.max_upload_bytes, 10_485_760);
        assert_eq!(config.server_address(), "127.0.0.1:8000");

        let upload = UploadConfig::from(&config);
        assert_eq!(upload.classify_timeout, Duration::from_secs(30));
    }

    #[test]
    fn weights_come_from_hub_only_when_repo_is_set() {
        let config = Config::parse_from([
            "emotion-server",
            "--detector-repo",
            "someone/blazeface",
            "--emotion-weights",
            "/models/fer.safetensors",
        ]);
        let models = ModelConfig::from(&config);

        assert_eq!(
            models.detector,
            WeightsSource::Hub {
                repo: "someone/blazeface".to_string(),
                revision: "main".to_string(),
                filename: "blazeface.pth".to_string(),
            }
        );
        assert_eq!(
            models.emotion,
            WeightsSource::Local(PathBuf::from("/models/fer.safetensors"))
        );
        assert_eq!(models.emotion.file_name(), "/models/fer.safetensors");
    }
}
