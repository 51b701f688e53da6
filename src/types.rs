use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;

/// Emotions the classifier can report.
///
/// Declaration order is the model's output order and doubles as the
/// tie-break priority: when two labels share the top score, the one
/// declared first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 7] = [
        EmotionLabel::Angry,
        EmotionLabel::Disgust,
        EmotionLabel::Fear,
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Surprise,
        EmotionLabel::Neutral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Angry => "angry",
            EmotionLabel::Disgust => "disgust",
            EmotionLabel::Fear => "fear",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Surprise => "surprise",
            EmotionLabel::Neutral => "neutral",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-label confidence for one face, as percentages.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionScores {
    scores: [f32; 7],
}

impl EmotionScores {
    pub fn new(scores: [f32; 7]) -> Self {
        Self { scores }
    }

    /// Builds scores from a model probability vector in [`EmotionLabel::ALL`] order.
    pub fn from_probabilities(probs: &[f32]) -> anyhow::Result<Self> {
        let scores: [f32; 7] = probs.try_into().map_err(|_| {
            anyhow::anyhow!(
                "Expected {} emotion probabilities, got {}",
                EmotionLabel::ALL.len(),
                probs.len()
            )
        })?;
        if scores.iter().any(|p| !p.is_finite()) {
            anyhow::bail!("Emotion probabilities contain non-finite values");
        }
        Ok(Self {
            scores: scores.map(|p| p * 100.0),
        })
    }

    pub fn get(&self, label: EmotionLabel) -> f32 {
        self.scores[label.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (EmotionLabel, f32)> + '_ {
        EmotionLabel::ALL
            .into_iter()
            .map(move |label| (label, self.get(label)))
    }

    /// Highest scoring label; ties go to the label declared first.
    pub fn dominant(&self) -> EmotionLabel {
        let mut best = EmotionLabel::ALL[0];
        for (label, score) in self.iter().skip(1) {
            if score > self.get(best) {
                best = label;
            }
        }
        best
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EmotionResponse {
    /// Dominant emotion detected on the face
    #[schema(example = "happy")]
    pub emotion: EmotionLabel,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub message: String,
    pub version: String,
    pub docs: String,
    pub endpoints: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Machine readable error kind, e.g. `no_face_detected`
    pub error: String,
    /// Human readable description
    pub message: String,
}
