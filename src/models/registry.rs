//! Known model identifiers and the properties derived from them.

use crate::schedulers::PredictionType;

/// Hugging Face revision holding the ONNX export of a model.
pub const ONNX_REVISION: &str = "onnx";

/// Models whose text encoder produces 1024-wide embeddings.
const WIDE_EMBEDDING_MODELS: &[&str] = &[
    "stabilityai/stable-diffusion-2-1",
    "stabilityai/stable-diffusion-2-1-base",
];

/// Models trained with v-prediction.
const V_PREDICTION_MODELS: &[&str] = &["stabilityai/stable-diffusion-2-1"];

/// Properties of a pretrained model needed to build its sampling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// Hugging Face identifier, e.g. `CompVis/stable-diffusion-v1-4`.
    pub id: String,
    /// Width of the conditioning embeddings.
    pub embedding_dim: usize,
    pub prediction_type: PredictionType,
    pub revision: &'static str,
}

impl ModelSpec {
    pub fn resolve(id: &str) -> Self {
        let embedding_dim = if WIDE_EMBEDDING_MODELS.contains(&id) {
            1024
        } else {
            768
        };
        let prediction_type = if V_PREDICTION_MODELS.contains(&id) {
            PredictionType::VPrediction
        } else {
            PredictionType::Epsilon
        };
        Self {
            id: id.to_string(),
            embedding_dim,
            prediction_type,
            revision: ONNX_REVISION,
        }
    }

    /// File name stem used for this model's outputs.
    pub fn safe_name(&self, suffix: &str) -> String {
        create_safe_name(&self.id, suffix)
    }

    /// Download URL of a file inside the model repository.
    pub fn file_url(&self, file: &str) -> String {
        format!(
            "https://huggingface.co/{}/resolve/{}/{}",
            self.id, self.revision, file
        )
    }
}

/// Last path segment of `model` plus `suffix`, with `-` replaced by `_`.
pub fn create_safe_name(model: &str, suffix: &str) -> String {
    let name = model.rsplit('/').next().unwrap_or(model);
    format!("{}{}", name, suffix).replace('-', "_")
}
