pub mod engine;
pub mod math;
pub mod preprocess;
pub mod vocab;

pub use engine::{CaptionEngine, CaptionEngineOptions, CaptionOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("inference runtime init failed: {0}")]
    Init(String),

    #[error(
        "caption model dir not found (expected `models/vit-gpt2-caption-onnx/` relative to the \
         working directory, or an explicit model dir override)"
    )]
    ModelDirNotFound,

    #[error("failed to load {which} model: {message}")]
    ModelLoad { which: &'static str, message: String },

    #[error("unreadable image {path}: {message}")]
    UnreadableImage { path: String, message: String },

    #[error("failed to build {name} tensor: {message}")]
    Tensor { name: &'static str, message: String },

    #[error("{stage} inference failed: {message}")]
    Inference { stage: &'static str, message: String },

    #[error("unexpected logits shape {shape:?}")]
    ShapeMismatch { shape: Vec<i64> },

    #[error(transparent)]
    Ort(#[from] ort::Error),
}
