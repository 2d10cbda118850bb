//! Inference error taxonomy

use thiserror::Error;

use crate::inference::backend::Precision;
use crate::system::Device;

/// A generation request that violates a parameter invariant
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("max_new_tokens must be positive")]
    MaxNewTokens,

    #[error("temperature must be a finite value above 0, got {0}")]
    Temperature(f32),

    #[error("top_p must be within [0, 1], got {0}")]
    TopP(f32),

    #[error("repetition_penalty must be at least 1.0, got {0}")]
    RepetitionPenalty(f32),
}

/// Failures while resolving or loading a model binding
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("{precision} precision is not supported on {device}")]
    UnsupportedPrecision { precision: Precision, device: Device },

    #[error("Model {model} cannot be placed on {device}")]
    UnsupportedDevice { model: String, device: Device },

    #[error("Invalid model file: {0}")]
    InvalidModelFile(String),

    #[error("Model backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Failed to load model: {0}")]
    Backend(String),

    #[error("Another model load is already in progress")]
    Busy,

    #[error("No model is bound")]
    NoBinding,

    #[error("Load worker error: {0}")]
    Worker(String),
}

/// Failures while running a generation request
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("No model loaded")]
    NoModelBound,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Generation timed out")]
    TimedOut,

    #[error("Generation worker error: {0}")]
    Worker(String),
}

/// Any error returned by the generation service
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}
