//! Generation requests and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inference::error::ValidationError;
use crate::system::Device;

/// Sampling parameters for one generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Tokens to generate beyond the prompt
    pub max_new_tokens: u32,
    /// Logit temperature, strictly positive
    pub temperature: f32,
    /// Top-k truncation (0 = disabled)
    pub top_k: u32,
    /// Nucleus threshold in [0, 1]
    pub top_p: f32,
    /// Penalty for previously seen tokens (1.0 = disabled)
    pub repetition_penalty: f32,
    /// Fixed sampling seed; drawn from entropy when unset
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            temperature: 1.0,
            top_k: 50,
            top_p: 0.95,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl GenerationParams {
    /// Checks every parameter invariant. Values are never clamped.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_new_tokens == 0 {
            return Err(ValidationError::MaxNewTokens);
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(ValidationError::Temperature(self.temperature));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ValidationError::TopP(self.top_p));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty < 1.0 {
            return Err(ValidationError::RepetitionPenalty(self.repetition_penalty));
        }
        Ok(())
    }
}

/// A single-turn generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            params,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        self.params.validate()
    }
}

/// Text produced by one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub request_id: Uuid,
    /// Prompt plus continuation, special tokens stripped
    pub text: String,
    pub model_name: String,
    pub device: Device,
    /// Tokens sampled after the prompt
    pub new_tokens: usize,
    pub finished_at: DateTime<Utc>,
}
