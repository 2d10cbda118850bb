//! Settings storage
//!
//! User-facing configuration: which model runs where, and how it samples.
//! Values are checked with [`AppSettings::validate`] and never clamped.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::{GenerationParams, Precision, ValidationError};
use crate::storage::{get_data_dir, StorageError};
use crate::system::Device;

/// Settings values that cannot be applied
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SettingsError {
    #[error("Model name must not be empty")]
    EmptyModel,

    #[error("Malformed device identifier: {0}")]
    Device(String),

    #[error(transparent)]
    Sampling(#[from] ValidationError),

    #[error("Unknown setting: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// What a settings change requires of the loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reload {
    /// Only sampling parameters changed
    None,
    /// Same model and precision, different device
    Device,
    /// Different model or precision
    Model,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Catalog name of the model to load
    pub model: String,
    /// Device identifier (`cpu`, `cuda:0`, ...)
    pub device: String,
    /// Numeric precision of the weights
    pub precision: Precision,
    /// Tokens to generate beyond the prompt
    pub max_new_tokens: u32,
    /// Sampling temperature, above 0
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Penalty for repeated tokens, at least 1.0
    pub repetition_penalty: f32,
    /// Fixed sampling seed for reproducible output
    pub seed: Option<u64>,
    /// Number of GPU layers to offload for GGUF models on an accelerator
    pub gpu_layers: u32,
    /// Directory scanned for `.gguf` model files
    pub models_directory: PathBuf,
}

impl Default for AppSettings {
    fn default() -> Self {
        let sampling = GenerationParams::default();
        Self {
            model: "demo-model".to_string(),
            device: "cpu".to_string(),
            precision: Precision::Full,
            max_new_tokens: sampling.max_new_tokens,
            temperature: sampling.temperature,
            top_k: sampling.top_k,
            top_p: sampling.top_p,
            repetition_penalty: sampling.repetition_penalty,
            seed: sampling.seed,
            gpu_layers: 99, // Offload all layers to GPU by default
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.model.trim().is_empty() {
            return Err(SettingsError::EmptyModel);
        }
        self.parsed_device()?;
        self.generation_params().validate()?;
        Ok(())
    }

    pub fn parsed_device(&self) -> Result<Device, SettingsError> {
        self.device
            .parse()
            .map_err(|_| SettingsError::Device(self.device.clone()))
    }

    /// Sampling parameters for the next request
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            seed: self.seed,
        }
    }

    /// Reload needed to go from `self` to `next`; sampling changes never reload
    pub fn reload_for(&self, next: &AppSettings) -> Reload {
        if self.model != next.model || self.precision != next.precision {
            Reload::Model
        } else if self.device.parse::<Device>().ok() != next.device.parse::<Device>().ok() {
            Reload::Device
        } else {
            Reload::None
        }
    }

    pub fn requires_reload(&self, next: &AppSettings) -> bool {
        self.reload_for(next) != Reload::None
    }

    /// Sets one field from its textual form
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "model" => self.model = value.to_string(),
            "device" => self.device = value.to_string(),
            "precision" => self.precision = value.parse().map_err(|_| invalid())?,
            "max_new_tokens" => self.max_new_tokens = value.parse().map_err(|_| invalid())?,
            "temperature" => self.temperature = value.parse().map_err(|_| invalid())?,
            "top_k" => self.top_k = value.parse().map_err(|_| invalid())?,
            "top_p" => self.top_p = value.parse().map_err(|_| invalid())?,
            "repetition_penalty" => {
                self.repetition_penalty = value.parse().map_err(|_| invalid())?
            }
            "seed" => {
                self.seed = match value {
                    "none" | "random" => None,
                    v => Some(v.parse().map_err(|_| invalid())?),
                }
            }
            "gpu_layers" => self.gpu_layers = value.parse().map_err(|_| invalid())?,
            "models_directory" => self.models_directory = PathBuf::from(value),
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the data directory
///
/// Returns default settings if the file doesn't exist, is corrupted or holds invalid values
pub fn load_settings() -> AppSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    match read_settings(path) {
        Ok(settings) => match settings.validate() {
            Ok(()) => settings,
            Err(e) => {
                tracing::warn!("Ignoring invalid settings in {}: {}", path.display(), e);
                AppSettings::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

fn read_settings(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let settings = serde_json::from_str(&json)?;
    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the data directory
pub fn save_settings(settings: &AppSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
