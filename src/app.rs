//! Application controller
//!
//! [`ChatController`] is the presentation layer's view of the engine. It owns the
//! device manager, the generation service, the settings and the transcript, and
//! reports asynchronous outcomes as [`ChatEvent`]s in completion order.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::inference::{
    BindingInfo, EngineError, GenerationError, GenerationRequest, GenerationResult,
    GenerationService, ModelLoadError, ModelLoader,
};
use crate::storage::settings::{save_settings_to, AppSettings, Reload, SettingsError};
use crate::storage::StorageError;
use crate::system::{Device, DeviceError, DeviceInfo, DeviceManager, DeviceProbe};
use crate::types::Message;

/// Represents the current state of the model
#[derive(Clone, PartialEq, Debug)]
pub enum ModelState {
    NotLoaded,
    Loading,
    Loaded(String),
    Error(String),
}

/// Outcome of background work started by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ModelLoaded(BindingInfo),
    ModelLoadFailed(ModelLoadError),
    Reply(GenerationResult),
    Failed {
        request_id: Uuid,
        error: GenerationError,
    },
}

/// Errors surfaced to the user by the controller
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ModelLoadError> for AppError {
    fn from(err: ModelLoadError) -> Self {
        AppError::Engine(err.into())
    }
}

pub struct ChatController {
    devices: DeviceManager,
    service: GenerationService,
    settings: AppSettings,
    transcript: Vec<Message>,
    model_state: ModelState,
    events_tx: mpsc::UnboundedSender<ChatEvent>,
    events_rx: mpsc::UnboundedReceiver<ChatEvent>,
}

impl ChatController {
    pub fn new(
        settings: AppSettings,
        probe: Box<dyn DeviceProbe>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self, AppError> {
        settings.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tracing::info!("ChatController initialized");
        Ok(Self {
            devices: DeviceManager::new(probe),
            service: GenerationService::new(loader),
            settings,
            transcript: Vec::new(),
            model_state: ModelState::NotLoaded,
            events_tx,
            events_rx,
        })
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn model_state(&self) -> &ModelState {
        &self.model_state
    }

    pub fn service(&self) -> &GenerationService {
        &self.service
    }

    pub fn devices(&self) -> &[Device] {
        self.devices.list_devices()
    }

    pub fn describe_device(&self, device: &Device) -> Result<DeviceInfo, AppError> {
        Ok(self.devices.describe(device)?)
    }

    pub fn available_models(&self) -> Vec<String> {
        self.service.available_models()
    }

    /// Selects the configured device and starts loading the configured model
    ///
    /// The load runs in the background; its outcome arrives as a [`ChatEvent`].
    pub fn start(&mut self) -> Result<(), AppError> {
        self.devices.select(&self.settings.device)?;
        self.spawn_load(Reload::Model)
    }

    /// Replaces the settings, reloading only when model, device or precision changed
    ///
    /// Invalid settings are rejected as a whole and the current ones stay in effect.
    pub fn apply_settings(&mut self, next: AppSettings) -> Result<Reload, AppError> {
        next.validate()?;

        let reload = self.settings.reload_for(&next);
        if reload != Reload::None {
            self.devices.select(&next.device)?;
        }
        if next.models_directory != self.settings.models_directory
            || next.gpu_layers != self.settings.gpu_layers
        {
            tracing::info!("Model directory and GPU layer changes apply on restart");
        }
        self.settings = next;

        if reload != Reload::None {
            self.spawn_load(reload)?;
        }
        Ok(reload)
    }

    fn spawn_load(&mut self, reload: Reload) -> Result<(), AppError> {
        let device = self.devices.current()?;
        let name = self.settings.model.clone();
        let precision = self.settings.precision;

        // A device switch only reuses the binding if it is the model we want
        let reload = match self.service.binding_info() {
            Some(info) if info.model_name == name && info.precision == precision => reload,
            _ => Reload::Model,
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ModelLoadError::Worker(e.to_string()))?;

        self.model_state = ModelState::Loading;
        let service = self.service.clone();
        let events = self.events_tx.clone();
        runtime.spawn(async move {
            let outcome = match reload {
                Reload::Device => service.set_device(device).await,
                _ => service.load_model(&name, device, precision).await,
            };
            let event = match outcome {
                Ok(info) => ChatEvent::ModelLoaded(info),
                Err(e) => ChatEvent::ModelLoadFailed(e),
            };
            // Controller gone means nobody is listening
            let _ = events.send(event);
        });
        Ok(())
    }

    /// Submits `prompt` with the current sampling settings
    ///
    /// Validation and "no model" failures are returned here; the reply itself
    /// arrives later as a [`ChatEvent`].
    pub fn send_message(&mut self, prompt: &str) -> Result<Uuid, AppError> {
        let request = GenerationRequest::new(prompt, self.settings.generation_params());
        let handle = self.service.submit(request)?;
        let request_id = handle.id();
        self.transcript.push(Message::user(prompt));

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match handle.wait().await {
                Ok(result) => ChatEvent::Reply(result),
                Err(error) => ChatEvent::Failed { request_id, error },
            };
            let _ = events.send(event);
        });
        Ok(request_id)
    }

    /// Waits for the next background outcome and folds it into the controller state
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        let event = self.events_rx.recv().await?;
        self.record(&event);
        Some(event)
    }

    /// Like [`next_event`](Self::next_event) without waiting
    pub fn try_next_event(&mut self) -> Option<ChatEvent> {
        let event = self.events_rx.try_recv().ok()?;
        self.record(&event);
        Some(event)
    }

    fn record(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::ModelLoaded(info) => {
                self.model_state = ModelState::Loaded(info.model_name.clone());
                self.follow_binding();
            }
            ChatEvent::ModelLoadFailed(e) => {
                self.model_state = ModelState::Error(e.to_string());
                self.transcript.push(Message::error(e.to_string()));
                self.follow_binding();
            }
            ChatEvent::Reply(result) => {
                self.transcript.push(Message::assistant(result.text.clone()));
            }
            ChatEvent::Failed { error, .. } => {
                self.transcript.push(Message::error(error.to_string()));
            }
        }
    }

    /// Points model, device and precision back at the live binding
    ///
    /// A rejected or failed load must not leave settings naming a model that
    /// is not loaded; only one swap runs at a time, so the live binding is the
    /// last one that succeeded.
    fn follow_binding(&mut self) {
        let Some(info) = self.service.binding_info() else {
            return;
        };
        if self.settings.model != info.model_name
            || self.settings.precision != info.precision
            || self.settings.parsed_device().ok() != Some(info.device)
        {
            tracing::info!(
                "Settings follow the loaded model {} on {}",
                info.model_name,
                info.device
            );
        }
        self.settings.model = info.model_name;
        self.settings.precision = info.precision;
        self.settings.device = info.device.to_string();
        if let Err(e) = self.devices.select(&self.settings.device) {
            tracing::warn!("Loaded device is not selectable: {}", e);
        }
    }

    pub fn status_line(&self) -> String {
        match self.service.binding_info() {
            Some(info) => format!(
                "Model: {} | Device: {} | Precision: {}",
                info.model_name, info.device, info.precision
            ),
            None => {
                let model = match &self.model_state {
                    ModelState::Loading => format!("{} (loading)", self.settings.model),
                    _ => "none".to_string(),
                };
                let device = self
                    .settings
                    .parsed_device()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|_| self.settings.device.clone());
                format!(
                    "Model: {} | Device: {} | Precision: {}",
                    model, device, self.settings.precision
                )
            }
        }
    }

    pub fn clear_transcript(&mut self) {
        self.transcript.clear();
    }

    pub fn save_settings(&self, path: &Path) -> Result<(), AppError> {
        Ok(save_settings_to(&self.settings, path)?)
    }

    /// Cancels outstanding requests and releases the model
    pub fn shutdown(&mut self) -> Result<(), AppError> {
        tracing::info!("Shutting down ({} request(s) in flight)", self.service.in_flight());
        self.service.cancel_all();
        self.service.unload()?;
        self.model_state = ModelState::NotLoaded;
        Ok(())
    }
}
