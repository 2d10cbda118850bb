//! Text generation
//!
//! Model backends, the sampling pipeline and the generation service that owns
//! the active model binding.

pub mod backend;
pub mod catalog;
pub mod demo;
pub mod error;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod request;
pub mod sampling;
pub mod service;

// Re-export main types for convenience
pub use backend::{DecodeSession, LoadedModel, ModelFacts, ModelLoader, Precision};
pub use catalog::{CatalogEntry, CatalogLoader, ModelCatalog, ModelSource};
pub use error::{EngineError, GenerationError, ModelLoadError, ValidationError};
pub use request::{GenerationParams, GenerationRequest, GenerationResult};
pub use service::{BindingInfo, GenerationHandle, GenerationService, ServiceState};
