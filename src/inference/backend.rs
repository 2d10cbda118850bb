//! Model backend seams
//!
//! A [`ModelLoader`] turns a model name into a [`LoadedModel`] placed on a device.
//! A loaded model owns both its tokenizer and its weights, so the two can never
//! disagree on which model or device they belong to. Each generation opens its
//! own [`DecodeSession`]; sessions never share buffers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::inference::error::{GenerationError, ModelLoadError};
use crate::system::Device;

/// Numeric precision the weights are held in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Full,
    Half,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Full => write!(f, "full"),
            Precision::Half => write!(f, "half"),
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "fp32" | "f32" => Ok(Precision::Full),
            "half" | "fp16" | "f16" => Ok(Precision::Half),
            other => Err(format!("unknown precision '{}'", other)),
        }
    }
}

/// Static facts about a loaded model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelFacts {
    pub vocab_size: usize,
    pub context_length: u32,
    pub param_count: u64,
}

/// Incremental decoder state for a single generation
pub trait DecodeSession {
    /// Feeds `tokens` at the next positions and returns logits for the position after them
    fn step(&mut self, tokens: &[u32]) -> Result<Vec<f32>, GenerationError>;
}

/// A tokenizer and weights pair resident on one device
pub trait LoadedModel: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, GenerationError>;

    /// Decodes `tokens`, skipping special tokens
    fn decode(&self, tokens: &[u32]) -> Result<String, GenerationError>;

    fn is_end_of_generation(&self, token: u32) -> bool;

    fn facts(&self) -> ModelFacts;

    /// Opens a fresh session sized for `capacity` tokens
    fn session(&self, capacity: usize) -> Result<Box<dyn DecodeSession + '_>, GenerationError>;

    /// Whether independent sessions may decode in parallel
    fn concurrent_decode(&self) -> bool {
        true
    }
}

/// Resolves model names and loads them onto a device
pub trait ModelLoader: Send + Sync {
    /// Blocking load; the service calls this from a worker thread
    fn load(
        &self,
        name: &str,
        device: Device,
        precision: Precision,
    ) -> Result<Box<dyn LoadedModel>, ModelLoadError>;

    /// Names that `load` can currently resolve
    fn available_models(&self) -> Vec<String>;
}

/// Test doubles for the service and controller tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};

    /// A latch that blocks callers of `wait` until `open` is called
    #[derive(Default)]
    pub struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }

        pub fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }
    }

    /// Counters shared by every model a [`MockLoader`] hands out
    #[derive(Default)]
    pub struct Counters {
        pub loads: AtomicUsize,
        pub sessions: AtomicUsize,
        pub steps: AtomicUsize,
        pub drops: AtomicUsize,
    }

    impl Counters {
        pub fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    /// Loader accepting a fixed set of names; loads and decode steps can be held on gates
    pub struct MockLoader {
        pub names: Vec<String>,
        pub counters: Arc<Counters>,
        pub load_gate: Option<Arc<Gate>>,
        pub step_gate: Option<Arc<Gate>>,
        /// Model names whose steps wait on `step_gate`; empty means all
        pub gated_models: Vec<String>,
        pub concurrent: bool,
    }

    impl MockLoader {
        pub fn new(names: &[&str]) -> Self {
            Self {
                names: names.iter().map(|n| n.to_string()).collect(),
                counters: Arc::new(Counters::default()),
                load_gate: None,
                step_gate: None,
                gated_models: Vec::new(),
                concurrent: true,
            }
        }
    }

    impl ModelLoader for MockLoader {
        fn load(
            &self,
            name: &str,
            device: Device,
            precision: Precision,
        ) -> Result<Box<dyn LoadedModel>, ModelLoadError> {
            if !self.names.iter().any(|n| n == name) {
                return Err(ModelLoadError::UnknownModel(name.to_string()));
            }
            if device.is_cpu() && precision == Precision::Half {
                return Err(ModelLoadError::UnsupportedPrecision { precision, device });
            }
            if let Some(gate) = &self.load_gate {
                gate.wait();
            }
            self.counters.loads.fetch_add(1, Ordering::SeqCst);

            let gated = self.gated_models.is_empty() || self.gated_models.iter().any(|n| n == name);
            Ok(Box::new(MockModel {
                counters: self.counters.clone(),
                step_gate: if gated { self.step_gate.clone() } else { None },
                concurrent: self.concurrent,
            }))
        }

        fn available_models(&self) -> Vec<String> {
            self.names.clone()
        }
    }

    /// Byte-level model whose logits always favor `'x'`; token 256 ends generation
    pub struct MockModel {
        counters: Arc<Counters>,
        step_gate: Option<Arc<Gate>>,
        concurrent: bool,
    }

    pub const MOCK_EOS: u32 = 256;

    impl LoadedModel for MockModel {
        fn encode(&self, text: &str) -> Result<Vec<u32>, GenerationError> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, tokens: &[u32]) -> Result<String, GenerationError> {
            let bytes: Vec<u8> = tokens
                .iter()
                .filter(|&&t| t < 256)
                .map(|&t| t as u8)
                .collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn is_end_of_generation(&self, token: u32) -> bool {
            token == MOCK_EOS
        }

        fn facts(&self) -> ModelFacts {
            ModelFacts {
                vocab_size: 257,
                context_length: 1024,
                param_count: 0,
            }
        }

        fn session(&self, _capacity: usize) -> Result<Box<dyn DecodeSession + '_>, GenerationError> {
            self.counters.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession { model: self }))
        }

        fn concurrent_decode(&self) -> bool {
            self.concurrent
        }
    }

    impl Drop for MockModel {
        fn drop(&mut self) {
            self.counters.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockSession<'a> {
        model: &'a MockModel,
    }

    impl DecodeSession for MockSession<'_> {
        fn step(&mut self, _tokens: &[u32]) -> Result<Vec<f32>, GenerationError> {
            if let Some(gate) = &self.model.step_gate {
                gate.wait();
            }
            self.model.counters.steps.fetch_add(1, Ordering::SeqCst);
            let mut logits = vec![f32::NEG_INFINITY; 257];
            logits[b'x' as usize] = 1.0;
            Ok(logits)
        }
    }
}
