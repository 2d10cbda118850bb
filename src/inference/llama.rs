//! llama.cpp backend for GGUF models
//!
//! Only built with the `llama` feature. Each generation opens its own
//! `LlamaContext`, so sessions never share a KV cache.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;

use crate::inference::backend::{DecodeSession, LoadedModel, ModelFacts, Precision};
use crate::inference::error::{GenerationError, ModelLoadError};
use crate::system::Device;

const BATCH_SIZE: usize = 512;
const MIN_CONTEXT: u32 = 2048;

/// llama.cpp may only be initialized once per process
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, ModelLoadError> {
    BACKEND.get_or_try_init(|| {
        let backend = LlamaBackend::init()
            .map_err(|e| ModelLoadError::BackendUnavailable(e.to_string()))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

/// A GGUF model resident on one device
pub struct LlamaCppModel {
    backend: &'static LlamaBackend,
    model: LlamaModel,
}

impl LlamaCppModel {
    /// Loads `path` onto `device`
    ///
    /// GGUF weights keep the quantization they were saved with, so only
    /// [`Precision::Full`] (as stored) is accepted.
    pub fn load(
        path: &Path,
        device: Device,
        precision: Precision,
        gpu_layers: u32,
    ) -> Result<Self, ModelLoadError> {
        if precision != Precision::Full {
            return Err(ModelLoadError::UnsupportedPrecision { precision, device });
        }
        let backend = backend()?;
        // Built without cuda/vulkan
        if !device.is_cpu() && !backend.supports_gpu_offload() {
            return Err(ModelLoadError::UnsupportedDevice {
                model: path.display().to_string(),
                device,
            });
        }

        let params = match device {
            Device::Cpu => LlamaModelParams::default().with_n_gpu_layers(0),
            Device::Accelerator(index) => LlamaModelParams::default()
                .with_n_gpu_layers(gpu_layers)
                .with_main_gpu(index as i32),
        };

        let model = LlamaModel::load_from_file(backend, path, &params)
            .map_err(|e| ModelLoadError::Backend(e.to_string()))?;

        tracing::info!(
            "Loaded {} on {} ({} params, {} vocab, {} ctx)",
            path.display(),
            device,
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(Self { backend, model })
    }

    fn is_special(&self, token: LlamaToken) -> bool {
        token == self.model.token_bos() || self.model.is_eog_token(token)
    }
}

fn to_llama(token: u32) -> LlamaToken {
    LlamaToken::new(token as i32)
}

impl LoadedModel for LlamaCppModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>, GenerationError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| GenerationError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0 as u32).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, GenerationError> {
        let mut bytes = Vec::new();
        for &token in tokens {
            let token = to_llama(token);
            if self.is_special(token) {
                continue;
            }
            let piece = self
                .model
                .token_to_bytes(token, Special::Plaintext)
                .map_err(|e| GenerationError::Decode(e.to_string()))?;
            bytes.extend_from_slice(&piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_end_of_generation(&self, token: u32) -> bool {
        self.model.is_eog_token(to_llama(token))
    }

    fn facts(&self) -> ModelFacts {
        ModelFacts {
            vocab_size: self.model.n_vocab().max(0) as usize,
            context_length: self.model.n_ctx_train(),
            param_count: self.model.n_params() as u64,
        }
    }

    fn session(&self, capacity: usize) -> Result<Box<dyn DecodeSession + '_>, GenerationError> {
        let train_ctx = self.model.n_ctx_train().max(MIN_CONTEXT);
        let n_ctx = u32::try_from(capacity)
            .unwrap_or(u32::MAX)
            .clamp(MIN_CONTEXT, train_ctx);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(BATCH_SIZE as u32);

        let ctx = self
            .model
            .new_context(self.backend, ctx_params)
            .map_err(|e| GenerationError::Decode(format!("Failed to create context: {}", e)))?;

        Ok(Box::new(LlamaSession {
            ctx,
            pos: 0,
            n_ctx: n_ctx as i32,
        }))
    }

    // One device, one compute stream; parallel contexts just thrash it
    fn concurrent_decode(&self) -> bool {
        false
    }
}

struct LlamaSession<'a> {
    ctx: LlamaContext<'a>,
    pos: i32,
    n_ctx: i32,
}

impl DecodeSession for LlamaSession<'_> {
    fn step(&mut self, tokens: &[u32]) -> Result<Vec<f32>, GenerationError> {
        if tokens.is_empty() {
            return Err(GenerationError::Decode("empty step".to_string()));
        }
        if self.pos + tokens.len() as i32 > self.n_ctx {
            return Err(GenerationError::Decode(format!(
                "context window of {} tokens exhausted",
                self.n_ctx
            )));
        }

        let chunks: Vec<&[u32]> = tokens.chunks(BATCH_SIZE).collect();
        let mut last_index = 0;
        for (c, chunk) in chunks.iter().enumerate() {
            let final_chunk = c + 1 == chunks.len();
            let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
            for (i, &token) in chunk.iter().enumerate() {
                let want_logits = final_chunk && i + 1 == chunk.len();
                batch
                    .add(to_llama(token), self.pos, &[0], want_logits)
                    .map_err(|e| GenerationError::Decode(format!("Failed to add token to batch: {}", e)))?;
                self.pos += 1;
            }
            self.ctx
                .decode(&mut batch)
                .map_err(|e| GenerationError::Decode(format!("Failed to decode: {}", e)))?;
            last_index = batch.n_tokens() - 1;
        }

        Ok(self.ctx.get_logits_ith(last_index).to_vec())
    }
}
