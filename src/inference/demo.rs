//! Built-in demo language model
//!
//! A character-bigram model trained at load time from a small embedded corpus.
//! Tokens are raw bytes plus two specials (BOS, EOS). It needs no model files,
//! which makes it the default model for first runs and for tests.

use crate::inference::backend::{DecodeSession, LoadedModel, ModelFacts, Precision};
use crate::inference::error::{GenerationError, ModelLoadError};
use crate::system::Device;

pub const BOS: u32 = 256;
pub const EOS: u32 = 257;
pub const VOCAB_SIZE: usize = 258;

/// Add-alpha smoothing applied to every allowed successor
const ALPHA: f32 = 0.05;

const PROSE: &str = "\
Hello there, and welcome to the local launcher.
Hello again, the model is ready when you are.
The quick brown fox jumps over the lazy dog.
A quasar is an extremely luminous active galactic nucleus.
Light from distant quasars has travelled for billions of years.
Small models run well on a laptop processor.
Larger models need a graphics card with plenty of memory.
Sampling picks the next token from a probability distribution.
Lower temperature makes the output more focused and predictable.
Higher temperature makes the output more varied and surprising.
The settings panel lets you choose the device and the model.
Every answer is generated on this machine and never leaves it.
Ask a question and the assistant will continue your text.
Rust makes it pleasant to write fast and reliable software.
The weather today is calm, with a light breeze from the west.
";

const VERSE: &str = "\
Hello moon above the hill,
the night is long, the air is still.
A lantern burns beside the door,
and waves are singing on the shore.
The river runs, the willows lean,
the morning fields are soft and green.
We walk the road and count the stars,
and hum a tune on old guitars.
The sparrow sleeps, the candle fades,
and silver light is in the glades.
";

/// Names of the built-in models with their training corpora
pub const BUILTIN_MODELS: &[(&str, &str)] = &[("demo-model", PROSE), ("demo-model-verse", VERSE)];

/// Corpus for a built-in model name
pub fn builtin_corpus(name: &str) -> Option<&'static str> {
    BUILTIN_MODELS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, corpus)| *corpus)
}

/// Bigram logits table: row = previous token, column = next token
pub struct DemoModel {
    name: String,
    logits: Vec<f32>,
}

impl DemoModel {
    /// Trains the named built-in model and places it on `device`
    ///
    /// Half precision is only accepted on accelerators; logits are then stored
    /// with a half-precision mantissa.
    pub fn load(name: &str, device: Device, precision: Precision) -> Result<Self, ModelLoadError> {
        let corpus =
            builtin_corpus(name).ok_or_else(|| ModelLoadError::UnknownModel(name.to_string()))?;

        if device.is_cpu() && precision == Precision::Half {
            return Err(ModelLoadError::UnsupportedPrecision { precision, device });
        }

        let mut model = Self::train(name, corpus);
        if precision == Precision::Half {
            for v in model.logits.iter_mut() {
                *v = round_to_half(*v);
            }
        }

        tracing::debug!("Trained {} on {} corpus bytes", name, corpus.len());
        Ok(model)
    }

    fn train(name: &str, corpus: &str) -> Self {
        let mut counts = vec![0u32; VOCAB_SIZE * VOCAB_SIZE];

        for line in corpus.lines().filter(|l| !l.trim().is_empty()) {
            let seq: Vec<u32> = std::iter::once(BOS)
                .chain(line.bytes().map(u32::from))
                .chain(std::iter::once(EOS))
                .collect();
            for pair in seq.windows(2) {
                counts[pair[0] as usize * VOCAB_SIZE + pair[1] as usize] += 1;
            }
        }

        let allowed = (0..VOCAB_SIZE as u32).filter(|&t| is_emittable(t)).count() as f32;
        let mut logits = vec![f32::NEG_INFINITY; VOCAB_SIZE * VOCAB_SIZE];
        for prev in 0..VOCAB_SIZE {
            let row = &counts[prev * VOCAB_SIZE..(prev + 1) * VOCAB_SIZE];
            let total: u32 = row.iter().sum();
            let denom = total as f32 + ALPHA * allowed;
            for next in 0..VOCAB_SIZE {
                if is_emittable(next as u32) {
                    logits[prev * VOCAB_SIZE + next] = ((row[next] as f32 + ALPHA) / denom).ln();
                }
            }
        }

        Self {
            name: name.to_string(),
            logits,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn row(&self, prev: u32) -> Result<&[f32], GenerationError> {
        let prev = prev as usize;
        if prev >= VOCAB_SIZE {
            return Err(GenerationError::Decode(format!("token {} out of vocabulary", prev)));
        }
        Ok(&self.logits[prev * VOCAB_SIZE..(prev + 1) * VOCAB_SIZE])
    }
}

/// Printable ASCII and EOS; BOS and control bytes are never sampled
fn is_emittable(token: u32) -> bool {
    token == EOS || (0x20..=0x7E).contains(&token)
}

/// Drops the low 13 mantissa bits, leaving the 10 an IEEE half keeps
fn round_to_half(v: f32) -> f32 {
    if !v.is_finite() {
        return v;
    }
    f32::from_bits(v.to_bits() & 0xFFFF_E000)
}

impl LoadedModel for DemoModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>, GenerationError> {
        Ok(std::iter::once(BOS).chain(text.bytes().map(u32::from)).collect())
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
        token == EOS
    }

    fn facts(&self) -> ModelFacts {
        ModelFacts {
            vocab_size: VOCAB_SIZE,
            context_length: 4096,
            param_count: (VOCAB_SIZE * VOCAB_SIZE) as u64,
        }
    }

    fn session(&self, _capacity: usize) -> Result<Box<dyn DecodeSession + '_>, GenerationError> {
        Ok(Box::new(DemoSession { model: self }))
    }
}

struct DemoSession<'a> {
    model: &'a DemoModel,
}

impl DecodeSession for DemoSession<'_> {
    fn step(&mut self, tokens: &[u32]) -> Result<Vec<f32>, GenerationError> {
        let last = tokens
            .last()
            .copied()
            .ok_or_else(|| GenerationError::Decode("empty step".to_string()))?;
        Ok(self.model.row(last)?.to_vec())
    }
}
