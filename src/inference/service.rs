//! Generation service
//!
//! Owns the active [`ModelBinding`] and runs generation requests against it.
//!
//! # Concurrency
//!
//! Every load and every generation runs on its own blocking worker
//! (`tokio::task::spawn_blocking`), so the caller's task never waits on
//! inference. A generation takes an `Arc` snapshot of the binding when it is
//! submitted. A concurrent reload swaps in a new binding without touching that
//! snapshot, and the old binding is released when its last request exits.
//!
//! Only one load, device switch or unload may run at a time. A second one is
//! rejected with [`ModelLoadError::Busy`] rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{oneshot, MutexGuard};
use uuid::Uuid;

use crate::inference::backend::{LoadedModel, ModelFacts, ModelLoader, Precision};
use crate::inference::error::{EngineError, GenerationError, ModelLoadError};
use crate::inference::request::{GenerationRequest, GenerationResult};
use crate::inference::sampling::Sampler;
use crate::system::Device;
use crate::truncate_str;

/// Chat-template and sentencepiece markers that survive detokenization
static SPECIAL_MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\|[^|<>\s]{1,48}\|>|</?s>|\[/?INST\]").expect("special-token pattern compiles")
});

/// Removes residual special-token markup from decoded text
pub fn strip_special_markup(text: &str) -> String {
    SPECIAL_MARKUP.replace_all(text, "").into_owned()
}

/// Observable lifecycle of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Unbound,
    Loading,
    Bound,
    Generating,
    Unloading,
}

/// A tokenizer and weights pair resident on one device, immutable once built
pub struct ModelBinding {
    model_name: String,
    device: Device,
    precision: Precision,
    model: Box<dyn LoadedModel>,
    facts: ModelFacts,
    loaded_at: DateTime<Utc>,
    /// Serializes decoding for models that cannot run sessions in parallel
    decode_gate: Option<Mutex<()>>,
}

impl ModelBinding {
    fn new(
        model_name: &str,
        device: Device,
        precision: Precision,
        model: Box<dyn LoadedModel>,
    ) -> Self {
        let decode_gate = (!model.concurrent_decode()).then(|| Mutex::new(()));
        Self {
            model_name: model_name.to_string(),
            device,
            precision,
            facts: model.facts(),
            model,
            loaded_at: Utc::now(),
            decode_gate,
        }
    }

    pub fn info(&self) -> BindingInfo {
        BindingInfo {
            model_name: self.model_name.clone(),
            device: self.device,
            precision: self.precision,
            facts: self.facts.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

impl Drop for ModelBinding {
    fn drop(&mut self) {
        tracing::info!("Released model {} on {}", self.model_name, self.device);
    }
}

/// Snapshot of a binding's identity, safe to hand to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingInfo {
    pub model_name: String,
    pub device: Device,
    pub precision: Precision,
    pub facts: ModelFacts,
    pub loaded_at: DateTime<Utc>,
}

struct Inner {
    loader: Arc<dyn ModelLoader>,
    binding: RwLock<Option<Arc<ModelBinding>>>,
    /// Held for the whole of a load, device switch or unload
    swap_lock: tokio::sync::Mutex<()>,
    loading: AtomicBool,
    /// Binding taken out by `unload` that in-flight requests may still hold
    retiring: Mutex<Weak<ModelBinding>>,
    in_flight: DashMap<Uuid, Arc<AtomicBool>>,
}

impl Inner {
    fn current_binding(&self) -> Option<Arc<ModelBinding>> {
        let guard = self.binding.read().unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    fn replace_binding(&self, next: Option<Arc<ModelBinding>>) -> Option<Arc<ModelBinding>> {
        let mut guard = self.binding.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, next)
    }

    fn is_retiring(&self) -> bool {
        let guard = self.retiring.lock().unwrap_or_else(PoisonError::into_inner);
        guard.strong_count() > 0
    }
}

/// Raises a flag for the lifetime of the guard
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Deregisters a request from the in-flight table, even if the worker panics
struct InFlightEntry {
    inner: Arc<Inner>,
    id: Uuid,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.id);
    }
}

/// Pending result of a submitted request
///
/// Dropping the handle before the result arrives cancels the request.
pub struct GenerationHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<GenerationResult, GenerationError>>,
    cancel: Arc<AtomicBool>,
}

impl GenerationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Asks the worker to stop at its next decoding step
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub async fn wait(mut self) -> Result<GenerationResult, GenerationError> {
        (&mut self.rx)
            .await
            .map_err(|_| GenerationError::Worker("worker exited without a result".to_string()))?
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

/// Handle to the generation service; clones share the same binding
#[derive(Clone)]
pub struct GenerationService {
    inner: Arc<Inner>,
}

impl GenerationService {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                binding: RwLock::new(None),
                swap_lock: tokio::sync::Mutex::new(()),
                loading: AtomicBool::new(false),
                retiring: Mutex::new(Weak::new()),
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        let bound = self.inner.current_binding().is_some();
        if !bound && self.inner.is_retiring() {
            ServiceState::Unloading
        } else if self.inner.loading.load(Ordering::SeqCst) {
            ServiceState::Loading
        } else if !self.inner.in_flight.is_empty() {
            ServiceState::Generating
        } else if bound {
            ServiceState::Bound
        } else {
            ServiceState::Unbound
        }
    }

    pub fn binding_info(&self) -> Option<BindingInfo> {
        self.inner.current_binding().map(|b| b.info())
    }

    /// Number of requests whose workers have not exited yet
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn available_models(&self) -> Vec<String> {
        self.inner.loader.available_models()
    }

    /// Loads `name` onto `device` and makes it the active binding
    ///
    /// The previous binding stays active until the new one is live, and stays
    /// intact if loading fails.
    pub async fn load_model(
        &self,
        name: &str,
        device: Device,
        precision: Precision,
    ) -> Result<BindingInfo, ModelLoadError> {
        let swap = self.lock_swap()?;
        self.load_locked(&swap, name, device, precision).await
    }

    /// Reloads the bound model with its precision on `device`
    pub async fn set_device(&self, device: Device) -> Result<BindingInfo, ModelLoadError> {
        let swap = self.lock_swap()?;
        let current = self
            .inner
            .current_binding()
            .ok_or(ModelLoadError::NoBinding)?;
        if current.device == device {
            return Ok(current.info());
        }

        let (name, precision) = (current.model_name.clone(), current.precision);
        drop(current);
        self.load_locked(&swap, &name, device, precision).await
    }

    fn lock_swap(&self) -> Result<MutexGuard<'_, ()>, ModelLoadError> {
        self.inner
            .swap_lock
            .try_lock()
            .map_err(|_| ModelLoadError::Busy)
    }

    /// Loads and swaps in a binding; the caller holds the swap lock
    async fn load_locked(
        &self,
        _swap: &MutexGuard<'_, ()>,
        name: &str,
        device: Device,
        precision: Precision,
    ) -> Result<BindingInfo, ModelLoadError> {
        let _loading = FlagGuard::raise(&self.inner.loading);

        tracing::info!("Loading model {} on {} ({} precision)", name, device, precision);
        let started = Instant::now();

        let loader = self.inner.loader.clone();
        let model_name = name.to_string();
        let model = tokio::task::spawn_blocking(move || loader.load(&model_name, device, precision))
            .await
            .map_err(|e| ModelLoadError::Worker(e.to_string()))?
            .map_err(|e| {
                tracing::warn!("Failed to load {} on {}: {}", name, device, e);
                e
            })?;

        let binding = Arc::new(ModelBinding::new(name, device, precision, model));
        let info = binding.info();

        if let Some(previous) = self.inner.replace_binding(Some(binding)) {
            tracing::debug!(
                "Retiring {} on {} ({} request(s) still hold it)",
                previous.model_name,
                previous.device,
                Arc::strong_count(&previous) - 1
            );
        }

        tracing::info!(
            "Model {} live on {} after {:.2?}",
            info.model_name,
            info.device,
            started.elapsed()
        );
        Ok(info)
    }

    /// Drops the active binding; requests already running finish against it
    pub fn unload(&self) -> Result<(), ModelLoadError> {
        let _swap = self.lock_swap()?;

        if let Some(previous) = self.inner.replace_binding(None) {
            let mut retiring = self
                .inner
                .retiring
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *retiring = Arc::downgrade(&previous);
            tracing::info!("Unloading {} on {}", previous.model_name, previous.device);
        }
        Ok(())
    }

    /// Validates `request` and starts it on a worker against the current binding
    pub fn submit(&self, request: GenerationRequest) -> Result<GenerationHandle, EngineError> {
        request.validate()?;
        let binding = self
            .inner
            .current_binding()
            .ok_or(GenerationError::NoModelBound)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GenerationError::Worker(e.to_string()))?;

        let id = request.id;
        let cancel = Arc::new(AtomicBool::new(false));
        self.inner.in_flight.insert(id, cancel.clone());
        let entry = InFlightEntry {
            inner: self.inner.clone(),
            id,
        };

        tracing::debug!(
            "Request {} on {}: {:?}",
            id,
            binding.model_name,
            truncate_str(&request.prompt, 64)
        );

        let (tx, rx) = oneshot::channel();
        let flag = cancel.clone();
        runtime.spawn_blocking(move || {
            let outcome = run_generation(&binding, &request, &flag);
            drop(binding);
            drop(entry);
            if tx.send(outcome).is_err() {
                tracing::debug!("Requester for {} is gone, dropping result", id);
            }
        });

        Ok(GenerationHandle { id, rx, cancel })
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, EngineError> {
        Ok(self.submit(request)?.wait().await?)
    }

    /// Like [`generate`](Self::generate), cancelling the worker once `timeout` elapses
    pub async fn generate_with_timeout(
        &self,
        request: GenerationRequest,
        timeout: Duration,
    ) -> Result<GenerationResult, EngineError> {
        let handle = self.submit(request)?;
        let id = handle.id();
        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!("Request {} timed out after {:?}", id, timeout);
                Err(GenerationError::TimedOut.into())
            }
        }
    }

    /// Cancels one in-flight request; false if it already finished
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.inner.in_flight.get(&id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.inner.in_flight.iter() {
            entry.value().store(true, Ordering::Relaxed);
        }
    }
}

/// Runs one request to completion on the calling (worker) thread
fn run_generation(
    binding: &ModelBinding,
    request: &GenerationRequest,
    cancel: &AtomicBool,
) -> Result<GenerationResult, GenerationError> {
    let _serial = binding
        .decode_gate
        .as_ref()
        .map(|gate| gate.lock().unwrap_or_else(PoisonError::into_inner));

    let model = binding.model.as_ref();
    let params = &request.params;

    let prompt_tokens = model.encode(&request.prompt)?;
    if prompt_tokens.is_empty() {
        return Err(GenerationError::Tokenization(
            "prompt produced no tokens".to_string(),
        ));
    }
    tracing::debug!("Tokenized prompt into {} tokens", prompt_tokens.len());

    // The context window bounds generation, whatever the request asks for
    let context = binding.facts.context_length as usize;
    let room = context.saturating_sub(prompt_tokens.len());
    if room == 0 {
        return Err(GenerationError::Decode(format!(
            "prompt of {} tokens fills the {} token context window",
            prompt_tokens.len(),
            context
        )));
    }
    let max_new = (params.max_new_tokens as usize).min(room);

    let mut session = model.session(prompt_tokens.len() + max_new)?;
    let mut sampler = Sampler::new(params);
    let mut tokens = prompt_tokens.clone();

    let mut logits = session.step(&prompt_tokens)?;
    let mut new_tokens = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            tracing::debug!("Request {} cancelled after {} tokens", request.id, new_tokens);
            return Err(GenerationError::Cancelled);
        }

        let next = sampler.sample(&logits, &tokens)?;
        tokens.push(next);
        new_tokens += 1;

        if model.is_end_of_generation(next) || new_tokens == max_new {
            break;
        }
        logits = session.step(&[next])?;
    }

    let text = strip_special_markup(&model.decode(&tokens)?);
    Ok(GenerationResult {
        request_id: request.id,
        text,
        model_name: binding.model_name.clone(),
        device: binding.device,
        new_tokens,
        finished_at: Utc::now(),
    })
}
