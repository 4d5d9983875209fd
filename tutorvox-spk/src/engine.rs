//! Synthesis engine: model lifecycle and text-to-audio generation
//!
//! The engine moves `Unloaded -> Loading -> Ready`. A load in flight is a
//! shared future held in the engine slot, so concurrent `load()` calls all
//! await the same download and instantiation. A failed or panicking load
//! removes the stored weights it may have read and returns the slot to
//! `Unloaded`. Weights are kept when the host simply cannot run the model.

use crate::backend::{BackendProbe, ExecutionProfile, PrecisionPolicy};
use crate::chunker::chunk_text;
use crate::config::{clamp_speed, ModelConfig, SpeechConfig};
use crate::download::WeightsFetcher;
use crate::error::{SpeechError, SpeechResult};
use crate::model::{ModelLoader, SpeechModel};
use crate::store::{ModelStore, RecordMeta};
use crate::wav;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle of the model instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
}

/// Step of a model load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Probing,
    Purging,
    CheckingCache,
    Downloading,
    Storing,
    Instantiating,
    Ready,
}

/// Progress report emitted during `load()`. `percent` never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub stage: LoadStage,
    pub percent: u8,
    pub bytes_loaded: u64,
    pub bytes_total: Option<u64>,
}

impl LoadProgress {
    fn at(stage: LoadStage, percent: u8) -> Self {
        Self {
            stage,
            percent,
            bytes_loaded: 0,
            bytes_total: None,
        }
    }
}

/// Progress callback
pub type ProgressFn = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Collaborators the engine needs to load a model
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn ModelStore>,
    pub fetcher: Arc<dyn WeightsFetcher>,
    pub loader: Arc<dyn ModelLoader>,
    pub probe: Arc<dyn BackendProbe>,
}

#[derive(Clone)]
struct LoadedModel {
    model: Arc<dyn SpeechModel>,
    profile: ExecutionProfile,
}

type LoadFuture = Shared<BoxFuture<'static, SpeechResult<LoadedModel>>>;

enum Slot {
    Unloaded,
    Loading(LoadFuture, Arc<ProgressHub>),
    Ready(LoadedModel),
}

/// Fans progress out to every caller attached to one load
struct ProgressHub {
    listeners: Mutex<Vec<ProgressFn>>,
    last_percent: AtomicU8,
}

impl ProgressHub {
    fn new(first: Option<ProgressFn>) -> Self {
        Self {
            listeners: Mutex::new(first.into_iter().collect()),
            last_percent: AtomicU8::new(0),
        }
    }

    fn attach(&self, listener: ProgressFn) {
        self.listeners.lock().push(listener);
    }

    fn emit(&self, progress: LoadProgress) {
        let previous = self.last_percent.fetch_max(progress.percent, Ordering::SeqCst);
        if progress.percent < previous {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(progress);
        }
    }
}

struct EngineShared {
    model: ModelConfig,
    precision: PrecisionPolicy,
    chunk_max_chars: usize,
    deps: EngineDeps,
    slot: Mutex<Slot>,
}

/// Owner of the neural model instance
pub struct SynthesisEngine {
    shared: Arc<EngineShared>,
}

impl SynthesisEngine {
    pub fn new(config: &SpeechConfig, deps: EngineDeps) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                model: config.model.clone(),
                precision: config.precision,
                chunk_max_chars: config.chunk_max_chars,
                deps,
                slot: Mutex::new(Slot::Unloaded),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        match &*self.shared.slot.lock() {
            Slot::Unloaded => EngineState::Unloaded,
            Slot::Loading(..) => EngineState::Loading,
            Slot::Ready(_) => EngineState::Ready,
        }
    }

    /// Backend and precision of the loaded model
    pub fn backend(&self) -> Option<ExecutionProfile> {
        match &*self.shared.slot.lock() {
            Slot::Ready(loaded) => Some(loaded.profile),
            _ => None,
        }
    }

    /// Load the model, or join the load already in flight
    pub async fn load(&self, on_progress: Option<ProgressFn>) -> SpeechResult<()> {
        self.loaded(on_progress).await.map(|_| ())
    }

    async fn loaded(&self, on_progress: Option<ProgressFn>) -> SpeechResult<LoadedModel> {
        let pending = {
            let mut slot = self.shared.slot.lock();
            match &*slot {
                Slot::Ready(loaded) => {
                    if let Some(listener) = on_progress {
                        listener(LoadProgress::at(LoadStage::Ready, 100));
                    }
                    return Ok(loaded.clone());
                }
                Slot::Loading(pending, hub) => {
                    debug!("Joining model load in flight");
                    if let Some(listener) = on_progress {
                        hub.attach(listener);
                    }
                    pending.clone()
                }
                Slot::Unloaded => {
                    let hub = Arc::new(ProgressHub::new(on_progress));
                    let pending = drive_load(Arc::clone(&self.shared), Arc::clone(&hub))
                        .boxed()
                        .shared();
                    *slot = Slot::Loading(pending.clone(), hub);
                    // Finish the load even if every caller goes away.
                    tokio::spawn(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Synthesize `text` into a single WAV buffer. Loads the model first when
    /// needed.
    pub async fn speak(&self, text: &str, voice: &str, speed: f32) -> SpeechResult<Bytes> {
        let loaded = self.loaded(None).await?;
        let speed = clamp_speed(speed);

        let chunks = chunk_text(text, self.shared.chunk_max_chars);
        if chunks.is_empty() {
            return Err(SpeechError::Synthesis("Nothing to speak".to_string()));
        }

        let mut segments = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            segments.push(loaded.model.generate(chunk, voice, speed).await?);
        }
        debug!(voice, segments = segments.len(), "Synthesized utterance");

        wav::splice(&segments)
    }
}

fn panicked(stage: &str) -> SpeechError {
    SpeechError::CacheCorruption(format!("Model load panicked while {}", stage))
}

async fn drive_load(shared: Arc<EngineShared>, hub: Arc<ProgressHub>) -> SpeechResult<LoadedModel> {
    // A panic must not leave the slot holding a poisoned shared future.
    let result = AssertUnwindSafe(run_load(&shared, &hub))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(panicked("preparing the load")));
    let mut slot = shared.slot.lock();
    match &result {
        Ok(loaded) => {
            *slot = Slot::Ready(loaded.clone());
            drop(slot);
            hub.emit(LoadProgress::at(LoadStage::Ready, 100));
            info!(
                backend = %loaded.profile.backend,
                precision = %loaded.profile.precision,
                "Speech model ready"
            );
        }
        Err(e) => {
            *slot = Slot::Unloaded;
            error!("Speech model load failed: {}", e);
        }
    }
    result
}

async fn run_load(shared: &EngineShared, hub: &ProgressHub) -> SpeechResult<LoadedModel> {
    let deps = &shared.deps;

    hub.emit(LoadProgress::at(LoadStage::Probing, 0));
    if !deps.loader.is_available() {
        return Err(SpeechError::Unsupported("Speech model cannot run on this host".to_string()));
    }
    let backend = deps.probe.probe().await;
    let profile = ExecutionProfile::resolve(backend, &shared.precision);
    let key = shared.model.store_key(profile.precision);
    info!(%key, backend = %profile.backend, "Loading speech model");

    hub.emit(LoadProgress::at(LoadStage::Purging, 5));
    if let Err(e) = deps.store.purge_stale(shared.model.max_age_days).await {
        warn!("Failed to purge stale models: {}", e);
    }

    let result = AssertUnwindSafe(async {
        hub.emit(LoadProgress::at(LoadStage::CheckingCache, 10));
        let weights = resolve_weights(shared, hub, &key).await?;

        hub.emit(LoadProgress::at(LoadStage::Instantiating, 90));
        let model = deps
            .loader
            .instantiate(weights, profile)
            .await
            .map_err(|e| match e {
                SpeechError::Unsupported(_) => e,
                other => SpeechError::CacheCorruption(format!("Model instantiation failed: {}", other)),
            })?;

        Ok(LoadedModel { model, profile })
    })
    .catch_unwind()
    .await
    .unwrap_or_else(|_| Err(panicked("loading weights")));

    match &result {
        // Nothing wrong with the weights; the host just cannot run them.
        Ok(_) | Err(SpeechError::Unsupported(_)) => {}
        Err(_) => {
            // The stored copy may be what broke the load.
            if let Err(e) = deps.store.remove(&key).await {
                warn!(%key, "Failed to remove model record after failed load: {}", e);
            }
        }
    }

    result
}

async fn resolve_weights(shared: &EngineShared, hub: &ProgressHub, key: &str) -> SpeechResult<Bytes> {
    let deps = &shared.deps;
    let min_bytes = shared.model.min_bytes;

    match deps.store.retrieve(key).await {
        Ok(Some(record)) => {
            if (record.weights.len() as u64) < min_bytes.max(1) {
                return Err(SpeechError::CacheCorruption(format!(
                    "Stored weights for {} are only {} bytes",
                    key,
                    record.weights.len()
                )));
            }
            info!(%key, bytes = record.weights.len(), "Model weights found in store");
            return Ok(record.weights);
        }
        Ok(None) => debug!(%key, "Model weights not in store"),
        Err(e) => warn!(%key, "Model store read failed, treating as miss: {}", e),
    }

    let on_bytes = |loaded: u64, total: Option<u64>| {
        let percent = match total {
            Some(total) if total > 0 => 10 + (loaded.min(total) * 70 / total) as u8,
            _ => 10,
        };
        hub.emit(LoadProgress {
            stage: LoadStage::Downloading,
            percent,
            bytes_loaded: loaded,
            bytes_total: total,
        });
    };
    let weights = deps.fetcher.fetch(&shared.model.url, &on_bytes).await?;

    if (weights.len() as u64) < min_bytes {
        return Err(SpeechError::Download(format!(
            "Downloaded weights are only {} bytes (expected at least {})",
            weights.len(),
            min_bytes
        )));
    }

    hub.emit(LoadProgress::at(LoadStage::Storing, 85));
    let meta = RecordMeta::now(shared.model.version.clone());
    match deps.store.store(key, weights.clone(), meta).await {
        Ok(()) => info!(%key, bytes = weights.len(), "Model weights stored"),
        Err(e) => warn!(%key, "Failed to store model weights: {}", e),
    }

    Ok(weights)
}
