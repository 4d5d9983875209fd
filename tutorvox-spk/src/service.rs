//! Speech service: the surface the rest of the application talks to
//!
//! Owns exactly one engine (through the queue), one cache and one playback
//! controller. Expected failures surface as booleans and callbacks; errors
//! are logged, never returned, except from the maintenance calls.

use crate::backend::{ExecutionProfile, HostBackendProbe};
use crate::cache::SpeechCache;
use crate::config::SpeechConfig;
use crate::download::HttpWeightsFetcher;
use crate::engine::{EngineDeps, EngineState, ProgressFn, SynthesisEngine};
use crate::error::{SpeechError, SpeechResult};
use crate::fallback::{CommandFallback, DisabledFallback, FallbackSpeech};
use crate::keepalive::AudioKeepAlive;
use crate::model::CommandModelLoader;
use crate::output::AudioOutput;
use crate::playback::{PlaybackController, PlaybackParts, SpeakCallbacks, SpeakOptions};
use crate::queue::SynthesisQueue;
use crate::store::{ModelMeta, ModelStore, SledModelStore};
use crate::voices::{Language, VoiceCatalog, VoiceDescriptor, VoiceFilter};
use std::sync::Arc;
use tracing::{info, warn};

pub struct SpeechService {
    config: SpeechConfig,
    catalog: VoiceCatalog,
    store: Arc<dyn ModelStore>,
    queue: Arc<SynthesisQueue>,
    cache: Arc<SpeechCache>,
    keep_alive: Arc<AudioKeepAlive>,
    playback: PlaybackController,
}

impl SpeechService {
    /// Wire the service from explicit collaborators. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: SpeechConfig,
        deps: EngineDeps,
        output: Arc<dyn AudioOutput>,
        fallback: Arc<dyn FallbackSpeech>,
    ) -> SpeechResult<Self> {
        config.validate().map_err(SpeechError::Config)?;

        let catalog = VoiceCatalog::builtin();
        let store = Arc::clone(&deps.store);
        let loader = Arc::clone(&deps.loader);
        let queue = Arc::new(SynthesisQueue::new(SynthesisEngine::new(&config, deps)));
        let cache = Arc::new(SpeechCache::new(Arc::clone(&queue)));
        let keep_alive = Arc::new(AudioKeepAlive::new(
            config.keep_alive.clone(),
            Arc::clone(&output),
        ));

        let playback = PlaybackController::new(PlaybackParts {
            catalog: catalog.clone(),
            cache: Arc::clone(&cache),
            output,
            fallback,
            keep_alive: Arc::clone(&keep_alive),
            loader,
            neural_enabled: config.neural_enabled,
            default_speed: config.default_speed,
        });

        info!(neural = config.neural_enabled, "Speech service initialized");
        Ok(Self {
            config,
            catalog,
            store,
            queue,
            cache,
            keep_alive,
            playback,
        })
    }

    /// Wire the service with the production collaborators: sled model store,
    /// HTTP download, external model runner and platform fallback.
    pub fn from_config(config: SpeechConfig, output: Arc<dyn AudioOutput>) -> SpeechResult<Self> {
        config.validate().map_err(SpeechError::Config)?;

        let deps = EngineDeps {
            store: Arc::new(SledModelStore::open(&config.store_path)?),
            fetcher: Arc::new(HttpWeightsFetcher::new(config.model.download_timeout_secs)?),
            loader: Arc::new(CommandModelLoader::new(config.runner.clone())),
            probe: Arc::new(HostBackendProbe::new(config.backend_override)),
        };

        let fallback: Arc<dyn FallbackSpeech> = if config.fallback.enabled {
            Arc::new(CommandFallback::detect(&config.fallback))
        } else {
            Arc::new(DisabledFallback)
        };

        Self::new(config, deps, output, fallback)
    }

    pub fn config(&self) -> &SpeechConfig {
        &self.config
    }

    pub fn playback(&self) -> &PlaybackController {
        &self.playback
    }

    pub fn cache(&self) -> &SpeechCache {
        &self.cache
    }

    pub fn speak(&self, text: &str, callbacks: SpeakCallbacks, options: SpeakOptions) -> bool {
        self.playback.speak(text, callbacks, options)
    }

    pub fn stop(&self) {
        self.playback.stop();
    }

    pub fn is_speaking(&self) -> bool {
        self.playback.is_speaking()
    }

    pub fn is_speech_available(&self, options: &SpeakOptions) -> bool {
        self.playback.is_speech_available(options)
    }

    pub fn is_speech_ready(&self, text: &str, options: &SpeakOptions) -> bool {
        self.playback.is_speech_ready(text, options)
    }

    pub async fn prepare_speech(&self, text: &str, options: &SpeakOptions) -> bool {
        self.playback.prepare_speech(text, options).await
    }

    pub async fn prepare_speech_batch<S: AsRef<str>>(&self, words: &[S], options: &SpeakOptions) {
        self.playback.prepare_speech_batch(words, options).await
    }

    /// Load the model ahead of the first utterance. Returns whether the
    /// neural path is ready.
    pub async fn initialize_engine(&self, on_progress: Option<ProgressFn>) -> bool {
        if !self.playback.neural_supported() {
            warn!("Neural speech unsupported on this host");
            return false;
        }
        let load = self
            .queue
            .enqueue(move |engine| async move { engine.load(on_progress).await });
        match load.await {
            Ok(()) => true,
            Err(e) => {
                warn!("Engine initialization failed: {}", e);
                false
            }
        }
    }

    /// Start the keep-alive tone. Call after the first user interaction.
    pub fn initialize_audio(&self) -> bool {
        self.keep_alive.start()
    }

    pub fn get_voices(&self, filter: VoiceFilter) -> Vec<&VoiceDescriptor> {
        self.catalog.get_voices(filter)
    }

    pub fn get_languages(&self) -> Vec<Language> {
        self.catalog.languages()
    }

    pub fn engine_state(&self) -> EngineState {
        self.queue.engine_state()
    }

    pub fn engine_backend(&self) -> Option<ExecutionProfile> {
        self.queue.engine_backend()
    }

    /// Remove stored models older than the configured age
    pub async fn purge_models(&self) -> SpeechResult<usize> {
        self.store.purge_stale(self.config.model.max_age_days).await
    }

    pub async fn stored_models(&self) -> SpeechResult<Vec<ModelMeta>> {
        self.store.list().await
    }
}
