//! Playback orchestration
//!
//! Every `speak()` and `stop()` bumps a generation token. Async work
//! captures the token it started with and may only touch playback state or
//! call back into the caller while that token is still current. Synthesis in
//! flight is never aborted: a superseded result still lands in the cache.

use crate::cache::SpeechCache;
use crate::chunker::normalize;
use crate::config::clamp_speed;
use crate::fallback::{FallbackRequest, FallbackSpeech};
use crate::keepalive::AudioKeepAlive;
use crate::model::ModelLoader;
use crate::output::AudioOutput;
use crate::voices::{Gender, Language, VoiceCatalog, VoiceQuery};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Where the controller is in an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    /// Waiting for synthesis of a cache miss
    Buffering,
    Playing,
}

/// Caller hook with no arguments
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Per-call options
#[derive(Clone)]
pub struct SpeakOptions {
    /// Use the neural path when the host supports it
    pub high_quality: bool,
    pub voice: Option<String>,
    pub language: Option<Language>,
    pub gender: Option<Gender>,
    /// Clamped to [0.5, 2.0]. Defaults to the configured speed.
    pub speed: Option<f32>,
    pub on_buffer_start: Option<Hook>,
    pub on_buffer_end: Option<Hook>,
}

impl Default for SpeakOptions {
    fn default() -> Self {
        Self {
            high_quality: true,
            voice: None,
            language: None,
            gender: None,
            speed: None,
            on_buffer_start: None,
            on_buffer_end: None,
        }
    }
}

impl fmt::Debug for SpeakOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeakOptions")
            .field("high_quality", &self.high_quality)
            .field("voice", &self.voice)
            .field("language", &self.language)
            .field("gender", &self.gender)
            .field("speed", &self.speed)
            .field("on_buffer_start", &self.on_buffer_start.is_some())
            .field("on_buffer_end", &self.on_buffer_end.is_some())
            .finish()
    }
}

impl SpeakOptions {
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn high_quality(mut self, high_quality: bool) -> Self {
        self.high_quality = high_quality;
        self
    }
}

type Callback = Box<dyn FnOnce() + Send>;

/// `on_start` / `on_end` for one `speak()` call
#[derive(Default)]
pub struct SpeakCallbacks {
    on_start: Option<Callback>,
    on_end: Option<Callback>,
}

impl SpeakCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }

    fn start(&mut self) {
        if let Some(f) = self.on_start.take() {
            f();
        }
    }

    fn end(&mut self) {
        if let Some(f) = self.on_end.take() {
            f();
        }
    }
}

/// Parts the controller plays through
pub struct PlaybackParts {
    pub catalog: VoiceCatalog,
    pub cache: Arc<SpeechCache>,
    pub output: Arc<dyn AudioOutput>,
    pub fallback: Arc<dyn FallbackSpeech>,
    pub keep_alive: Arc<AudioKeepAlive>,
    /// Asked whether the model can run here before anything is downloaded
    pub loader: Arc<dyn ModelLoader>,
    pub neural_enabled: bool,
    pub default_speed: f32,
}

struct Inner {
    parts: PlaybackParts,
    token: AtomicU64,
    state: Mutex<PlaybackState>,
    state_tx: broadcast::Sender<PlaybackState>,
    // Serializes output and fallback starts so a superseded start can stop itself.
    output_gate: tokio::sync::Mutex<()>,
}

/// Resolved voice parameters for one utterance
struct Utterance {
    text: String,
    voice: &'static str,
    speed: f32,
    fallback: FallbackRequest,
}

/// Public face of speech playback. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<Inner>,
}

impl PlaybackController {
    pub fn new(parts: PlaybackParts) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                parts,
                token: AtomicU64::new(0),
                state: Mutex::new(PlaybackState::Idle),
                state_tx,
                output_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.inner.state.lock()
    }

    /// Stream of state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        self.state() != PlaybackState::Idle
    }

    /// Whether the neural path can run on this host
    pub fn neural_supported(&self) -> bool {
        let parts = &self.inner.parts;
        parts.neural_enabled && parts.output.is_available() && parts.loader.is_available()
    }

    pub fn is_speech_available(&self, options: &SpeakOptions) -> bool {
        (options.high_quality && self.neural_supported()) || self.inner.parts.fallback.is_available()
    }

    /// Whether `speak` would start without buffering
    pub fn is_speech_ready(&self, text: &str, options: &SpeakOptions) -> bool {
        if options.high_quality && self.neural_supported() {
            let u = self.inner.utterance(text, options);
            return self.inner.parts.cache.is_ready(u.voice, u.speed, &u.text);
        }
        self.inner.parts.fallback.is_available()
    }

    /// Synthesize into the cache without playing. Playback state is untouched.
    pub async fn prepare_speech(&self, text: &str, options: &SpeakOptions) -> bool {
        if !(options.high_quality && self.neural_supported()) {
            return self.inner.parts.fallback.is_available();
        }
        let u = self.inner.utterance(text, options);
        if u.text.is_empty() {
            return false;
        }
        match self.inner.parts.cache.get_or_create(u.voice, u.speed, &u.text).await {
            Ok(_) => true,
            Err(e) => {
                warn!(voice = u.voice, "Prepare failed: {}", e);
                false
            }
        }
    }

    /// Prepare each word in turn
    pub async fn prepare_speech_batch<S: AsRef<str>>(&self, words: &[S], options: &SpeakOptions) {
        for word in words {
            self.prepare_speech(word.as_ref(), options).await;
        }
    }

    /// Speak `text`, superseding anything already speaking.
    ///
    /// Returns whether speech was started. When nothing can speak, `on_end`
    /// is still called before returning.
    pub fn speak(&self, text: &str, mut callbacks: SpeakCallbacks, options: SpeakOptions) -> bool {
        let inner = &self.inner;
        let token = inner.begin();
        inner.parts.keep_alive.start();

        let utterance = inner.utterance(text, &options);
        if utterance.text.is_empty() {
            callbacks.end();
            return false;
        }

        if options.high_quality && self.neural_supported() {
            let inner = Arc::clone(inner);
            tokio::spawn(async move { inner.run_neural(token, utterance, callbacks, options).await });
            return true;
        }

        if !inner.parts.fallback.is_available() {
            warn!("No speech path available");
            callbacks.end();
            return false;
        }

        info!(token, "Routing speech to fallback");
        let inner = Arc::clone(inner);
        tokio::spawn(async move { inner.run_fallback(token, utterance, callbacks).await });
        true
    }

    /// Cancel the current utterance. In-flight synthesis still completes and
    /// is cached.
    pub fn stop(&self) {
        let token = self.inner.begin();
        debug!(token, "Playback stopped");
    }
}

impl Inner {
    /// Issue a new token and silence whatever was playing
    fn begin(&self) -> u64 {
        let token = {
            let mut state = self.state.lock();
            let token = self.token.fetch_add(1, Ordering::SeqCst) + 1;
            if *state != PlaybackState::Idle {
                *state = PlaybackState::Idle;
                let _ = self.state_tx.send(PlaybackState::Idle);
            }
            token
        };
        self.parts.output.stop();
        self.parts.fallback.cancel();
        self.parts.keep_alive.unmute();
        token
    }

    fn is_current(&self, token: u64) -> bool {
        self.token.load(Ordering::SeqCst) == token
    }

    /// Move to `next` if `token` still owns playback
    fn transition(&self, token: u64, next: PlaybackState) -> bool {
        let mut state = self.state.lock();
        if !self.is_current(token) {
            return false;
        }
        if *state != next {
            *state = next;
            let _ = self.state_tx.send(next);
        }
        true
    }

    fn utterance(&self, text: &str, options: &SpeakOptions) -> Utterance {
        let catalog = &self.parts.catalog;
        let voice = catalog.resolve_voice(VoiceQuery {
            voice: options.voice.as_deref(),
            language: options.language,
            gender: options.gender,
        });
        let speed = clamp_speed(options.speed.unwrap_or(self.parts.default_speed));
        let descriptor = catalog.get(voice);

        Utterance {
            text: normalize(text),
            voice,
            speed,
            fallback: FallbackRequest {
                language: options
                    .language
                    .or(descriptor.map(|d| d.language))
                    .unwrap_or(Language::EnUs),
                gender: options
                    .gender
                    .or(descriptor.map(|d| d.gender))
                    .unwrap_or(Gender::Female),
                speed,
            },
        }
    }

    async fn run_neural(
        self: Arc<Self>,
        token: u64,
        utterance: Utterance,
        mut callbacks: SpeakCallbacks,
        options: SpeakOptions,
    ) {
        let cache = &self.parts.cache;
        let audio = match cache.get_ready(utterance.voice, utterance.speed, &utterance.text) {
            Some(audio) => audio,
            None => {
                // Request first so the result is cached even if we are
                // superseded right away.
                let pending = cache.get_or_create(utterance.voice, utterance.speed, &utterance.text);
                if !self.transition(token, PlaybackState::Buffering) {
                    return;
                }
                if let Some(hook) = &options.on_buffer_start {
                    hook();
                }

                let result = pending.await;

                if !self.is_current(token) {
                    debug!(token, "Synthesis finished for superseded call");
                    return;
                }
                if let Some(hook) = &options.on_buffer_end {
                    hook();
                }

                match result {
                    Ok(audio) => audio,
                    Err(e) => {
                        warn!(voice = utterance.voice, "Neural synthesis failed, falling back: {}", e);
                        if self.parts.fallback.is_available() {
                            self.run_fallback(token, utterance, callbacks).await;
                        } else if self.transition(token, PlaybackState::Idle) {
                            callbacks.end();
                        }
                        return;
                    }
                }
            }
        };

        if !self.is_current(token) {
            return;
        }
        self.play(token, audio, callbacks).await;
    }

    async fn play(&self, token: u64, audio: Bytes, mut callbacks: SpeakCallbacks) {
        let gate = self.output_gate.lock().await;
        if !self.is_current(token) {
            return;
        }

        self.parts.keep_alive.mute();
        let done = match self.parts.output.play(audio).await {
            Ok(done) => done,
            Err(e) => {
                warn!(token, "Playback failed: {}", e);
                if self.transition(token, PlaybackState::Idle) {
                    self.parts.keep_alive.unmute();
                    callbacks.end();
                }
                return;
            }
        };

        if !self.transition(token, PlaybackState::Playing) {
            // Superseded while starting; no newer output can have begun.
            self.parts.output.stop();
            return;
        }
        drop(gate);
        callbacks.start();

        let _ = done.await;

        if self.transition(token, PlaybackState::Idle) {
            self.parts.keep_alive.unmute();
            callbacks.end();
        }
    }

    async fn run_fallback(&self, token: u64, utterance: Utterance, mut callbacks: SpeakCallbacks) {
        let gate = self.output_gate.lock().await;
        if !self.is_current(token) {
            return;
        }

        let done = match self.parts.fallback.speak(&utterance.text, utterance.fallback).await {
            Ok(done) => done,
            Err(e) => {
                warn!(token, "Fallback speech failed: {}", e);
                if self.transition(token, PlaybackState::Idle) {
                    callbacks.end();
                }
                return;
            }
        };

        if !self.transition(token, PlaybackState::Playing) {
            self.parts.fallback.cancel();
            return;
        }
        drop(gate);
        self.parts.keep_alive.mute();
        callbacks.start();

        let _ = done.await;

        if self.transition(token, PlaybackState::Idle) {
            self.parts.keep_alive.unmute();
            callbacks.end();
        }
    }
}
