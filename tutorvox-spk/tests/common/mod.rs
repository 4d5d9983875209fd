//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tutorvox_spk::backend::{BackendProbe, ComputeBackend, ExecutionProfile};
use tutorvox_spk::download::{ByteProgress, WeightsFetcher};
use tutorvox_spk::engine::EngineDeps;
use tutorvox_spk::fallback::{FallbackRequest, FallbackSpeech};
use tutorvox_spk::model::{ModelLoader, SpeechModel};
use tutorvox_spk::output::{AudioOutput, PlaybackDone};
use tutorvox_spk::store::{MemoryModelStore, ModelStore};
use tutorvox_spk::{wav, SpeechConfig, SpeechError, SpeechResult};

pub const WEIGHTS: &[u8] = b"kokoro-test-weights-0123456789";
pub const SAMPLE_RATE: u32 = 24_000;
/// Length of every generated segment
pub const SEGMENT_SECS: f32 = 0.1;

pub fn test_config() -> SpeechConfig {
    let mut config = SpeechConfig::default();
    config.model.min_bytes = 8;
    config.keep_alive.enabled = false;
    config
}

/// Serves fixed weights, counting calls
pub struct FakeFetcher {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Duration,
    payload: Bytes,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::with_payload(Bytes::from_static(WEIGHTS))
    }

    pub fn with_payload(payload: Bytes) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::from_millis(20),
            payload,
        }
    }

    pub fn failing() -> Self {
        let fetcher = Self::new();
        fetcher.fail.store(true, Ordering::SeqCst);
        fetcher
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WeightsFetcher for FakeFetcher {
    async fn fetch(&self, _url: &str, on_bytes: ByteProgress<'_>) -> SpeechResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(SpeechError::Download("HTTP 503 Service Unavailable".to_string()));
        }
        let total = self.payload.len() as u64;
        on_bytes(0, Some(total));
        on_bytes(total / 2, Some(total));
        on_bytes(total, Some(total));
        Ok(self.payload.clone())
    }
}

/// Model that renders every chunk as a short tone
pub struct FakeModel {
    pub calls: AtomicUsize,
    pub texts: Mutex<Vec<String>>,
    active: AtomicUsize,
    pub overlapped: AtomicBool,
    pub fail_on: Mutex<Option<String>>,
    /// When set, each generation waits for a permit
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            fail_on: Mutex::new(None),
            gate: None,
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechModel for FakeModel {
    async fn generate(&self, text: &str, _voice: &str, _speed: f32) -> SpeechResult<Bytes> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().push(text.to_string());

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        } else {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let failing = self.fail_on.lock().as_deref() == Some(text);
        self.active.fetch_sub(1, Ordering::SeqCst);
        if failing {
            return Err(SpeechError::Synthesis(format!("cannot say {}", text)));
        }
        wav::tone(SAMPLE_RATE, 440.0, 0.3, SEGMENT_SECS)
    }
}

/// Hands out one shared [`FakeModel`], counting instantiations
pub struct FakeLoader {
    pub model: Arc<FakeModel>,
    pub calls: AtomicUsize,
    pub available: AtomicBool,
    pub reject: AtomicBool,
    /// Answer `Unsupported` from `instantiate`
    pub unsupported: AtomicBool,
    /// Panic on the next `instantiate`, once
    pub panic_once: AtomicBool,
    pub seen: Mutex<Vec<(Bytes, ExecutionProfile)>>,
}

impl FakeLoader {
    pub fn new(model: Arc<FakeModel>) -> Self {
        Self {
            model,
            calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            reject: AtomicBool::new(false),
            unsupported: AtomicBool::new(false),
            panic_once: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn instantiate(
        &self,
        weights: Bytes,
        profile: ExecutionProfile,
    ) -> SpeechResult<Arc<dyn SpeechModel>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.seen.lock().push((weights.clone(), profile));
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("runtime crashed while mapping weights");
        }
        if self.unsupported.load(Ordering::SeqCst) {
            return Err(SpeechError::Unsupported("no execution provider".to_string()));
        }
        if self.reject.load(Ordering::SeqCst) || weights.as_ref() != WEIGHTS {
            return Err(SpeechError::CacheCorruption("weights rejected".to_string()));
        }
        Ok(self.model.clone())
    }
}

pub struct FixedProbe(pub ComputeBackend);

#[async_trait]
impl BackendProbe for FixedProbe {
    async fn probe(&self) -> ComputeBackend {
        self.0
    }
}

/// Everything an engine needs, with handles kept for assertions
pub struct Harness {
    pub store: Arc<MemoryModelStore>,
    pub fetcher: Arc<FakeFetcher>,
    pub model: Arc<FakeModel>,
    pub loader: Arc<FakeLoader>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_model(FakeModel::new())
    }

    pub fn with_model(model: FakeModel) -> Self {
        let model = Arc::new(model);
        Self {
            store: Arc::new(MemoryModelStore::new()),
            fetcher: Arc::new(FakeFetcher::new()),
            loader: Arc::new(FakeLoader::new(model.clone())),
            model,
        }
    }

    pub fn deps(&self) -> EngineDeps {
        self.deps_with_store(self.store.clone())
    }

    pub fn deps_with_store(&self, store: Arc<dyn ModelStore>) -> EngineDeps {
        EngineDeps {
            store,
            fetcher: self.fetcher.clone(),
            loader: self.loader.clone(),
            probe: Arc::new(FixedProbe(ComputeBackend::Portable)),
        }
    }
}

/// Output that records what it played. Each utterance ends when the test
/// says so, or immediately in auto-finish mode.
pub struct RecordingOutput {
    pub available: AtomicBool,
    pub auto_finish: bool,
    pub played: Mutex<Vec<Bytes>>,
    pub stops: AtomicUsize,
    pub refuse: AtomicBool,
    finishers: Mutex<Vec<oneshot::Sender<()>>>,
    pub tone_muted: Mutex<Vec<bool>>,
}

impl RecordingOutput {
    pub fn new(auto_finish: bool) -> Self {
        Self {
            available: AtomicBool::new(true),
            auto_finish,
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            finishers: Mutex::new(Vec::new()),
            tone_muted: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        let output = Self::new(true);
        output.available.store(false, Ordering::SeqCst);
        output
    }

    pub fn plays(&self) -> usize {
        self.played.lock().len()
    }

    /// End every utterance still sounding
    pub fn finish_all(&self) {
        for done in self.finishers.lock().drain(..) {
            let _ = done.send(());
        }
    }
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn play(&self, audio: Bytes) -> SpeechResult<PlaybackDone> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SpeechError::Playback("decoder refused".to_string()));
        }
        self.played.lock().push(audio);
        let (done_tx, done_rx) = oneshot::channel();
        if self.auto_finish {
            let _ = done_tx.send(());
        } else {
            self.finishers.lock().push(done_tx);
        }
        Ok(done_rx)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.finish_all();
    }

    fn start_tone(&self, _frequency_hz: f32, _amplitude: f32) -> SpeechResult<()> {
        Ok(())
    }

    fn set_tone_muted(&self, muted: bool) {
        self.tone_muted.lock().push(muted);
    }
}

/// Fallback that records what it was asked to say. Speech ends at once
/// unless the fallback is held, in which case it runs until cancelled or
/// finished by the test.
pub struct RecordingFallback {
    pub available: bool,
    pub spoken: Mutex<Vec<(String, FallbackRequest)>>,
    pub cancels: AtomicUsize,
    /// Calls to `speak` entered so far
    pub entered: AtomicUsize,
    /// When set, each start waits for a permit
    pub gate: Option<Arc<Semaphore>>,
    held: bool,
    live: Mutex<Vec<(String, oneshot::Sender<()>)>>,
    pub cut_off: Mutex<Vec<String>>,
}

impl RecordingFallback {
    pub fn new(available: bool) -> Self {
        Self {
            available,
            spoken: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
            gate: None,
            held: false,
            live: Mutex::new(Vec::new()),
            cut_off: Mutex::new(Vec::new()),
        }
    }

    /// Available fallback whose starts wait on `gate` and whose speech
    /// lasts until cancelled or finished
    pub fn held(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            held: true,
            ..Self::new(true)
        }
    }

    pub fn spoken_texts(&self) -> Vec<String> {
        self.spoken.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn cut_off_texts(&self) -> Vec<String> {
        self.cut_off.lock().clone()
    }

    pub fn finish_all(&self) {
        for (_, done) in self.live.lock().drain(..) {
            let _ = done.send(());
        }
    }
}

#[async_trait]
impl FallbackSpeech for RecordingFallback {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn speak(&self, text: &str, request: FallbackRequest) -> SpeechResult<PlaybackDone> {
        if !self.available {
            return Err(SpeechError::Unsupported("no platform speech".to_string()));
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.spoken.lock().push((text.to_string(), request));
        let (done_tx, done_rx) = oneshot::channel();
        if self.held {
            self.live.lock().push((text.to_string(), done_tx));
        } else {
            let _ = done_tx.send(());
        }
        Ok(done_rx)
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let mut cut_off = self.cut_off.lock();
        for (text, done) in self.live.lock().drain(..) {
            cut_off.push(text);
            let _ = done.send(());
        }
    }
}

/// Records callback invocations by name
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn recorder(&self, event: &'static str) -> impl FnOnce() + Send + 'static {
        let log = self.clone();
        move || log.push(event)
    }

    pub fn hook(&self, event: &'static str) -> Arc<dyn Fn() + Send + Sync> {
        let log = self.clone();
        Arc::new(move || log.push(event))
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in self.events() {
            *counts.entry(event).or_insert(0) += 1;
        }
        counts
    }
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
