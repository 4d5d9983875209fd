//! tutorvox-spk: Neural speech for lesson playback
//!
//! Turns lesson text into spoken audio with a locally cached neural model:
//! - Persistent model store with staleness eviction
//! - Hardware-aware model loading, shared across concurrent callers
//! - Serialized synthesis and a coalescing per-utterance audio cache
//! - Token-based cancellation of superseded playback
//! - Graceful fallback to platform speech

pub mod backend;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod keepalive;
pub mod model;
pub mod output;
pub mod playback;
pub mod queue;
pub mod service;
pub mod store;
pub mod voices;
pub mod wav;

pub use backend::{BackendProbe, ComputeBackend, ExecutionProfile, HostBackendProbe, Precision, PrecisionPolicy};
pub use cache::SpeechCache;
pub use config::SpeechConfig;
pub use engine::{EngineDeps, EngineState, LoadProgress, LoadStage, ProgressFn, SynthesisEngine};
pub use error::{SpeechError, SpeechResult};
pub use fallback::{CommandFallback, DisabledFallback, FallbackRequest, FallbackSpeech};
pub use keepalive::AudioKeepAlive;
pub use output::{AudioOutput, FileOutput, PlaybackDone};
#[cfg(feature = "rodio")]
pub use output::RodioOutput;
pub use playback::{PlaybackController, PlaybackState, SpeakCallbacks, SpeakOptions};
pub use queue::SynthesisQueue;
pub use service::SpeechService;
pub use store::{MemoryModelStore, ModelMeta, ModelRecord, ModelStore, RecordMeta, SledModelStore};
pub use voices::{Gender, Language, QualityGrade, VoiceCatalog, VoiceDescriptor, VoiceFilter, VoiceQuery};
