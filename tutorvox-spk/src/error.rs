//! Error types for tutorvox-spk

use std::sync::Arc;
use thiserror::Error;

/// Speech subsystem errors
///
/// Cloneable so a single failure can be handed to every caller that was
/// coalesced onto the same load or synthesis.
#[derive(Error, Debug, Clone)]
pub enum SpeechError {
    /// Model weights could not be fetched (bad status, network error, empty body)
    #[error("Download error: {0}")]
    Download(String),

    /// Stored or freshly fetched weights could not be turned into a model
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Playback error: {0}")]
    Playback(String),

    /// A host capability the requested path needs is missing
    #[error("Unsupported environment: {0}")]
    Unsupported(String),

    #[error("Model store error: {0}")]
    Store(String),

    /// Malformed audio container or segments that cannot be spliced together
    #[error("Audio format error: {0}")]
    Format(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Synthesis queue is closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for SpeechError {
    fn from(err: std::io::Error) -> Self {
        SpeechError::Io(Arc::new(err))
    }
}

impl From<sled::Error> for SpeechError {
    fn from(err: sled::Error) -> Self {
        SpeechError::Store(format!("sled: {}", err))
    }
}

impl From<bincode::Error> for SpeechError {
    fn from(err: bincode::Error) -> Self {
        SpeechError::Store(format!("record encoding: {}", err))
    }
}

impl From<hound::Error> for SpeechError {
    fn from(err: hound::Error) -> Self {
        SpeechError::Format(err.to_string())
    }
}

/// Result alias used across the crate
pub type SpeechResult<T> = Result<T, SpeechError>;
