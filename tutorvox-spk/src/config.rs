//! Configuration for the speech subsystem

use crate::backend::{ComputeBackend, PrecisionPolicy};
use crate::error::SpeechError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Lowest playback speed accepted by the engine
pub const MIN_SPEED: f32 = 0.5;
/// Highest playback speed accepted by the engine
pub const MAX_SPEED: f32 = 2.0;

/// Clamp a requested speed into the supported range. NaN maps to 1.0.
pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_nan() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

/// Speech subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Allow the neural path at all
    pub neural_enabled: bool,

    /// Model weights origin and cache policy
    pub model: ModelConfig,

    /// Precision to load per compute backend
    pub precision: PrecisionPolicy,

    /// Force a backend instead of probing
    pub backend_override: Option<ComputeBackend>,

    /// Directory of the persistent model store
    pub store_path: PathBuf,

    /// Maximum characters handed to the model in one generation call
    pub chunk_max_chars: usize,

    /// Speed used when the caller does not pass one
    pub default_speed: f32,

    pub runner: RunnerConfig,

    pub keep_alive: KeepAliveConfig,

    pub fallback: FallbackConfig,
}

/// Where the model comes from and how long a stored copy stays valid
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier, also the store key prefix
    pub id: String,

    /// Download URL of the weights
    pub url: String,

    /// Version tag recorded alongside stored weights
    pub version: String,

    /// Smallest plausible weights size in bytes
    pub min_bytes: u64,

    /// Stored weights older than this are purged
    pub max_age_days: u32,

    pub download_timeout_secs: u64,
}

/// External program that runs the model
///
/// Arguments may contain `{model}`, `{voice}`, `{speed}`, `{precision}`,
/// `{backend}` and `{output}` placeholders. Text is written to stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

/// Background tone that keeps the output device awake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub frequency_hz: f32,
    pub amplitude: f32,
}

/// Platform speech used when the neural path is unavailable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Program to run instead of the platform default (espeak-ng / say)
    pub command: Option<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        let store_path = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tutorvox")
            .join("models");

        Self {
            neural_enabled: true,
            model: ModelConfig::default(),
            precision: PrecisionPolicy::default(),
            backend_override: None,
            store_path,
            chunk_max_chars: 400,
            default_speed: 1.0,
            runner: RunnerConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: "kokoro-82m".to_string(),
            url: "https://huggingface.co/onnx-community/Kokoro-82M-v1.0-ONNX/resolve/main/onnx/model_quantized.onnx"
                .to_string(),
            version: "1.0".to_string(),
            min_bytes: 1024 * 1024,
            max_age_days: 30,
            download_timeout_secs: 3600,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "kokoro-tts".to_string(),
            args: vec![
                "--model".to_string(),
                "{model}".to_string(),
                "--voice".to_string(),
                "{voice}".to_string(),
                "--speed".to_string(),
                "{speed}".to_string(),
                "--output".to_string(),
                "{output}".to_string(),
            ],
            timeout_secs: 120,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency_hz: 30.0,
            amplitude: 0.001,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
        }
    }
}

impl ModelConfig {
    /// Store key of the weights for a given precision
    pub fn store_key(&self, precision: crate::backend::Precision) -> String {
        format!("{}@{}:{}", self.id, self.version, precision)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() || self.id.len() > 128 {
            return Err("Model id must be 1-128 characters".to_string());
        }

        if self.id.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
            return Err("Model id contains invalid characters".to_string());
        }

        if !(self.url.starts_with("https://") || self.url.starts_with("http://")) {
            return Err("Model URL must be http(s)".to_string());
        }

        if self.url.len() > 2048 {
            return Err("Model URL too long (max 2048 chars)".to_string());
        }

        if self.version.is_empty() {
            return Err("Model version cannot be empty".to_string());
        }

        if self.max_age_days == 0 {
            return Err("max_age_days must be greater than 0".to_string());
        }

        if self.download_timeout_secs == 0 {
            return Err("Download timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl SpeechConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, SpeechError> {
        let config: SpeechConfig =
            toml::from_str(s).map_err(|e| SpeechError::Config(format!("Invalid TOML: {}", e)))?;
        config.validate().map_err(SpeechError::Config)?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SpeechError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SpeechError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;

        if !(MIN_SPEED..=MAX_SPEED).contains(&self.default_speed) {
            return Err(format!(
                "Default speed must be between {} and {}",
                MIN_SPEED, MAX_SPEED
            ));
        }

        if !(16..=10_000).contains(&self.chunk_max_chars) {
            return Err("chunk_max_chars must be between 16 and 10000".to_string());
        }

        // Prevent path traversal
        if self.store_path.to_string_lossy().contains("..") {
            return Err("Store path cannot contain '..'".to_string());
        }

        if self.keep_alive.enabled {
            if !(self.keep_alive.amplitude > 0.0 && self.keep_alive.amplitude <= 0.05) {
                return Err("Keep-alive amplitude must be in (0, 0.05]".to_string());
            }
            if !(1.0..=20_000.0).contains(&self.keep_alive.frequency_hz) {
                return Err("Keep-alive frequency must be between 1 and 20000 Hz".to_string());
            }
        }

        if self.neural_enabled {
            if self.runner.program.is_empty() {
                return Err("Runner program cannot be empty".to_string());
            }
            if self.runner.timeout_secs == 0 {
                return Err("Runner timeout must be greater than 0".to_string());
            }
        }

        if let Some(ref command) = self.fallback.command {
            if command.is_empty() || command.chars().any(|c| c.is_control()) {
                return Err("Fallback command is invalid".to_string());
            }
        }

        Ok(())
    }
}
