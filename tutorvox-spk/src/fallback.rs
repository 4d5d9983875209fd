//! Platform speech used when the neural path is unavailable

use crate::config::FallbackConfig;
use crate::error::{SpeechError, SpeechResult};
use crate::output::PlaybackDone;
use crate::voices::{Gender, Language};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Words per minute at speed 1.0
const BASE_WPM: f32 = 175.0;

/// What the fallback should sound like
#[derive(Debug, Clone, Copy)]
pub struct FallbackRequest {
    pub language: Language,
    pub gender: Gender,
    pub speed: f32,
}

impl Default for FallbackRequest {
    fn default() -> Self {
        Self {
            language: Language::EnUs,
            gender: Gender::Female,
            speed: 1.0,
        }
    }
}

/// Simpler speech capability with no pre-buffering
#[async_trait]
pub trait FallbackSpeech: Send + Sync {
    fn is_available(&self) -> bool;

    /// Start speaking `text`. Returns once speech has started; the receiver
    /// resolves when it ends or is cancelled.
    async fn speak(&self, text: &str, request: FallbackRequest) -> SpeechResult<PlaybackDone>;

    /// Cut off whatever has been started
    fn cancel(&self);
}

/// Fallback that is never available
pub struct DisabledFallback;

#[async_trait]
impl FallbackSpeech for DisabledFallback {
    fn is_available(&self) -> bool {
        false
    }

    async fn speak(&self, _text: &str, _request: FallbackRequest) -> SpeechResult<PlaybackDone> {
        Err(SpeechError::Unsupported("Fallback speech disabled".to_string()))
    }

    fn cancel(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Espeak,
    Say,
}

/// Speaks through espeak-ng (Linux) or `say` (macOS)
pub struct CommandFallback {
    program: Option<String>,
    flavor: Flavor,
    cancel_tx: watch::Sender<u64>,
}

impl CommandFallback {
    /// Detect the platform speech program. A configured command wins.
    pub fn detect(config: &FallbackConfig) -> Self {
        let flavor = if cfg!(target_os = "macos") {
            Flavor::Say
        } else {
            Flavor::Espeak
        };

        let program = config.command.clone().or_else(|| {
            let candidates: &[&str] = match flavor {
                Flavor::Say => &["say"],
                Flavor::Espeak => &["espeak-ng", "espeak"],
            };
            candidates
                .iter()
                .find(|name| program_exists(name))
                .map(|name| name.to_string())
        });

        match &program {
            Some(program) => info!(program, "Fallback speech available"),
            None => warn!("No fallback speech program found"),
        }

        let (cancel_tx, _) = watch::channel(0);
        Self {
            program,
            flavor,
            cancel_tx,
        }
    }

    fn args(&self, text: &str, request: FallbackRequest) -> Vec<String> {
        let wpm = (BASE_WPM * request.speed).round() as u32;
        match self.flavor {
            Flavor::Espeak => {
                let variant = match request.gender {
                    Gender::Female => "f3",
                    Gender::Male => "m3",
                };
                vec![
                    "-v".to_string(),
                    format!("{}+{}", request.language.code(), variant),
                    "-s".to_string(),
                    wpm.to_string(),
                    "--".to_string(),
                    text.to_string(),
                ]
            }
            Flavor::Say => vec!["-r".to_string(), wpm.to_string(), "--".to_string(), text.to_string()],
        }
    }
}

fn program_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

#[async_trait]
impl FallbackSpeech for CommandFallback {
    fn is_available(&self) -> bool {
        self.program.is_some()
    }

    async fn speak(&self, text: &str, request: FallbackRequest) -> SpeechResult<PlaybackDone> {
        let program = self
            .program
            .clone()
            .ok_or_else(|| SpeechError::Unsupported("No fallback speech program".to_string()))?;

        // Strip control characters before passing text as an argument.
        let text: String = text.chars().filter(|c| !c.is_control()).collect();

        // Subscribe before spawning so a cancel issued from here on is seen.
        let mut cancelled = self.cancel_tx.subscribe();
        let generation = *cancelled.borrow();

        let mut child = Command::new(&program)
            .args(self.args(&text, request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpeechError::Playback(format!("Failed to start {}: {}", program, e)))?;
        debug!(program = %program, "Fallback speech started");

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) if !status.success() => {
                                warn!(program = %program, "Fallback speech exited with {}", status);
                            }
                            Err(e) => warn!(program = %program, "Fallback speech wait failed: {}", e),
                            Ok(_) => {}
                        }
                        break;
                    }
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() != generation {
                            let _ = child.kill().await;
                            debug!(program = %program, "Fallback speech cancelled");
                            break;
                        }
                    }
                }
            }
            let _ = done_tx.send(());
        });

        Ok(done_rx)
    }

    fn cancel(&self) {
        self.cancel_tx.send_modify(|generation| *generation += 1);
    }
}
