//! Background tone that keeps the audio device from idling
//!
//! Some output hardware ramps volume up slowly after a period of silence,
//! which swallows the start of short utterances. A near-inaudible tone keeps
//! the device awake; it is muted while real speech plays.

use crate::config::KeepAliveConfig;
use crate::output::AudioOutput;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToneStatus {
    Off,
    Audible,
    Muted,
}

pub struct AudioKeepAlive {
    config: KeepAliveConfig,
    output: Arc<dyn AudioOutput>,
    status: Mutex<ToneStatus>,
}

impl AudioKeepAlive {
    pub fn new(config: KeepAliveConfig, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            config,
            output,
            status: Mutex::new(ToneStatus::Off),
        }
    }

    /// Start the tone. Later calls are no-ops, as are calls when disabled.
    /// Returns whether the tone is running.
    pub fn start(&self) -> bool {
        let mut status = self.status.lock();
        if *status != ToneStatus::Off {
            return true;
        }
        if !self.config.enabled || !self.output.is_available() {
            return false;
        }

        match self
            .output
            .start_tone(self.config.frequency_hz, self.config.amplitude)
        {
            Ok(()) => {
                *status = ToneStatus::Audible;
                info!(
                    frequency_hz = self.config.frequency_hz,
                    amplitude = self.config.amplitude,
                    "Keep-alive tone started"
                );
                true
            }
            Err(e) => {
                warn!("Keep-alive tone unavailable: {}", e);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        *self.status.lock() != ToneStatus::Off
    }

    /// Silence the tone for the length of an utterance
    pub fn mute(&self) {
        let mut status = self.status.lock();
        if *status == ToneStatus::Audible {
            self.output.set_tone_muted(true);
            *status = ToneStatus::Muted;
        }
    }

    /// Restore the tone after an utterance
    pub fn unmute(&self) {
        let mut status = self.status.lock();
        if *status == ToneStatus::Muted {
            self.output.set_tone_muted(false);
            *status = ToneStatus::Audible;
        }
    }

    pub fn is_muted(&self) -> bool {
        *self.status.lock() == ToneStatus::Muted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::FileOutput;

    fn keep_alive(enabled: bool) -> (tempfile::TempDir, Arc<FileOutput>, AudioKeepAlive) {
        let dir = tempfile::tempdir().unwrap();
        let output = Arc::new(FileOutput::new(dir.path(), false).unwrap());
        let config = KeepAliveConfig {
            enabled,
            ..KeepAliveConfig::default()
        };
        let keep_alive = AudioKeepAlive::new(config, output.clone());
        (dir, output, keep_alive)
    }

    #[test]
    fn start_is_idempotent() {
        let (_dir, output, keep_alive) = keep_alive(true);
        assert!(keep_alive.start());
        output.set_tone_muted(true);
        // A second start must not restart (and unmute) the tone.
        assert!(keep_alive.start());
        assert_eq!(output.tone().map(|t| t.muted), Some(true));
    }

    #[test]
    fn mute_and_unmute_follow_the_tone() {
        let (_dir, output, keep_alive) = keep_alive(true);

        // Before start, mute is a no-op.
        keep_alive.mute();
        assert!(!keep_alive.is_muted());

        keep_alive.start();
        keep_alive.mute();
        assert!(keep_alive.is_muted());
        assert_eq!(output.tone().map(|t| t.muted), Some(true));

        keep_alive.unmute();
        assert!(!keep_alive.is_muted());
        assert_eq!(output.tone().map(|t| t.muted), Some(false));
    }

    #[test]
    fn disabled_never_starts() {
        let (_dir, output, keep_alive) = keep_alive(false);
        assert!(!keep_alive.start());
        assert!(output.tone().is_none());
    }
}
