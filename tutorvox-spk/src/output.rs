//! Host audio output
//!
//! [`AudioOutput`] is the seam between playback and the sound device. The
//! default build ships [`FileOutput`], which writes each utterance to disk;
//! the `rodio` feature adds [`RodioOutput`] for real device playback.

use crate::error::{SpeechError, SpeechResult};
use crate::wav;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Resolves when an utterance stops sounding, either because it ended or
/// because the output was stopped
pub type PlaybackDone = oneshot::Receiver<()>;

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Whether the host can play audio at all
    fn is_available(&self) -> bool;

    /// Start playing a WAV buffer. Returns once audio has started.
    async fn play(&self, audio: Bytes) -> SpeechResult<PlaybackDone>;

    /// Stop the current utterance immediately
    fn stop(&self);

    /// Start the continuous background tone
    fn start_tone(&self, frequency_hz: f32, amplitude: f32) -> SpeechResult<()>;

    fn set_tone_muted(&self, muted: bool);
}

/// Tone state as seen by [`FileOutput`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneState {
    pub frequency_hz: f32,
    pub amplitude: f32,
    pub muted: bool,
}

/// Writes each utterance as `utterance-NNNN.wav` under a directory.
///
/// With pacing enabled an utterance "plays" for its real duration, so stop
/// and supersession behave like a device.
pub struct FileOutput {
    dir: PathBuf,
    pace: bool,
    counter: AtomicU64,
    stop_tx: watch::Sender<u64>,
    tone: Mutex<Option<ToneState>>,
}

impl FileOutput {
    pub fn new(dir: impl Into<PathBuf>, pace: bool) -> SpeechResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (stop_tx, _) = watch::channel(0);
        Ok(Self {
            dir,
            pace,
            counter: AtomicU64::new(0),
            stop_tx,
            tone: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of utterances written so far
    pub fn written(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn tone(&self) -> Option<ToneState> {
        *self.tone.lock()
    }
}

#[async_trait]
impl AudioOutput for FileOutput {
    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }

    async fn play(&self, audio: Bytes) -> SpeechResult<PlaybackDone> {
        let duration = wav::duration_secs(&audio)
            .map_err(|e| SpeechError::Playback(format!("Cannot decode audio: {}", e)))?;

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.join(format!("utterance-{:04}.wav", n));
        tokio::fs::write(&path, &audio).await?;
        info!(path = %path.display(), secs = duration, "Utterance written");

        let (done_tx, done_rx) = oneshot::channel();
        if !self.pace {
            let _ = done_tx.send(());
            return Ok(done_rx);
        }

        let mut stopped = self.stop_tx.subscribe();
        let generation = *stopped.borrow();
        tokio::spawn(async move {
            let wait = tokio::time::sleep(Duration::from_secs_f64(duration));
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() != generation {
                            break;
                        }
                    }
                }
            }
            let _ = done_tx.send(());
        });
        Ok(done_rx)
    }

    fn stop(&self) {
        self.stop_tx.send_modify(|generation| *generation += 1);
        debug!("File output stopped");
    }

    fn start_tone(&self, frequency_hz: f32, amplitude: f32) -> SpeechResult<()> {
        *self.tone.lock() = Some(ToneState {
            frequency_hz,
            amplitude,
            muted: false,
        });
        Ok(())
    }

    fn set_tone_muted(&self, muted: bool) {
        if let Some(tone) = self.tone.lock().as_mut() {
            tone.muted = muted;
        }
    }
}

#[cfg(feature = "rodio")]
pub use device::RodioOutput;

#[cfg(feature = "rodio")]
mod device {
    //! Device playback through rodio.
    //!
    //! `OutputStream` is not `Send`, so the stream and sinks live on a
    //! dedicated thread that takes commands over a channel.

    use super::{AudioOutput, PlaybackDone};
    use crate::error::{SpeechError, SpeechResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use rodio::source::{SineWave, Source};
    use rodio::{OutputStream, Sink};
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::thread;
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use tracing::{error, info, warn};

    enum Command {
        Play(Bytes, oneshot::Sender<SpeechResult<PlaybackDone>>),
        Stop,
        StartTone(f32, f32, mpsc::Sender<SpeechResult<()>>),
        MuteTone(bool),
    }

    pub struct RodioOutput {
        commands: mpsc::Sender<Command>,
    }

    impl RodioOutput {
        /// Open the default output device
        pub fn new() -> SpeechResult<Self> {
            let (commands, receiver) = mpsc::channel();
            let (ready_tx, ready_rx) = mpsc::channel();

            thread::Builder::new()
                .name("tutorvox-audio".to_string())
                .spawn(move || run_device(receiver, ready_tx))
                .map_err(|e| SpeechError::Playback(format!("Failed to start audio thread: {}", e)))?;

            ready_rx
                .recv()
                .map_err(|_| SpeechError::Playback("Audio thread exited".to_string()))??;
            info!("Audio output ready");
            Ok(Self { commands })
        }
    }

    fn run_device(receiver: mpsc::Receiver<Command>, ready: mpsc::Sender<SpeechResult<()>>) {
        let (_stream, handle) = match OutputStream::try_default() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = ready.send(Err(SpeechError::Unsupported(format!("No audio device: {}", e))));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        let mut voice: Option<Arc<Sink>> = None;
        let mut tone: Option<Sink> = None;

        while let Ok(command) = receiver.recv() {
            match command {
                Command::Play(audio, reply) => {
                    if let Some(old) = voice.take() {
                        old.stop();
                    }
                    let result = Sink::try_new(&handle)
                        .map_err(|e| SpeechError::Playback(e.to_string()))
                        .and_then(|sink| {
                            let source = rodio::Decoder::new(Cursor::new(audio))
                                .map_err(|e| SpeechError::Playback(format!("Decode failed: {}", e)))?;
                            sink.append(source.convert_samples::<f32>());
                            Ok(sink)
                        });
                    match result {
                        Ok(sink) => {
                            let sink = Arc::new(sink);
                            let (done_tx, done_rx) = oneshot::channel();
                            let watcher = Arc::clone(&sink);
                            thread::spawn(move || {
                                watcher.sleep_until_end();
                                let _ = done_tx.send(());
                            });
                            voice = Some(sink);
                            let _ = reply.send(Ok(done_rx));
                        }
                        Err(e) => {
                            warn!("Playback refused: {}", e);
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Command::Stop => {
                    if let Some(sink) = voice.take() {
                        sink.stop();
                    }
                }
                Command::StartTone(frequency, amplitude, reply) => {
                    let result = Sink::try_new(&handle)
                        .map(|sink| {
                            sink.append(SineWave::new(frequency).amplify(amplitude));
                            sink
                        })
                        .map_err(|e| SpeechError::Playback(e.to_string()));
                    match result {
                        Ok(sink) => {
                            tone = Some(sink);
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            error!("Failed to start tone: {}", e);
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Command::MuteTone(muted) => {
                    if let Some(sink) = tone.as_ref() {
                        sink.set_volume(if muted { 0.0 } else { 1.0 });
                    }
                }
            }
        }
    }

    #[async_trait]
    impl AudioOutput for RodioOutput {
        fn is_available(&self) -> bool {
            true
        }

        async fn play(&self, audio: Bytes) -> SpeechResult<PlaybackDone> {
            let (reply, result) = oneshot::channel();
            self.commands
                .send(Command::Play(audio, reply))
                .map_err(|_| SpeechError::Playback("Audio thread stopped".to_string()))?;
            result
                .await
                .map_err(|_| SpeechError::Playback("Audio thread stopped".to_string()))?
        }

        fn stop(&self) {
            let _ = self.commands.send(Command::Stop);
        }

        fn start_tone(&self, frequency_hz: f32, amplitude: f32) -> SpeechResult<()> {
            let (reply, result) = mpsc::channel();
            self.commands
                .send(Command::StartTone(frequency_hz, amplitude, reply))
                .map_err(|_| SpeechError::Playback("Audio thread stopped".to_string()))?;
            result
                .recv()
                .map_err(|_| SpeechError::Playback("Audio thread stopped".to_string()))?
        }

        fn set_tone_muted(&self, muted: bool) {
            let _ = self.commands.send(Command::MuteTone(muted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_output_writes_utterances() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileOutput::new(dir.path(), false).unwrap();
        assert!(output.is_available());

        let audio = wav::tone(16_000, 440.0, 0.5, 0.05).unwrap();
        let done = output.play(audio.clone()).await.unwrap();
        done.await.unwrap();

        assert_eq!(output.written(), 1);
        let written = std::fs::read(dir.path().join("utterance-0001.wav")).unwrap();
        assert_eq!(written, audio.to_vec());
    }

    #[tokio::test]
    async fn paced_playback_ends_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileOutput::new(dir.path(), true).unwrap();

        let audio = wav::tone(16_000, 440.0, 0.5, 30.0).unwrap();
        let done = output.play(audio).await.unwrap();
        output.stop();

        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("stop should end playback")
            .unwrap();
    }

    #[tokio::test]
    async fn undecodable_audio_is_a_playback_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileOutput::new(dir.path(), false).unwrap();
        match output.play(Bytes::from_static(b"junk")).await {
            Err(SpeechError::Playback(_)) => {}
            other => panic!("expected playback error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn tone_mute_is_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileOutput::new(dir.path(), false).unwrap();
        assert!(output.tone().is_none());
        output.start_tone(30.0, 0.001).unwrap();
        output.set_tone_muted(true);
        assert_eq!(output.tone().map(|t| t.muted), Some(true));
    }
}
