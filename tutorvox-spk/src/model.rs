//! Neural model seam and the external-runner implementation

use crate::backend::ExecutionProfile;
use crate::config::RunnerConfig;
use crate::error::{SpeechError, SpeechResult};
use crate::wav;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// A loaded model. Not reentrant: callers serialize `generate`.
#[async_trait]
pub trait SpeechModel: Send + Sync {
    /// Generate one WAV segment for a chunk of text
    async fn generate(&self, text: &str, voice: &str, speed: f32) -> SpeechResult<Bytes>;
}

/// Turns raw weights into a model for a given backend and precision
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Whether this host can run the model at all. Checked before any
    /// download is attempted.
    fn is_available(&self) -> bool {
        true
    }

    async fn instantiate(
        &self,
        weights: Bytes,
        profile: ExecutionProfile,
    ) -> SpeechResult<Arc<dyn SpeechModel>>;
}

fn find_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

/// Runs the model through an external program.
///
/// The weights are written to a temporary file that lives as long as the
/// model. Each generation spawns the runner with the configured argument
/// template, writes the text to its stdin and reads the WAV it produces.
pub struct CommandModelLoader {
    runner: RunnerConfig,
}

impl CommandModelLoader {
    pub fn new(runner: RunnerConfig) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ModelLoader for CommandModelLoader {
    fn is_available(&self) -> bool {
        find_program(&self.runner.program).is_some()
    }

    async fn instantiate(
        &self,
        weights: Bytes,
        profile: ExecutionProfile,
    ) -> SpeechResult<Arc<dyn SpeechModel>> {
        let program = find_program(&self.runner.program).ok_or_else(|| {
            SpeechError::Unsupported(format!("Model runner '{}' not found", self.runner.program))
        })?;

        let weights_file = tokio::task::spawn_blocking(move || -> SpeechResult<NamedTempFile> {
            let mut file = tempfile::Builder::new()
                .prefix("tutorvox-model-")
                .suffix(".onnx")
                .tempfile()?;
            file.write_all(&weights)?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| SpeechError::CacheCorruption(format!("Weights write task failed: {}", e)))??;

        debug!(
            program = %program.display(),
            weights = %weights_file.path().display(),
            backend = %profile.backend,
            precision = %profile.precision,
            "Model runner ready"
        );

        Ok(Arc::new(CommandModel {
            program,
            args: self.runner.args.clone(),
            timeout: Duration::from_secs(self.runner.timeout_secs),
            profile,
            weights_file,
        }))
    }
}

struct CommandModel {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    profile: ExecutionProfile,
    weights_file: NamedTempFile,
}

impl CommandModel {
    fn render_args(&self, voice: &str, speed: f32, output: &Path) -> Vec<String> {
        let model = self.weights_file.path().to_string_lossy();
        let output = output.to_string_lossy();
        let speed = format!("{:.2}", speed);
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &model)
                    .replace("{voice}", voice)
                    .replace("{speed}", &speed)
                    .replace("{precision}", self.profile.precision.as_str())
                    .replace("{backend}", &self.profile.backend.to_string())
                    .replace("{output}", &output)
            })
            .collect()
    }
}

#[async_trait]
impl SpeechModel for CommandModel {
    async fn generate(&self, text: &str, voice: &str, speed: f32) -> SpeechResult<Bytes> {
        let output_file = tempfile::Builder::new()
            .prefix("tutorvox-segment-")
            .suffix(".wav")
            .tempfile()?;
        let args = self.render_args(voice, speed, output_file.path());

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpeechError::Synthesis(format!("Failed to start model runner: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SpeechError::Synthesis("Model runner timed out".to_string()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = ?output.status, "Model runner failed: {}", stderr.trim());
            return Err(SpeechError::Synthesis(format!(
                "Model runner exited with {}",
                output.status
            )));
        }

        let audio = Bytes::from(tokio::fs::read(output_file.path()).await?);
        wav::inspect(&audio)
            .map_err(|e| SpeechError::Synthesis(format!("Runner produced invalid audio: {}", e)))?;
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_not_found() {
        assert!(find_program("tutorvox-definitely-not-installed").is_none());
        assert!(find_program("/nonexistent/dir/runner").is_none());
    }

    #[tokio::test]
    async fn instantiate_without_runner_is_unsupported() {
        let loader = CommandModelLoader::new(RunnerConfig {
            program: "tutorvox-definitely-not-installed".to_string(),
            ..RunnerConfig::default()
        });
        assert!(!loader.is_available());
        let profile = ExecutionProfile {
            backend: crate::backend::ComputeBackend::Portable,
            precision: crate::backend::Precision::Q8,
        };
        match loader.instantiate(Bytes::from_static(b"weights"), profile).await {
            Err(SpeechError::Unsupported(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("runner should be missing"),
        }
    }
}
