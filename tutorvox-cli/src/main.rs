// TutorVox Command Line Interface
// Speak lesson text, warm the model cache and inspect the voice registry

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tutorvox_spk::{
    AudioOutput, FileOutput, Gender, Language, LoadProgress, ProgressFn, SpeakCallbacks, SpeakOptions,
    SpeechConfig, SpeechService, VoiceFilter,
};

#[derive(Parser)]
#[command(name = "tutorvox")]
#[command(about = "TutorVox - neural speech for lesson playback", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Directory WAV files are written to when no audio device is used
    #[arg(long, default_value = "./utterances", global = true)]
    out_dir: PathBuf,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak text
    Speak {
        text: String,

        #[command(flatten)]
        voice: VoiceArgs,

        /// Use platform speech instead of the neural model
        #[arg(long)]
        low_quality: bool,
    },

    /// Synthesize words into the cache without playing them
    Prepare {
        words: Vec<String>,

        #[command(flatten)]
        voice: VoiceArgs,
    },

    /// List voices, best first
    Voices {
        #[arg(long)]
        language: Option<Language>,

        #[arg(long)]
        gender: Option<Gender>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List supported languages
    Languages,

    /// Download and load the model ahead of time
    Init,

    /// List stored model weights
    Models,

    /// Remove stored model weights older than the configured age
    Purge,

    /// Print the effective configuration
    ShowConfig,
}

#[derive(clap::Args)]
struct VoiceArgs {
    /// Voice id, e.g. af_heart
    #[arg(long)]
    voice: Option<String>,

    #[arg(long)]
    language: Option<Language>,

    #[arg(long)]
    gender: Option<Gender>,

    /// Speaking rate, 0.5 to 2.0
    #[arg(long)]
    speed: Option<f32>,
}

impl VoiceArgs {
    fn options(&self) -> SpeakOptions {
        SpeakOptions {
            voice: self.voice.clone(),
            language: self.language,
            gender: self.gender,
            speed: self.speed,
            ..SpeakOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => SpeechConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SpeechConfig::default(),
    };

    match cli.command {
        Commands::Speak { text, voice, low_quality } => {
            let service = open_service(config, &cli.out_dir)?;
            let options = voice.options().high_quality(!low_quality);
            speak(&service, &text, options).await?;
        }
        Commands::Prepare { words, voice } => {
            let service = open_service(config, &cli.out_dir)?;
            let options = voice.options();
            service.prepare_speech_batch(&words, &options).await;
            let ready = words
                .iter()
                .filter(|w| service.is_speech_ready(w, &options))
                .count();
            println!("{} of {} words ready", ready, words.len());
        }
        Commands::Voices { language, gender, json } => {
            let service = open_service(config, &cli.out_dir)?;
            let voices = service.get_voices(VoiceFilter { language, gender });
            if json {
                println!("{}", serde_json::to_string_pretty(&voices)?);
            } else {
                for v in voices {
                    println!(
                        "{:<14} {:<10} {:<6} {:<7} {}",
                        v.id,
                        v.name,
                        v.language,
                        v.gender,
                        v.grade.label()
                    );
                }
            }
        }
        Commands::Languages => {
            let service = open_service(config, &cli.out_dir)?;
            for language in service.get_languages() {
                println!("{}", language);
            }
        }
        Commands::Init => {
            let service = open_service(config, &cli.out_dir)?;
            let progress: ProgressFn = Arc::new(|p: LoadProgress| {
                eprintln!("{:>3}% {:?}", p.percent, p.stage);
            });
            if !service.initialize_engine(Some(progress)).await {
                anyhow::bail!("neural engine could not be loaded (see log output)");
            }
            if let Some(profile) = service.engine_backend() {
                println!("Engine ready on {} ({})", profile.backend, profile.precision);
            }
        }
        Commands::Models => {
            let service = open_service(config, &cli.out_dir)?;
            let models = service.stored_models().await?;
            println!("{}", serde_json::to_string_pretty(&models)?);
        }
        Commands::Purge => {
            let service = open_service(config, &cli.out_dir)?;
            let removed = service.purge_models().await?;
            println!("Removed {} stale model(s)", removed);
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn open_service(config: SpeechConfig, out_dir: &Path) -> anyhow::Result<SpeechService> {
    let output = audio_output(out_dir)?;
    let service = SpeechService::from_config(config, output)?;
    Ok(service)
}

#[cfg(feature = "audio")]
fn audio_output(out_dir: &Path) -> anyhow::Result<Arc<dyn AudioOutput>> {
    match tutorvox_spk::RodioOutput::new() {
        Ok(output) => Ok(Arc::new(output)),
        Err(e) => {
            warn!("No audio device ({}), writing WAV files instead", e);
            Ok(Arc::new(FileOutput::new(out_dir, true)?))
        }
    }
}

#[cfg(not(feature = "audio"))]
fn audio_output(out_dir: &Path) -> anyhow::Result<Arc<dyn AudioOutput>> {
    Ok(Arc::new(FileOutput::new(out_dir, true)?))
}

async fn speak(service: &SpeechService, text: &str, options: SpeakOptions) -> anyhow::Result<()> {
    let (end_tx, end_rx) = oneshot::channel();
    let callbacks = SpeakCallbacks::new()
        .on_start(|| info!("Speaking"))
        .on_end(move || {
            let _ = end_tx.send(());
        });

    service.initialize_audio();
    if !service.speak(text, callbacks, options) {
        anyhow::bail!("no speech path available");
    }

    tokio::select! {
        _ = end_rx => {}
        _ = tokio::signal::ctrl_c() => {
            service.stop();
            warn!("Interrupted");
        }
    }
    Ok(())
}
