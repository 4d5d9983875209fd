//! End-to-end tests for SpeechService wiring
//! Persistent store, file output and maintenance calls

mod common;

use bytes::Bytes;
use chrono::{Duration, Utc};
use common::*;
use std::sync::Arc;
use tempfile::TempDir;
use tutorvox_spk::playback::{SpeakCallbacks, SpeakOptions};
use tutorvox_spk::store::{ModelStore, RecordMeta, SledModelStore};
use tutorvox_spk::{FileOutput, SpeechError, SpeechService};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_speak_writes_utterance_and_persists_model() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let store = Arc::new(SledModelStore::open(dir.path().join("models")).unwrap());
    let output = Arc::new(FileOutput::new(dir.path().join("out"), false).unwrap());

    let service = SpeechService::new(
        test_config(),
        harness.deps_with_store(store.clone()),
        output.clone(),
        Arc::new(RecordingFallback::new(false)),
    )
    .unwrap();

    let log = EventLog::default();
    let callbacks = SpeakCallbacks::new()
        .on_start(log.recorder("start"))
        .on_end(log.recorder("end"));
    assert!(service.speak("The cat sat.", callbacks, SpeakOptions::default()));
    assert!(eventually(|| log.events().contains(&"end".to_string())).await);

    assert_eq!(log.events(), vec!["start", "end"]);
    assert_eq!(output.written(), 1);
    let wavs = std::fs::read_dir(output.dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |x| x == "wav"))
        .count();
    assert_eq!(wavs, 1);

    let stored = service.stored_models().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].key.starts_with("kokoro-82m@1.0:"));
    assert_eq!(stored[0].byte_size, WEIGHTS.len() as u64);
}

#[tokio::test]
async fn test_purge_models_uses_configured_age() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let store = Arc::new(SledModelStore::open(dir.path().join("models")).unwrap());
    let stale = RecordMeta {
        model_version: "0.9".to_string(),
        stored_at: Utc::now() - Duration::days(45),
    };
    store
        .store("kokoro-82m@0.9:q8", Bytes::from_static(WEIGHTS), stale)
        .await
        .unwrap();
    store
        .store("kokoro-82m@1.0:q8", Bytes::from_static(WEIGHTS), RecordMeta::now("1.0"))
        .await
        .unwrap();

    let service = SpeechService::new(
        test_config(),
        harness.deps_with_store(store),
        Arc::new(RecordingOutput::new(true)),
        Arc::new(RecordingFallback::new(true)),
    )
    .unwrap();

    assert_eq!(service.purge_models().await.unwrap(), 1);
    let remaining = service.stored_models().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].model_version, "1.0");
}

#[tokio::test]
async fn test_from_config_wires_production_parts() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.store_path = dir.path().join("models");
    config.fallback.enabled = false;
    let runner = dir.path().join("kokoro-runner");
    std::fs::write(&runner, b"").unwrap();
    config.runner.program = runner.to_string_lossy().into_owned();
    let output = Arc::new(FileOutput::new(dir.path().join("out"), false).unwrap());

    let service = SpeechService::from_config(config, output).unwrap();

    assert!(service.playback().neural_supported());
    assert!(service.is_speech_available(&SpeakOptions::default()));
    assert!(!service.is_speech_available(&SpeakOptions::default().high_quality(false)));
    assert!(service.stored_models().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_from_config_without_runner_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.store_path = dir.path().join("models");
    config.fallback.enabled = false;
    config.runner.program = dir.path().join("missing-runner").to_string_lossy().into_owned();
    let output = Arc::new(FileOutput::new(dir.path().join("out"), false).unwrap());

    let service = SpeechService::from_config(config, output).unwrap();

    assert!(!service.playback().neural_supported());
    assert!(!service.is_speech_available(&SpeakOptions::default()));
    assert!(!service.initialize_engine(None).await);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = test_config();
    config.default_speed = 5.0;

    let result = SpeechService::new(
        config,
        Harness::new().deps(),
        Arc::new(RecordingOutput::new(true)),
        Arc::new(RecordingFallback::new(true)),
    );
    assert!(matches!(result, Err(SpeechError::Config(_))));
}
