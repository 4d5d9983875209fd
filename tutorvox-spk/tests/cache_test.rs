//! Tests for SpeechCache
//! Coalescing, eviction of failures and completion after cancellation

mod common;

use common::*;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};
use tutorvox_spk::cache::SpeechCache;
use tutorvox_spk::engine::SynthesisEngine;
use tutorvox_spk::queue::SynthesisQueue;

fn cache(harness: &Harness) -> SpeechCache {
    let engine = SynthesisEngine::new(&test_config(), harness.deps());
    SpeechCache::new(Arc::new(SynthesisQueue::new(engine)))
}

#[tokio::test]
async fn test_concurrent_requests_coalesce() {
    let harness = Harness::new();
    let cache = cache(&harness);

    let a = cache.get_or_create("af_bella", 1.0, "cat");
    let b = cache.get_or_create("af_bella", 1.0, "cat");
    let (a, b) = tokio::join!(a, b);

    assert_eq!(harness.model.calls(), 1);
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_ready_entry_skips_synthesis() {
    let harness = Harness::new();
    let cache = cache(&harness);

    assert!(!cache.is_ready("af_bella", 1.0, "cat"));
    let first = cache.get_or_create("af_bella", 1.0, "cat").await.unwrap();
    assert!(cache.is_ready("af_bella", 1.0, "cat"));

    let second = cache.get_or_create("af_bella", 1.0, "cat").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(harness.model.calls(), 1);
}

#[tokio::test]
async fn test_equivalent_requests_share_an_entry() {
    let harness = Harness::new();
    let cache = cache(&harness);

    assert_ok!(cache.get_or_create("af_bella", 1.0, "the  cat").await);
    assert_ok!(cache.get_or_create("af_bella", 1.004, " the cat ").await);
    assert_eq!(harness.model.calls(), 1);

    assert_ok!(cache.get_or_create("af_bella", 1.5, "the cat").await);
    assert_ok!(cache.get_or_create("am_michael", 1.0, "the cat").await);
    assert_eq!(harness.model.calls(), 3);
    assert_eq!(cache.len(), 3);
}

#[tokio::test]
async fn test_failed_synthesis_is_evicted() {
    let harness = Harness::new();
    *harness.model.fail_on.lock() = Some("cat".to_string());
    let cache = cache(&harness);

    assert_err!(cache.get_or_create("af_bella", 1.0, "cat").await);
    assert!(cache.is_empty());

    *harness.model.fail_on.lock() = None;
    assert_ok!(cache.get_or_create("af_bella", 1.0, "cat").await);
    assert_eq!(harness.model.calls(), 2);
    assert!(cache.is_ready("af_bella", 1.0, "cat"));
}

#[tokio::test]
async fn test_abandoned_request_still_fills_cache() {
    let harness = Harness::new();
    let cache = cache(&harness);

    drop(cache.get_or_create("af_bella", 1.0, "cat"));

    assert!(eventually(|| cache.is_ready("af_bella", 1.0, "cat")).await);
    assert_eq!(harness.model.calls(), 1);
}

#[tokio::test]
async fn test_clear_keeps_pending_entries() {
    // One permit for the first utterance; the second waits for the test.
    let gate = Arc::new(Semaphore::new(1));
    let harness = Harness::with_model(FakeModel::gated(gate.clone()));
    let cache = cache(&harness);

    assert_ok!(cache.get_or_create("af_bella", 1.0, "ready").await);
    assert!(cache.is_ready("af_bella", 1.0, "ready"));

    let pending = cache.get_or_create("af_bella", 1.0, "cat");
    cache.clear();
    assert_eq!(cache.len(), 1, "pending entry must survive clear");
    assert!(!cache.is_ready("af_bella", 1.0, "ready"));

    let joined = cache.get_or_create("af_bella", 1.0, "cat");
    gate.add_permits(1);
    let (a, b) = tokio::join!(pending, joined);
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(harness.model.texts.lock().iter().filter(|t| *t == "cat").count(), 1);
}
