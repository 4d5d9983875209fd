//! Per-utterance audio cache with request coalescing

use crate::chunker::normalize;
use crate::config::clamp_speed;
use crate::error::SpeechResult;
use crate::queue::SynthesisQueue;
use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type PendingAudio = Shared<BoxFuture<'static, SpeechResult<Bytes>>>;

enum CacheEntry {
    Pending(PendingAudio),
    Ready(Bytes),
}

/// Cache key for an utterance.
///
/// Speed is clamped and rounded to two decimals and the text is normalised,
/// so equivalent requests share one entry.
pub fn cache_key(voice: &str, speed: f32, text: &str) -> String {
    let speed = (clamp_speed(speed) * 100.0).round() / 100.0;
    let mut hasher = Sha256::new();
    hasher.update(voice.as_bytes());
    hasher.update([0u8]);
    hasher.update(format!("{:.2}", speed).as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Audio results keyed by (voice, speed, text)
pub struct SpeechCache {
    queue: Arc<SynthesisQueue>,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl SpeechCache {
    pub fn new(queue: Arc<SynthesisQueue>) -> Self {
        Self {
            queue,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Audio for the utterance, synthesizing it at most once.
    ///
    /// A ready entry resolves immediately. A pending entry hands out the
    /// in-flight handle. A failed synthesis evicts the entry so the next
    /// request starts fresh. The synthesis runs to completion even if every
    /// caller drops the returned future.
    pub fn get_or_create(
        &self,
        voice: &str,
        speed: f32,
        text: &str,
    ) -> BoxFuture<'static, SpeechResult<Bytes>> {
        let key = cache_key(voice, speed, text);

        if let Some(found) = self.lookup(&key) {
            return found;
        }

        let mut entries = self.entries.write();
        // Another caller may have inserted between the two locks.
        match entries.get(&key) {
            Some(CacheEntry::Ready(audio)) => return future::ready(Ok(audio.clone())).boxed(),
            Some(CacheEntry::Pending(pending)) => return pending.clone().boxed(),
            None => {}
        }

        debug!(%key, voice, "Speech cache miss");
        let text = normalize(text);
        let voice = voice.to_string();
        let speed = clamp_speed(speed);
        let synthesis = self
            .queue
            .enqueue(move |engine| async move { engine.speak(&text, &voice, speed).await });

        let settle_entries = Arc::clone(&self.entries);
        let settle_key = key.clone();
        let pending = async move {
            let result = synthesis.await;
            let mut entries = settle_entries.write();
            match &result {
                Ok(audio) => {
                    entries.insert(settle_key, CacheEntry::Ready(audio.clone()));
                }
                Err(_) => {
                    entries.remove(&settle_key);
                }
            }
            result
        }
        .boxed()
        .shared();

        entries.insert(key, CacheEntry::Pending(pending.clone()));
        drop(entries);

        tokio::spawn(pending.clone());
        pending.boxed()
    }

    fn lookup(&self, key: &str) -> Option<BoxFuture<'static, SpeechResult<Bytes>>> {
        match self.entries.read().get(key)? {
            CacheEntry::Ready(audio) => {
                debug!(%key, "Speech cache hit");
                Some(future::ready(Ok(audio.clone())).boxed())
            }
            CacheEntry::Pending(pending) => {
                debug!(%key, "Joining in-flight synthesis");
                Some(pending.clone().boxed())
            }
        }
    }

    /// Audio for the utterance if it is already synthesized
    pub fn get_ready(&self, voice: &str, speed: f32, text: &str) -> Option<Bytes> {
        match self.entries.read().get(&cache_key(voice, speed, text)) {
            Some(CacheEntry::Ready(audio)) => Some(audio.clone()),
            _ => None,
        }
    }

    pub fn is_ready(&self, voice: &str, speed: f32, text: &str) -> bool {
        self.get_ready(voice, speed, text).is_some()
    }

    /// Number of entries, pending ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every ready entry. Pending entries stay so in-flight requests keep
    /// coalescing.
    pub fn clear(&self) {
        self.entries
            .write()
            .retain(|_, entry| matches!(entry, CacheEntry::Pending(_)));
    }
}
