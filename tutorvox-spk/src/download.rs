//! Streamed download of model weights

use crate::error::{SpeechError, SpeechResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

/// Hard ceiling on downloaded weights (2GB)
const MAX_WEIGHTS_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Byte-level progress sink: `(bytes_received, bytes_total)`
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Source of model weights
#[async_trait]
pub trait WeightsFetcher: Send + Sync {
    /// Fetch the full weights at `url`, reporting bytes as they arrive.
    /// Any non-success status, transport error or empty body is a
    /// [`SpeechError::Download`].
    async fn fetch(&self, url: &str, on_bytes: ByteProgress<'_>) -> SpeechResult<Bytes>;
}

/// HTTP GET with a streamed body
pub struct HttpWeightsFetcher {
    client: reqwest::Client,
}

impl HttpWeightsFetcher {
    pub fn new(timeout_secs: u64) -> SpeechResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SpeechError::Download(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WeightsFetcher for HttpWeightsFetcher {
    async fn fetch(&self, url: &str, on_bytes: ByteProgress<'_>) -> SpeechResult<Bytes> {
        info!("Downloading model weights from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SpeechError::Download(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SpeechError::Download(format!(
                "Failed to download model: HTTP {}",
                response.status()
            )));
        }

        let total = response.content_length();
        if let Some(total) = total {
            if total > MAX_WEIGHTS_SIZE {
                return Err(SpeechError::Download(format!(
                    "Model too large: {} bytes (max {} bytes)",
                    total, MAX_WEIGHTS_SIZE
                )));
            }
        }

        let mut buffer = BytesMut::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        on_bytes(0, total);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SpeechError::Download(format!("Stream error: {}", e)))?;
            buffer.extend_from_slice(&chunk);
            let received = buffer.len() as u64;
            if received > MAX_WEIGHTS_SIZE {
                return Err(SpeechError::Download(format!(
                    "Downloaded model too large: more than {} bytes",
                    MAX_WEIGHTS_SIZE
                )));
            }
            on_bytes(received, total);
        }

        if buffer.is_empty() {
            return Err(SpeechError::Download("Empty response body".to_string()));
        }

        debug!(bytes = buffer.len(), "Model download complete");
        Ok(buffer.freeze())
    }
}
