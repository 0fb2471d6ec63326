//! Bounded offload of payload normalization and checksumming
//!
//! Large binary payloads are prepared on tokio's blocking pool, at most `workers`
//! at a time. A timeout or a failed job falls back to preparing inline, so the
//! result never depends on the offload succeeding.

use super::envelope::{PreparedPayload, prepare_payload};
use crate::config::CodecConfig;
use crate::types::Bundle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct PayloadOffload {
    permits: Arc<Semaphore>,
    timeout: Duration,
    min_bytes: usize,
    max_bytes: usize,
    crypto_min_bytes: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(2)
}

impl PayloadOffload {
    pub fn new(limits: &CodecConfig) -> Self {
        let workers = if limits.offload_workers == 0 {
            default_workers()
        } else {
            limits.offload_workers
        };
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            timeout: Duration::from_millis(limits.offload_timeout_ms),
            min_bytes: limits.offload_min_bytes,
            max_bytes: limits.offload_max_bytes,
            crypto_min_bytes: limits.crypto_checksum_min_bytes,
        }
    }

    /// Payloads inside the offload window go to the blocking pool
    pub fn should_offload(&self, estimated_bytes: usize) -> bool {
        estimated_bytes >= self.min_bytes && estimated_bytes <= self.max_bytes
    }

    /// Normalize and checksum `bundle`, offloading when the size hint says so
    pub async fn prepare(
        &self,
        bundle: &Bundle,
        estimated_bytes: usize,
    ) -> Result<PreparedPayload, serde_json::Error> {
        if self.should_offload(estimated_bytes) {
            if let Some(prepared) = self.try_offload(bundle.clone()).await {
                return Ok(prepared);
            }
            tracing::debug!(
                "[incremental] payload offload unavailable for {}; preparing inline",
                bundle.file
            );
        }
        prepare_payload(bundle, self.crypto_min_bytes)
    }

    async fn try_offload(&self, bundle: Bundle) -> Option<PreparedPayload> {
        let permits = Arc::clone(&self.permits);
        let crypto_min_bytes = self.crypto_min_bytes;
        let file = bundle.file.clone();

        let job = async move {
            let permit = permits.acquire_owned().await.ok()?;
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                prepare_payload(&bundle, crypto_min_bytes)
            });
            match handle.await {
                Ok(Ok(prepared)) => Some(prepared),
                Ok(Err(e)) => {
                    tracing::warn!("Offloaded payload preparation failed: {}", e);
                    None
                }
                Err(e) => {
                    tracing::warn!("Offload worker crashed: {}", e);
                    None
                }
            }
        };

        match tokio::time::timeout(self.timeout, job).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "[incremental] payload offload for {} timed out after {:?}",
                    file,
                    self.timeout
                );
                None
            }
        }
    }
}
