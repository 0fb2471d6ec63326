//! Bundle codec
//!
//! Writes and reads one file's cached analysis in either wire format:
//!
//! - **json**: the bundle document, plus an optional append-only patch sidecar that
//!   is replayed on read
//! - **binary**: a bincode envelope around the canonical JSON payload, carrying a
//!   blake3 or sha256 checksum that is verified on read
//!
//! Large bundles are split into ordered shards. Every full write is atomic
//! (temp file + rename) and clears any stale patch sidecar.

pub mod envelope;
pub mod offload;
pub mod patch;

pub use envelope::{Checksum, ChecksumAlgo};
pub use offload::PayloadOffload;
pub use patch::{BundlePatch, ChunkSplice, PatchField, PatchOutcome};

use crate::config::CodecConfig;
use crate::error::{BundleError, BundleReadFailure, CacheError};
use crate::paths::{bundle_file_name, is_bare_file_name, patch_sidecar_path};
use crate::types::{Bundle, BundleFormat};
use std::io::Write;
use std::path::{Path, PathBuf};

/// What a full write produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Checksum of the payload; binary format only
    pub checksum: Option<Checksum>,
    pub bytes: usize,
}

/// What a sharded write produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedWrite {
    /// Shard file names in order, all bare names inside the bundle directory
    pub shard_names: Vec<String>,
    /// Checksum of shard 0, rendered `<algo>:<hex>`
    pub checksum: Option<String>,
}

/// Counts serialized bytes without buffering them
#[derive(Default)]
struct ByteCounter(usize);

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn serialized_len<T: serde::Serialize>(value: &T) -> usize {
    let mut counter = ByteCounter::default();
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => 0,
    }
}

/// Write `bytes` to a sibling temp file, then rename over `path`
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(format!(".tmp-{}", std::process::id()));
    let tmp = path.with_file_name(tmp_name);

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success
pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Serializes bundles to disk and reads them back. One codec is constructed per
/// build and shared by every writer in it.
#[derive(Debug, Clone)]
pub struct BundleCodec {
    limits: CodecConfig,
    offload: PayloadOffload,
}

impl BundleCodec {
    pub fn new(limits: CodecConfig) -> Self {
        let offload = PayloadOffload::new(&limits);
        Self { limits, offload }
    }

    pub fn limits(&self) -> &CodecConfig {
        &self.limits
    }

    /// Fully write one bundle file in `format`
    pub async fn write(
        &self,
        path: &Path,
        bundle: &Bundle,
        format: BundleFormat,
    ) -> Result<WriteReceipt, CacheError> {
        self.write_with_hint(path, bundle, format, None).await
    }

    async fn write_with_hint(
        &self,
        path: &Path,
        bundle: &Bundle,
        format: BundleFormat,
        size_hint: Option<usize>,
    ) -> Result<WriteReceipt, CacheError> {
        let serialize_failed = |e: serde_json::Error| BundleError::SerializeFailed {
            file: bundle.file.clone(),
            reason: e.to_string(),
        };

        let (bytes, checksum) = match format {
            BundleFormat::Json => (serde_json::to_vec(bundle).map_err(serialize_failed)?, None),
            BundleFormat::Binary => {
                let estimated = size_hint.unwrap_or_else(|| serialized_len(bundle));
                let prepared = self
                    .offload
                    .prepare(bundle, estimated)
                    .await
                    .map_err(serialize_failed)?;
                let checksum = prepared.checksum.clone();
                let encoded = envelope::encode_envelope(&prepared.into_envelope()).map_err(
                    |reason| BundleError::SerializeFailed {
                        file: bundle.file.clone(),
                        reason,
                    },
                )?;
                (encoded, Some(checksum))
            }
        };

        write_atomic(path, &bytes)
            .await
            .map_err(|e| BundleError::WriteFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        remove_if_exists(&patch_sidecar_path(path)).await?;

        Ok(WriteReceipt {
            checksum,
            bytes: bytes.len(),
        })
    }

    /// Read one bundle file. Every failure is a typed cache miss.
    pub async fn read(&self, path: &Path, format: BundleFormat) -> Result<Bundle, BundleReadFailure> {
        self.read_with_checksum(path, format).await.map(|(bundle, _)| bundle)
    }

    /// Like [`BundleCodec::read`], also returning the binary envelope's stored
    /// checksum in its `<algo>:<hex>` form
    async fn read_with_checksum(
        &self,
        path: &Path,
        format: BundleFormat,
    ) -> Result<(Bundle, Option<String>), BundleReadFailure> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.limits.max_read_bytes {
            return Err(BundleReadFailure::TooLarge {
                size,
                max: self.limits.max_read_bytes,
            });
        }
        let bytes = tokio::fs::read(path).await?;

        match format {
            BundleFormat::Binary => {
                let (bundle, checksum) =
                    envelope::decode_envelope(&bytes, self.limits.checksum_verify_max_bytes)?;
                Ok((bundle, checksum.map(|c| c.to_string())))
            }
            BundleFormat::Json => {
                let mut bundle = envelope::parse_bundle(&bytes)?;
                patch::replay_sidecar(&patch_sidecar_path(path), &mut bundle, &self.limits)
                    .await?;
                Ok((bundle, None))
            }
        }
    }

    /// Append a delta to the bundle's patch sidecar instead of rewriting it.
    ///
    /// The binary format never patches: the call is rejected and any stale sidecar
    /// next to the bundle is removed.
    pub async fn write_patch(
        &self,
        path: &Path,
        previous: &Bundle,
        next: &Bundle,
        format: BundleFormat,
    ) -> Result<PatchOutcome, CacheError> {
        let sidecar = patch_sidecar_path(path);
        if format == BundleFormat::Binary {
            remove_if_exists(&sidecar).await?;
            return Ok(PatchOutcome::Rejected("binary-format".to_string()));
        }
        patch::append_patch(&sidecar, previous, next, &self.limits).await
    }

    /// Split chunks into groups whose serialized size stays near the shard target
    fn plan_shards(&self, bundle: &Bundle) -> Result<Vec<(std::ops::Range<usize>, usize)>, BundleError> {
        let base = serialized_len(&bundle.with_chunks(Vec::new()));
        let mut shards = Vec::new();
        let mut start = 0;
        let mut current = base;

        for (index, chunk) in bundle.chunks.iter().enumerate() {
            let size = serialized_len(chunk) + 1;
            if size > self.limits.shard_max_bytes {
                return Err(BundleError::TooLarge {
                    file: bundle.file.clone(),
                    size,
                    max: self.limits.shard_max_bytes,
                });
            }
            if index > start && current + size > self.limits.shard_target_bytes {
                shards.push((start..index, current));
                start = index;
                current = base;
            }
            current += size;
        }
        shards.push((start..bundle.chunks.len(), current));
        Ok(shards)
    }

    /// Write a file's bundle as one or more shards under `bundle_dir`.
    ///
    /// Shards listed in `previous_shards` that the new write does not produce are
    /// deleted along with their sidecars.
    pub async fn write_sharded(
        &self,
        bundle_dir: &Path,
        bundle: &Bundle,
        format: BundleFormat,
        previous_shards: &[String],
    ) -> Result<ShardedWrite, CacheError> {
        let plan = self.plan_shards(bundle)?;
        let mut shard_names = Vec::with_capacity(plan.len());
        let mut checksum = None;

        for (index, (range, estimated)) in plan.into_iter().enumerate() {
            let name = bundle_file_name(&bundle.file, format, index);
            let shard = if index == 0 && range.len() == bundle.chunks.len() {
                None
            } else {
                Some(bundle.with_chunks(bundle.chunks[range].to_vec()))
            };
            let receipt = self
                .write_with_hint(
                    &bundle_dir.join(&name),
                    shard.as_ref().unwrap_or(bundle),
                    format,
                    Some(estimated),
                )
                .await?;
            if index == 0 {
                checksum = receipt.checksum.map(|c| c.to_string());
            }
            shard_names.push(name);
        }

        for stale in previous_shards {
            if shard_names.contains(stale) || !is_bare_file_name(stale) {
                continue;
            }
            let path = bundle_dir.join(stale);
            remove_if_exists(&path).await?;
            remove_if_exists(&patch_sidecar_path(&path)).await?;
        }

        if shard_names.len() > 1 {
            tracing::debug!(
                "[incremental] bundle for {} split into {} shards",
                bundle.file,
                shard_names.len()
            );
        }
        Ok(ShardedWrite {
            shard_names,
            checksum,
        })
    }

    /// Read every shard and concatenate their chunks in shard order
    pub async fn read_shards(
        &self,
        bundle_dir: &Path,
        shard_names: &[String],
        format: BundleFormat,
    ) -> Result<Bundle, BundleReadFailure> {
        self.read_shards_with_checksum(bundle_dir, shard_names, format)
            .await
            .map(|(bundle, _)| bundle)
    }

    /// Like [`BundleCodec::read_shards`], also returning the first shard's envelope
    /// checksum, the value recorded in the manifest entry
    pub async fn read_shards_with_checksum(
        &self,
        bundle_dir: &Path,
        shard_names: &[String],
        format: BundleFormat,
    ) -> Result<(Bundle, Option<String>), BundleReadFailure> {
        let mut paths: Vec<PathBuf> = Vec::with_capacity(shard_names.len());
        for name in shard_names {
            if !is_bare_file_name(name) {
                return Err(BundleReadFailure::InvalidEnvelope(format!(
                    "unsafe shard name '{}'",
                    name
                )));
            }
            paths.push(bundle_dir.join(name));
        }
        let Some((first_path, rest)) = paths.split_first() else {
            return Err(BundleReadFailure::Missing);
        };

        let (mut bundle, checksum) = self.read_with_checksum(first_path, format).await?;
        for path in rest {
            let shard = self.read(path, format).await?;
            if shard.file != bundle.file {
                return Err(BundleReadFailure::ShardMismatch);
            }
            bundle.chunks.extend(shard.chunks);
        }
        Ok((bundle, checksum))
    }
}
