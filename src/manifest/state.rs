use super::{Manifest, ManifestEntry, ManifestExpectation, ManifestLoad};
use crate::bundle::{BundleCodec, remove_if_exists};
use crate::config::Config;
use crate::error::{BundleError, BundleReadFailure, CacheError, ManifestError};
use crate::fs_lock::BuildLockGuard;
use crate::paths::{IncrementalLayout, normalize_rel_path, patch_sidecar_path};
use crate::reconcile::ReadHashCache;
use crate::types::{Bundle, BundleFormat, IndexMode};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Everything one build needs to read and write a mode's incremental cache.
///
/// Holds the mode's build lock for its whole lifetime.
#[derive(Debug)]
pub struct IncrementalState {
    pub mode: IndexMode,
    pub layout: IncrementalLayout,
    pub manifest: Manifest,
    pub codec: BundleCodec,
    pub read_hash_cache: Arc<ReadHashCache>,
    /// Format used for newly written bundles
    pub bundle_format: BundleFormat,
    /// Set when an existing manifest was discarded
    pub reset_reason: Option<String>,
    _lock: BuildLockGuard,
}

/// Result of pruning entries for files that disappeared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub removed: usize,
}

impl IncrementalState {
    /// Open the cache for `mode` under `repo_cache_root`, discarding the stored
    /// manifest when it no longer matches this build's configuration.
    pub async fn load_or_init(
        repo_cache_root: &Path,
        mode: IndexMode,
        config: &Config,
        tokenization_key: Option<&str>,
    ) -> Result<Self, CacheError> {
        let layout = IncrementalLayout::new(repo_cache_root, mode);
        let dir_failed = |path: &Path, e: std::io::Error| ManifestError::DirectoryCreationFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        tokio::fs::create_dir_all(&layout.bundle_dir)
            .await
            .map_err(|e| dir_failed(&layout.bundle_dir, e))?;

        let lock = BuildLockGuard::acquire(
            &layout.lock_path,
            Duration::from_secs(config.incremental.lock_timeout_secs),
        )
        .await?;

        let expected = ManifestExpectation {
            mode,
            cache_signature: config.cache_signature(),
            signature_summary: config.signature_summary(),
            tokenization_key: tokenization_key.map(str::to_string),
            bundle_format: config.incremental.bundle_format,
        };

        let mut reset_reason = None;
        let mut manifest = match Manifest::load(&layout.manifest_path, &expected).await? {
            ManifestLoad::Loaded(manifest) => manifest,
            ManifestLoad::Missing => {
                tracing::debug!("[incremental] {} cache initialized.", mode);
                Manifest::empty(&expected)
            }
            ManifestLoad::Reset {
                reason,
                changed_keys,
            } => {
                tracing::info!("[incremental] {} cache reset: {}.", mode, reason);
                if let Some(keys) = changed_keys {
                    tracing::info!("[incremental] {} changed signature keys: {}", mode, keys);
                }
                // Bundles the discarded manifest referenced can never be reused
                tokio::fs::remove_dir_all(&layout.bundle_dir).await?;
                tokio::fs::create_dir_all(&layout.bundle_dir)
                    .await
                    .map_err(|e| dir_failed(&layout.bundle_dir, e))?;
                reset_reason = Some(reason);
                Manifest::empty(&expected)
            }
        };

        if manifest.bundle_format != expected.bundle_format {
            tracing::info!(
                "[incremental] {} bundle format changed: {} -> {}.",
                mode,
                manifest.bundle_format,
                expected.bundle_format
            );
            manifest.bundle_format = expected.bundle_format;
        }

        Ok(Self {
            mode,
            layout,
            manifest,
            codec: BundleCodec::new(config.codec.clone()),
            read_hash_cache: Arc::new(ReadHashCache::new()),
            bundle_format: expected.bundle_format,
            reset_reason,
            _lock: lock,
        })
    }

    /// Write one file's bundle and record its fingerprint.
    ///
    /// On failure the file's entry is dropped so a later build recomputes it, and
    /// the error is returned for the caller to log and skip the file.
    pub async fn write_file_bundle(&mut self, mut bundle: Bundle) -> Result<ManifestEntry, CacheError> {
        let rel = normalize_rel_path(&bundle.file);
        bundle.file = rel.clone();
        let previous_shards = self
            .manifest
            .files
            .get(&rel)
            .map(|entry| entry.bundle_shard_names.clone())
            .unwrap_or_default();

        let written = match self
            .codec
            .write_sharded(&self.layout.bundle_dir, &bundle, self.bundle_format, &previous_shards)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!("[incremental] failed to write bundle for {}: {}", rel, e);
                self.manifest.files.remove(&rel);
                return Err(e);
            }
        };

        let entry = ManifestEntry {
            content_hash: bundle.hash.clone(),
            mod_time_ms: bundle.mod_time_ms,
            size_bytes: bundle.size,
            bundle_shard_names: written.shard_names,
            bundle_format: self.bundle_format,
            bundle_checksum: written.checksum,
            encoding: bundle.encoding.clone(),
        };
        self.manifest.files.insert(rel, entry.clone());
        Ok(entry)
    }

    /// Read the cached bundle recorded for `rel`, without staleness checks
    pub async fn read_bundle(&self, rel: &str) -> Result<Bundle, BundleReadFailure> {
        let entry = self.manifest.get(rel).ok_or(BundleReadFailure::Missing)?;
        self.codec
            .read_shards(
                &self.layout.bundle_dir,
                &entry.bundle_shard_names,
                entry.bundle_format,
            )
            .await
    }

    /// Drop entries for files not in `seen`, delete their shards and sidecars, then
    /// persist the manifest
    pub async fn prune_and_persist<'a, I>(&mut self, seen: I) -> Result<PruneSummary, CacheError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let seen: HashSet<String> = seen.into_iter().map(normalize_rel_path).collect();
        let stale: Vec<String> = self
            .manifest
            .files
            .keys()
            .filter(|rel| !seen.contains(&normalize_rel_path(rel)))
            .cloned()
            .collect();

        for rel in &stale {
            if let Some(entry) = self.manifest.files.remove(rel) {
                for name in &entry.bundle_shard_names {
                    let path = self.layout.bundle_dir.join(name);
                    remove_if_exists(&path).await?;
                    remove_if_exists(&patch_sidecar_path(&path)).await?;
                }
            }
        }
        if !stale.is_empty() {
            tracing::debug!(
                "[incremental] {} pruned {} removed file(s)",
                self.mode,
                stale.len()
            );
        }

        self.persist().await?;
        Ok(PruneSummary {
            removed: stale.len(),
        })
    }

    pub async fn persist(&self) -> Result<(), CacheError> {
        self.manifest.persist(&self.layout.manifest_path).await
    }

    /// Entry for `rel`, or a typed error when the file is untracked
    pub fn entry(&self, rel: &str) -> Result<&ManifestEntry, CacheError> {
        self.manifest
            .get(rel)
            .ok_or_else(|| BundleError::NoShards(rel.to_string()).into())
    }
}
