//! Cache reconciliation
//!
//! Decides whether a cached bundle still describes the file on disk. Size and
//! modification time are trusted when they match exactly, except for timestamps with
//! whole-second resolution, which are re-verified by content hash. A changed
//! timestamp with a recorded hash falls back to hashing the file.

mod hash_cache;
mod whole_index;

pub use hash_cache::{ReadHashCache, content_hash};
pub use whole_index::{IndexStage, ReuseVerdict, should_reuse_whole_index};

use crate::error::BundleReadFailure;
use crate::manifest::{IncrementalState, ManifestEntry};
use crate::types::{Bundle, BundleFormat, FileEntry, FileStat};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Why a cached bundle cannot be trusted for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaleReason {
    Missing,
    SizeChanged,
    ModTimeChanged,
    ContentChanged,
    Unreadable,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleReason::Missing => "missing",
            StaleReason::SizeChanged => "size-changed",
            StaleReason::ModTimeChanged => "mtime-changed",
            StaleReason::ContentChanged => "content-changed",
            StaleReason::Unreadable => "unreadable",
        }
    }
}

/// Per-file reuse classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
pub enum ReuseDecision {
    /// Size and modification time match
    Fresh,
    /// Content hash matched after reading the file
    HashVerified,
    Changed(StaleReason),
    /// Not tracked by the manifest
    New,
}

impl ReuseDecision {
    pub fn is_reusable(&self) -> bool {
        matches!(self, ReuseDecision::Fresh | ReuseDecision::HashVerified)
    }
}

/// Why [`read_cached_bundle`] produced no bundle
#[derive(Debug, Clone, PartialEq)]
pub enum CacheMiss {
    NotTracked,
    Stale(StaleReason),
    Unreadable(BundleReadFailure),
    /// The stored bundle was written for different content than the manifest
    /// entry records, e.g. by a build that never persisted its manifest
    EntryMismatch { field: &'static str },
}

impl CacheMiss {
    pub fn reason_code(&self) -> &'static str {
        match self {
            CacheMiss::NotTracked => "not-tracked",
            CacheMiss::Stale(reason) => reason.as_str(),
            CacheMiss::Unreadable(failure) => failure.reason_code(),
            CacheMiss::EntryMismatch { .. } => "entry-mismatch",
        }
    }
}

impl fmt::Display for CacheMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMiss::NotTracked => f.write_str("file is not tracked"),
            CacheMiss::Stale(reason) => write!(f, "cached bundle is stale ({})", reason.as_str()),
            CacheMiss::Unreadable(failure) => write!(f, "cached bundle unreadable: {}", failure),
            CacheMiss::EntryMismatch { field } => {
                write!(f, "cached bundle disagrees with its manifest entry ({})", field)
            }
        }
    }
}

fn verify_hash(expected: &str, file: &FileEntry, stat: &FileStat, cache: &ReadHashCache) -> ReuseDecision {
    match cache.hash_file(&file.abs_path, stat) {
        Ok(actual) if actual == expected => ReuseDecision::HashVerified,
        Ok(_) => ReuseDecision::Changed(StaleReason::ContentChanged),
        Err(e) => {
            tracing::debug!("[incremental] failed to hash {}: {}", file.rel, e);
            ReuseDecision::Changed(StaleReason::Unreadable)
        }
    }
}

/// Classify one tracked file against its manifest entry. Blocking: may read and
/// hash the file.
pub fn check_entry(entry: &ManifestEntry, file: &FileEntry, cache: &ReadHashCache) -> ReuseDecision {
    let Some(stat) = file.stat else {
        return ReuseDecision::Changed(StaleReason::Missing);
    };
    if stat.size != entry.size_bytes {
        return ReuseDecision::Changed(StaleReason::SizeChanged);
    }

    if stat.mtime_ms == entry.mod_time_ms {
        return match &entry.content_hash {
            Some(hash) if stat.has_coarse_mtime() => verify_hash(hash, file, &stat, cache),
            _ => ReuseDecision::Fresh,
        };
    }

    match &entry.content_hash {
        Some(hash) => verify_hash(hash, file, &stat, cache),
        None => ReuseDecision::Changed(StaleReason::ModTimeChanged),
    }
}

/// Reuse classification of a whole file list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReusePlan {
    /// One decision per input file, in input order
    pub decisions: Vec<(String, ReuseDecision)>,
}

impl ReusePlan {
    pub fn reusable(&self) -> impl Iterator<Item = &str> {
        self.decisions
            .iter()
            .filter(|(_, d)| d.is_reusable())
            .map(|(rel, _)| rel.as_str())
    }

    pub fn needs_rebuild(&self) -> impl Iterator<Item = &str> {
        self.decisions
            .iter()
            .filter(|(_, d)| !d.is_reusable())
            .map(|(rel, _)| rel.as_str())
    }

    pub fn count(&self, predicate: impl Fn(&ReuseDecision) -> bool) -> usize {
        self.decisions.iter().filter(|(_, d)| predicate(d)).count()
    }
}

/// Classify every file in parallel; only files whose fingerprint cannot be trusted
/// are read and hashed
pub fn plan_reuse(state: &IncrementalState, files: &[FileEntry]) -> ReusePlan {
    let cache = state.read_hash_cache.as_ref();
    let decisions = files
        .par_iter()
        .map(|file| {
            let decision = match state.manifest.get(&file.rel) {
                Some(entry) => check_entry(entry, file, cache),
                None => ReuseDecision::New,
            };
            (file.rel.clone(), decision)
        })
        .collect();
    ReusePlan { decisions }
}

/// First fingerprint field on which `bundle` disagrees with `entry`
fn entry_mismatch(entry: &ManifestEntry, bundle: &Bundle, checksum: Option<&str>) -> Option<&'static str> {
    if bundle.hash != entry.content_hash {
        return Some("hash");
    }
    if bundle.size != entry.size_bytes {
        return Some("size");
    }
    if bundle.mod_time_ms != entry.mod_time_ms {
        return Some("modTimeMs");
    }
    if entry.bundle_format == BundleFormat::Binary && checksum != entry.bundle_checksum.as_deref() {
        return Some("bundleChecksum");
    }
    None
}

/// Return the cached bundle for `file` if its fingerprint still matches and the
/// stored bundle is the one its manifest entry describes
pub async fn read_cached_bundle(state: &IncrementalState, file: &FileEntry) -> Result<Bundle, CacheMiss> {
    let Some(entry) = state.manifest.get(&file.rel).cloned() else {
        return Err(CacheMiss::NotTracked);
    };

    let cache = Arc::clone(&state.read_hash_cache);
    let owned_entry = entry.clone();
    let owned_file = file.clone();
    let decision = tokio::task::spawn_blocking(move || check_entry(&owned_entry, &owned_file, &cache))
        .await
        .unwrap_or(ReuseDecision::Changed(StaleReason::Unreadable));

    if let ReuseDecision::Changed(reason) = decision {
        return Err(CacheMiss::Stale(reason));
    }

    let (bundle, checksum) = state
        .codec
        .read_shards_with_checksum(&state.layout.bundle_dir, &entry.bundle_shard_names, entry.bundle_format)
        .await
        .map_err(|failure| {
            tracing::debug!(
                "[incremental] cached bundle for {} unusable: {}",
                file.rel,
                failure
            );
            CacheMiss::Unreadable(failure)
        })?;

    if let Some(field) = entry_mismatch(&entry, &bundle, checksum.as_deref()) {
        tracing::debug!(
            "[incremental] cached bundle for {} does not match its manifest entry ({})",
            file.rel,
            field
        );
        return Err(CacheMiss::EntryMismatch { field });
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests;
