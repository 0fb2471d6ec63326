//! Incremental manifest and per-build cache state
//!
//! The manifest maps repository-relative paths to the fingerprint of the file each
//! bundle was built from. It is the single source of truth for reuse: bundles on disk
//! that it does not reference are never read.

mod state;

pub use state::{IncrementalState, PruneSummary};

use crate::error::{CacheError, ManifestError};
use crate::paths::{is_bare_file_name, normalize_rel_path};
use crate::types::{BundleFormat, FileStat, IndexMode, TextEncoding};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Bumped whenever the manifest or bundle layout changes incompatibly
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Signature keys listed in a reset message before the rest are counted
const SIGNATURE_DELTA_KEYS: usize = 5;

/// Cache fingerprint of one tracked file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub mod_time_ms: i64,
    pub size_bytes: u64,
    #[serde(default)]
    pub bundle_shard_names: Vec<String>,
    #[serde(default)]
    pub bundle_format: BundleFormat,
    /// `<algo>:<hex>` checksum of shard 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_checksum: Option<String>,
    #[serde(flatten)]
    pub encoding: TextEncoding,
}

impl ManifestEntry {
    pub fn stat(&self) -> FileStat {
        FileStat {
            size: self.size_bytes,
            mtime_ms: self.mod_time_ms,
        }
    }
}

/// Per-mode table of file fingerprints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub mode: IndexMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenization_key: Option<String>,
    pub cache_signature: String,
    #[serde(default)]
    pub signature_summary: BTreeMap<String, Value>,
    #[serde(default)]
    pub bundle_format: BundleFormat,
    #[serde(default)]
    pub files: BTreeMap<String, ManifestEntry>,
}

/// What a build expects a reusable manifest to agree on
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestExpectation {
    pub mode: IndexMode,
    pub cache_signature: String,
    pub signature_summary: BTreeMap<String, Value>,
    pub tokenization_key: Option<String>,
    pub bundle_format: BundleFormat,
}

/// Outcome of loading a manifest from disk
#[derive(Debug)]
pub enum ManifestLoad {
    /// Reusable as-is
    Loaded(Manifest),
    /// No manifest on disk yet
    Missing,
    /// Present but incompatible; must start from empty
    Reset {
        reason: String,
        changed_keys: Option<String>,
    },
}

impl Manifest {
    /// Empty manifest stamped with this build's expectations
    pub fn empty(expected: &ManifestExpectation) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            mode: expected.mode,
            tokenization_key: expected.tokenization_key.clone(),
            cache_signature: expected.cache_signature.clone(),
            signature_summary: expected.signature_summary.clone(),
            bundle_format: expected.bundle_format,
            files: BTreeMap::new(),
        }
    }

    /// Look up an entry by repository-relative path, tolerating separator style
    pub fn get(&self, rel: &str) -> Option<&ManifestEntry> {
        self.files
            .get(rel)
            .or_else(|| self.files.get(&normalize_rel_path(rel)))
    }

    /// Every shard name must be a bare file name inside the bundle directory
    pub fn validate_bundle_names(&self) -> Result<(), ManifestError> {
        for (file, entry) in &self.files {
            if let Some(name) = entry
                .bundle_shard_names
                .iter()
                .find(|name| !is_bare_file_name(name))
            {
                return Err(ManifestError::UnsafeBundleName {
                    file: file.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Read the manifest at `path` and check it against `expected`.
    ///
    /// Incompatibility is never partial: any mismatch discards the whole table.
    /// An unsafe shard name is a hard error.
    pub async fn load(path: &Path, expected: &ManifestExpectation) -> Result<ManifestLoad, CacheError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ManifestLoad::Missing),
            Err(e) => return Err(e.into()),
        };

        let reset = |reason: String| ManifestLoad::Reset {
            reason,
            changed_keys: None,
        };

        let raw: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => return Ok(reset(format!("manifest unreadable ({})", e))),
        };
        let stored_version = raw.get("schemaVersion").and_then(Value::as_u64);
        if stored_version != Some(u64::from(MANIFEST_SCHEMA_VERSION)) {
            return Ok(reset(format!(
                "schema version {} != {}",
                stored_version.map_or_else(|| "missing".to_string(), |v| v.to_string()),
                MANIFEST_SCHEMA_VERSION
            )));
        }
        let manifest: Manifest = match serde_json::from_value(raw) {
            Ok(manifest) => manifest,
            Err(e) => return Ok(reset(format!("manifest unreadable ({})", e))),
        };

        if manifest.mode != expected.mode {
            return Ok(reset(format!(
                "manifest belongs to mode {}",
                manifest.mode
            )));
        }
        if manifest.cache_signature != expected.cache_signature {
            return Ok(ManifestLoad::Reset {
                reason: "cache signature changed".to_string(),
                changed_keys: signature_delta(
                    &manifest.signature_summary,
                    &expected.signature_summary,
                    SIGNATURE_DELTA_KEYS,
                ),
            });
        }
        if manifest.tokenization_key != expected.tokenization_key {
            return Ok(reset("tokenization key changed".to_string()));
        }

        manifest.validate_bundle_names()?;
        Ok(ManifestLoad::Loaded(manifest))
    }

    /// Atomically write the manifest, pretty-printed
    pub async fn persist(&self, path: &Path) -> Result<(), CacheError> {
        let save_failed = |reason: String| ManifestError::SaveFailed {
            path: path.display().to_string(),
            reason,
        };
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        crate::bundle::write_atomic(path, &bytes)
            .await
            .map_err(|e| save_failed(e.to_string()))?;
        Ok(())
    }
}

/// Human-readable list of signature keys whose values differ, bounded to `limit`
/// names followed by `(+N more)`
pub fn signature_delta(
    previous: &BTreeMap<String, Value>,
    next: &BTreeMap<String, Value>,
    limit: usize,
) -> Option<String> {
    let keys: BTreeSet<&String> = previous.keys().chain(next.keys()).collect();
    let changed: Vec<&String> = keys
        .into_iter()
        .filter(|key| previous.get(*key) != next.get(*key))
        .collect();
    if changed.is_empty() {
        return None;
    }

    let shown: Vec<&str> = changed.iter().take(limit).map(|k| k.as_str()).collect();
    let mut summary = shown.join(", ");
    if changed.len() > limit {
        summary.push_str(&format!(" (+{} more)", changed.len() - limit));
    }
    Some(summary)
}
