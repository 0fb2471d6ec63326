//! Append-only delta patches for JSON bundles
//!
//! Each line of a `<bundle>.patch.jsonl` sidecar is one [`BundlePatch`]: an optional
//! contiguous chunk splice plus field-level replacements. Reading a bundle replays
//! every line in file order on top of the base document.

use crate::config::CodecConfig;
use crate::error::{BundleReadFailure, CacheError, PatchError};
use crate::types::{Bundle, ChunkRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;

pub const PATCH_FORMAT: &str = "bundle-patch";
pub const PATCH_VERSION: u32 = 1;

/// Replace `delete_count` chunks at `start` with `items`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSplice {
    pub start: usize,
    pub delete_count: usize,
    pub items: Vec<ChunkRecord>,
}

/// Bundle fields a patch may replace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatchField {
    Hash,
    Size,
    ModTimeMs,
    FileRelations,
    AuxRows,
    Encoding,
    EncodingFallback,
    EncodingConfidence,
}

impl PatchField {
    pub const ALL: [PatchField; 8] = [
        PatchField::Hash,
        PatchField::Size,
        PatchField::ModTimeMs,
        PatchField::FileRelations,
        PatchField::AuxRows,
        PatchField::Encoding,
        PatchField::EncodingFallback,
        PatchField::EncodingConfidence,
    ];

    /// Wire key, matching the bundle's own JSON field name
    pub fn key(&self) -> &'static str {
        match self {
            PatchField::Hash => "hash",
            PatchField::Size => "size",
            PatchField::ModTimeMs => "modTimeMs",
            PatchField::FileRelations => "fileRelations",
            PatchField::AuxRows => "auxRows",
            PatchField::Encoding => "encoding",
            PatchField::EncodingFallback => "encodingFallback",
            PatchField::EncodingConfidence => "encodingConfidence",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    /// Current value of this field; absent optionals read as `null`
    fn read(&self, bundle: &Bundle) -> Value {
        match self {
            PatchField::Hash => Value::from(bundle.hash.clone()),
            PatchField::Size => Value::from(bundle.size),
            PatchField::ModTimeMs => Value::from(bundle.mod_time_ms),
            PatchField::FileRelations => bundle.file_relations.clone().unwrap_or(Value::Null),
            PatchField::AuxRows => Value::from(bundle.aux_rows.clone()),
            PatchField::Encoding => Value::from(bundle.encoding.encoding.clone()),
            PatchField::EncodingFallback => Value::from(bundle.encoding.encoding_fallback),
            PatchField::EncodingConfidence => Value::from(bundle.encoding.encoding_confidence),
        }
    }

    fn write(&self, bundle: &mut Bundle, value: Value) -> Result<(), PatchError> {
        let invalid = |e: serde_json::Error| PatchError::InvalidField {
            field: self.key().to_string(),
            reason: e.to_string(),
        };
        match self {
            PatchField::Hash => bundle.hash = serde_json::from_value(value).map_err(invalid)?,
            PatchField::Size => bundle.size = serde_json::from_value(value).map_err(invalid)?,
            PatchField::ModTimeMs => {
                bundle.mod_time_ms = serde_json::from_value(value).map_err(invalid)?
            }
            PatchField::FileRelations => {
                bundle.file_relations = if value.is_null() { None } else { Some(value) }
            }
            PatchField::AuxRows => {
                bundle.aux_rows = serde_json::from_value(value).map_err(invalid)?
            }
            PatchField::Encoding => {
                bundle.encoding.encoding = serde_json::from_value(value).map_err(invalid)?
            }
            PatchField::EncodingFallback => {
                bundle.encoding.encoding_fallback =
                    serde_json::from_value(value).map_err(invalid)?
            }
            PatchField::EncodingConfidence => {
                bundle.encoding.encoding_confidence =
                    serde_json::from_value(value).map_err(invalid)?
            }
        }
        Ok(())
    }
}

/// One validated delta between two successive versions of a bundle
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BundlePatch {
    pub chunks: Option<ChunkSplice>,
    pub set: BTreeMap<PatchField, Value>,
}

/// Wire form of one sidecar line
#[derive(Debug, Serialize, Deserialize)]
struct PatchRecord {
    format: String,
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunks: Option<ChunkSplice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    set: Option<BTreeMap<String, Value>>,
}

impl From<&BundlePatch> for PatchRecord {
    fn from(patch: &BundlePatch) -> Self {
        PatchRecord {
            format: PATCH_FORMAT.to_string(),
            version: PATCH_VERSION,
            chunks: patch.chunks.clone(),
            set: (!patch.set.is_empty()).then(|| {
                patch
                    .set
                    .iter()
                    .map(|(field, value)| (field.key().to_string(), value.clone()))
                    .collect()
            }),
        }
    }
}

impl TryFrom<PatchRecord> for BundlePatch {
    type Error = PatchError;

    fn try_from(record: PatchRecord) -> Result<Self, Self::Error> {
        if record.format != PATCH_FORMAT || record.version != PATCH_VERSION {
            return Err(PatchError::UnsupportedEnvelope(format!(
                "{} v{}",
                record.format, record.version
            )));
        }
        let mut set = BTreeMap::new();
        for (key, value) in record.set.unwrap_or_default() {
            let field = PatchField::from_key(&key).ok_or_else(|| PatchError::InvalidField {
                field: key.clone(),
                reason: "field is not patchable".to_string(),
            })?;
            set.insert(field, value);
        }
        Ok(BundlePatch {
            chunks: record.chunks,
            set,
        })
    }
}

impl BundlePatch {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_none() && self.set.is_empty()
    }

    /// Minimal delta turning `previous` into `next`, or `None` when they agree on
    /// every chunk and patchable field
    pub fn diff(previous: &Bundle, next: &Bundle) -> Option<Self> {
        let prev = &previous.chunks;
        let curr = &next.chunks;

        let prefix = prev
            .iter()
            .zip(curr.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = prev.len().min(curr.len()) - prefix;
        let suffix = prev
            .iter()
            .rev()
            .zip(curr.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let chunks = if prefix == prev.len() && prefix == curr.len() {
            None
        } else {
            Some(ChunkSplice {
                start: prefix,
                delete_count: prev.len() - prefix - suffix,
                items: curr[prefix..curr.len() - suffix].to_vec(),
            })
        };

        let set: BTreeMap<PatchField, Value> = PatchField::ALL
            .into_iter()
            .filter_map(|field| {
                let after = field.read(next);
                (field.read(previous) != after).then_some((field, after))
            })
            .collect();

        let patch = BundlePatch { chunks, set };
        (!patch.is_empty()).then_some(patch)
    }

    /// Apply in place. An out-of-range splice is an error, never clamped.
    pub fn apply(&self, bundle: &mut Bundle) -> Result<(), PatchError> {
        if let Some(splice) = &self.chunks {
            let len = bundle.chunks.len();
            let in_range = splice
                .start
                .checked_add(splice.delete_count)
                .is_some_and(|end| end <= len);
            if !in_range {
                return Err(PatchError::OutOfRange {
                    start: splice.start,
                    delete_count: splice.delete_count,
                    len,
                });
            }
            bundle.chunks.splice(
                splice.start..splice.start + splice.delete_count,
                splice.items.iter().cloned(),
            );
        }
        for (field, value) in &self.set {
            field.write(bundle, value.clone())?;
        }
        Ok(())
    }

    /// Serialized sidecar line, newline-terminated
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(&PatchRecord::from(self))?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, PatchError> {
        let record: PatchRecord = serde_json::from_str(line)
            .map_err(|e| PatchError::UnsupportedEnvelope(e.to_string()))?;
        BundlePatch::try_from(record)
    }
}

/// Result of trying to persist a change as a patch instead of a full rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// One line appended to the sidecar
    Applied,
    /// Nothing differs; no write happened
    NoChanges,
    /// A cap was hit; the caller must rewrite the whole bundle
    Rejected(String),
}

/// Append the delta between `previous` and `next` to the sidecar at `sidecar_path`
pub async fn append_patch(
    sidecar_path: &Path,
    previous: &Bundle,
    next: &Bundle,
    limits: &CodecConfig,
) -> Result<PatchOutcome, CacheError> {
    let Some(patch) = BundlePatch::diff(previous, next) else {
        return Ok(PatchOutcome::NoChanges);
    };
    let line = patch.to_line().map_err(|e| {
        CacheError::other(format!("Failed to serialize patch for '{}': {}", next.file, e))
    })?;
    if line.len() > limits.patch_max_entry_bytes {
        return Ok(PatchOutcome::Rejected("entry-too-large".to_string()));
    }

    let (existing_bytes, existing_entries) = match tokio::fs::read(sidecar_path).await {
        Ok(bytes) => {
            let entries = bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
            (bytes.len() as u64, entries)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, 0),
        Err(e) => return Err(e.into()),
    };
    if existing_entries + 1 > limits.patch_max_entries {
        return Ok(PatchOutcome::Rejected("too-many-entries".to_string()));
    }
    if existing_bytes + line.len() as u64 > limits.patch_max_total_bytes {
        return Ok(PatchOutcome::Rejected("sidecar-too-large".to_string()));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(sidecar_path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(PatchOutcome::Applied)
}

/// Replay every sidecar line onto `bundle`; a missing sidecar is a no-op
pub async fn replay_sidecar(
    sidecar_path: &Path,
    bundle: &mut Bundle,
    limits: &CodecConfig,
) -> Result<(), BundleReadFailure> {
    let size = match tokio::fs::metadata(sidecar_path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BundleReadFailure::Io(e.to_string())),
    };
    if size > limits.patch_max_total_bytes {
        return Err(BundleReadFailure::PatchTooLarge {
            size,
            max: limits.patch_max_total_bytes,
        });
    }

    let text = tokio::fs::read_to_string(sidecar_path)
        .await
        .map_err(|e| BundleReadFailure::PatchInvalid(e.to_string()))?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() > limits.patch_max_entries {
        return Err(BundleReadFailure::PatchTooManyEntries {
            count: lines.len(),
            max: limits.patch_max_entries,
        });
    }

    for (index, line) in lines.into_iter().enumerate() {
        if line.len() > limits.patch_max_entry_bytes {
            return Err(BundleReadFailure::PatchEntryTooLarge {
                line: index + 1,
                size: line.len(),
                max: limits.patch_max_entry_bytes,
            });
        }
        BundlePatch::from_line(line)?.apply(bundle)?;
    }
    Ok(())
}
