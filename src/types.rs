use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::UNIX_EPOCH;

/// Build mode; each mode keeps its own manifest and bundle directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IndexMode {
    #[default]
    Code,
    Prose,
    ExtractedProse,
    Records,
}

impl IndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexMode::Code => "code",
            IndexMode::Prose => "prose",
            IndexMode::ExtractedProse => "extracted-prose",
            IndexMode::Records => "records",
        }
    }
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code" => Ok(IndexMode::Code),
            "prose" => Ok(IndexMode::Prose),
            "extracted-prose" => Ok(IndexMode::ExtractedProse),
            "records" => Ok(IndexMode::Records),
            other => Err(format!("unknown index mode '{}'", other)),
        }
    }
}

/// On-disk wire format of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BundleFormat {
    #[default]
    Json,
    Binary,
}

impl BundleFormat {
    /// File extension used for bundle shards in this format
    pub fn extension(&self) -> &'static str {
        match self {
            BundleFormat::Json => "json",
            BundleFormat::Binary => "bin",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleFormat::Json => "json",
            BundleFormat::Binary => "binary",
        }
    }

    /// Parse a user-supplied format name; unknown names yield `None`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(BundleFormat::Json),
            "binary" | "bin" => Some(BundleFormat::Binary),
            _ => None,
        }
    }

    /// Infer the format of an existing shard from its file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".bin") {
            Some(BundleFormat::Binary)
        } else if name.ends_with(".json") {
            Some(BundleFormat::Json)
        } else {
            None
        }
    }
}

impl fmt::Display for BundleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk produced by upstream analysis.
///
/// Only the span, identity and provenance fields are interpreted here; anything else
/// the analyzers attach is carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_index: Option<u64>,
    /// Embedded-language segment this chunk came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChunkRecord {
    pub fn new(file: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            file: Some(file.into()),
            start,
            end,
            ..Default::default()
        }
    }

    /// Attach an opaque analyzer field
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Text decoding facts recorded alongside a file's analysis
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEncoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_confidence: Option<f64>,
}

impl TextEncoding {
    pub fn is_empty(&self) -> bool {
        self.encoding.is_none()
            && self.encoding_fallback.is_none()
            && self.encoding_confidence.is_none()
    }
}

/// Serialized per-file analysis result cached across builds
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub mod_time_ms: i64,
    #[serde(default)]
    pub size: u64,
    pub chunks: Vec<ChunkRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_relations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_rows: Option<Vec<Value>>,
    #[serde(flatten)]
    pub encoding: TextEncoding,
}

impl Bundle {
    /// True when rewriting `other` over `self` would change nothing on disk
    pub fn same_content(&self, other: &Bundle) -> bool {
        self == other
    }

    /// Copy of this bundle carrying only `chunks`
    pub(crate) fn with_chunks(&self, chunks: Vec<ChunkRecord>) -> Bundle {
        Bundle {
            file: self.file.clone(),
            hash: self.hash.clone(),
            mod_time_ms: self.mod_time_ms,
            size: self.size,
            chunks,
            file_relations: self.file_relations.clone(),
            aux_rows: self.aux_rows.clone(),
            encoding: self.encoding.clone(),
        }
    }
}

/// Size and modification time of a file as seen by this build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ms: i64,
}

impl FileStat {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            size: metadata.len(),
            mtime_ms,
        }
    }

    /// Timestamps on whole seconds cannot tell two writes in the same second apart
    pub fn has_coarse_mtime(&self) -> bool {
        self.mtime_ms % 1000 == 0
    }
}

/// A file tracked by the current build
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Repository-relative path, `/`-separated
    pub rel: String,
    pub abs_path: PathBuf,
    pub stat: Option<FileStat>,
}

impl FileEntry {
    pub fn new(rel: impl Into<String>, abs_path: impl Into<PathBuf>, stat: Option<FileStat>) -> Self {
        Self {
            rel: rel.into(),
            abs_path: abs_path.into(),
            stat,
        }
    }

    /// Build an entry by stat-ing the file on disk
    pub fn from_disk(rel: impl Into<String>, abs_path: impl Into<PathBuf>) -> Self {
        let abs_path = abs_path.into();
        let stat = std::fs::metadata(&abs_path)
            .ok()
            .map(|m| FileStat::from_metadata(&m));
        Self {
            rel: rel.into(),
            abs_path,
            stat,
        }
    }
}
