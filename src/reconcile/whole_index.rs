//! Whole-index reuse check
//!
//! Before a build skips an entire stage it must prove the previous output is complete
//! and still describes every tracked file. Any doubt means rebuild.

use crate::manifest::{MANIFEST_SCHEMA_VERSION, Manifest};
use crate::paths::{normalize_rel_path, resolve_within};
use crate::types::FileEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

const INDEX_STATE_FILE: &str = "index_state.json";
const PIECES_MANIFEST_FILE: &str = "pieces/manifest.json";

/// Completion level recorded by the downstream index writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStage {
    Stage1,
    Stage2,
    Stage3,
    Stage4,
}

impl fmt::Display for IndexStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexStage::Stage1 => "stage1",
            IndexStage::Stage2 => "stage2",
            IndexStage::Stage3 => "stage3",
            IndexStage::Stage4 => "stage4",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize)]
struct IndexState {
    stage: IndexStage,
}

#[derive(Debug, Deserialize)]
struct PiecesManifest {
    #[serde(default)]
    pieces: Vec<PieceRef>,
}

#[derive(Debug, Deserialize)]
struct PieceRef {
    path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuseVerdict {
    Reuse,
    Rebuild(String),
}

impl ReuseVerdict {
    pub fn is_reuse(&self) -> bool {
        matches!(self, ReuseVerdict::Reuse)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Decide whether the output in `output_dir` can be reused without rebuilding.
///
/// Fails closed: every check that cannot be completed returns `Rebuild` with the
/// reason. With `explain` set, a rejection is logged at info level.
pub fn should_reuse_whole_index(
    output_dir: &Path,
    files: &[FileEntry],
    manifest: &Manifest,
    required_stage: IndexStage,
    explain: bool,
) -> ReuseVerdict {
    let verdict = evaluate(output_dir, files, manifest, required_stage);
    if let ReuseVerdict::Rebuild(reason) = &verdict {
        if explain {
            tracing::info!("[incremental] {} index reuse rejected: {}", manifest.mode, reason);
        } else {
            tracing::debug!("[incremental] {} index reuse rejected: {}", manifest.mode, reason);
        }
    }
    verdict
}

fn evaluate(
    output_dir: &Path,
    files: &[FileEntry],
    manifest: &Manifest,
    required_stage: IndexStage,
) -> ReuseVerdict {
    if !output_dir.is_dir() {
        return ReuseVerdict::Rebuild("output directory missing".to_string());
    }
    if files.is_empty() {
        return ReuseVerdict::Rebuild("no tracked entries".to_string());
    }
    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        return ReuseVerdict::Rebuild(format!(
            "manifest schema version {} is stale",
            manifest.schema_version
        ));
    }

    let state: IndexState = match read_json(&output_dir.join(INDEX_STATE_FILE)) {
        Ok(state) => state,
        Err(e) => return ReuseVerdict::Rebuild(format!("index state unreadable: {}", e)),
    };
    if state.stage < required_stage {
        return ReuseVerdict::Rebuild(format!(
            "index state is {}, {} required",
            state.stage, required_stage
        ));
    }

    let pieces: PiecesManifest = match read_json(&output_dir.join(PIECES_MANIFEST_FILE)) {
        Ok(pieces) => pieces,
        Err(e) => return ReuseVerdict::Rebuild(format!("piece manifest unreadable: {}", e)),
    };
    if pieces.pieces.is_empty() {
        return ReuseVerdict::Rebuild("piece manifest is empty".to_string());
    }
    for piece in &pieces.pieces {
        let Some(path) = resolve_within(output_dir, &piece.path) else {
            return ReuseVerdict::Rebuild(format!("piece path escapes output directory: {}", piece.path));
        };
        if !path.exists() {
            return ReuseVerdict::Rebuild(format!("piece missing: {}", piece.path));
        }
    }

    let mut tracked = HashSet::with_capacity(files.len());
    for file in files {
        let rel = normalize_rel_path(&file.rel);
        let Some(entry) = manifest.get(&rel) else {
            return ReuseVerdict::Rebuild(format!("{} is not in the manifest", rel));
        };
        match file.stat {
            Some(stat) if stat == entry.stat() => {}
            Some(_) => return ReuseVerdict::Rebuild(format!("{} changed since the last build", rel)),
            None => return ReuseVerdict::Rebuild(format!("{} is missing", rel)),
        }
        tracked.insert(rel);
    }
    if let Some(removed) = manifest
        .files
        .keys()
        .find(|rel| !tracked.contains(&normalize_rel_path(rel)))
    {
        return ReuseVerdict::Rebuild(format!("{} was removed", removed));
    }

    ReuseVerdict::Reuse
}
