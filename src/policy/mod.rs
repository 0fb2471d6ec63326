//! Heavy-file policy engine
//!
//! Pure decision logic: given a file's size, line count, chunk count and path, decide
//! whether to downshift analysis depth, whether to skip tokenization, how far to
//! coalesce its chunks, and which parser fallback mode applies. No I/O.

mod coalesce;
mod fallback;

pub use coalesce::coalesce_heavy_chunks;
pub use fallback::{ChunkingDiagnostics, FallbackReason, ParserFallbackProfile, ParserMode};

use crate::config::HeavyFileConfig;
use crate::types::IndexMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

const MAX_BYTES_DEFAULT: u64 = 512 * 1024;
const MAX_LINES_DEFAULT: u64 = 6000;
const MAX_CHUNKS_DEFAULT: u64 = 64;
const PATH_MIN_BYTES_DEFAULT: u64 = 64 * 1024;
const PATH_MIN_LINES_DEFAULT: u64 = 1200;
const PATH_MIN_CHUNKS_DEFAULT: u64 = MAX_CHUNKS_DEFAULT;
const CHUNK_ONLY_MIN_BYTES_DEFAULT: u64 = 96 * 1024;
const CHUNK_ONLY_MIN_LINES_DEFAULT: u64 = 1200;
const SKIP_TOKENIZATION_MAX_BYTES_DEFAULT: u64 = MAX_BYTES_DEFAULT * 2;
const SKIP_TOKENIZATION_MAX_LINES_DEFAULT: u64 = MAX_LINES_DEFAULT * 2;
const SKIP_TOKENIZATION_MAX_CHUNKS_DEFAULT: u64 = MAX_CHUNKS_DEFAULT * 2;
const SKIP_TOKENIZATION_CHUNK_ONLY_MIN_BYTES_DEFAULT: u64 = 256 * 1024;
const SKIP_TOKENIZATION_CHUNK_ONLY_MIN_LINES_DEFAULT: u64 = 3000;
const SKIP_TOKENIZATION_COALESCE_MAX_CHUNKS_DEFAULT: u64 = 16;
const HOT_PATH_TARGET_CHUNKS_DEFAULT: u64 = 24;
const HOT_PATH_MIN_CHUNKS_DEFAULT: u64 = 48;

/// Generated, vendored and third-party trees, matched as leading path segments
const HEAVY_PATH_PREFIXES: &[&str] = &[
    "/3rdparty/",
    "/third_party/",
    "/thirdparty/",
    "/vendor/",
    "/single_include/",
    "/include/fmt/",
    "/include/spdlog/fmt/",
    "/include/nlohmann/",
    "/modules/core/include/opencv2/core/hal/",
    "/modules/core/src/",
    "/modules/dnn/",
    "/modules/js/perf/",
    "/sources/cniollhttp/",
    "/sources/nio/",
    "/sources/niocore/",
    "/sources/nioposix/",
    "/tests/nio/",
    "/test/api-digester/inputs/",
    "/test/remote-run/",
    "/test/stdlib/inputs/",
    "/tests/abi/",
    "/test/gtest/",
    "/utils/unicodedata/",
    "/utils/gen-unicode-data/",
    "/samples/",
    "/docs/mkdocs/",
    "/cmake/",
    "/.github/workflows/",
];

/// Test and utility directories where large Swift files get extra coalescing
const HOT_PATH_PARTS: &[&str] = &[
    "/test/",
    "/tests/",
    "/validation-test/",
    "/unittests/",
    "/utils/",
];

/// Fully-defaulted heavy-file thresholds for one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeavyFilePolicy {
    pub enabled: bool,
    pub max_bytes: u64,
    pub max_lines: u64,
    pub max_chunks: u64,
    pub path_min_bytes: u64,
    pub path_min_lines: u64,
    pub path_min_chunks: u64,
    pub chunk_only_min_bytes: u64,
    pub chunk_only_min_lines: u64,
    pub skip_tokenization_enabled: bool,
    pub skip_tokenization_max_bytes: u64,
    pub skip_tokenization_max_lines: u64,
    pub skip_tokenization_max_chunks: u64,
    pub skip_tokenization_chunk_only_min_bytes: u64,
    pub skip_tokenization_chunk_only_min_lines: u64,
    pub skip_tokenization_coalesce_max_chunks: u64,
    pub hot_path_target_chunks: u64,
    pub hot_path_min_chunks: u64,
}

impl Default for HeavyFilePolicy {
    fn default() -> Self {
        Self::resolve(&HeavyFileConfig::default())
    }
}

/// Size facts about one file, measured before analysis
#[derive(Debug, Clone, Copy)]
pub struct FileMetrics<'a> {
    pub rel_path: &'a str,
    /// Extension including the leading dot, e.g. `.swift`
    pub extension: Option<&'a str>,
    pub bytes: u64,
    pub lines: u64,
    pub chunks: usize,
}

/// Resolved heavy-file handling for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeavyFileDecision {
    pub downshift: bool,
    pub skip_tokenization: bool,
    pub hot_path: bool,
    /// Upper bound on chunk count after coalescing
    pub target_chunks: usize,
}

fn positive(raw: Option<u64>) -> Option<u64> {
    raw.filter(|v| *v > 0)
}

impl HeavyFilePolicy {
    /// Merge explicit overrides with built-in defaults.
    ///
    /// An explicit `max_chunks` zeroes the derived chunk-only minimums (unless those are
    /// set too), so a custom chunk ceiling is not masked by hidden size floors. The same
    /// holds for `skip_tokenization_max_chunks`.
    pub fn resolve(config: &HeavyFileConfig) -> Self {
        let explicit_max_chunks = positive(config.max_chunks);
        let explicit_skip_chunks = positive(config.skip_tokenization_max_chunks);
        Self {
            enabled: config.enabled,
            max_bytes: positive(config.max_bytes).unwrap_or(MAX_BYTES_DEFAULT),
            max_lines: positive(config.max_lines).unwrap_or(MAX_LINES_DEFAULT),
            max_chunks: explicit_max_chunks.unwrap_or(MAX_CHUNKS_DEFAULT),
            path_min_bytes: positive(config.path_min_bytes).unwrap_or(PATH_MIN_BYTES_DEFAULT),
            path_min_lines: positive(config.path_min_lines).unwrap_or(PATH_MIN_LINES_DEFAULT),
            path_min_chunks: positive(config.path_min_chunks).unwrap_or(PATH_MIN_CHUNKS_DEFAULT),
            chunk_only_min_bytes: positive(config.chunk_only_min_bytes).unwrap_or(
                if explicit_max_chunks.is_some() {
                    0
                } else {
                    CHUNK_ONLY_MIN_BYTES_DEFAULT
                },
            ),
            chunk_only_min_lines: positive(config.chunk_only_min_lines).unwrap_or(
                if explicit_max_chunks.is_some() {
                    0
                } else {
                    CHUNK_ONLY_MIN_LINES_DEFAULT
                },
            ),
            skip_tokenization_enabled: config.skip_tokenization,
            skip_tokenization_max_bytes: positive(config.skip_tokenization_max_bytes)
                .unwrap_or(SKIP_TOKENIZATION_MAX_BYTES_DEFAULT),
            skip_tokenization_max_lines: positive(config.skip_tokenization_max_lines)
                .unwrap_or(SKIP_TOKENIZATION_MAX_LINES_DEFAULT),
            skip_tokenization_max_chunks: explicit_skip_chunks
                .unwrap_or(SKIP_TOKENIZATION_MAX_CHUNKS_DEFAULT),
            skip_tokenization_chunk_only_min_bytes: positive(
                config.skip_tokenization_chunk_only_min_bytes,
            )
            .unwrap_or(if explicit_skip_chunks.is_some() {
                0
            } else {
                SKIP_TOKENIZATION_CHUNK_ONLY_MIN_BYTES_DEFAULT
            }),
            skip_tokenization_chunk_only_min_lines: positive(
                config.skip_tokenization_chunk_only_min_lines,
            )
            .unwrap_or(if explicit_skip_chunks.is_some() {
                0
            } else {
                SKIP_TOKENIZATION_CHUNK_ONLY_MIN_LINES_DEFAULT
            }),
            skip_tokenization_coalesce_max_chunks: positive(
                config.skip_tokenization_coalesce_max_chunks,
            )
            .unwrap_or(SKIP_TOKENIZATION_COALESCE_MAX_CHUNKS_DEFAULT),
            hot_path_target_chunks: positive(config.hot_path_target_chunks)
                .unwrap_or(HOT_PATH_TARGET_CHUNKS_DEFAULT),
            hot_path_min_chunks: positive(config.hot_path_min_chunks)
                .unwrap_or(HOT_PATH_MIN_CHUNKS_DEFAULT),
        }
    }

    /// Whether a file is expensive enough to reduce analysis depth.
    ///
    /// Only `code` mode downshifts; other modes never get full analysis anyway.
    pub fn should_downshift(&self, mode: IndexMode, file: &FileMetrics<'_>) -> bool {
        if mode != IndexMode::Code || !self.enabled {
            return false;
        }
        let chunks = file.chunks as u64;
        let by_bytes = file.bytes >= self.max_bytes;
        let by_lines = file.lines >= self.max_lines;
        let by_chunk_only = chunks >= self.max_chunks
            && (file.bytes >= self.chunk_only_min_bytes || file.lines >= self.chunk_only_min_lines);
        by_bytes || by_lines || by_chunk_only || self.should_downshift_for_path(file)
    }

    /// Heavy directories downshift at lower, path-specific minimums
    pub fn should_downshift_for_path(&self, file: &FileMetrics<'_>) -> bool {
        if !is_heavy_path(file.rel_path) {
            return false;
        }
        file.bytes >= self.path_min_bytes
            || file.lines >= self.path_min_lines
            || file.chunks as u64 >= self.path_min_chunks
    }

    /// Tokenization is skipped only for downshifted files past the stricter ceilings
    pub fn should_skip_tokenization(&self, downshifted: bool, file: &FileMetrics<'_>) -> bool {
        if !downshifted || !self.skip_tokenization_enabled {
            return false;
        }
        let by_bytes = file.bytes >= self.skip_tokenization_max_bytes;
        let by_lines = file.lines >= self.skip_tokenization_max_lines;
        let by_chunk_only = file.chunks as u64 >= self.skip_tokenization_max_chunks
            && (file.bytes >= self.skip_tokenization_chunk_only_min_bytes
                || file.lines >= self.skip_tokenization_chunk_only_min_lines);
        by_bytes || by_lines || by_chunk_only
    }

    /// Large Swift files under test/utility trees get an extra coalescing bound
    pub fn should_apply_hot_path_coalescing(&self, file: &FileMetrics<'_>) -> bool {
        let is_swift = file
            .extension
            .is_some_and(|ext| ext.eq_ignore_ascii_case(".swift"));
        if !is_swift || (file.chunks as u64) < self.hot_path_min_chunks {
            return false;
        }
        let bounded = bounded_path(file.rel_path);
        HOT_PATH_PARTS.iter().any(|part| bounded.contains(part))
    }

    /// Resolve every heavy-file decision for one file
    pub fn evaluate(&self, mode: IndexMode, file: &FileMetrics<'_>) -> HeavyFileDecision {
        let downshift = self.should_downshift(mode, file);
        let skip_tokenization = self.should_skip_tokenization(downshift, file);
        let hot_path = downshift && self.should_apply_hot_path_coalescing(file);

        let mut target = if skip_tokenization {
            self.max_chunks.min(self.skip_tokenization_coalesce_max_chunks)
        } else {
            self.max_chunks
        };
        if hot_path {
            target = target.min(self.hot_path_target_chunks).max(1);
        }

        if downshift {
            tracing::debug!(
                "[perf] heavy-file downshift enabled for {} ({} bytes, {} lines, {} chunks)",
                file.rel_path,
                file.bytes,
                file.lines,
                file.chunks
            );
            if skip_tokenization {
                tracing::debug!("[perf] heavy-file tokenization skipped for {}", file.rel_path);
            }
        }

        HeavyFileDecision {
            downshift,
            skip_tokenization,
            hot_path,
            target_chunks: usize::try_from(target).unwrap_or(usize::MAX),
        }
    }
}

/// `/`-bounded, lower-cased form used for segment-anchored matching
/// Extension of the final path segment including the leading dot, e.g. `.swift`.
/// Dots in directory names are ignored.
pub fn file_extension(rel_path: &str) -> Option<&str> {
    let name = Path::new(rel_path).file_name()?.to_str()?;
    let ext = Path::new(name).extension()?.to_str()?;
    Some(&name[name.len() - ext.len() - 1..])
}

fn bounded_path(rel_path: &str) -> String {
    let normalized = rel_path.replace('\\', "/").to_lowercase();
    format!("/{}/", normalized.trim_matches('/'))
}

/// Whether a path lives under a known generated/vendored tree.
///
/// Matching is anchored on whole leading segments, so `vendor-utils/` is not heavy.
pub fn is_heavy_path(rel_path: &str) -> bool {
    let bounded = bounded_path(rel_path);
    HEAVY_PATH_PREFIXES
        .iter()
        .any(|prefix| bounded.starts_with(prefix))
}

#[cfg(test)]
mod tests;
