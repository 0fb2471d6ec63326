//! Parser fallback profile resolution

use crate::types::IndexMode;
use serde::{Serialize, Serializer};

/// Depth of structural analysis applied to a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserMode {
    /// Full structural parse
    AstFull,
    /// Heuristic or partial structure
    SyntaxLite,
    /// Raw spans only
    ChunkOnly,
}

impl ParserMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserMode::AstFull => "ast-full",
            ParserMode::SyntaxLite => "syntax-lite",
            ParserMode::ChunkOnly => "chunk-only",
        }
    }
}

/// Why a file did not get full structural analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    NonCodeMode,
    HeavyFileTokenizationSkip,
    HeavyFileDownshift,
    SchedulerMiss,
    HeuristicFallback,
}

impl FallbackReason {
    pub fn code(&self) -> &'static str {
        match self {
            FallbackReason::NonCodeMode => "non-code-mode",
            FallbackReason::HeavyFileTokenizationSkip => "heavy-file-tokenization-skip",
            FallbackReason::HeavyFileDownshift => "heavy-file-downshift",
            FallbackReason::SchedulerMiss => "scheduler-miss",
            FallbackReason::HeuristicFallback => "heuristic-fallback",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FallbackReason::NonCodeMode => "structural parsing only runs in code mode",
            FallbackReason::HeavyFileTokenizationSkip => {
                "file exceeded heavy-file tokenization thresholds"
            }
            FallbackReason::HeavyFileDownshift => "file exceeded heavy-file downshift thresholds",
            FallbackReason::SchedulerMiss => "no structural parser was scheduled for this file",
            FallbackReason::HeuristicFallback => {
                "structural parser fell back to heuristic chunking"
            }
        }
    }
}

/// Resolved parser decision for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserFallbackProfile {
    AstFull,
    SyntaxLite(FallbackReason),
    ChunkOnly(FallbackReason),
}

/// Upstream chunking signals about structural parser availability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkingDiagnostics {
    pub scheduler_missing_count: usize,
    pub used_heuristic_chunking: bool,
    pub fallback_segment_count: usize,
}

impl ChunkingDiagnostics {
    fn parser_unavailable(&self) -> bool {
        self.scheduler_missing_count > 0
            || self.used_heuristic_chunking
            || self.fallback_segment_count > 0
    }
}

impl ParserFallbackProfile {
    /// First matching rule wins; size signals outrank parser availability.
    pub fn resolve(
        mode: IndexMode,
        downshifted: bool,
        tokenization_skipped: bool,
        diagnostics: &ChunkingDiagnostics,
    ) -> Self {
        if mode != IndexMode::Code {
            return ParserFallbackProfile::ChunkOnly(FallbackReason::NonCodeMode);
        }
        if tokenization_skipped {
            return ParserFallbackProfile::ChunkOnly(FallbackReason::HeavyFileTokenizationSkip);
        }
        if downshifted {
            return ParserFallbackProfile::SyntaxLite(FallbackReason::HeavyFileDownshift);
        }
        if diagnostics.parser_unavailable() {
            let reason = if diagnostics.scheduler_missing_count > 0 {
                FallbackReason::SchedulerMiss
            } else {
                FallbackReason::HeuristicFallback
            };
            return ParserFallbackProfile::SyntaxLite(reason);
        }
        ParserFallbackProfile::AstFull
    }

    pub fn mode(&self) -> ParserMode {
        match self {
            ParserFallbackProfile::AstFull => ParserMode::AstFull,
            ParserFallbackProfile::SyntaxLite(_) => ParserMode::SyntaxLite,
            ParserFallbackProfile::ChunkOnly(_) => ParserMode::ChunkOnly,
        }
    }

    pub fn reason(&self) -> Option<FallbackReason> {
        match self {
            ParserFallbackProfile::AstFull => None,
            ParserFallbackProfile::SyntaxLite(reason) | ParserFallbackProfile::ChunkOnly(reason) => {
                Some(*reason)
            }
        }
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        self.reason().map(|r| r.code())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRecord {
    mode: &'static str,
    reason_code: Option<&'static str>,
    reason: Option<&'static str>,
}

// Attached to per-file analysis metadata as `{mode, reasonCode, reason}`
impl Serialize for ParserFallbackProfile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ProfileRecord {
            mode: self.mode().as_str(),
            reason_code: self.reason_code(),
            reason: self.reason().map(|r| r.description()),
        }
        .serialize(serializer)
    }
}
