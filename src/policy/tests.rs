use super::*;
use crate::types::ChunkRecord;
use serde_json::json;

fn metrics(rel_path: &str, bytes: u64, lines: u64, chunks: usize) -> FileMetrics<'_> {
    FileMetrics {
        rel_path,
        extension: file_extension(rel_path),
        bytes,
        lines,
        chunks,
    }
}

fn contiguous_chunks(count: usize) -> Vec<ChunkRecord> {
    (0..count)
        .map(|i| {
            let mut chunk = ChunkRecord::new("src/big.js", (i * 10) as u64, (i * 10 + 10) as u64);
            chunk.chunk_id = Some(format!("chunk-{}", i));
            chunk.chunk_uid = Some(format!("uid-{}", i));
            chunk.span_index = Some(i as u64);
            chunk.segment = Some(json!({"languageId": format!("lang-{}", i)}));
            chunk.segment_uid = Some(format!("seg-{}", i));
            chunk
        })
        .collect()
}

#[test]
fn test_resolve_defaults() {
    let policy = HeavyFilePolicy::default();
    assert!(policy.enabled);
    assert_eq!(policy.max_bytes, 512 * 1024);
    assert_eq!(policy.max_lines, 6000);
    assert_eq!(policy.max_chunks, 64);
    assert_eq!(policy.chunk_only_min_bytes, 96 * 1024);
    assert_eq!(policy.skip_tokenization_max_chunks, 128);
    assert_eq!(policy.skip_tokenization_coalesce_max_chunks, 16);
}

#[test]
fn test_explicit_max_chunks_disables_chunk_only_minimums() {
    let config = HeavyFileConfig {
        max_chunks: Some(40),
        ..Default::default()
    };
    let policy = HeavyFilePolicy::resolve(&config);
    assert_eq!(policy.max_chunks, 40);
    assert_eq!(policy.chunk_only_min_bytes, 0);
    assert_eq!(policy.chunk_only_min_lines, 0);
    // Tokenization-skip minimums are independent of max_chunks
    assert_eq!(policy.skip_tokenization_chunk_only_min_bytes, 256 * 1024);

    let explicit_both = HeavyFileConfig {
        max_chunks: Some(40),
        chunk_only_min_bytes: Some(2048),
        ..Default::default()
    };
    let policy = HeavyFilePolicy::resolve(&explicit_both);
    assert_eq!(policy.chunk_only_min_bytes, 2048);
    assert_eq!(policy.chunk_only_min_lines, 0);
}

#[test]
fn test_zero_override_means_default() {
    let config = HeavyFileConfig {
        max_bytes: Some(0),
        ..Default::default()
    };
    assert_eq!(HeavyFilePolicy::resolve(&config).max_bytes, 512 * 1024);
}

#[test]
fn test_small_file_not_downshifted() {
    let policy = HeavyFilePolicy::default();
    assert!(!policy.should_downshift(IndexMode::Code, &metrics("src/a.rs", 1000, 10, 3)));
}

#[test]
fn test_downshift_by_bytes_and_lines() {
    let policy = HeavyFilePolicy::default();
    assert!(policy.should_downshift(IndexMode::Code, &metrics("src/a.rs", 512 * 1024, 10, 3)));
    assert!(policy.should_downshift(IndexMode::Code, &metrics("src/a.rs", 100, 6000, 3)));
}

#[test]
fn test_chunk_count_alone_needs_size_minimum() {
    let policy = HeavyFilePolicy::default();
    let many_small_chunks = metrics("src/a.rs", 10_000, 100, 100);
    assert!(!policy.should_downshift(IndexMode::Code, &many_small_chunks));

    let many_chunks_and_big = metrics("src/a.rs", 100 * 1024, 100, 100);
    assert!(policy.should_downshift(IndexMode::Code, &many_chunks_and_big));

    let custom = HeavyFilePolicy::resolve(&HeavyFileConfig {
        max_chunks: Some(50),
        ..Default::default()
    });
    assert!(custom.should_downshift(IndexMode::Code, &many_small_chunks));
}

#[test]
fn test_non_code_mode_never_downshifts() {
    let policy = HeavyFilePolicy::default();
    let huge = metrics("docs/huge.md", 10 * 1024 * 1024, 100_000, 500);
    assert!(!policy.should_downshift(IndexMode::Prose, &huge));
}

#[test]
fn test_disabled_policy_never_downshifts() {
    let policy = HeavyFilePolicy::resolve(&HeavyFileConfig {
        enabled: false,
        ..Default::default()
    });
    let huge = metrics("src/huge.rs", 10 * 1024 * 1024, 100_000, 500);
    assert!(!policy.should_downshift(IndexMode::Code, &huge));
}

#[test]
fn test_file_extension_ignores_directory_dots() {
    assert_eq!(file_extension("test/stdlib/Array.swift"), Some(".swift"));
    assert_eq!(file_extension("a.v2/Foo"), None);
    assert_eq!(file_extension("a.v2/Foo.Swift"), Some(".Swift"));
    assert_eq!(file_extension("archive.tar.gz"), Some(".gz"));
    assert_eq!(file_extension(".gitignore"), None);
    assert_eq!(file_extension(""), None);
}

#[test]
fn test_hot_path_needs_swift_file_not_directory() {
    let policy = HeavyFilePolicy::default();
    let chunks = policy.hot_path_min_chunks as usize;
    assert!(policy.should_apply_hot_path_coalescing(&metrics("test/a/Big.swift", 1, 1, chunks)));
    assert!(!policy.should_apply_hot_path_coalescing(&metrics("test/kit.swift/Big", 1, 1, chunks)));
}

#[test]
fn test_heavy_path_prefixes() {
    assert!(is_heavy_path("vendor/lib/a.js"));
    assert!(is_heavy_path("/third_party/x/y.cc"));
    assert!(is_heavy_path("Vendor\\lib\\a.js"));
    assert!(is_heavy_path("utils/unicodedata/table.txt"));
    assert!(is_heavy_path(".github/workflows/ci.yml"));
    assert!(is_heavy_path("modules/dnn/src/layer.cpp"));
    assert!(is_heavy_path("modules/core/src/matrix.cpp"));
    assert!(is_heavy_path("modules/core/include/opencv2/core/hal/intrin.hpp"));
    assert!(is_heavy_path("modules/js/perf/base.js"));
    assert!(is_heavy_path("Sources/NIO/Channel.swift"));
    assert!(is_heavy_path("sources/niocore/EventLoop.swift"));
    assert!(is_heavy_path("sources/nioposix/Socket.swift"));
    assert!(is_heavy_path("sources/cniollhttp/parser.c"));
    assert!(is_heavy_path("tests/nio/ChannelTests.swift"));
    assert!(is_heavy_path("test/stdlib/inputs/x.swift"));
    assert!(is_heavy_path("test/api-digester/inputs/a.swift"));
    assert!(is_heavy_path("test/remote-run/run.py"));
    assert!(!is_heavy_path("modules/core/include/opencv2/core.hpp"));
    assert!(!is_heavy_path("sources/niossl/Handler.swift"));
    assert!(!is_heavy_path("test/stdlib/Array.swift"));
    assert!(!is_heavy_path("vendor-utils/a.js"));
    assert!(!is_heavy_path("src/vendor/a.js"));
    assert!(!is_heavy_path("vendored.js"));
}

#[test]
fn test_heavy_path_uses_lower_minimums() {
    let policy = HeavyFilePolicy::default();
    let vendored = metrics("vendor/lib/big.js", 70_000, 100, 3);
    let lookalike = metrics("vendor-utils/big.js", 70_000, 100, 3);
    assert!(policy.should_downshift(IndexMode::Code, &vendored));
    assert!(!policy.should_downshift(IndexMode::Code, &lookalike));

    let small_vendored = metrics("vendor/lib/tiny.js", 1_000, 10, 1);
    assert!(!policy.should_downshift(IndexMode::Code, &small_vendored));
}

#[test]
fn test_skip_tokenization_requires_downshift() {
    let policy = HeavyFilePolicy::default();
    let huge = metrics("src/huge.rs", 2 * 1024 * 1024, 10, 3);
    assert!(!policy.should_skip_tokenization(false, &huge));
    assert!(policy.should_skip_tokenization(true, &huge));

    let disabled = HeavyFilePolicy::resolve(&HeavyFileConfig {
        skip_tokenization: false,
        ..Default::default()
    });
    assert!(!disabled.should_skip_tokenization(true, &huge));
}

#[test]
fn test_evaluate_targets() {
    let policy = HeavyFilePolicy::default();

    let plain = policy.evaluate(IndexMode::Code, &metrics("src/a.rs", 100, 10, 3));
    assert!(!plain.downshift);
    assert_eq!(plain.target_chunks, 64);

    let skipped = policy.evaluate(IndexMode::Code, &metrics("src/a.rs", 2 * 1024 * 1024, 10, 3));
    assert!(skipped.downshift);
    assert!(skipped.skip_tokenization);
    assert_eq!(skipped.target_chunks, 16);
}

#[test]
fn test_swift_hot_path_coalescing() {
    let policy = HeavyFilePolicy::default();
    let swift = metrics("test/Parse/huge.swift", 600 * 1024, 100, 50);
    let decision = policy.evaluate(IndexMode::Code, &swift);
    assert!(decision.downshift);
    assert!(decision.hot_path);
    assert_eq!(decision.target_chunks, 24);

    let not_swift = metrics("test/Parse/huge.rs", 600 * 1024, 100, 50);
    assert!(!policy.evaluate(IndexMode::Code, &not_swift).hot_path);

    let few_chunks = metrics("test/Parse/huge.swift", 600 * 1024, 100, 10);
    assert!(!policy.evaluate(IndexMode::Code, &few_chunks).hot_path);
}

#[test]
fn test_fallback_profile_branches() {
    let clean = ChunkingDiagnostics::default();
    let missing = ChunkingDiagnostics {
        scheduler_missing_count: 1,
        ..Default::default()
    };
    let heuristic = ChunkingDiagnostics {
        used_heuristic_chunking: true,
        ..Default::default()
    };
    let segments = ChunkingDiagnostics {
        fallback_segment_count: 2,
        ..Default::default()
    };

    assert_eq!(
        ParserFallbackProfile::resolve(IndexMode::Prose, true, true, &missing),
        ParserFallbackProfile::ChunkOnly(FallbackReason::NonCodeMode)
    );
    assert_eq!(
        ParserFallbackProfile::resolve(IndexMode::Code, true, true, &missing),
        ParserFallbackProfile::ChunkOnly(FallbackReason::HeavyFileTokenizationSkip)
    );
    assert_eq!(
        ParserFallbackProfile::resolve(IndexMode::Code, false, false, &missing),
        ParserFallbackProfile::SyntaxLite(FallbackReason::SchedulerMiss)
    );
    assert_eq!(
        ParserFallbackProfile::resolve(IndexMode::Code, false, false, &heuristic),
        ParserFallbackProfile::SyntaxLite(FallbackReason::HeuristicFallback)
    );
    assert_eq!(
        ParserFallbackProfile::resolve(IndexMode::Code, false, false, &segments),
        ParserFallbackProfile::SyntaxLite(FallbackReason::HeuristicFallback)
    );
    assert_eq!(
        ParserFallbackProfile::resolve(IndexMode::Code, false, false, &clean),
        ParserFallbackProfile::AstFull
    );
}

#[test]
fn test_size_outranks_missing_parser() {
    let policy = HeavyFilePolicy::default();
    let oversized = metrics("src/huge.rs", 600 * 1024, 100, 3);
    let decision = policy.evaluate(IndexMode::Code, &oversized);
    assert!(decision.downshift);
    assert!(!decision.skip_tokenization);

    let diagnostics = ChunkingDiagnostics {
        scheduler_missing_count: 3,
        used_heuristic_chunking: true,
        fallback_segment_count: 1,
    };
    let profile = ParserFallbackProfile::resolve(
        IndexMode::Code,
        decision.downshift,
        decision.skip_tokenization,
        &diagnostics,
    );
    assert_eq!(profile.mode(), ParserMode::SyntaxLite);
    assert_eq!(profile.reason_code(), Some("heavy-file-downshift"));
}

#[test]
fn test_profile_serialization() {
    let profile = ParserFallbackProfile::SyntaxLite(FallbackReason::SchedulerMiss);
    let value = serde_json::to_value(profile).unwrap();
    assert_eq!(value["mode"], "syntax-lite");
    assert_eq!(value["reasonCode"], "scheduler-miss");
    assert!(value["reason"].is_string());

    let full = serde_json::to_value(ParserFallbackProfile::AstFull).unwrap();
    assert_eq!(full["mode"], "ast-full");
    assert!(full["reasonCode"].is_null());
}

#[test]
fn test_coalesce_noop_when_within_target() {
    let chunks = contiguous_chunks(4);
    let result = coalesce_heavy_chunks(chunks.clone(), 4);
    assert_eq!(result, chunks);
}

#[test]
fn test_coalesce_preserves_coverage() {
    for count in [2usize, 5, 7, 64, 129] {
        for target in [1usize, 2, 3, 4, 16, 50] {
            let chunks = contiguous_chunks(count);
            let first_start = chunks[0].start;
            let last_end = chunks[count - 1].end;
            let merged = coalesce_heavy_chunks(chunks, target);

            assert!(merged.len() <= target);
            assert_eq!(merged[0].start, first_start);
            assert_eq!(merged[merged.len() - 1].end, last_end);
            for pair in merged.windows(2) {
                assert_eq!(pair[0].end, pair[1].start, "gap or overlap at count={count} target={target}");
                assert!(pair[0].start < pair[0].end);
            }
        }
    }
}

#[test]
fn test_coalesce_tail_keeps_segment() {
    let chunks = contiguous_chunks(5);
    let merged = coalesce_heavy_chunks(chunks.clone(), 4);

    assert_eq!(merged.len(), 3);
    assert!(merged[0].segment.is_none());
    assert!(merged[0].segment_uid.is_none());
    assert!(merged[1].segment.is_none());
    assert_eq!(merged[2].segment, chunks[4].segment);
    assert_eq!(merged[2].segment_uid, chunks[4].segment_uid);

    for chunk in &merged {
        assert!(chunk.chunk_id.is_none());
        assert!(chunk.chunk_uid.is_none());
        assert!(chunk.span_index.is_none());
    }
}

#[test]
fn test_coalesce_merges_end_line() {
    let mut chunks = contiguous_chunks(4);
    for (i, chunk) in chunks.iter_mut().enumerate() {
        let mut meta = serde_json::Map::new();
        meta.insert("startLine".to_string(), json!(i * 5 + 1));
        meta.insert("endLine".to_string(), json!(i * 5 + 5));
        chunk.meta = Some(meta);
    }
    let merged = coalesce_heavy_chunks(chunks, 2);
    assert_eq!(merged.len(), 2);
    let meta = merged[0].meta.as_ref().unwrap();
    assert_eq!(meta["startLine"], json!(1));
    assert_eq!(meta["endLine"], json!(10));
    assert_eq!(merged[1].meta.as_ref().unwrap()["endLine"], json!(20));
}

#[test]
fn test_coalesce_keeps_extra_fields_of_first() {
    let mut chunks = contiguous_chunks(3);
    chunks[0] = chunks[0].clone().with_extra("kind", json!("function"));
    let merged = coalesce_heavy_chunks(chunks, 1);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].extra.get("kind"), Some(&json!("function")));
    assert_eq!(merged[0].start, 0);
    assert_eq!(merged[0].end, 30);
}
