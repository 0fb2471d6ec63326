use super::*;
use crate::config::Config;
use crate::manifest::{Manifest, ManifestExpectation};
use crate::types::{BundleFormat, ChunkRecord, IndexMode, TextEncoding};
use filetime::{FileTime, set_file_mtime};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

const FINE_MTIME_MS: i64 = 1_700_000_000_123;
const COARSE_MTIME_MS: i64 = 1_700_000_000_000;

fn write_file(dir: &Path, rel: &str, contents: &[u8], mtime_ms: i64) -> FileEntry {
    let abs = dir.join(rel);
    std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
    std::fs::write(&abs, contents).unwrap();
    let secs = mtime_ms.div_euclid(1000);
    let nanos = (mtime_ms.rem_euclid(1000) * 1_000_000) as u32;
    set_file_mtime(&abs, FileTime::from_unix_time(secs, nanos)).unwrap();
    FileEntry::from_disk(rel, abs)
}

fn entry_for(file: &FileEntry, hash: Option<String>) -> ManifestEntry {
    let stat = file.stat.unwrap();
    ManifestEntry {
        content_hash: hash,
        mod_time_ms: stat.mtime_ms,
        size_bytes: stat.size,
        bundle_shard_names: vec![],
        bundle_format: BundleFormat::Json,
        bundle_checksum: None,
        encoding: TextEncoding::default(),
    }
}

#[test]
fn test_matching_fingerprint_is_fresh_without_reading() {
    let dir = TempDir::new().unwrap();
    let file = write_file(dir.path(), "src/a.rs", b"fn a() {}", FINE_MTIME_MS);
    assert_eq!(file.stat.unwrap().mtime_ms, FINE_MTIME_MS);

    // A wrong hash proves the file was never read
    let entry = entry_for(&file, Some("not-the-real-hash".to_string()));
    let cache = ReadHashCache::new();
    assert_eq!(check_entry(&entry, &file, &cache), ReuseDecision::Fresh);
    assert_eq!(cache.files_hashed(), 0);
}

#[test]
fn test_coarse_mtime_is_verified_by_hash() {
    let dir = TempDir::new().unwrap();
    let contents = b"fn a() {}";
    let file = write_file(dir.path(), "src/a.rs", contents, COARSE_MTIME_MS);
    assert!(file.stat.unwrap().has_coarse_mtime());

    let cache = ReadHashCache::new();
    let good = entry_for(&file, Some(content_hash(contents)));
    assert_eq!(check_entry(&good, &file, &cache), ReuseDecision::HashVerified);
    assert_eq!(cache.files_hashed(), 1);

    let bad = entry_for(&file, Some(content_hash(b"fn b() {}")));
    assert_eq!(
        check_entry(&bad, &file, &cache),
        ReuseDecision::Changed(StaleReason::ContentChanged)
    );
    // Same fingerprint, so the second check hits the hash cache
    assert_eq!(cache.files_hashed(), 1);
}

#[test]
fn test_coarse_mtime_without_hash_is_trusted() {
    let dir = TempDir::new().unwrap();
    let file = write_file(dir.path(), "src/a.rs", b"x", COARSE_MTIME_MS);
    let cache = ReadHashCache::new();
    assert_eq!(check_entry(&entry_for(&file, None), &file, &cache), ReuseDecision::Fresh);
    assert_eq!(cache.files_hashed(), 0);
}

#[test]
fn test_touched_file_with_same_content_is_reusable() {
    let dir = TempDir::new().unwrap();
    let contents = b"const x = 1;\n";
    let file = write_file(dir.path(), "src/x.js", contents, FINE_MTIME_MS);
    let mut entry = entry_for(&file, Some(content_hash(contents)));
    entry.mod_time_ms -= 5_000;

    let cache = ReadHashCache::new();
    assert_eq!(check_entry(&entry, &file, &cache), ReuseDecision::HashVerified);
    assert_eq!(cache.files_hashed(), 1);

    entry.content_hash = None;
    assert_eq!(
        check_entry(&entry, &file, &cache),
        ReuseDecision::Changed(StaleReason::ModTimeChanged)
    );
}

#[test]
fn test_size_change_and_missing_file() {
    let dir = TempDir::new().unwrap();
    let file = write_file(dir.path(), "src/a.rs", b"abc", FINE_MTIME_MS);
    let mut entry = entry_for(&file, Some(content_hash(b"abc")));
    entry.size_bytes += 1;

    let cache = ReadHashCache::new();
    assert_eq!(
        check_entry(&entry, &file, &cache),
        ReuseDecision::Changed(StaleReason::SizeChanged)
    );
    assert_eq!(cache.files_hashed(), 0);

    let gone = FileEntry::new("src/gone.rs", dir.path().join("src/gone.rs"), None);
    assert_eq!(
        check_entry(&entry, &gone, &cache),
        ReuseDecision::Changed(StaleReason::Missing)
    );
}

#[test]
fn test_unreadable_file_is_stale() {
    let dir = TempDir::new().unwrap();
    let file = write_file(dir.path(), "src/a.rs", b"abc", COARSE_MTIME_MS);
    let entry = entry_for(&file, Some(content_hash(b"abc")));
    std::fs::remove_file(&file.abs_path).unwrap();

    assert_eq!(
        check_entry(&entry, &file, &ReadHashCache::new()),
        ReuseDecision::Changed(StaleReason::Unreadable)
    );
}

async fn state_with(
    cache_root: &Path,
    files: &[(&FileEntry, &[u8])],
) -> IncrementalState {
    let mut state = IncrementalState::load_or_init(cache_root, IndexMode::Code, &Config::default(), None)
        .await
        .unwrap();
    for (file, contents) in files {
        let stat = file.stat.unwrap();
        state
            .write_file_bundle(Bundle {
                file: file.rel.clone(),
                hash: Some(content_hash(contents)),
                mod_time_ms: stat.mtime_ms,
                size: stat.size,
                chunks: vec![ChunkRecord::new(file.rel.clone(), 0, stat.size)],
                file_relations: Some(json!({"imports": []})),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    state
}

#[tokio::test]
async fn test_plan_reuse_classifies_every_file() {
    let repo = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let same = write_file(repo.path(), "src/same.rs", b"same", FINE_MTIME_MS);
    let edited = write_file(repo.path(), "src/edited.rs", b"before", FINE_MTIME_MS);
    let state = state_with(cache.path(), &[(&same, &b"same"[..]), (&edited, &b"before"[..])]).await;

    let edited = write_file(repo.path(), "src/edited.rs", b"after!!", FINE_MTIME_MS + 10);
    let added = write_file(repo.path(), "src/new.rs", b"new", FINE_MTIME_MS);

    let plan = plan_reuse(&state, &[same, edited, added]);
    assert_eq!(
        plan.decisions,
        vec![
            ("src/same.rs".to_string(), ReuseDecision::Fresh),
            (
                "src/edited.rs".to_string(),
                ReuseDecision::Changed(StaleReason::SizeChanged)
            ),
            ("src/new.rs".to_string(), ReuseDecision::New),
        ]
    );
    assert_eq!(plan.reusable().collect::<Vec<_>>(), vec!["src/same.rs"]);
    assert_eq!(
        plan.needs_rebuild().collect::<Vec<_>>(),
        vec!["src/edited.rs", "src/new.rs"]
    );
    assert_eq!(plan.count(|d| *d == ReuseDecision::New), 1);
}

#[tokio::test]
async fn test_read_cached_bundle_hit_and_misses() {
    let repo = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let file = write_file(repo.path(), "src/x.js", b"let x;", FINE_MTIME_MS);
    let state = state_with(cache.path(), &[(&file, &b"let x;"[..])]).await;

    let bundle = read_cached_bundle(&state, &file).await.unwrap();
    assert_eq!(bundle.file, "src/x.js");
    assert_eq!(bundle.chunks.len(), 1);
    assert_eq!(bundle.file_relations, Some(json!({"imports": []})));

    let untracked = write_file(repo.path(), "src/y.js", b"let y;", FINE_MTIME_MS);
    assert_eq!(
        read_cached_bundle(&state, &untracked).await.unwrap_err(),
        CacheMiss::NotTracked
    );

    let edited = write_file(repo.path(), "src/x.js", b"let xx;", FINE_MTIME_MS);
    let miss = read_cached_bundle(&state, &edited).await.unwrap_err();
    assert_eq!(miss, CacheMiss::Stale(StaleReason::SizeChanged));
    assert_eq!(miss.reason_code(), "size-changed");
}

#[tokio::test]
async fn test_read_cached_bundle_with_deleted_shard() {
    let repo = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let file = write_file(repo.path(), "src/x.js", b"let x;", FINE_MTIME_MS);
    let state = state_with(cache.path(), &[(&file, &b"let x;"[..])]).await;

    let shard = &state.manifest.files["src/x.js"].bundle_shard_names[0];
    std::fs::remove_file(state.layout.bundle_dir.join(shard)).unwrap();

    let miss = read_cached_bundle(&state, &file).await.unwrap_err();
    assert_eq!(miss, CacheMiss::Unreadable(BundleReadFailure::Missing));
    assert!(miss.to_string().starts_with("cached bundle unreadable"));
}

async fn open_state(cache_root: &Path, format: BundleFormat) -> IncrementalState {
    let mut config = Config::default();
    config.incremental.bundle_format = format;
    IncrementalState::load_or_init(cache_root, IndexMode::Code, &config, None)
        .await
        .unwrap()
}

fn tagged_bundle(file: &FileEntry, contents: &[u8], tag: &str) -> Bundle {
    let stat = file.stat.unwrap();
    Bundle {
        file: file.rel.clone(),
        hash: Some(content_hash(contents)),
        mod_time_ms: stat.mtime_ms,
        size: stat.size,
        chunks: vec![ChunkRecord::new(file.rel.clone(), 0, stat.size).with_extra("tag", json!(tag))],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_unpersisted_rewrite_is_not_served_after_revert() {
    let repo = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();

    // Build A persists a bundle for v1
    let v1 = write_file(repo.path(), "src/x.js", b"let v = 1;", FINE_MTIME_MS);
    {
        let mut state = open_state(cache.path(), BundleFormat::Json).await;
        state
            .write_file_bundle(tagged_bundle(&v1, b"let v = 1;", "v1"))
            .await
            .unwrap();
        state.persist().await.unwrap();
    }

    // Build B overwrites the shard for v2 and dies before persisting
    let v2 = write_file(repo.path(), "src/x.js", b"let v = 2;", FINE_MTIME_MS + 1_000);
    {
        let mut state = open_state(cache.path(), BundleFormat::Json).await;
        state
            .write_file_bundle(tagged_bundle(&v2, b"let v = 2;", "v2"))
            .await
            .unwrap();
    }

    // Reverted content hash-verifies against the persisted entry
    let reverted = write_file(repo.path(), "src/x.js", b"let v = 1;", FINE_MTIME_MS + 2_000);
    let state = open_state(cache.path(), BundleFormat::Json).await;
    let entry = state.manifest.files["src/x.js"].clone();
    assert_eq!(
        check_entry(&entry, &reverted, &ReadHashCache::new()),
        ReuseDecision::HashVerified
    );

    let miss = read_cached_bundle(&state, &reverted).await.unwrap_err();
    assert_eq!(miss, CacheMiss::EntryMismatch { field: "hash" });
    assert_eq!(miss.reason_code(), "entry-mismatch");
}

#[tokio::test]
async fn test_binary_checksum_must_match_entry() {
    let repo = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let file = write_file(repo.path(), "src/x.js", b"let x;", FINE_MTIME_MS);
    {
        let mut state = open_state(cache.path(), BundleFormat::Binary).await;
        state
            .write_file_bundle(tagged_bundle(&file, b"let x;", "first"))
            .await
            .unwrap();
        state.persist().await.unwrap();
    }

    {
        let state = open_state(cache.path(), BundleFormat::Binary).await;
        let bundle = read_cached_bundle(&state, &file).await.unwrap();
        assert_eq!(bundle.chunks[0].extra["tag"], json!("first"));
    }

    // Same fingerprint, different chunks, manifest never persisted
    {
        let mut state = open_state(cache.path(), BundleFormat::Binary).await;
        state
            .write_file_bundle(tagged_bundle(&file, b"let x;", "second"))
            .await
            .unwrap();
    }

    let state = open_state(cache.path(), BundleFormat::Binary).await;
    assert_eq!(
        read_cached_bundle(&state, &file).await.unwrap_err(),
        CacheMiss::EntryMismatch {
            field: "bundleChecksum"
        }
    );
}

fn manifest_for(files: &[&FileEntry]) -> Manifest {
    let mut manifest = Manifest::empty(&ManifestExpectation {
        mode: IndexMode::Code,
        cache_signature: "sig".to_string(),
        signature_summary: BTreeMap::new(),
        tokenization_key: None,
        bundle_format: BundleFormat::Json,
    });
    for file in files {
        manifest
            .files
            .insert(file.rel.clone(), entry_for(file, None));
    }
    manifest
}

fn write_index_output(dir: &Path, stage: &str, pieces: serde_json::Value) {
    std::fs::create_dir_all(dir.join("pieces")).unwrap();
    std::fs::write(
        dir.join("index_state.json"),
        serde_json::to_vec(&json!({ "stage": stage })).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join("pieces/manifest.json"),
        serde_json::to_vec(&json!({ "pieces": pieces })).unwrap(),
    )
    .unwrap();
}

struct WholeIndexFixture {
    _repo: TempDir,
    output: TempDir,
    files: Vec<FileEntry>,
    manifest: Manifest,
}

fn whole_index_fixture() -> WholeIndexFixture {
    let repo = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let a = write_file(repo.path(), "src/a.rs", b"a", FINE_MTIME_MS);
    let b = write_file(repo.path(), "src/b.rs", b"bb", FINE_MTIME_MS);
    let manifest = manifest_for(&[&a, &b]);

    write_index_output(output.path(), "stage2", json!([{ "path": "chunks.bin" }]));
    std::fs::write(output.path().join("chunks.bin"), b"data").unwrap();

    WholeIndexFixture {
        _repo: repo,
        output,
        files: vec![a, b],
        manifest,
    }
}

#[test]
fn test_whole_index_reuse() {
    let f = whole_index_fixture();
    let verdict = should_reuse_whole_index(f.output.path(), &f.files, &f.manifest, IndexStage::Stage2, true);
    assert_eq!(verdict, ReuseVerdict::Reuse);
    assert!(verdict.is_reuse());
}

#[test]
fn test_whole_index_missing_output() {
    let f = whole_index_fixture();
    let missing = f.output.path().join("nope");
    let verdict = should_reuse_whole_index(&missing, &f.files, &f.manifest, IndexStage::Stage1, false);
    assert_eq!(
        verdict,
        ReuseVerdict::Rebuild("output directory missing".to_string())
    );
}

#[test]
fn test_whole_index_stage_too_low() {
    let f = whole_index_fixture();
    let verdict = should_reuse_whole_index(f.output.path(), &f.files, &f.manifest, IndexStage::Stage3, false);
    assert_eq!(
        verdict,
        ReuseVerdict::Rebuild("index state is stage2, stage3 required".to_string())
    );
}

#[test]
fn test_whole_index_stale_schema_version() {
    let mut f = whole_index_fixture();
    f.manifest.schema_version = 0;
    let verdict = should_reuse_whole_index(f.output.path(), &f.files, &f.manifest, IndexStage::Stage1, false);
    assert!(!verdict.is_reuse());
}

#[test]
fn test_whole_index_rejects_empty_or_escaping_pieces() {
    let f = whole_index_fixture();
    write_index_output(f.output.path(), "stage4", json!([]));
    assert_eq!(
        should_reuse_whole_index(f.output.path(), &f.files, &f.manifest, IndexStage::Stage1, false),
        ReuseVerdict::Rebuild("piece manifest is empty".to_string())
    );

    write_index_output(f.output.path(), "stage4", json!([{ "path": "../outside.bin" }]));
    let verdict = should_reuse_whole_index(f.output.path(), &f.files, &f.manifest, IndexStage::Stage1, false);
    match verdict {
        ReuseVerdict::Rebuild(reason) => assert!(reason.contains("escapes"), "{}", reason),
        ReuseVerdict::Reuse => panic!("escaping piece path must not be reused"),
    }

    write_index_output(f.output.path(), "stage4", json!([{ "path": "gone.bin" }]));
    assert_eq!(
        should_reuse_whole_index(f.output.path(), &f.files, &f.manifest, IndexStage::Stage1, false),
        ReuseVerdict::Rebuild("piece missing: gone.bin".to_string())
    );
}

#[test]
fn test_whole_index_empty_file_list_is_rebuilt() {
    let f = whole_index_fixture();
    write_index_output(f.output.path(), "stage4", json!([{ "path": "chunks.bin" }]));
    let empty = manifest_for(&[]);
    assert_eq!(
        should_reuse_whole_index(f.output.path(), &[], &empty, IndexStage::Stage1, false),
        ReuseVerdict::Rebuild("no tracked entries".to_string())
    );
}

#[test]
fn test_whole_index_unreadable_state() {
    let f = whole_index_fixture();
    std::fs::write(f.output.path().join("index_state.json"), b"{}").unwrap();
    let verdict = should_reuse_whole_index(f.output.path(), &f.files, &f.manifest, IndexStage::Stage1, false);
    match verdict {
        ReuseVerdict::Rebuild(reason) => assert!(reason.starts_with("index state unreadable")),
        ReuseVerdict::Reuse => panic!("missing stage must not be reused"),
    }
}

#[test]
fn test_whole_index_file_changes() {
    let f = whole_index_fixture();

    let mut changed = f.files.clone();
    changed[1].stat = changed[1].stat.map(|mut s| {
        s.mtime_ms += 1;
        s
    });
    assert_eq!(
        should_reuse_whole_index(f.output.path(), &changed, &f.manifest, IndexStage::Stage1, false),
        ReuseVerdict::Rebuild("src/b.rs changed since the last build".to_string())
    );

    let mut added = f.files.clone();
    added.push(FileEntry::new("src/c.rs", "/nowhere/src/c.rs", None));
    assert_eq!(
        should_reuse_whole_index(f.output.path(), &added, &f.manifest, IndexStage::Stage1, false),
        ReuseVerdict::Rebuild("src/c.rs is not in the manifest".to_string())
    );

    let removed = vec![f.files[0].clone()];
    assert_eq!(
        should_reuse_whole_index(f.output.path(), &removed, &f.manifest, IndexStage::Stage1, false),
        ReuseVerdict::Rebuild("src/b.rs was removed".to_string())
    );
}
