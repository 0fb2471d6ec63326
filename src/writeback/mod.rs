//! Cross-file bundle writeback
//!
//! After relations that span files are resolved, every tracked file whose chunks
//! were recomputed gets its bundle refreshed. Unchanged bundles are left alone,
//! single-shard JSON bundles are patched where possible, and everything else is
//! rewritten. Workers pull from a shared cursor; the manifest is only touched by
//! the coordinator once all of them have returned.

pub mod autotune;

use crate::bundle::{BundleCodec, PatchOutcome, ShardedWrite};
use crate::config::WritebackConfig;
use crate::manifest::{IncrementalState, ManifestEntry};
use crate::paths::normalize_rel_path;
use crate::types::{Bundle, BundleFormat, ChunkRecord};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// One bundle waiting to be refreshed
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    /// Manifest key as stored
    pub key: String,
    pub normalized: String,
    pub entry: ManifestEntry,
    pub chunks: Vec<ChunkRecord>,
    pub relations: Option<Value>,
}

#[derive(Debug)]
enum WritebackOutcome {
    Rewritten(ShardedWrite),
    Patched,
    Reused,
    Failed(String),
}

/// Counters reported at the end of a writeback pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WritebackSummary {
    /// Bundles rewritten or patched
    pub updated: usize,
    pub patched: usize,
    /// Bundles whose content was already current
    pub reused: usize,
    pub failed: usize,
    pub workers: usize,
    pub duration_ms: u64,
}

/// Relations for a file, looked up by normalized path first, then as given
fn resolve_relations(relations: &HashMap<String, Value>, normalized: &str, raw: &str) -> Option<Value> {
    relations
        .get(normalized)
        .or_else(|| relations.get(raw))
        .cloned()
}

fn group_chunks(chunks: Vec<ChunkRecord>) -> HashMap<String, Vec<ChunkRecord>> {
    let mut grouped: HashMap<String, Vec<ChunkRecord>> = HashMap::new();
    for chunk in chunks {
        let Some(file) = chunk.file.as_deref() else {
            continue;
        };
        grouped
            .entry(normalize_rel_path(file))
            .or_default()
            .push(chunk);
    }
    grouped
}

fn collect_pending(
    state: &IncrementalState,
    chunks: Vec<ChunkRecord>,
    relations: &HashMap<String, Value>,
) -> Vec<PendingUpdate> {
    let mut by_file = group_chunks(chunks);
    state
        .manifest
        .files
        .iter()
        .filter_map(|(key, entry)| {
            let normalized = normalize_rel_path(key);
            let chunks = by_file.remove(&normalized)?;
            if entry.bundle_shard_names.is_empty() {
                return None;
            }
            Some(PendingUpdate {
                key: key.clone(),
                relations: resolve_relations(relations, &normalized, key),
                normalized,
                entry: entry.clone(),
                chunks,
            })
        })
        .collect()
}

struct WorkerContext {
    codec: BundleCodec,
    bundle_dir: PathBuf,
    updates: Vec<PendingUpdate>,
    cursor: AtomicUsize,
    completed: AtomicUsize,
    progress_interval: usize,
}

impl WorkerContext {
    async fn refresh(&self, update: &PendingUpdate) -> WritebackOutcome {
        let entry = &update.entry;
        let existing = self
            .codec
            .read_shards(&self.bundle_dir, &entry.bundle_shard_names, entry.bundle_format)
            .await
            .ok();

        let next = Bundle {
            file: update.normalized.clone(),
            hash: entry.content_hash.clone(),
            mod_time_ms: entry.mod_time_ms,
            size: entry.size_bytes,
            chunks: update.chunks.clone(),
            file_relations: update.relations.clone(),
            aux_rows: existing.as_ref().and_then(|b| b.aux_rows.clone()),
            encoding: entry.encoding.clone(),
        };

        if let Some(existing) = &existing {
            if existing.same_content(&next) {
                return WritebackOutcome::Reused;
            }
            if entry.bundle_format == BundleFormat::Json && entry.bundle_shard_names.len() == 1 {
                let path = self.bundle_dir.join(&entry.bundle_shard_names[0]);
                match self
                    .codec
                    .write_patch(&path, existing, &next, BundleFormat::Json)
                    .await
                {
                    Ok(PatchOutcome::Applied) => return WritebackOutcome::Patched,
                    Ok(PatchOutcome::NoChanges) => return WritebackOutcome::Reused,
                    Ok(PatchOutcome::Rejected(reason)) => {
                        tracing::debug!(
                            "[incremental] patch rejected for {} ({}); rewriting",
                            update.normalized,
                            reason
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            "[incremental] patch failed for {}: {}; rewriting",
                            update.normalized,
                            e
                        );
                    }
                }
            }
        }

        match self
            .codec
            .write_sharded(
                &self.bundle_dir,
                &next,
                entry.bundle_format,
                &entry.bundle_shard_names,
            )
            .await
        {
            Ok(written) => WritebackOutcome::Rewritten(written),
            Err(e) => {
                tracing::warn!(
                    "[incremental] failed to rewrite bundle for {}: {}",
                    update.normalized,
                    e
                );
                WritebackOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run_worker(self: Arc<Self>) -> Vec<(usize, WritebackOutcome)> {
        let mut results = Vec::new();
        let total = self.updates.len();
        loop {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(update) = self.updates.get(index) else {
                break;
            };
            let outcome = self.refresh(update).await;
            results.push((index, outcome));

            let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
            if completed % self.progress_interval == 0 && completed < total {
                tracing::info!(
                    "[incremental] cross-file bundle updates: {}/{}",
                    completed,
                    total
                );
            }
        }
        results
    }
}

/// Refresh the bundles of every tracked file that has recomputed chunks.
///
/// `relations` maps file paths to their recomputed cross-file relation data.
pub async fn update_bundles_with_chunks(
    state: &mut IncrementalState,
    chunks: Vec<ChunkRecord>,
    relations: &HashMap<String, Value>,
    config: &WritebackConfig,
) -> WritebackSummary {
    let started = Instant::now();
    let mut updates = collect_pending(state, chunks, relations);
    if updates.is_empty() {
        return WritebackSummary::default();
    }

    autotune::prioritize(
        &mut updates,
        chrono::Utc::now().timestamp_millis(),
        Duration::from_secs(config.hot_window_secs),
    );

    let total = updates.len();
    let workers = match config.max_concurrency {
        Some(fixed) => fixed.min(total).max(1),
        None => {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            let idle = autotune::sample_cpu_idle_ratio(Duration::from_millis(config.cpu_sample_ms))
                .await;
            autotune::resolve_concurrency(total, cores, idle)
        }
    };

    let context = Arc::new(WorkerContext {
        codec: state.codec.clone(),
        bundle_dir: state.layout.bundle_dir.clone(),
        updates,
        cursor: AtomicUsize::new(0),
        completed: AtomicUsize::new(0),
        progress_interval: config.progress_interval.max(1),
    });

    let handles = (0..workers).map(|_| tokio::spawn(Arc::clone(&context).run_worker()));
    let joined = join_all(handles).await;

    let mut summary = WritebackSummary {
        workers,
        ..Default::default()
    };
    let mut handled = 0;
    for result in joined {
        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                tracing::warn!("[incremental] writeback worker failed: {}", e);
                continue;
            }
        };
        for (index, outcome) in outcomes {
            handled += 1;
            let update = &context.updates[index];
            match outcome {
                WritebackOutcome::Rewritten(written) => {
                    summary.updated += 1;
                    if let Some(entry) = state.manifest.files.get_mut(&update.key) {
                        entry.bundle_shard_names = written.shard_names;
                        entry.bundle_checksum = written.checksum;
                    }
                }
                WritebackOutcome::Patched => {
                    summary.updated += 1;
                    summary.patched += 1;
                }
                WritebackOutcome::Reused => summary.reused += 1,
                WritebackOutcome::Failed(_) => summary.failed += 1,
            }
        }
    }
    // Items claimed by a worker that panicked never reported back
    summary.failed += total - handled;
    summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    if summary.updated > 0 || summary.reused > 0 || summary.failed > 0 {
        let patched = if summary.patched > 0 {
            format!(", patched {}", summary.patched)
        } else {
            String::new()
        };
        let reused = if summary.reused > 0 {
            format!(", reused {}", summary.reused)
        } else {
            String::new()
        };
        let failed = if summary.failed > 0 {
            format!(", failed {}", summary.failed)
        } else {
            String::new()
        };
        tracing::info!(
            "Cross-file inference updated {} incremental bundle(s){}{}{} in {}ms (workers={}).",
            summary.updated,
            patched,
            reused,
            failed,
            summary.duration_ms,
            summary.workers
        );
    }
    summary
}
