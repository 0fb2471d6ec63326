//! Chunk coalescing for downshifted files

use crate::types::ChunkRecord;

/// Merge adjacent chunks into at most `target_count` contiguous groups.
///
/// Each merged chunk spans `[first.start, last.end]` of its group, so coverage and
/// order are preserved exactly. Identity fields are dropped from every output chunk;
/// segment provenance is dropped only from groups that really merged more than one
/// chunk, so a single-chunk tail keeps its segment.
pub fn coalesce_heavy_chunks(chunks: Vec<ChunkRecord>, target_count: usize) -> Vec<ChunkRecord> {
    let target = target_count.max(1);
    if chunks.len() <= 1 || chunks.len() <= target {
        return chunks;
    }
    let group_size = chunks.len().div_ceil(target);
    let original_len = chunks.len();

    let merged: Vec<ChunkRecord> = chunks
        .chunks(group_size)
        .map(|group| {
            let first = &group[0];
            let last = &group[group.len() - 1];
            let mut next = first.clone();
            next.end = last.end;

            if let Some(last_meta) = &last.meta {
                let mut meta = next.meta.take().unwrap_or_default();
                let end_line = last_meta
                    .get("endLine")
                    .filter(|v| !v.is_null())
                    .cloned()
                    .or_else(|| meta.get("endLine").cloned());
                match end_line {
                    Some(value) => {
                        meta.insert("endLine".to_string(), value);
                    }
                    None => {
                        meta.remove("endLine");
                    }
                }
                next.meta = Some(meta);
            }

            if group.len() > 1 {
                next.segment = None;
                next.segment_uid = None;
            }
            next.chunk_uid = None;
            next.chunk_id = None;
            next.span_index = None;
            next
        })
        .collect();

    tracing::debug!(
        "[perf] heavy-file chunks coalesced ({} -> {})",
        original_len,
        merged.len()
    );
    merged
}
