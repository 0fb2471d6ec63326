//! Worker-count tuning and update ordering for cross-file writeback

use super::PendingUpdate;
use std::cmp::Reverse;
use std::time::Duration;

/// Update volume above which the pool is allowed to grow further
pub const HIGH_VOLUME_UPDATES: usize = 16_384;

const BASE_PER_CORE: usize = 3;
const BASE_MIN: usize = 12;
const BASE_MAX: usize = 64;
const HIGH_VOLUME_PER_CORE: usize = 4;
const HIGH_VOLUME_MAX: usize = 96;

const IDLE_BOOST_AT: f64 = 0.6;
const IDLE_THROTTLE_AT: f64 = 0.2;

/// Worker count for `total_updates` pending bundle rewrites.
///
/// Scales with core count, grows for very large batches, and is nudged by the
/// sampled CPU idle ratio. Never exceeds the number of updates.
pub fn resolve_concurrency(total_updates: usize, cores: usize, cpu_idle: Option<f64>) -> usize {
    if total_updates == 0 {
        return 0;
    }
    let cores = cores.max(1);
    let base = if total_updates >= HIGH_VOLUME_UPDATES {
        (HIGH_VOLUME_PER_CORE * cores).clamp(BASE_MIN, HIGH_VOLUME_MAX)
    } else {
        (BASE_PER_CORE * cores).clamp(BASE_MIN, BASE_MAX)
    };

    let adjusted = match cpu_idle {
        Some(idle) if idle >= IDLE_BOOST_AT => base + base.div_ceil(4),
        Some(idle) if idle <= IDLE_THROTTLE_AT => (base - base / 4).max(1),
        _ => base,
    };
    adjusted.min(total_updates).max(1)
}

/// Aggregate `(idle, total)` jiffies from the first line of `/proc/stat`
fn parse_proc_stat(contents: &str) -> Option<(u64, u64)> {
    let line = contents.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();
    Some((idle, total))
}

async fn read_cpu_times() -> Option<(u64, u64)> {
    let contents = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_proc_stat(&contents)
}

/// System-wide idle ratio over a short window; `None` where it cannot be measured
pub async fn sample_cpu_idle_ratio(window: Duration) -> Option<f64> {
    let (idle_a, total_a) = read_cpu_times().await?;
    tokio::time::sleep(window).await;
    let (idle_b, total_b) = read_cpu_times().await?;

    let total = total_b.checked_sub(total_a)?;
    if total == 0 {
        return None;
    }
    let idle = idle_b.saturating_sub(idle_a);
    Some((idle as f64 / total as f64).clamp(0.0, 1.0))
}

/// Hot files (modified within `hot_window`) first; within each group most recent
/// first, then larger chunk lists, then path
pub fn prioritize(updates: &mut [PendingUpdate], now_ms: i64, hot_window: Duration) {
    let hot_since = now_ms - i64::try_from(hot_window.as_millis()).unwrap_or(i64::MAX);
    updates.sort_by(|a, b| {
        let key = |u: &PendingUpdate| {
            (
                u.entry.mod_time_ms < hot_since,
                Reverse(u.entry.mod_time_ms),
                Reverse(u.chunks.len()),
            )
        };
        key(a).cmp(&key(b)).then_with(|| a.normalized.cmp(&b.normalized))
    });
}
