//! CLI progress reporting: a `kdam` bar driven by batched counter updates
//! from worker threads, plus the chunk-size heuristic that keeps those
//! updates from becoming a bottleneck on very large ingests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kdam::{Bar, BarExt};

/// Target number of bar redraws over the whole run, independent of item
/// count — redrawing on every single item would dominate runtime for
/// million-file ingests.
const TARGET_UPDATES: u64 = 100;
const ADAPTIVE_CHUNK_MIN: u64 = 1;

/// Pick how many completed items should accumulate between progress-bar
/// updates, given the total item count and worker count.
pub fn adaptive_progress_chunk_size(total_items: u64, num_workers: usize) -> u64 {
    if total_items == 0 {
        return ADAPTIVE_CHUNK_MIN;
    }
    let per_worker_target = (total_items / TARGET_UPDATES.max(1)).max(ADAPTIVE_CHUNK_MIN);
    let workers = num_workers.max(1) as u64;
    (per_worker_target / workers).max(ADAPTIVE_CHUNK_MIN)
}

pub struct ProgressBarConfig {
    pub total: u64,
    pub desc: String,
    pub unit: String,
}

/// A progress bar plus a batching counter: callers call
/// [`ProgressReporter::advance`] cheaply from any thread, and the bar is
/// only actually redrawn once the accumulated count crosses `chunk_size`.
pub struct ProgressReporter {
    bar: Mutex<Bar>,
    pending: AtomicU64,
    chunk_size: u64,
}

impl ProgressReporter {
    pub fn new(config: ProgressBarConfig, chunk_size: u64) -> Self {
        let bar = Bar::builder()
            .total(config.total as usize)
            .desc(config.desc)
            .unit(config.unit)
            .build()
            .expect("kdam bar configuration must be valid");
        Self {
            bar: Mutex::new(bar),
            pending: AtomicU64::new(0),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Record one completed item. Thread-safe and lock-free on the common
    /// path; only touches the bar's mutex once per `chunk_size` items.
    pub fn advance(&self, n: u64) {
        let prev = self.pending.fetch_add(n, Ordering::Relaxed);
        if (prev + n) / self.chunk_size > prev / self.chunk_size {
            self.flush();
        }
    }

    /// Force the bar to catch up to the true pending count; call once more
    /// after the last item so a partial final chunk isn't left undrawn.
    pub fn flush(&self) {
        let pending = self.pending.swap(0, Ordering::Relaxed);
        if pending == 0 {
            return;
        }
        if let Ok(mut bar) = self.bar.lock() {
            let _ = bar.update(pending as usize);
        }
    }

    pub fn finish(&self) {
        self.flush();
        if let Ok(mut bar) = self.bar.lock() {
            let _ = bar.refresh();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_targets_roughly_constant_update_count() {
        let small = adaptive_progress_chunk_size(1_000, 1);
        let large = adaptive_progress_chunk_size(1_000_000, 1);
        assert!(large > small);
        assert!(adaptive_progress_chunk_size(0, 4) >= ADAPTIVE_CHUNK_MIN);
    }

    #[test]
    fn more_workers_means_smaller_per_worker_chunk() {
        let one_worker = adaptive_progress_chunk_size(100_000, 1);
        let many_workers = adaptive_progress_chunk_size(100_000, 8);
        assert!(many_workers <= one_worker);
    }
}
