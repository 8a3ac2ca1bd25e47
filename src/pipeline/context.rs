//! Shared ingest state: cancellation flag and the strict/skip error
//! bookkeeping, in the shape of the teacher's walk+worker pipeline context.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Where the ingest pipeline's producer thread gets its list of files from.
pub enum IngestSource {
    /// Walk `root` recursively, stripping its own directory name from
    /// stored paths when `strip_root` is set.
    Directory { root: PathBuf, strip_root: bool },
    /// A pre-enumerated list of absolute file paths (e.g. read from stdin),
    /// stored under their own path string unchanged.
    PathList(Vec<PathBuf>),
}

impl IngestSource {
    /// The directory used to pick ingest worker/channel tuning from drive
    /// type; a bare path list has no single root, so falls back to `.`.
    pub fn tuning_root(&self) -> &std::path::Path {
        match self {
            IngestSource::Directory { root, .. } => root,
            IngestSource::PathList(_) => std::path::Path::new("."),
        }
    }
}

pub struct IngestOptions {
    pub source: IngestSource,
    pub workers: usize,
    pub channel_capacity: usize,
    /// Abort the whole ingest on the first per-file error instead of
    /// skipping the file and continuing.
    pub strict: bool,
    /// Drive a `kdam` progress bar from the consumer thread as files land.
    pub show_progress: bool,
}

#[derive(Default)]
pub struct IngestContext {
    pub cancelled: AtomicBool,
    pub first_error: Mutex<Option<String>>,
    pub skipped_paths: Mutex<Vec<(PathBuf, String)>>,
}

impl IngestContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Record a per-file failure. In strict mode the first one also flips
    /// the cancellation flag so sibling threads stop picking up new work.
    pub fn record_error(&self, path: PathBuf, message: String, strict: bool) {
        if strict {
            let mut first = self.first_error.lock().unwrap();
            if first.is_none() {
                *first = Some(format!("{}: {message}", path.display()));
            }
            self.cancel();
        } else {
            self.skipped_paths.lock().unwrap().push((path, message));
        }
    }

    /// Strict mode: return the recorded error, if any. Skip mode: log a
    /// breakdown of how many paths failed and why.
    pub fn check_for_initial_error_or_skipped_paths(&self) -> crate::error::Result<()> {
        if let Some(msg) = self.first_error.lock().unwrap().take() {
            return Err(crate::error::BarecatError::IntegrityError(msg));
        }
        let skipped = self.skipped_paths.lock().unwrap();
        if !skipped.is_empty() {
            use std::collections::HashMap;
            let mut by_message: HashMap<&str, usize> = HashMap::new();
            for (_, msg) in skipped.iter() {
                *by_message.entry(msg.as_str()).or_insert(0) += 1;
            }
            for (msg, count) in by_message {
                log::warn!("skipped {count} path(s): {msg}");
            }
        }
        Ok(())
    }
}
