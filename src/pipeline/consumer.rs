//! Consumer: the sole writer of index rows. Batches completed entries into
//! transactions of [`crate::config::DB_INSERT_BATCH_SIZE`] to amortize
//! SQLite's per-transaction overhead, and is the only thread that ever
//! calls into the index during ingest.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;

use crate::archive::Archive;
use crate::common::BarecatFileInfo;
use crate::config::DB_INSERT_BATCH_SIZE;
use crate::progress::ProgressReporter;

use super::context::IngestContext;
use super::worker::CompletedEntry;

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestSummary {
    pub num_files: u64,
    pub total_bytes: u64,
}

pub fn spawn_consumer(
    archive: Arc<Mutex<Archive>>,
    rx: Receiver<CompletedEntry>,
    ctx: Arc<IngestContext>,
    strict: bool,
    progress: Option<Arc<ProgressReporter>>,
) -> JoinHandle<IngestSummary> {
    thread::spawn(move || {
        let mut summary = IngestSummary::default();
        let mut batch = Vec::with_capacity(DB_INSERT_BATCH_SIZE);
        loop {
            match rx.recv() {
                Ok(entry) => {
                    batch.push(entry);
                    if batch.len() >= DB_INSERT_BATCH_SIZE {
                        flush_batch(&archive, &mut batch, &mut summary, &ctx, strict, progress.as_deref());
                    }
                }
                Err(_) => break,
            }
        }
        flush_batch(&archive, &mut batch, &mut summary, &ctx, strict, progress.as_deref());
        if let Some(p) = &progress {
            p.finish();
        }
        summary
    })
}

fn flush_batch(
    archive: &Arc<Mutex<Archive>>,
    batch: &mut Vec<CompletedEntry>,
    summary: &mut IngestSummary,
    ctx: &IngestContext,
    strict: bool,
    progress: Option<&ProgressReporter>,
) {
    if batch.is_empty() {
        return;
    }
    let mut guard = archive.lock().unwrap();
    for entry in batch.drain(..) {
        if let Err(e) = guard.ensure_parent_dirs_public(&entry.rel_path) {
            ctx.record_error(entry.rel_path.clone().into(), e.to_string(), strict);
            continue;
        }
        let mut info = BarecatFileInfo::new(&entry.rel_path);
        info.base.mode = entry.base.mode;
        info.base.uid = entry.base.uid;
        info.base.gid = entry.base.gid;
        info.base.mtime_ns = entry.base.mtime_ns;
        info.shard = entry.address.shard as i64;
        info.offset = entry.address.offset as i64;
        info.size = entry.address.size as i64;
        info.crc32c = Some(entry.crc32c);
        match guard.add_file_record(&info) {
            Ok(()) => {
                summary.num_files += 1;
                summary.total_bytes += info.size as u64;
                if let Some(p) = progress {
                    p.advance(1);
                }
            }
            Err(e) => ctx.record_error(entry.rel_path.into(), e.to_string(), strict),
        }
    }
}
