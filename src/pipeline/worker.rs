//! Worker pool: reads each reserved file from disk, computes its CRC32C,
//! and writes the bytes into its already-reserved shard extent. Workers
//! never touch the shared archive handle — each opens its own file
//! descriptor onto the shard path, so concurrent writes to disjoint,
//! non-overlapping extents need no cross-thread coordination.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::common::BaseInfo;
use crate::config::ArchivePaths;

use super::context::IngestContext;
use super::producer::ReservedEntry;

pub struct CompletedEntry {
    pub rel_path: String,
    pub base: BaseInfo,
    pub address: crate::shard::Address,
    pub crc32c: u32,
}

pub fn spawn_workers(
    n: usize,
    archive_prefix: PathBuf,
    rx: Receiver<ReservedEntry>,
    tx: Sender<CompletedEntry>,
    ctx: Arc<IngestContext>,
    strict: bool,
) -> Vec<JoinHandle<()>> {
    (0..n)
        .map(|_| {
            let rx = rx.clone();
            let tx = tx.clone();
            let ctx = ctx.clone();
            let prefix = archive_prefix.clone();
            thread::spawn(move || worker_loop(prefix, rx, tx, ctx, strict))
        })
        .collect()
}

fn worker_loop(
    prefix: PathBuf,
    rx: Receiver<ReservedEntry>,
    tx: Sender<CompletedEntry>,
    ctx: Arc<IngestContext>,
    strict: bool,
) {
    let paths = ArchivePaths::new(&prefix);
    let mut open_shards: HashMap<u32, File> = HashMap::new();
    while let Ok(entry) = rx.recv() {
        if ctx.is_cancelled() {
            break;
        }
        let result = process_entry(&entry, &paths, &mut open_shards);
        match result {
            Ok(completed) => {
                if tx.send(completed).is_err() {
                    break;
                }
            }
            Err(e) => ctx.record_error(entry.abs_path, e.to_string(), strict),
        }
    }
}

fn process_entry(
    entry: &ReservedEntry,
    paths: &ArchivePaths<'_>,
    open_shards: &mut HashMap<u32, File>,
) -> crate::error::Result<CompletedEntry> {
    let data = std::fs::read(&entry.abs_path)?;
    if data.len() as u64 != entry.address.size {
        return Err(crate::error::BarecatError::SizeChanged {
            path: entry.abs_path.clone(),
            reserved: entry.address.size,
            actual: data.len() as u64,
        });
    }
    let crc = crc32c::crc32c(&data);

    let file = open_shards.entry(entry.address.shard).or_insert_with(|| {
        OpenOptions::new()
            .write(true)
            .open(paths.shard_path(entry.address.shard))
            .expect("reserved shard file must already exist")
    });
    file.seek(SeekFrom::Start(entry.address.offset))?;
    file.write_all(&data)?;

    let meta = std::fs::metadata(&entry.abs_path)?;
    let mut base = BaseInfo::new(&entry.rel_path);
    base.fill_from_metadata(&meta);

    Ok(CompletedEntry {
        rel_path: entry.rel_path.clone(),
        base,
        address: entry.address,
        crc32c: crc,
    })
}
