//! Producer: walks the source tree and reserves a shard extent for each
//! file. Reservation is the only step that touches the archive's shard
//! tail, so it stays serialized on this single thread even though the
//! actual byte writes happen on the worker pool.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use ignore::WalkBuilder;

use crate::archive::Archive;
use crate::shard::Address;

use super::context::IngestContext;

pub struct ReservedEntry {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub address: Address,
}

pub fn spawn_producer(
    archive: Arc<Mutex<Archive>>,
    root: PathBuf,
    strip_root: bool,
    tx: Sender<ReservedEntry>,
    ctx: Arc<IngestContext>,
    strict: bool,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let walker = WalkBuilder::new(&root).hidden(false).build();
        for result in walker {
            if ctx.is_cancelled() {
                break;
            }
            let entry = match result {
                Ok(e) => e,
                Err(e) => {
                    ctx.record_error(root.clone(), e.to_string(), strict);
                    continue;
                }
            };
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let abs_path = entry.path().to_path_buf();
            let rel_path = relative_path(&root, &abs_path, strip_root);
            let size = match std::fs::metadata(&abs_path) {
                Ok(m) => m.len(),
                Err(e) => {
                    ctx.record_error(abs_path, e.to_string(), strict);
                    continue;
                }
            };
            let address = {
                let mut guard = archive.lock().unwrap();
                match guard.reserve(size) {
                    Ok(a) => a,
                    Err(e) => {
                        ctx.record_error(abs_path, e.to_string(), strict);
                        continue;
                    }
                }
            };
            if tx
                .send(ReservedEntry {
                    abs_path,
                    rel_path,
                    address,
                })
                .is_err()
            {
                break;
            }
        }
    })
}

/// Drain a pre-enumerated list of paths (e.g. read from stdin by the `create`
/// CLI command) instead of walking a directory: each path is stored under
/// its own path string, normalized to forward slashes, since there is no
/// single root to make it relative to.
pub fn spawn_producer_from_paths(
    archive: Arc<Mutex<Archive>>,
    paths: Vec<PathBuf>,
    tx: Sender<ReservedEntry>,
    ctx: Arc<IngestContext>,
    strict: bool,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for abs_path in paths {
            if ctx.is_cancelled() {
                break;
            }
            let rel_path = abs_path.to_string_lossy().replace('\\', "/");
            let size = match std::fs::metadata(&abs_path) {
                Ok(m) => m.len(),
                Err(e) => {
                    ctx.record_error(abs_path, e.to_string(), strict);
                    continue;
                }
            };
            let address = {
                let mut guard = archive.lock().unwrap();
                match guard.reserve(size) {
                    Ok(a) => a,
                    Err(e) => {
                        ctx.record_error(abs_path, e.to_string(), strict);
                        continue;
                    }
                }
            };
            if tx
                .send(ReservedEntry {
                    abs_path,
                    rel_path,
                    address,
                })
                .is_err()
            {
                break;
            }
        }
    })
}

fn relative_path(root: &std::path::Path, abs_path: &std::path::Path, strip_root: bool) -> String {
    let rel = abs_path.strip_prefix(root).unwrap_or(abs_path);
    let mut s = rel.to_string_lossy().replace('\\', "/");
    if !strip_root {
        if let Some(name) = root.file_name() {
            s = format!("{}/{s}", name.to_string_lossy());
        }
    }
    s
}
