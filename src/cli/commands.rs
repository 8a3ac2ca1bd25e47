//! Command handlers: each corresponds to one CLI subcommand and does the
//! minimum translation from parsed args into calls against `archive`,
//! `pipeline`, and `defrag`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::{Archive, ArchiveMode};
use crate::common::SHARD_SIZE_UNLIMITED;
use crate::config::parse_size_spec;
use crate::defrag;
use crate::error::{BarecatError, Result};
use crate::pipeline::{run_ingest, IngestOptions, IngestSource};

fn shard_limit(spec: Option<&str>) -> Result<i64> {
    match spec {
        Some(spec) => Ok(parse_size_spec(spec)? as i64),
        None => Ok(SHARD_SIZE_UNLIMITED),
    }
}

/// Read a list of paths to ingest, one per record, from `file` if given or
/// stdin otherwise. Records are newline-delimited, or NUL-delimited when
/// `null_delimited` is set (for filenames that may themselves contain
/// newlines, matching `find -print0` / `xargs -0` convention).
fn read_path_list(file: Option<&Path>, null_delimited: bool) -> Result<Vec<PathBuf>> {
    let sep = if null_delimited { 0u8 } else { b'\n' };
    let raw: Vec<u8> = match file {
        Some(p) => std::fs::read(p)?,
        None => {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut std::io::stdin().lock(), &mut buf)?;
            buf
        }
    };
    Ok(raw
        .split(|&b| b == sep)
        .map(|chunk| String::from_utf8_lossy(chunk).trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// Ingest a list of paths (read from `--file` or stdin) into a freshly
/// created archive at `target`.
pub fn create(
    file: Option<&Path>,
    null_delimited: bool,
    target: &Path,
    shard_size_limit: Option<&str>,
    workers: usize,
    overwrite: bool,
    strict: bool,
) -> Result<()> {
    let limit = shard_limit(shard_size_limit)?;
    if overwrite {
        remove_archive_files(target)?;
    }
    let paths = read_path_list(file, null_delimited)?;
    let archive = Archive::create(target, limit, false)?;
    let opts = IngestOptions {
        source: IngestSource::PathList(paths),
        workers,
        channel_capacity: 0,
        strict,
        show_progress: true,
    };
    let (archive, summary) = run_ingest(archive, opts)?;
    log::info!(
        "ingested {} files, {} bytes into {}",
        summary.num_files,
        summary.total_bytes,
        target.display()
    );
    archive.close()
}

/// Ingest one or more directory trees, walked recursively, into a freshly
/// created archive at `target`.
pub fn create_recursive(
    roots: &[PathBuf],
    target: &Path,
    shard_size_limit: Option<&str>,
    workers: usize,
    strip_root: bool,
    overwrite: bool,
    strict: bool,
) -> Result<()> {
    let limit = shard_limit(shard_size_limit)?;
    if overwrite {
        remove_archive_files(target)?;
    }
    let mut archive = Archive::create(target, limit, false)?;
    let mut total_files = 0u64;
    let mut total_bytes = 0u64;
    for root in roots {
        let opts = IngestOptions {
            source: IngestSource::Directory {
                root: root.clone(),
                strip_root,
            },
            workers,
            channel_capacity: 0,
            strict,
            show_progress: true,
        };
        let (next, summary) = run_ingest(archive, opts)?;
        archive = next;
        total_files += summary.num_files;
        total_bytes += summary.total_bytes;
    }
    log::info!(
        "ingested {total_files} files, {total_bytes} bytes into {}",
        target.display()
    );
    archive.close()
}

fn remove_archive_files(target: &Path) -> Result<()> {
    let paths = crate::config::ArchivePaths::new(target);
    let index = paths.index_path();
    if index.exists() {
        std::fs::remove_file(&index)?;
    }
    for shard in 0.. {
        let p = paths.shard_path(shard);
        if !p.exists() {
            break;
        }
        std::fs::remove_file(p)?;
    }
    Ok(())
}

pub fn extract(archive: &Path, destination: &Path) -> Result<()> {
    let mut arch = Archive::open(archive, ArchiveMode::Readonly, true)?;
    for (dir_path, _, files) in arch.walk_infos("")? {
        let dir_dest = destination.join(&dir_path);
        std::fs::create_dir_all(&dir_dest)?;
        for f in files {
            let data = arch.read(f.path())?;
            let out_path = destination.join(f.path());
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out_path, &data)?;
        }
    }
    log::info!("extracted {} to {}", archive.display(), destination.display());
    Ok(())
}

pub fn extract_single(archive: &Path, path: &str, out: Option<&Path>) -> Result<()> {
    let mut arch = Archive::open(archive, ArchiveMode::Readonly, true)?;
    let data = arch.read(path)?;
    match out {
        Some(p) => std::fs::write(p, &data)?,
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
    }
    Ok(())
}

/// Byte-copy merge of `inputs` into a freshly created archive at `output`.
pub fn merge(
    inputs: &[PathBuf],
    output: &Path,
    shard_size_limit: Option<&str>,
    ignore_duplicates: bool,
) -> Result<()> {
    if inputs.is_empty() {
        return Err(BarecatError::InvalidArgument(
            "merge requires at least one input archive".into(),
        ));
    }
    let limit = shard_limit(shard_size_limit)?;
    let mut arch = Archive::create(output, limit, false)?;
    for input in inputs {
        arch.merge_from(input, ignore_duplicates)?;
        log::info!("merged {} into {}", input.display(), output.display());
    }
    arch.close()
}

/// Link-based merge of `inputs` into a freshly created archive at `output`:
/// each input's shards are symlinked in rather than copied.
pub fn merge_symlink(inputs: &[PathBuf], output: &Path) -> Result<()> {
    if inputs.is_empty() {
        return Err(BarecatError::InvalidArgument(
            "merge-symlink requires at least one input archive".into(),
        ));
    }
    let mut arch = Archive::create(output, SHARD_SIZE_UNLIMITED, true)?;
    for input in inputs {
        arch.merge_from_other(input, false)?;
        log::info!("symlink-merged {} into {}", input.display(), output.display());
    }
    arch.close()
}

pub fn verify(archive: &Path, quick: bool) -> Result<()> {
    let mut arch = Archive::open(archive, ArchiveMode::Readonly, true)?;
    if quick {
        arch.verify_integrity_quick()?;
    } else {
        arch.verify_integrity()?;
    }
    log::info!("{} passed integrity verification", archive.display());
    Ok(())
}

pub fn defrag_cmd(archive: &Path, quick: bool, time_max_seconds: u64) -> Result<()> {
    let mut arch = Archive::open(archive, ArchiveMode::ReadWrite, false)?;
    if quick {
        defrag::defrag_quick(&mut arch, Duration::from_secs(time_max_seconds))?;
    } else {
        defrag::defrag(&mut arch)?;
    }
    log::info!("defragmented {}", archive.display());
    arch.close()
}

pub fn archive2barecat(
    source: &Path,
    target: &Path,
    shard_size_limit: Option<&str>,
    workers: usize,
) -> Result<()> {
    let roots = [source.to_path_buf()];
    create_recursive(&roots, target, shard_size_limit, workers, true, false, true)
}

pub fn barecat2archive(archive: &Path, destination: &Path) -> Result<()> {
    extract(archive, destination)
}
