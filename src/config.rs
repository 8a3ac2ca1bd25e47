//! Ambient configuration: archive file-naming conventions, worker-thread
//! tuning by drive type, batching/channel-capacity constants, the
//! `--shard-size-limit`-style size-spec parser, and the optional
//! `.barecat.toml` per-directory defaults file.

use std::path::Path;

use serde::Deserialize;

use crate::error::{BarecatError, Result};

/// Derives the on-disk file names for an archive rooted at a given path
/// prefix, mirroring the original `<archive>-sqlite-index` /
/// `<archive>-shard-NNNNN` convention.
pub struct ArchivePaths<'a> {
    prefix: &'a Path,
}

impl<'a> ArchivePaths<'a> {
    pub fn new(prefix: &'a Path) -> Self {
        Self { prefix }
    }

    pub fn index_path(&self) -> std::path::PathBuf {
        self.with_suffix("-sqlite-index")
    }

    pub fn shard_path(&self, shard: u32) -> std::path::PathBuf {
        self.with_suffix(&format!("-shard-{shard:05}"))
    }

    fn with_suffix(&self, suffix: &str) -> std::path::PathBuf {
        let mut s = self.prefix.as_os_str().to_owned();
        s.push(suffix);
        s.into()
    }
}

/// Worker thread limits for drive-type-aware tuning of the ingest pipeline.
#[derive(Clone, Copy, Debug)]
pub struct WorkerTuning {
    pub all_threads: usize,
    pub hdd_max: usize,
    pub floor: usize,
    pub unknown_max: usize,
    pub network_max: usize,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            all_threads: 0,
            hdd_max: Self::HDD_THREADS,
            floor: Self::FLOOR_THREADS,
            unknown_max: Self::UNKNOWN_MAX_THREADS,
            network_max: Self::NETWORK_MAX_THREADS,
        }
    }
}

impl WorkerTuning {
    pub const HDD_THREADS: usize = 4;
    pub const FLOOR_THREADS: usize = 2;
    pub const UNKNOWN_MAX_THREADS: usize = 8;
    pub const NETWORK_MAX_THREADS: usize = 12;

    pub fn current() -> Self {
        Self {
            all_threads: rayon::current_num_threads(),
            ..Self::default()
        }
    }

    pub fn workers_for(&self, drive: crate::disk_detect::DriveType) -> usize {
        drive.worker_threads(self.all_threads).max(self.floor)
    }
}

/// Batch size for index insert transactions during ingest (balances
/// transaction overhead against round-trip count).
pub const DB_INSERT_BATCH_SIZE: usize = 1000;

/// Bounded-channel capacities tuned by drive type for the ingest pipeline's
/// producer → worker and worker → consumer handoffs.
pub struct StreamingChannelCap;

impl StreamingChannelCap {
    pub const DEFAULT_SSD: usize = 500_000;
    pub const DEFAULT_HDD: usize = 100_000;
    pub const DEFAULT_NETWORK: usize = 200_000;
    pub const DEFAULT_UNKNOWN: usize = 50_000;
}

/// Parse a size spec: a plain integer or an integer with a `K`/`M`/`G`/`T`
/// suffix (binary, i.e. powers of 1024), as accepted by `--shard-size-limit`.
pub fn parse_size_spec(spec: &str) -> Result<u64> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(BarecatError::InvalidArgument("empty size spec".into()));
    }
    let (digits, mult) = match spec.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&spec[..spec.len() - 1], 1024u64),
        'M' => (&spec[..spec.len() - 1], 1024u64 * 1024),
        'G' => (&spec[..spec.len() - 1], 1024u64 * 1024 * 1024),
        'T' => (&spec[..spec.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => (spec, 1u64),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| BarecatError::InvalidArgument(format!("invalid size spec: {spec}")))?;
    value
        .checked_mul(mult)
        .ok_or_else(|| BarecatError::InvalidArgument(format!("size spec overflows: {spec}")))
}

/// Optional `.barecat.toml` dropped next to an archive root, overriding only
/// the fields the CLI did not set explicitly.
#[derive(Debug, Default, Deserialize)]
pub struct BarecatToml {
    #[serde(default)]
    pub settings: BarecatTomlSettings,
}

#[derive(Debug, Default, Deserialize)]
pub struct BarecatTomlSettings {
    pub shard_size_limit: Option<String>,
    pub workers: Option<usize>,
    pub strip_root: Option<bool>,
    pub ignore_duplicates: Option<bool>,
    pub verbose: Option<bool>,
}

/// Load `.barecat.toml` from `dir` if present; returns `None` on any I/O or
/// parse failure (a missing or malformed config file is never fatal, only
/// logged at the call site).
pub fn load_barecat_toml(dir: &Path) -> Option<BarecatToml> {
    let path = dir.join(".barecat.toml");
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            log::warn!("failed to parse .barecat.toml: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!(parse_size_spec("1024").unwrap(), 1024);
        assert_eq!(parse_size_spec("1K").unwrap(), 1024);
        assert_eq!(parse_size_spec("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size_spec("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size_spec("1t").unwrap(), 1024u64.pow(4));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size_spec("").is_err());
        assert!(parse_size_spec("abc").is_err());
    }

    #[test]
    fn archive_paths_match_convention() {
        let prefix = Path::new("/tmp/mydata");
        let paths = ArchivePaths::new(prefix);
        assert_eq!(paths.index_path(), Path::new("/tmp/mydata-sqlite-index"));
        assert_eq!(paths.shard_path(3), Path::new("/tmp/mydata-shard-00003"));
    }
}
