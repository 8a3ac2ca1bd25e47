//! Archive façade (§4.4): the public entry point combining the shard
//! manager, the index, and the codec registry into add/remove/rename/merge/
//! verify operations over logical paths. Grounded on `core/barecat.py`.

use std::path::{Path, PathBuf};

use crate::codec::CodecRegistry;
use crate::common::{BarecatDirInfo, BarecatFileInfo, Info, Order};
use crate::config::ArchivePaths;
use crate::error::{BarecatError, Result};
use crate::index::{Index, IndexMode};
use crate::path_utils;
use crate::shard::{Address, OpenMode, ShardManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    Readonly,
    ReadWrite,
    AppendOnly,
}

impl ArchiveMode {
    fn shard_mode(self) -> OpenMode {
        match self {
            ArchiveMode::Readonly => OpenMode::Readonly,
            ArchiveMode::ReadWrite => OpenMode::ReadWrite,
            ArchiveMode::AppendOnly => OpenMode::AppendOnly,
        }
    }

    fn index_mode(self) -> IndexMode {
        match self {
            ArchiveMode::Readonly => IndexMode::Readonly,
            ArchiveMode::ReadWrite | ArchiveMode::AppendOnly => IndexMode::ReadWrite,
        }
    }
}

/// A Barecat archive: one relational index plus a sequence of shard blobs,
/// addressed by a shared path prefix.
pub struct Archive {
    prefix: PathBuf,
    pub(crate) mode: ArchiveMode,
    pub(crate) shards: ShardManager,
    pub(crate) index: Index,
    codecs: CodecRegistry,
    allow_writing_symlinked_shard: bool,
}

impl Archive {
    /// Create a brand-new, empty archive at `prefix`.
    pub fn create(prefix: &Path, shard_size_limit: i64, allow_writing_symlinked_shard: bool) -> Result<Self> {
        let index = Index::create(prefix, shard_size_limit)?;
        let shards = ShardManager::open(
            prefix,
            OpenMode::ReadWrite,
            shard_size_limit as u64,
            allow_writing_symlinked_shard,
            &[],
        )?;
        Ok(Self {
            prefix: prefix.to_path_buf(),
            mode: ArchiveMode::ReadWrite,
            shards,
            index,
            codecs: CodecRegistry::new(),
            allow_writing_symlinked_shard,
        })
    }

    /// Open an existing archive.
    pub fn open(prefix: &Path, mode: ArchiveMode, allow_writing_symlinked_shard: bool) -> Result<Self> {
        let mut index = Index::open(prefix, mode.index_mode())?;
        let limit = index.shard_size_limit()? as u64;
        let logical_shard_ends = index.logical_shard_ends()?;
        let shards = ShardManager::open(
            prefix,
            mode.shard_mode(),
            limit,
            allow_writing_symlinked_shard,
            &logical_shard_ends,
        )?;
        Ok(Self {
            prefix: prefix.to_path_buf(),
            mode,
            shards,
            index,
            codecs: CodecRegistry::new(),
            allow_writing_symlinked_shard,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn paths(&self) -> ArchivePaths<'_> {
        ArchivePaths::new(&self.prefix)
    }

    pub fn register_codec(
        &mut self,
        suffix: &str,
        encode: crate::codec::EncodeFn,
        decode: crate::codec::DecodeFn,
        nonfinal: bool,
    ) {
        self.codecs.register(suffix, encode, decode, nonfinal);
    }

    pub(crate) fn raise_if_readonly(&self) -> Result<()> {
        if self.mode == ArchiveMode::Readonly {
            return Err(BarecatError::PermissionError("archive is read-only".into()));
        }
        Ok(())
    }

    // --- reads ------------------------------------------------------

    pub fn lookup(&self, path: &str) -> Result<Info> {
        self.index.lookup(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.index.exists(path)
    }

    pub fn num_files(&self) -> Result<i64> {
        self.index.num_files()
    }

    pub fn total_size(&self) -> Result<i64> {
        self.index.total_size()
    }

    pub fn isfile(&self, path: &str) -> bool {
        self.index.isfile(path)
    }

    pub fn isdir(&self, path: &str) -> bool {
        self.index.isdir(path)
    }

    pub fn reverse_lookup(&self, shard: u32, offset: u64) -> Result<BarecatFileInfo> {
        self.index.reverse_lookup(shard, offset)
    }

    pub fn listdir_names(&self, path: &str) -> Result<Vec<String>> {
        self.index.listdir_names(path)
    }

    pub fn listdir_infos(&self, path: &str) -> Result<Vec<Info>> {
        self.index.listdir_infos(path)
    }

    pub fn glob_paths(
        &self,
        pattern: &str,
        recursive: bool,
        include_hidden: bool,
        only_files: bool,
        order: Order,
    ) -> Result<Vec<String>> {
        self.index
            .glob_paths(pattern, recursive, include_hidden, only_files, order)
    }

    pub fn walk_infos(
        &self,
        root: &str,
    ) -> Result<Vec<(String, Vec<BarecatDirInfo>, Vec<BarecatFileInfo>)>> {
        self.index.walk_infos(root)
    }

    /// Read and decode the full contents of a stored file.
    /// Look up a file, turning a miss into `IsADirectory` instead of
    /// `FileNotFound` when the path actually resolves to a directory row.
    fn lookup_file_or_is_dir(&self, path: &str) -> Result<BarecatFileInfo> {
        match self.index.lookup_file(path) {
            Err(BarecatError::FileNotFound(_)) if self.index.isdir(path) => {
                Err(BarecatError::IsADirectory(path.into()))
            }
            other => other,
        }
    }

    pub fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        let info = self.lookup_file_or_is_dir(path)?;
        let addr = Address {
            shard: info.shard as u32,
            offset: info.offset as u64,
            size: info.size as u64,
        };
        let raw = self.shards.read_from_address(addr, info.crc32c)?;
        self.codecs.decode(path, &raw)
    }

    // --- writes -----------------------------------------------------

    /// Encode and store `data` under `path`, creating parent directories
    /// implicitly (matching the original's dict-like `__setitem__`).
    pub fn add(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.raise_if_readonly()?;
        let path = path_utils::normalize(path);
        if self.index.lookup(&path).is_ok() {
            return Err(BarecatError::FileExists(path.into()));
        }
        self.ensure_parent_dirs(&path)?;
        let encoded = self.codecs.encode(&path, data)?;
        let (addr, crc) = self.shards.add(&encoded, None)?;
        let mut info = BarecatFileInfo::new(&path);
        info.shard = addr.shard as i64;
        info.offset = addr.offset as i64;
        info.size = addr.size as i64;
        info.crc32c = Some(crc);
        self.index.add_file(&info)
    }

    /// Add the contents of a real filesystem file at `source`, preserving
    /// its metadata.
    pub fn add_by_path(&mut self, path: &str, source: &Path) -> Result<()> {
        let data = std::fs::read(source)?;
        self.add(path, &data)?;
        let meta = std::fs::metadata(source)?;
        let mut info = self.index.lookup_file(&path_utils::normalize(path))?;
        info.base.fill_from_metadata(&meta);
        self.index.move_file(info.path(), info.shard as u32, info.offset as u64)?;
        Ok(())
    }

    /// Reserve a fresh shard extent at the current tail, for use by the
    /// ingest pipeline's producer thread. The caller is responsible for
    /// writing the real bytes and recording the file in the index.
    pub fn reserve(&mut self, size: u64) -> Result<Address> {
        self.raise_if_readonly()?;
        self.shards.reserve(size)
    }

    pub fn ensure_parent_dirs_public(&mut self, path: &str) -> Result<()> {
        self.ensure_parent_dirs(path)
    }

    /// Record a file whose bytes were already written directly to a shard
    /// (used by the ingest pipeline's consumer thread, which is the index's
    /// sole writer while workers place bytes concurrently).
    pub fn add_file_record(&mut self, info: &BarecatFileInfo) -> Result<()> {
        self.index.add_file(info)
    }

    /// Create any missing ancestor directories, shallowest first: each
    /// directory's own tree-statistics triggers need its parent row to
    /// already exist, so a deepest-first order would silently orphan the
    /// trigger update for whichever ancestor doesn't exist yet.
    fn ensure_parent_dirs(&mut self, path: &str) -> Result<()> {
        for ancestor in path_utils::ancestors(path) {
            if self.index.lookup_dir(&ancestor).is_err() {
                self.index.add_dir(&BarecatDirInfo::new(&ancestor), true)?;
            }
        }
        Ok(())
    }

    /// Remove a file. If it happens to be the last file physically placed
    /// in its shard, the shard is truncated immediately instead of leaving
    /// a hole for the defragmenter to clean up later.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.raise_if_readonly()?;
        let info = self.lookup_file_or_is_dir(path)?;
        self.index.remove_file(path)?;
        let shard = info.shard as u32;
        let shard_end = self.shards.physical_shard_end(shard)?;
        if shard_end == info.end() as u64 {
            let logical_end = self.index.logical_shard_end(shard)?;
            self.shards.truncate_all_to_logical(&{
                let mut ends = self.index.logical_shard_ends()?;
                if ends.len() <= shard as usize {
                    ends.resize(shard as usize + 1, 0);
                }
                ends[shard as usize] = logical_end;
                ends
            })?;
        }
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.raise_if_readonly()?;
        self.index.remove_empty_dir(path)
    }

    pub fn remove_recursively(&mut self, path: &str) -> Result<()> {
        self.raise_if_readonly()?;
        self.index.remove_recursively(path)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.raise_if_readonly()?;
        self.index.rename(old, new)
    }

    pub fn shard_size_limit(&mut self) -> Result<i64> {
        self.index.shard_size_limit()
    }

    pub fn set_shard_size_limit(&mut self, limit: i64) -> Result<()> {
        self.index.set_shard_size_limit(limit)
    }

    pub fn verify_integrity(&mut self) -> Result<()> {
        self.index.verify_integrity()?;
        // Full CRC sweep: read every stored file back through the shard
        // manager, which checks its CRC32C as a side effect.
        for (_, _, files) in self.index.walk_infos("")? {
            for f in files {
                let addr = Address {
                    shard: f.shard as u32,
                    offset: f.offset as u64,
                    size: f.size as u64,
                };
                self.shards.read_from_address(addr, f.crc32c)?;
            }
        }
        Ok(())
    }

    /// Cheap integrity check: only the cached-vs-recomputed tree statistics
    /// and `PRAGMA integrity_check`, no CRC re-read.
    pub fn verify_integrity_quick(&self) -> Result<()> {
        self.index.verify_integrity()
    }

    /// Merge another archive's files and directories into this one. Rather
    /// than renumbering and splicing in the source's shard files directly,
    /// each file's bytes are copied through and re-placed via `shards.add`,
    /// so the result is indistinguishable from having added the files one
    /// by one; `ignore_duplicates` controls whether a path collision is an
    /// error or silently kept from `self`.
    pub fn merge_from(&mut self, other_prefix: &Path, ignore_duplicates: bool) -> Result<()> {
        self.raise_if_readonly()?;
        let mut other = Archive::open(other_prefix, ArchiveMode::Readonly, true)?;
        for (dir_path, _, files) in other.index.walk_infos("")? {
            if !dir_path.is_empty() {
                let _ = self.index.add_dir(&BarecatDirInfo::new(&dir_path), true);
            }
            for mut f in files {
                if self.index.lookup(f.path()).is_ok() {
                    if ignore_duplicates {
                        continue;
                    }
                    return Err(BarecatError::FileExists(f.path().into()));
                }
                let data = other.read(f.path())?;
                self.ensure_parent_dirs(f.path())?;
                let (addr, crc) = self.shards.add(&data, None)?;
                f.shard = addr.shard as i64;
                f.offset = addr.offset as i64;
                f.size = addr.size as i64;
                f.crc32c = Some(crc);
                self.index.add_file(&f)?;
            }
        }
        if ignore_duplicates {
            self.index.update_treestats()?;
        }
        Ok(())
    }

    /// Merge another archive's files and directories into this one by
    /// symlinking its shard files in rather than copying their bytes: each
    /// source shard becomes a new shard here, numbered after the last one
    /// already in use, and file rows are reinserted with their shard number
    /// shifted by that offset (their in-shard offset is unchanged). Directory
    /// metadata is folded rather than overwritten (mode OR'd together,
    /// mtime the max of the two, uid/gid from the source taking priority
    /// when present); the tree-statistics counters then accumulate on their
    /// own through the same insert triggers `add` relies on.
    pub fn merge_from_other(&mut self, other_prefix: &Path, ignore_duplicates: bool) -> Result<()> {
        self.raise_if_readonly()?;
        if !self.allow_writing_symlinked_shard {
            return Err(BarecatError::PermissionError(
                "merging by symlink requires allow_writing_symlinked_shard".into(),
            ));
        }
        let other = Archive::open(other_prefix, ArchiveMode::Readonly, true)?;
        let shard_offset = self.shards.num_shards();
        let other_num_shards = other.index.num_used_shards()?;
        let self_paths = ArchivePaths::new(&self.prefix);
        let other_paths = ArchivePaths::new(other_prefix);
        for shard in 0..other_num_shards {
            let dest = self_paths.shard_path(shard_offset + shard);
            let src = other_paths.shard_path(shard);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&src, &dest)?;
            self.shards.adopt_symlinked_shard(&dest)?;
        }

        for (dir_path, _, files) in other.index.walk_infos("")? {
            if !dir_path.is_empty() {
                self.merge_dir_metadata(&dir_path, &other)?;
            }
            for mut f in files {
                if self.index.lookup(f.path()).is_ok() {
                    if ignore_duplicates {
                        continue;
                    }
                    return Err(BarecatError::FileExists(f.path().into()));
                }
                self.ensure_parent_dirs(f.path())?;
                f.shard += shard_offset as i64;
                self.index.add_file(&f)?;
            }
        }
        self.index.update_treestats()?;
        Ok(())
    }

    /// Fold `path`'s metadata from `other` into this archive's directory row,
    /// creating it first if it doesn't exist yet.
    fn merge_dir_metadata(&mut self, path: &str, other: &Archive) -> Result<()> {
        let src = other.index.lookup_dir(path)?;
        let merged = match self.index.lookup_dir(path) {
            Ok(existing) => BarecatDirInfo {
                base: crate::common::BaseInfo {
                    path: path.to_string(),
                    mode: match (existing.base.mode, src.base.mode) {
                        (Some(a), Some(b)) => Some(a | b),
                        (a, b) => a.or(b),
                    },
                    uid: src.base.uid.or(existing.base.uid),
                    gid: src.base.gid.or(existing.base.gid),
                    mtime_ns: match (existing.base.mtime_ns, src.base.mtime_ns) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => a.or(b),
                    },
                },
                ..existing
            },
            Err(_) => BarecatDirInfo {
                base: src.base.clone(),
                ..BarecatDirInfo::new(path)
            },
        };
        self.index.add_dir(&merged, true)
    }

    pub fn close(self) -> Result<()> {
        self.index.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SHARD_SIZE_UNLIMITED;
    use tempfile::tempdir;

    #[test]
    fn add_and_read_back_roundtrip() {
        let dir = tempdir().unwrap();
        let mut arch = Archive::create(&dir.path().join("arch"), SHARD_SIZE_UNLIMITED, false).unwrap();
        arch.add("a/b.bin", b"hello world").unwrap();
        assert_eq!(arch.read("a/b.bin").unwrap(), b"hello world");
        assert_eq!(arch.num_files().unwrap(), 1);
    }

    #[test]
    fn remove_truncates_last_file_in_shard() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("arch");
        let mut arch = Archive::create(&prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
        arch.add("a.bin", b"0123456789").unwrap();
        arch.remove("a.bin").unwrap();
        let shard_path = ArchivePaths::new(&prefix).shard_path(0);
        let len = std::fs::metadata(shard_path).unwrap().len();
        assert_eq!(len, 0);
    }

    #[test]
    fn duplicate_add_rejected() {
        let dir = tempdir().unwrap();
        let mut arch = Archive::create(&dir.path().join("arch"), SHARD_SIZE_UNLIMITED, false).unwrap();
        arch.add("a.bin", b"x").unwrap();
        let err = arch.add("a.bin", b"y").unwrap_err();
        assert!(matches!(err, BarecatError::FileExists(_)));
    }

    #[test]
    fn merge_copies_files_from_other_archive() {
        let dir = tempdir().unwrap();
        let mut src = Archive::create(&dir.path().join("src"), SHARD_SIZE_UNLIMITED, false).unwrap();
        src.add("x.bin", b"payload").unwrap();
        src.close().unwrap();

        let mut dst = Archive::create(&dir.path().join("dst"), SHARD_SIZE_UNLIMITED, false).unwrap();
        dst.merge_from(&dir.path().join("src"), false).unwrap();
        assert_eq!(dst.read("x.bin").unwrap(), b"payload");
    }

    #[test]
    fn read_and_remove_on_directory_path_raise_is_a_directory() {
        let dir = tempdir().unwrap();
        let mut arch = Archive::create(&dir.path().join("arch"), SHARD_SIZE_UNLIMITED, false).unwrap();
        arch.add("a/b.bin", b"x").unwrap();
        assert!(matches!(arch.read("a").unwrap_err(), BarecatError::IsADirectory(_)));
        assert!(matches!(arch.remove("a").unwrap_err(), BarecatError::IsADirectory(_)));
        assert!(matches!(arch.read("nope").unwrap_err(), BarecatError::FileNotFound(_)));
    }

    #[test]
    fn isfile_isdir_and_reverse_lookup() {
        let dir = tempdir().unwrap();
        let mut arch = Archive::create(&dir.path().join("arch"), SHARD_SIZE_UNLIMITED, false).unwrap();
        arch.add("a/b.bin", b"hello").unwrap();
        assert!(arch.isfile("a/b.bin"));
        assert!(!arch.isdir("a/b.bin"));
        assert!(arch.isdir("a"));
        assert!(!arch.isfile("a"));
        assert!(!arch.isfile("missing"));

        let found = arch.reverse_lookup(0, 0).unwrap();
        assert_eq!(found.path(), "a/b.bin");
        assert!(arch.reverse_lookup(0, 999).is_err());
    }

    #[test]
    fn merge_from_other_symlinks_shards_and_shifts_numbers() {
        let dir = tempdir().unwrap();
        let src_prefix = dir.path().join("src");
        let mut src = Archive::create(&src_prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
        src.add("x.bin", b"payload").unwrap();
        src.close().unwrap();

        let dst_prefix = dir.path().join("dst");
        let mut dst = Archive::create(&dst_prefix, SHARD_SIZE_UNLIMITED, true).unwrap();
        dst.add("own.bin", b"seed").unwrap();
        dst.merge_from_other(&src_prefix, false).unwrap();

        assert_eq!(dst.read("x.bin").unwrap(), b"payload");
        assert_eq!(dst.read("own.bin").unwrap(), b"seed");
        let info = dst.index.lookup_file("x.bin").unwrap();
        assert_eq!(info.shard, 1);

        let dst_shard1 = ArchivePaths::new(&dst_prefix).shard_path(1);
        assert!(dst_shard1
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());
    }
}
