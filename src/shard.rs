//! Shard manager (§4.2): owns the open shard blob files for one archive,
//! places writes, rolls shards over at the size limit, and recovers a
//! truncated tail on open. Grounded on `core/sharder.py`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::common::FileSection;
use crate::config::ArchivePaths;
use crate::error::{BarecatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Readonly,
    ReadWrite,
    AppendOnly,
}

/// Address of a stored file's bytes: which shard, at what offset, how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
}

pub struct ShardManager {
    prefix: PathBuf,
    mode: OpenMode,
    shard_size_limit: u64,
    allow_writing_symlinked_shard: bool,
    shard_files: Vec<File>,
}

impl ShardManager {
    /// Open all existing shard blobs for `prefix`. In writable modes, the
    /// last shard is opened for read+write; in readonly mode all shards are
    /// opened read-only. `logical_shard_ends` (as recorded by the index) is
    /// used to truncate a writable last shard whose on-disk size runs past
    /// its logical end — the crash-recovery case where a process died after
    /// `reserve` zero-filled an extent but before the index row landed.
    pub fn open(
        prefix: &Path,
        mode: OpenMode,
        shard_size_limit: u64,
        allow_writing_symlinked_shard: bool,
        logical_shard_ends: &[u64],
    ) -> Result<Self> {
        let paths = ArchivePaths::new(prefix);
        let mut shard_paths = Vec::new();
        let mut n = 0u32;
        loop {
            let p = paths.shard_path(n);
            if p.exists() {
                shard_paths.push(p);
                n += 1;
            } else {
                break;
            }
        }

        if mode != OpenMode::Readonly
            && !allow_writing_symlinked_shard
            && shard_paths.iter().any(|p| {
                p.symlink_metadata()
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
            })
        {
            return Err(BarecatError::PermissionError(
                "writing symlinked shards is disabled (allow_writing_symlinked_shard)".into(),
            ));
        }

        let mut shard_files = Vec::with_capacity(shard_paths.len().max(1));
        for p in &shard_paths {
            shard_files.push(open_existing(p, mode)?);
        }
        if shard_files.is_empty() {
            if mode == OpenMode::Readonly {
                return Err(BarecatError::FileNotFound(paths.shard_path(0)));
            }
            shard_files.push(create_new(&paths.shard_path(0))?);
        }

        if mode != OpenMode::Readonly {
            let last_idx = shard_files.len() - 1;
            let logical_end = logical_shard_ends.get(last_idx).copied().unwrap_or(0);
            let last = &mut shard_files[last_idx];
            let phys_len = last.seek(SeekFrom::End(0))?;
            if phys_len > logical_end {
                last.set_len(logical_end)?;
            }
        }

        Ok(Self {
            prefix: prefix.to_path_buf(),
            mode,
            shard_size_limit,
            allow_writing_symlinked_shard,
            shard_files,
        })
    }

    pub fn num_shards(&self) -> u32 {
        self.shard_files.len() as u32
    }

    fn paths(&self) -> ArchivePaths<'_> {
        ArchivePaths::new(&self.prefix)
    }

    fn ensure_open(&mut self, shard: u32) -> Result<()> {
        while self.shard_files.len() <= shard as usize {
            let p = self.paths().shard_path(self.shard_files.len() as u32);
            self.shard_files.push(open_or_create(&p, self.mode)?);
        }
        Ok(())
    }

    pub fn read_from_address(
        &mut self,
        addr: Address,
        expected_crc32c: Option<u32>,
    ) -> Result<Vec<u8>> {
        let f = self
            .shard_files
            .get_mut(addr.shard as usize)
            .ok_or_else(|| BarecatError::FileNotFound(self.paths().shard_path(addr.shard)))?;
        f.seek(SeekFrom::Start(addr.offset))?;
        let mut buf = vec![0u8; addr.size as usize];
        f.read_exact(&mut buf)?;
        if let Some(expected) = expected_crc32c {
            let actual = crc32c::crc32c(&buf);
            if actual != expected {
                return Err(BarecatError::CrcMismatch {
                    path: self.paths().shard_path(addr.shard),
                    expected,
                    actual,
                });
            }
        }
        Ok(buf)
    }

    pub fn readinto_from_address(
        &mut self,
        addr: Address,
        buffer: &mut [u8],
        expected_crc32c: Option<u32>,
    ) -> Result<usize> {
        let f = self
            .shard_files
            .get_mut(addr.shard as usize)
            .ok_or_else(|| BarecatError::FileNotFound(self.paths().shard_path(addr.shard)))?;
        f.seek(SeekFrom::Start(addr.offset))?;
        let want = buffer.len().min(addr.size as usize);
        let n = f.read(&mut buffer[..want])?;
        if let Some(expected) = expected_crc32c {
            let actual = crc32c::crc32c(&buffer[..n]);
            if actual != expected {
                return Err(BarecatError::CrcMismatch {
                    path: self.paths().shard_path(addr.shard),
                    expected,
                    actual,
                });
            }
        }
        Ok(n)
    }

    /// Write `data` at an explicit, already-allocated address (used by the
    /// defragmenter to relocate a file into an earlier gap; never grows a
    /// shard, unlike [`ShardManager::add`]).
    pub fn write_at(&mut self, addr: Address, data: &[u8]) -> Result<()> {
        self.raise_if_readonly()?;
        self.ensure_open(addr.shard)?;
        let f = &mut self.shard_files[addr.shard as usize];
        f.seek(SeekFrom::Start(addr.offset))?;
        f.write_all(data)?;
        Ok(())
    }

    pub fn open_section(&mut self, addr: Address, readonly: bool) -> Result<FileSection<'_>> {
        let f = self
            .shard_files
            .get_mut(addr.shard as usize)
            .ok_or_else(|| BarecatError::FileNotFound(self.paths().shard_path(addr.shard)))?;
        Ok(FileSection::new(f, addr.offset, addr.size, readonly))
    }

    /// Reserve `size` bytes at the current tail, zero-filling them. The
    /// caller writes the real bytes later (used by the ingest pipeline so a
    /// producer thread can hand out extents to workers).
    pub fn reserve(&mut self, size: u64) -> Result<Address> {
        self.raise_if_readonly()?;
        if size > self.shard_size_limit {
            return Err(BarecatError::FileTooLarge {
                size,
                limit: self.shard_size_limit,
            });
        }
        let last = self.shard_files.len() as u32 - 1;
        let tail = self.shard_files[last as usize].seek(SeekFrom::End(0))?;
        let (shard, offset) = if tail + size > self.shard_size_limit {
            self.start_new_shard()?;
            (self.shard_files.len() as u32 - 1, 0)
        } else {
            (last, tail)
        };
        let f = &mut self.shard_files[shard as usize];
        f.seek(SeekFrom::Start(offset))?;
        write_zeroes(f, size)?;
        f.flush()?;
        Ok(Address { shard, offset, size })
    }

    /// Write `data` at the tail of the current shard (or at `reserved`, if
    /// given), rolling the shard over if the write would overflow the
    /// limit. Returns the final placement and its CRC32C.
    pub fn add(&mut self, data: &[u8], reserved: Option<Address>) -> Result<(Address, u32)> {
        self.raise_if_readonly()?;
        let size = data.len() as u64;
        if size > self.shard_size_limit {
            return Err(BarecatError::FileTooLarge {
                size,
                limit: self.shard_size_limit,
            });
        }

        let (mut shard, mut offset) = match reserved {
            Some(addr) => {
                self.ensure_open(addr.shard)?;
                (addr.shard, addr.offset)
            }
            None => {
                let last = self.shard_files.len() as u32 - 1;
                let tail = self.shard_files[last as usize].seek(SeekFrom::End(0))?;
                if tail + size > self.shard_size_limit {
                    self.start_new_shard()?;
                    (self.shard_files.len() as u32 - 1, 0)
                } else {
                    (last, tail)
                }
            }
        };

        {
            let f = &mut self.shard_files[shard as usize];
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(data)?;
        }
        let crc = crc32c::crc32c(data);

        if offset + size > self.shard_size_limit {
            self.start_new_shard_and_transfer_last_file(shard, offset, size)?;
            shard = self.shard_files.len() as u32 - 1;
            offset = 0;
        }

        Ok((Address { shard, offset, size }, crc))
    }

    pub fn start_new_shard(&mut self) -> Result<()> {
        self.raise_if_readonly()?;
        let p = self.paths().shard_path(self.shard_files.len() as u32);
        self.shard_files.push(create_new(&p)?);
        Ok(())
    }

    /// Append an already-created symlinked shard file (pointing at another
    /// archive's shard) to the tail of this manager's shard list, for a
    /// symlink-based merge. Subject to the same guard `open` applies to
    /// symlinked shards found on disk.
    pub fn adopt_symlinked_shard(&mut self, path: &Path) -> Result<()> {
        if !self.allow_writing_symlinked_shard {
            return Err(BarecatError::PermissionError(
                "writing symlinked shards is disabled (allow_writing_symlinked_shard)".into(),
            ));
        }
        self.shard_files.push(open_existing(path, self.mode)?);
        Ok(())
    }

    /// Overflow recovery: the write at `(shard, offset)` of `size` bytes
    /// turned out to cross the shard-size limit only after completion
    /// (streamed write of unknown length). Copy the tail into a fresh shard
    /// and truncate the old one; the invariant this depends on is that the
    /// copy never needs to span more than one rollover.
    fn start_new_shard_and_transfer_last_file(
        &mut self,
        shard: u32,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        self.raise_if_readonly()?;
        let new_path = self.paths().shard_path(self.shard_files.len() as u32);
        let mut new_file = create_new(&new_path)?;
        {
            let old_file = &mut self.shard_files[shard as usize];
            old_file.seek(SeekFrom::Start(offset))?;
            copy_n_bytes(old_file, &mut new_file, size)?;
            old_file.set_len(offset)?;
        }
        self.shard_files.push(new_file);
        Ok(())
    }

    pub fn total_physical_size_seek(&mut self) -> Result<u64> {
        let mut total = 0u64;
        for f in self.shard_files.iter_mut() {
            total += f.seek(SeekFrom::End(0))?;
        }
        Ok(total)
    }

    pub fn physical_shard_end(&mut self, shard: u32) -> Result<u64> {
        Ok(self.shard_files[shard as usize].seek(SeekFrom::End(0))?)
    }

    /// Truncate each shard to its logical end; delete any fully-empty
    /// trailing shards.
    pub fn truncate_all_to_logical(&mut self, logical_shard_ends: &[u64]) -> Result<()> {
        self.raise_if_readonly()?;
        let mut i = self.shard_files.len();
        while i > 1 {
            i -= 1;
            if logical_shard_ends.get(i).copied().unwrap_or(0) == 0 {
                let path = self.paths().shard_path(i as u32);
                self.shard_files.pop();
                std::fs::remove_file(path).ok();
            } else {
                break;
            }
        }
        for (i, f) in self.shard_files.iter_mut().enumerate() {
            let end = logical_shard_ends.get(i).copied().unwrap_or(0);
            f.set_len(end)?;
        }
        Ok(())
    }

    fn raise_if_readonly(&self) -> Result<()> {
        if self.mode == OpenMode::Readonly {
            return Err(BarecatError::PermissionError(
                "archive is read-only".into(),
            ));
        }
        Ok(())
    }
}

fn open_existing(path: &Path, mode: OpenMode) -> Result<File> {
    let f = match mode {
        OpenMode::Readonly => OpenOptions::new().read(true).open(path)?,
        OpenMode::AppendOnly | OpenMode::ReadWrite => {
            OpenOptions::new().read(true).write(true).open(path)?
        }
    };
    Ok(f)
}

fn open_or_create(path: &Path, mode: OpenMode) -> Result<File> {
    if path.exists() {
        open_existing(path, mode)
    } else {
        create_new(path)
    }
}

fn create_new(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn write_zeroes(f: &mut File, size: u64) -> std::io::Result<()> {
    const CHUNK: usize = 64 * 1024;
    let zeroes = [0u8; CHUNK];
    let mut remaining = size as usize;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        f.write_all(&zeroes[..n])?;
        remaining -= n;
    }
    Ok(())
}

fn copy_n_bytes(src: &mut File, dst: &mut File, len: u64) -> std::io::Result<()> {
    let mut remaining = len;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        src.read_exact(&mut buf[..want])?;
        dst.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn prefix(dir: &Path) -> PathBuf {
        dir.join("arch")
    }

    #[test]
    fn add_rolls_over_at_size_limit() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path());
        let mut sm = ShardManager::open(&prefix, OpenMode::ReadWrite, 1000, false, &[]).unwrap();
        let (addr_a, _) = sm.add(&vec![1u8; 600], None).unwrap();
        assert_eq!((addr_a.shard, addr_a.offset), (0, 0));
        let (addr_b, _) = sm.add(&vec![2u8; 500], None).unwrap();
        assert_eq!((addr_b.shard, addr_b.offset), (1, 0));
    }

    #[test]
    fn crc_mismatch_detected() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path());
        let mut sm = ShardManager::open(&prefix, OpenMode::ReadWrite, 1_000_000, false, &[]).unwrap();
        let data: Vec<u8> = (0u8..=255).collect();
        let (addr, crc) = sm.add(&data, None).unwrap();
        assert!(sm.read_from_address(addr, Some(crc)).is_ok());

        // Flip a byte directly on disk, bypassing the manager.
        let shard_path = ArchivePaths::new(&prefix).shard_path(0);
        let mut f = OpenOptions::new().write(true).open(&shard_path).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&[0xff]).unwrap();
        drop(f);

        let err = sm.read_from_address(addr, Some(crc)).unwrap_err();
        assert!(matches!(err, BarecatError::CrcMismatch { .. }));
    }

    #[test]
    fn reserve_then_write_reuses_extent() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path());
        let mut sm = ShardManager::open(&prefix, OpenMode::ReadWrite, 1_000_000, false, &[]).unwrap();
        let reserved = sm.reserve(10).unwrap();
        let (addr, _) = sm.add(b"0123456789", Some(reserved)).unwrap();
        assert_eq!(addr.shard, reserved.shard);
        assert_eq!(addr.offset, reserved.offset);
    }
}
