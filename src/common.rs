//! Shared value types: file/directory metadata records, enumeration order
//! flags, and the bounded seekable view used for in-shard reads and writes.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{BarecatError, Result};
use crate::path_utils::normalize;

/// Sentinel for "no shard size limit". Matches the Python sources' use of
/// the largest positive `i64`, so the value round-trips through the same
/// SQLite `INTEGER` column without special-casing.
pub const SHARD_SIZE_UNLIMITED: i64 = i64::MAX;

/// POSIX metadata shared by files and directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseInfo {
    pub path: String,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

impl BaseInfo {
    pub fn new(path: &str) -> Self {
        Self {
            path: normalize(path),
            ..Default::default()
        }
    }

    pub fn fill_from_metadata(&mut self, meta: &std::fs::Metadata) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            self.mode = Some(meta.mode());
            self.uid = Some(meta.uid());
            self.gid = Some(meta.gid());
            self.mtime_ns = Some(meta.mtime() * 1_000_000_000 + meta.mtime_nsec());
        }
        #[cfg(not(unix))]
        {
            self.mode = None;
            self.uid = None;
            self.gid = None;
            self.mtime_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64);
        }
    }
}

/// A stored file's full metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarecatFileInfo {
    pub base: BaseInfo,
    pub shard: i64,
    pub offset: i64,
    pub size: i64,
    pub crc32c: Option<u32>,
}

impl BarecatFileInfo {
    pub fn new(path: &str) -> Self {
        Self {
            base: BaseInfo::new(path),
            ..Default::default()
        }
    }

    pub fn path(&self) -> &str {
        &self.base.path
    }

    pub fn end(&self) -> i64 {
        self.offset + self.size
    }
}

/// A stored directory's metadata plus derived tree statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarecatDirInfo {
    pub base: BaseInfo,
    pub num_subdirs: i64,
    pub num_files: i64,
    pub size_tree: i64,
    pub num_files_tree: i64,
}

impl BarecatDirInfo {
    pub fn new(path: &str) -> Self {
        Self {
            base: BaseInfo::new(path),
            ..Default::default()
        }
    }

    pub fn path(&self) -> &str {
        &self.base.path
    }

    pub fn num_entries(&self) -> i64 {
        self.num_subdirs + self.num_files
    }
}

/// Sum type returned by lookups that can resolve to either kind of entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Info {
    File(BarecatFileInfo),
    Dir(BarecatDirInfo),
}

impl Info {
    pub fn path(&self) -> &str {
        match self {
            Info::File(f) => f.path(),
            Info::Dir(d) => d.path(),
        }
    }
}

/// Enumeration order for index queries, mirroring the original flag set
/// `{any, random, address, path, path_desc, address_desc}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Any,
    Random,
    Address,
    AddressDesc,
    Path,
    PathDesc,
}

impl Order {
    pub fn as_query_text(self) -> &'static str {
        match self {
            Order::Any => "",
            Order::Random => " ORDER BY RANDOM()",
            Order::Address => " ORDER BY shard, offset",
            Order::AddressDesc => " ORDER BY shard DESC, offset DESC",
            Order::Path => " ORDER BY path",
            Order::PathDesc => " ORDER BY path DESC",
        }
    }
}

/// A bounded, seekable view over a region of an open shard file.
///
/// Writes past `end` fail rather than silently extending the shard; this is
/// what keeps the ingest pipeline's reserved extents from ever overlapping.
pub struct FileSection<'a> {
    file: &'a mut std::fs::File,
    start: u64,
    end: u64,
    position: u64,
    readonly: bool,
}

impl<'a> FileSection<'a> {
    pub fn new(file: &'a mut std::fs::File, start: u64, size: u64, readonly: bool) -> Self {
        Self {
            file,
            start,
            end: start + size,
            position: start,
            readonly,
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

impl Read for FileSection<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = (self.end - self.position) as usize;
        let want = buf.len().min(remaining);
        if want == 0 {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(self.position))?;
        let n = self.file.read(&mut buf[..want])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for FileSection<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.readonly {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cannot write to a read-only file section",
            ));
        }
        if self.position + buf.len() as u64 > self.end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "cannot write past the end of the section",
            ));
        }
        self.file.seek(SeekFrom::Start(self.position))?;
        let n = self.file.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileSection<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_position = match pos {
            SeekFrom::Start(off) => self.start as i128 + off as i128,
            SeekFrom::Current(off) => self.position as i128 + off as i128,
            SeekFrom::End(off) => self.end as i128 + off as i128,
        };
        if new_position < self.start as i128 || new_position > self.end as i128 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "seek position out of bounds",
            ));
        }
        self.position = new_position as u64;
        Ok(self.position - self.start)
    }
}

/// CRC32C of the empty byte string: the value used for zero-size files,
/// never a null/absent checksum.
pub fn crc32c_of_empty() -> u32 {
    crc32c::crc32c(&[])
}

/// Verify a CRC32C, producing the taxonomy error on mismatch.
pub fn check_crc32c(path: &str, expected: u32, data: &[u8]) -> Result<()> {
    let actual = crc32c::crc32c(data);
    if actual != expected {
        return Err(BarecatError::CrcMismatch {
            path: path.into(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_crc_is_not_null() {
        assert_eq!(crc32c_of_empty(), crc32c::crc32c(b""));
    }

    #[test]
    fn order_query_text_matches_flags() {
        assert_eq!(Order::Address.as_query_text(), " ORDER BY shard, offset");
        assert_eq!(Order::PathDesc.as_query_text(), " ORDER BY path DESC");
        assert_eq!(Order::Any.as_query_text(), "");
    }
}
