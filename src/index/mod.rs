//! Relational index (§4.3): the SQLite-backed catalog of files and
//! directories for one archive, including the triggers that keep directory
//! tree statistics (`num_subdirs`, `num_files`, `size_tree`, `num_files_tree`)
//! up to date incrementally. Grounded on `core/index.py`; no canonical
//! `schema.sql` exists upstream to port, so the schema and triggers below are
//! designed fresh from the column names and query shapes that file uses.

pub mod glob;

use std::path::Path;

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::common::{BarecatDirInfo, BarecatFileInfo, Info, Order, SHARD_SIZE_UNLIMITED};
use crate::config::ArchivePaths;
use crate::error::{BarecatError, Result};
use crate::path_utils::{self, ROOT_PARENT_SENTINEL};
use crate::shard::Address;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dirs (
    path TEXT PRIMARY KEY,
    parent TEXT NOT NULL,
    num_subdirs INTEGER NOT NULL DEFAULT 0,
    num_files INTEGER NOT NULL DEFAULT 0,
    size_tree INTEGER NOT NULL DEFAULT 0,
    num_files_tree INTEGER NOT NULL DEFAULT 0,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);
CREATE INDEX IF NOT EXISTS idx_dirs_parent ON dirs(parent);

CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    parent TEXT NOT NULL REFERENCES dirs(path),
    shard INTEGER NOT NULL,
    offset INTEGER NOT NULL,
    size INTEGER NOT NULL,
    crc32c INTEGER,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);
CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent);
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_shard_offset ON files(shard, offset);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value_int INTEGER,
    value_text TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_files_ai AFTER INSERT ON files
WHEN (SELECT value_int FROM config WHERE key = 'triggers_enabled') = 1
BEGIN
    UPDATE dirs SET num_files = num_files + 1,
                    size_tree = size_tree + NEW.size,
                    num_files_tree = num_files_tree + 1
    WHERE path = NEW.parent;
END;

CREATE TRIGGER IF NOT EXISTS trg_files_ad AFTER DELETE ON files
WHEN (SELECT value_int FROM config WHERE key = 'triggers_enabled') = 1
BEGIN
    UPDATE dirs SET num_files = num_files - 1,
                    size_tree = size_tree - OLD.size,
                    num_files_tree = num_files_tree - 1
    WHERE path = OLD.parent;
END;

CREATE TRIGGER IF NOT EXISTS trg_files_au AFTER UPDATE ON files
WHEN (SELECT value_int FROM config WHERE key = 'triggers_enabled') = 1
BEGIN
    UPDATE dirs SET num_files = num_files - 1,
                    size_tree = size_tree - OLD.size,
                    num_files_tree = num_files_tree - 1
    WHERE path = OLD.parent AND OLD.parent <> NEW.parent;
    UPDATE dirs SET num_files = num_files + 1,
                    size_tree = size_tree + NEW.size,
                    num_files_tree = num_files_tree + 1
    WHERE path = NEW.parent AND OLD.parent <> NEW.parent;
    UPDATE dirs SET size_tree = size_tree + (NEW.size - OLD.size)
    WHERE path = NEW.parent AND OLD.parent = NEW.parent AND OLD.size <> NEW.size;
END;

CREATE TRIGGER IF NOT EXISTS trg_dirs_ai AFTER INSERT ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'triggers_enabled') = 1 AND NEW.path <> ''
BEGIN
    UPDATE dirs SET num_subdirs = num_subdirs + 1,
                    size_tree = size_tree + NEW.size_tree,
                    num_files_tree = num_files_tree + NEW.num_files_tree
    WHERE path = NEW.parent;
END;

CREATE TRIGGER IF NOT EXISTS trg_dirs_ad AFTER DELETE ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'triggers_enabled') = 1 AND OLD.path <> ''
BEGIN
    UPDATE dirs SET num_subdirs = num_subdirs - 1,
                    size_tree = size_tree - OLD.size_tree,
                    num_files_tree = num_files_tree - OLD.num_files_tree
    WHERE path = OLD.parent;
END;

CREATE TRIGGER IF NOT EXISTS trg_dirs_au AFTER UPDATE OF size_tree, num_files_tree ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'triggers_enabled') = 1
  AND NEW.path <> ''
  AND (NEW.size_tree <> OLD.size_tree OR NEW.num_files_tree <> OLD.num_files_tree)
BEGIN
    UPDATE dirs SET size_tree = size_tree + (NEW.size_tree - OLD.size_tree),
                    num_files_tree = num_files_tree + (NEW.num_files_tree - OLD.num_files_tree)
    WHERE path = NEW.parent;
END;
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    Readonly,
    ReadWrite,
}

pub struct Index {
    conn: Connection,
    mode: IndexMode,
    shard_size_limit_cache: Option<i64>,
}

impl Index {
    /// Create a brand-new index database at `prefix`'s index path.
    pub fn create(prefix: &Path, shard_size_limit: i64) -> Result<Self> {
        let path = ArchivePaths::new(prefix).index_path();
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT INTO dirs(path, parent) VALUES ('', ?1)",
            params![ROOT_PARENT_SENTINEL],
        )?;
        conn.execute(
            "INSERT INTO config(key, value_int) VALUES ('triggers_enabled', 1)",
            [],
        )?;
        conn.execute(
            "INSERT INTO config(key, value_int) VALUES ('shard_size_limit', ?1)",
            params![shard_size_limit],
        )?;
        conn.pragma_update(None, "recursive_triggers", "ON")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn,
            mode: IndexMode::ReadWrite,
            shard_size_limit_cache: Some(shard_size_limit),
        })
    }

    /// Open an existing index, read-only or read-write.
    pub fn open(prefix: &Path, mode: IndexMode) -> Result<Self> {
        let path = ArchivePaths::new(prefix).index_path();
        let conn = match mode {
            IndexMode::Readonly => Connection::open_with_flags(
                &path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
            )?,
            IndexMode::ReadWrite => {
                let conn = Connection::open(&path)?;
                conn.pragma_update(None, "recursive_triggers", "ON")?;
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn
            }
        };
        Ok(Self {
            conn,
            mode,
            shard_size_limit_cache: None,
        })
    }

    fn raise_if_readonly(&self) -> Result<()> {
        if self.mode == IndexMode::Readonly {
            return Err(BarecatError::PermissionError("index is read-only".into()));
        }
        Ok(())
    }

    // --- config -----------------------------------------------------

    pub fn shard_size_limit(&mut self) -> Result<i64> {
        if let Some(v) = self.shard_size_limit_cache {
            return Ok(v);
        }
        let v: i64 = self.conn.query_row(
            "SELECT value_int FROM config WHERE key = 'shard_size_limit'",
            [],
            |r| r.get(0),
        )?;
        self.shard_size_limit_cache = Some(v);
        Ok(v)
    }

    pub fn set_shard_size_limit(&mut self, new_limit: i64) -> Result<()> {
        self.raise_if_readonly()?;
        if new_limit != SHARD_SIZE_UNLIMITED {
            let largest: i64 = self.conn.query_row(
                "SELECT COALESCE(MAX(offset + size), 0) FROM files",
                [],
                |r| r.get(0),
            )?;
            if new_limit < largest {
                return Err(BarecatError::InvalidArgument(format!(
                    "cannot shrink shard_size_limit below the largest used shard size ({largest})"
                )));
            }
        }
        self.conn.execute(
            "UPDATE config SET value_int = ?1 WHERE key = 'shard_size_limit'",
            params![new_limit],
        )?;
        self.shard_size_limit_cache = Some(new_limit);
        Ok(())
    }

    pub fn triggers_enabled(&self) -> Result<bool> {
        let v: i64 = self.conn.query_row(
            "SELECT value_int FROM config WHERE key = 'triggers_enabled'",
            [],
            |r| r.get(0),
        )?;
        Ok(v != 0)
    }

    pub fn set_triggers_enabled(&self, enabled: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE config SET value_int = ?1 WHERE key = 'triggers_enabled'",
            params![enabled as i64],
        )?;
        Ok(())
    }

    /// RAII guard that disables triggers for bulk mutations, restoring the
    /// previous setting on drop. Callers that disable triggers are
    /// responsible for calling [`Index::update_treestats`] before the guard
    /// is dropped.
    pub fn no_triggers(&self) -> Result<NoTriggersGuard<'_>> {
        let was_enabled = self.triggers_enabled()?;
        if was_enabled {
            self.set_triggers_enabled(false)?;
        }
        Ok(NoTriggersGuard {
            index: self,
            restore: was_enabled,
        })
    }

    pub fn no_foreign_keys(&self) -> Result<NoForeignKeysGuard<'_>> {
        let was_enabled: i64 = self.conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?;
        if was_enabled != 0 {
            self.conn.pragma_update(None, "foreign_keys", "OFF")?;
        }
        Ok(NoForeignKeysGuard {
            index: self,
            restore: was_enabled != 0,
        })
    }

    // --- basic counts -------------------------------------------------

    pub fn num_files(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT num_files_tree FROM dirs WHERE path = ''", [], |r| {
                r.get(0)
            })?)
    }

    pub fn total_size(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT size_tree FROM dirs WHERE path = ''", [], |r| {
                r.get(0)
            })?)
    }

    pub fn num_dirs(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM dirs", [], |r| r.get(0))?)
    }

    pub fn num_used_shards(&self) -> Result<u32> {
        let n: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(shard), -1) + 1 FROM files", [], |r| {
                r.get(0)
            })?;
        Ok(n as u32)
    }

    pub fn logical_shard_end(&self, shard: u32) -> Result<u64> {
        let v: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(offset + size), 0) FROM files WHERE shard = ?1",
            params![shard],
            |r| r.get(0),
        )?;
        Ok(v as u64)
    }

    pub fn logical_shard_ends(&self) -> Result<Vec<u64>> {
        let n = self.num_used_shards()?;
        (0..n).map(|s| self.logical_shard_end(s)).collect()
    }

    // --- lookups --------------------------------------------------------

    pub fn lookup_file(&self, path: &str) -> Result<BarecatFileInfo> {
        let path = path_utils::normalize(path);
        self.conn
            .query_row(
                "SELECT path, mode, uid, gid, mtime_ns, shard, offset, size, crc32c \
                 FROM files WHERE path = ?1",
                params![path],
                file_from_row,
            )
            .optional()?
            .ok_or_else(|| BarecatError::FileNotFound(path.clone().into()))
    }

    pub fn lookup_dir(&self, path: &str) -> Result<BarecatDirInfo> {
        let path = path_utils::normalize(path);
        self.conn
            .query_row(
                "SELECT path, mode, uid, gid, mtime_ns, num_subdirs, num_files, \
                 size_tree, num_files_tree FROM dirs WHERE path = ?1",
                params![path],
                dir_from_row,
            )
            .optional()?
            .ok_or_else(|| BarecatError::FileNotFound(path.clone().into()))
    }

    pub fn lookup(&self, path: &str) -> Result<Info> {
        if let Ok(d) = self.lookup_dir(path) {
            return Ok(Info::Dir(d));
        }
        self.lookup_file(path).map(Info::File)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_ok()
    }

    pub fn isfile(&self, path: &str) -> bool {
        self.lookup_file(path).is_ok()
    }

    pub fn isdir(&self, path: &str) -> bool {
        self.lookup_dir(path).is_ok()
    }

    /// Find the file stored at a raw shard address, the inverse of the
    /// `(shard, offset)` pair on a `BarecatFileInfo`.
    pub fn reverse_lookup(&self, shard: u32, offset: u64) -> Result<BarecatFileInfo> {
        self.conn
            .query_row(
                "SELECT path, mode, uid, gid, mtime_ns, shard, offset, size, crc32c \
                 FROM files WHERE shard = ?1 AND offset = ?2",
                params![shard, offset],
                file_from_row,
            )
            .optional()?
            .ok_or_else(|| {
                BarecatError::FileNotFound(format!("shard {shard} offset {offset}").into())
            })
    }

    // --- mutation: files --------------------------------------------------

    pub fn add_file(&self, info: &BarecatFileInfo) -> Result<()> {
        self.raise_if_readonly()?;
        let res = self.conn.execute(
            "INSERT INTO files(path, parent, shard, offset, size, crc32c, mode, uid, gid, mtime_ns) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                info.path(),
                path_utils::parent(info.path()),
                info.shard,
                info.offset,
                info.size,
                info.crc32c,
                info.base.mode,
                info.base.uid,
                info.base.gid,
                info.base.mtime_ns,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(BarecatError::FileExists(info.path().into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn move_file(&self, path: &str, new_shard: u32, new_offset: u64) -> Result<()> {
        self.raise_if_readonly()?;
        self.conn.execute(
            "UPDATE files SET shard = ?1, offset = ?2 WHERE path = ?3",
            params![new_shard, new_offset, path],
        )?;
        Ok(())
    }

    pub fn remove_file(&self, path: &str) -> Result<()> {
        self.raise_if_readonly()?;
        let n = self
            .conn
            .execute("DELETE FROM files WHERE path = ?1", params![path])?;
        if n == 0 {
            return Err(BarecatError::FileNotFound(path.into()));
        }
        Ok(())
    }

    // --- mutation: dirs -----------------------------------------------

    pub fn add_dir(&self, info: &BarecatDirInfo, exist_ok: bool) -> Result<()> {
        self.raise_if_readonly()?;
        if info.path() == "" || exist_ok {
            if self.lookup_dir(info.path()).is_ok() {
                self.conn.execute(
                    "UPDATE dirs SET mode = ?2, uid = ?3, gid = ?4, mtime_ns = ?5 WHERE path = ?1",
                    params![
                        info.path(),
                        info.base.mode,
                        info.base.uid,
                        info.base.gid,
                        info.base.mtime_ns
                    ],
                )?;
                return Ok(());
            }
        }
        let res = self.conn.execute(
            "INSERT INTO dirs(path, parent, num_subdirs, num_files, size_tree, num_files_tree, \
             mode, uid, gid, mtime_ns) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                info.path(),
                path_utils::parent(info.path()),
                info.num_subdirs,
                info.num_files,
                info.size_tree,
                info.num_files_tree,
                info.base.mode,
                info.base.uid,
                info.base.gid,
                info.base.mtime_ns,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(BarecatError::FileExists(info.path().into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_empty_dir(&self, path: &str) -> Result<()> {
        self.raise_if_readonly()?;
        let dir = self.lookup_dir(path)?;
        if dir.num_entries() != 0 {
            return Err(BarecatError::DirectoryNotEmpty(path.into()));
        }
        self.conn
            .execute("DELETE FROM dirs WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Delete a directory and every file/subdirectory beneath it.
    pub fn remove_recursively(&self, path: &str) -> Result<()> {
        self.raise_if_readonly()?;
        let path = path_utils::normalize(path);
        if path.is_empty() {
            return Err(BarecatError::InvalidArgument("cannot remove the root directory".into()));
        }
        let dir = self.lookup_dir(&path)?;
        if dir.num_entries() > 0 {
            let guard = self.no_triggers()?;
            let escaped = path_utils::escape_glob_literal(&path);
            self.conn.execute(
                "DELETE FROM files WHERE path GLOB ?1",
                params![format!("{escaped}/*")],
            )?;
            self.conn.execute(
                "DELETE FROM dirs WHERE path GLOB ?1",
                params![format!("{escaped}/*")],
            )?;
            drop(guard);
        }
        self.conn
            .execute("DELETE FROM dirs WHERE path = ?1", params![path])?;
        Ok(())
    }

    // --- rename ----------------------------------------------------------

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if self.lookup_dir(old).is_ok() {
            self.rename_dir(old, new)
        } else {
            self.rename_file(old, new)
        }
    }

    pub fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        self.raise_if_readonly()?;
        let new_norm = path_utils::normalize(new);
        let res = self.conn.execute(
            "UPDATE files SET path = ?1, parent = ?2 WHERE path = ?3",
            params![new_norm, path_utils::parent(&new_norm), old],
        );
        match res {
            Ok(0) => Err(BarecatError::FileNotFound(old.into())),
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(BarecatError::FileExists(new_norm.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn rename_dir(&self, old: &str, new: &str) -> Result<()> {
        self.raise_if_readonly()?;
        let old = path_utils::normalize(old);
        let new = path_utils::normalize(new);
        if old.is_empty() {
            return Err(BarecatError::InvalidArgument("cannot rename the root directory".into()));
        }
        if self.lookup(&new).is_ok() {
            return Err(BarecatError::FileExists(new.into()));
        }
        let dir = self.lookup_dir(&old)?;
        let guard = self.no_foreign_keys()?;
        self.conn.execute(
            "UPDATE dirs SET path = ?1, parent = ?2 WHERE path = ?3",
            params![new, path_utils::parent(&new), old],
        )?;
        if dir.num_entries() > 0 {
            let trig_guard = self.no_triggers()?;
            let escaped_old = path_utils::escape_glob_literal(&old);
            self.conn.execute(
                "UPDATE files SET path = ?1 || substr(path, ?2), parent = ?1 || substr(parent, ?2) \
                 WHERE path GLOB ?3",
                params![new, old.len() as i64 + 1, format!("{escaped_old}/*")],
            )?;
            self.conn.execute(
                "UPDATE dirs SET path = ?1 || substr(path, ?2), parent = ?1 || substr(parent, ?2) \
                 WHERE path GLOB ?3",
                params![new, old.len() as i64 + 1, format!("{escaped_old}/*")],
            )?;
            drop(trig_guard);
        }
        drop(guard);
        Ok(())
    }

    // --- listing -----------------------------------------------------

    pub fn listdir_names(&self, path: &str) -> Result<Vec<String>> {
        let path = path_utils::normalize(path);
        let mut names: Vec<String> = self
            .conn
            .prepare("SELECT path FROM files WHERE parent = ?1")?
            .query_map(params![path], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        let dirnames: Vec<String> = self
            .conn
            .prepare("SELECT path FROM dirs WHERE parent = ?1")?
            .query_map(params![path], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        names.extend(dirnames);
        Ok(names)
    }

    pub fn listdir_infos(&self, path: &str) -> Result<Vec<Info>> {
        let path = path_utils::normalize(path);
        let mut infos: Vec<Info> = self
            .conn
            .prepare(
                "SELECT path, mode, uid, gid, mtime_ns, shard, offset, size, crc32c \
                 FROM files WHERE parent = ?1",
            )?
            .query_map(params![path], file_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(Info::File)
            .collect();
        let dirs: Vec<Info> = self
            .conn
            .prepare(
                "SELECT path, mode, uid, gid, mtime_ns, num_subdirs, num_files, \
                 size_tree, num_files_tree FROM dirs WHERE parent = ?1",
            )?
            .query_map(params![path], dir_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(Info::Dir)
            .collect();
        infos.extend(dirs);
        Ok(infos)
    }

    /// Pre-order walk of a subtree, yielding `(dir_path, subdirs, files)` for
    /// each directory visited, the directory itself first.
    pub fn walk_infos(
        &self,
        root: &str,
    ) -> Result<Vec<(String, Vec<BarecatDirInfo>, Vec<BarecatFileInfo>)>> {
        let root = path_utils::normalize(root);
        let mut out = Vec::new();
        let mut queue = vec![root];
        while let Some(dir) = queue.pop() {
            let subdirs: Vec<BarecatDirInfo> = self
                .conn
                .prepare(
                    "SELECT path, mode, uid, gid, mtime_ns, num_subdirs, num_files, \
                     size_tree, num_files_tree FROM dirs WHERE parent = ?1 ORDER BY path",
                )?
                .query_map(params![dir], dir_from_row)?
                .collect::<std::result::Result<_, _>>()?;
            let files: Vec<BarecatFileInfo> = self
                .conn
                .prepare(
                    "SELECT path, mode, uid, gid, mtime_ns, shard, offset, size, crc32c \
                     FROM files WHERE parent = ?1 ORDER BY path",
                )?
                .query_map(params![dir], file_from_row)?
                .collect::<std::result::Result<_, _>>()?;
            for d in subdirs.iter().rev() {
                queue.push(d.path().to_string());
            }
            out.push((dir, subdirs, files));
        }
        Ok(out)
    }

    // --- glob --------------------------------------------------------

    /// Resolve a glob pattern (as described in §4.3) to matching paths.
    /// `recursive` controls whether `**` crosses path segments; `include_hidden`
    /// controls whether paths with a dotfile segment are kept.
    pub fn glob_paths(
        &self,
        pattern: &str,
        recursive: bool,
        include_hidden: bool,
        only_files: bool,
        order: Order,
    ) -> Result<Vec<String>> {
        if glob::is_match_all(pattern, recursive) {
            let mut out = self.all_paths(only_files, order)?;
            if !include_hidden {
                out.retain(|p| !glob::is_hidden(p));
            }
            return Ok(out);
        }
        if let Some(seg) = glob::single_wildcard_segment(pattern) {
            let mut out = self.glob_single_segment(&seg, recursive, only_files)?;
            if !include_hidden {
                out.retain(|p| !glob::is_hidden(p));
            }
            return Ok(out);
        }
        let re = Regex::new(&glob::glob_to_regex(pattern, recursive))
            .map_err(|e| BarecatError::InvalidArgument(format!("bad glob pattern: {e}")))?;
        let mut out: Vec<String> = self
            .all_paths(only_files, order)?
            .into_iter()
            .filter(|p| re.is_match(p))
            .filter(|p| include_hidden || !glob::is_hidden(p))
            .collect();
        out.sort();
        Ok(out)
    }

    fn all_paths(&self, only_files: bool, order: Order) -> Result<Vec<String>> {
        let q = if only_files {
            format!("SELECT path FROM files{}", order.as_query_text())
        } else {
            format!(
                "SELECT path FROM (SELECT path FROM files UNION ALL SELECT path FROM dirs WHERE path <> ''){}",
                order.as_query_text()
            )
        };
        let paths = self
            .conn
            .prepare(&q)?
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(paths)
    }

    fn glob_single_segment(
        &self,
        seg: &glob::SingleWildcardSegment,
        recursive: bool,
        only_files: bool,
    ) -> Result<Vec<String>> {
        let re = Regex::new(&glob::glob_to_regex(&seg.segment_pattern, recursive))
            .map_err(|e| BarecatError::InvalidArgument(format!("bad glob segment: {e}")))?;
        if seg.is_last_segment {
            let mut out = Vec::new();
            for info in self.listdir_infos(&seg.prefix)? {
                let name = path_utils::basename(info.path());
                if re.is_match(name) && !(only_files && matches!(info, Info::Dir(_))) {
                    out.push(info.path().to_string());
                }
            }
            out.sort();
            Ok(out)
        } else {
            // Wildcard in a middle segment: resolve each matching immediate
            // subdirectory of the prefix, then check the literal suffix
            // beneath it directly rather than rescanning.
            let mut out = Vec::new();
            for name in self.listdir_names(&seg.prefix)? {
                let base = path_utils::basename(&name);
                if !re.is_match(base) {
                    continue;
                }
                let candidate = format!("{name}/{}", seg.suffix);
                if let Ok(info) = self.lookup(&candidate) {
                    if !(only_files && matches!(info, Info::Dir(_))) {
                        out.push(candidate);
                    }
                }
            }
            out.sort();
            Ok(out)
        }
    }

    // --- space allocation --------------------------------------------

    /// Find where a file of `size` bytes can be placed: first try to extend
    /// the current shard tail, then look for a hole left by a removed file,
    /// finally fall back to a brand-new shard.
    pub fn find_space(&mut self, size: u64) -> Result<Address> {
        let limit = self.shard_size_limit()? as u64;
        if size > limit {
            return Err(BarecatError::FileTooLarge { size, limit });
        }

        if let Some((shard, offset)) = self
            .conn
            .query_row(
                "SELECT shard, offset + size FROM files \
                 ORDER BY shard DESC, offset DESC LIMIT 1",
                [],
                |r| Ok((r.get::<_, u32>(0)?, r.get::<_, u64>(1)?)),
            )
            .optional()?
        {
            if offset + size <= limit {
                return Ok(Address { shard, offset, size });
            }
        }

        let gap = self
            .conn
            .query_row(
                "WITH gaps AS ( \
                   SELECT shard, offset + size AS gap_offset, \
                          LEAD(offset, 1, ?2) OVER (PARTITION BY shard ORDER BY offset) AS gap_end \
                   FROM files \
                 ) \
                 SELECT shard, gap_offset FROM gaps WHERE gap_end - gap_offset >= ?1 \
                 ORDER BY shard, gap_offset LIMIT 1",
                params![size, limit as i64],
                |r| Ok((r.get::<_, u32>(0)?, r.get::<_, u64>(1)?)),
            )
            .optional()?;
        if let Some((shard, offset)) = gap {
            return Ok(Address { shard, offset, size });
        }

        let new_shard = self.num_used_shards()?;
        Ok(Address {
            shard: new_shard,
            offset: 0,
            size,
        })
    }

    // --- integrity & treestats -----------------------------------------

    /// Recompute every directory's tree statistics from scratch and write
    /// them back. Used after bulk mutations performed with triggers
    /// disabled.
    pub fn update_treestats(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TEMPORARY TABLE IF NOT EXISTS tmp_file_counts AS \
             SELECT parent, COUNT(*) AS n, COALESCE(SUM(size), 0) AS total_size \
             FROM files GROUP BY parent;",
        )?;
        self.conn.execute_batch(
            "CREATE TEMPORARY TABLE IF NOT EXISTS tmp_subdir_counts AS \
             SELECT parent, COUNT(*) AS n FROM dirs WHERE path <> '' GROUP BY parent;",
        )?;
        // Tree aggregates: every file whose path starts with this dir's
        // path (or is directly in it) contributes to size_tree/num_files_tree.
        self.conn.execute(
            "UPDATE dirs SET
                num_files = COALESCE((SELECT n FROM tmp_file_counts WHERE parent = dirs.path), 0),
                num_subdirs = COALESCE((SELECT n FROM tmp_subdir_counts WHERE parent = dirs.path), 0),
                size_tree = (
                    SELECT COALESCE(SUM(size), 0) FROM files
                    WHERE path = dirs.path OR path GLOB (CASE WHEN dirs.path = '' THEN '*' ELSE dirs.path || '/*' END)
                ),
                num_files_tree = (
                    SELECT COUNT(*) FROM files
                    WHERE path = dirs.path OR path GLOB (CASE WHEN dirs.path = '' THEN '*' ELSE dirs.path || '/*' END)
                )",
            [],
        )?;
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS tmp_file_counts; DROP TABLE IF EXISTS tmp_subdir_counts;",
        )?;
        Ok(())
    }

    /// Cross-check `dirs`' cached tree statistics against a from-scratch
    /// recomputation, and run SQLite's own consistency and foreign-key
    /// checks. Collects up to ten mismatches before stopping, rather than
    /// aborting on the first.
    pub fn verify_integrity(&self) -> Result<()> {
        const MAX_MISMATCHES: usize = 10;

        let integrity: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        if integrity != "ok" {
            return Err(BarecatError::IntegrityError(format!(
                "PRAGMA integrity_check reported: {integrity}"
            )));
        }

        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let fk_violations: Vec<String> = stmt
            .query_map([], |r| {
                let table: String = r.get(0)?;
                let rowid: Option<i64> = r.get(1)?;
                Ok(format!("{table} row {rowid:?}"))
            })?
            .collect::<std::result::Result<_, _>>()?;
        if !fk_violations.is_empty() {
            return Err(BarecatError::IntegrityError(format!(
                "PRAGMA foreign_key_check found violations: {}",
                fk_violations.join("; ")
            )));
        }

        let mut mismatches: Vec<String> = Vec::new();
        let mut dir_stmt = self.conn.prepare(
            "SELECT path, num_files, num_subdirs, size_tree, num_files_tree FROM dirs",
        )?;
        let rows: Vec<(String, i64, i64, i64, i64)> = dir_stmt
            .query_map([], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        for (path, num_files, num_subdirs, size_tree, num_files_tree) in rows {
            if mismatches.len() >= MAX_MISMATCHES {
                break;
            }
            let actual_files: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM files WHERE parent = ?1",
                params![path],
                |r| r.get(0),
            )?;
            let actual_subdirs: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM dirs WHERE parent = ?1 AND path <> ''",
                params![path],
                |r| r.get(0),
            )?;
            if actual_files != num_files || actual_subdirs != num_subdirs {
                mismatches.push(format!(
                    "directory {path:?} has stale counts: cached ({num_files},{num_subdirs}), actual ({actual_files},{actual_subdirs})"
                ));
                continue;
            }
            let pattern = if path.is_empty() {
                "*".to_string()
            } else {
                format!("{}/*", path_utils::escape_glob_literal(&path))
            };
            let (actual_size, actual_count): (i64, i64) = self.conn.query_row(
                "SELECT COALESCE(SUM(size), 0), COUNT(*) FROM files WHERE path = ?1 OR path GLOB ?2",
                params![path, pattern],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            if actual_size != size_tree || actual_count != num_files_tree {
                mismatches.push(format!(
                    "directory {path:?} has stale tree stats: cached ({size_tree},{num_files_tree}), actual ({actual_size},{actual_count})"
                ));
            }
        }
        if !mismatches.is_empty() {
            return Err(BarecatError::IntegrityError(mismatches.join("; ")));
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        if self.mode == IndexMode::ReadWrite {
            self.conn.execute("PRAGMA optimize", [])?;
            self.conn.execute_batch("VACUUM;")?;
        }
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub struct NoTriggersGuard<'a> {
    index: &'a Index,
    restore: bool,
}

impl Drop for NoTriggersGuard<'_> {
    fn drop(&mut self) {
        if self.restore {
            let _ = self.index.set_triggers_enabled(true);
        }
    }
}

pub struct NoForeignKeysGuard<'a> {
    index: &'a Index,
    restore: bool,
}

impl Drop for NoForeignKeysGuard<'_> {
    fn drop(&mut self) {
        if self.restore {
            let _ = self.index.conn.pragma_update(None, "foreign_keys", "ON");
        }
    }
}

fn file_from_row(row: &rusqlite::Row) -> rusqlite::Result<BarecatFileInfo> {
    Ok(BarecatFileInfo {
        base: crate::common::BaseInfo {
            path: row.get(0)?,
            mode: row.get(1)?,
            uid: row.get(2)?,
            gid: row.get(3)?,
            mtime_ns: row.get(4)?,
        },
        shard: row.get(5)?,
        offset: row.get(6)?,
        size: row.get(7)?,
        crc32c: row.get(8)?,
    })
}

fn dir_from_row(row: &rusqlite::Row) -> rusqlite::Result<BarecatDirInfo> {
    Ok(BarecatDirInfo {
        base: crate::common::BaseInfo {
            path: row.get(0)?,
            mode: row.get(1)?,
            uid: row.get(2)?,
            gid: row.get(3)?,
            mtime_ns: row.get(4)?,
        },
        num_subdirs: row.get(5)?,
        num_files: row.get(6)?,
        size_tree: row.get(7)?,
        num_files_tree: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_index(dir: &Path) -> Index {
        Index::create(&dir.join("arch"), SHARD_SIZE_UNLIMITED).unwrap()
    }

    #[test]
    fn add_file_updates_root_treestats() {
        let dir = tempdir().unwrap();
        let idx = new_index(dir.path());
        let mut info = BarecatFileInfo::new("a/b.bin");
        info.size = 42;
        idx.add_dir(&BarecatDirInfo::new("a"), false).unwrap();
        idx.add_file(&info).unwrap();
        assert_eq!(idx.num_files().unwrap(), 1);
        assert_eq!(idx.total_size().unwrap(), 42);
    }

    #[test]
    fn duplicate_file_rejected() {
        let dir = tempdir().unwrap();
        let idx = new_index(dir.path());
        let info = BarecatFileInfo::new("a.bin");
        idx.add_file(&info).unwrap();
        let err = idx.add_file(&info).unwrap_err();
        assert!(matches!(err, BarecatError::FileExists(_)));
    }

    #[test]
    fn remove_recursively_clears_treestats() {
        let dir = tempdir().unwrap();
        let idx = new_index(dir.path());
        idx.add_dir(&BarecatDirInfo::new("a"), false).unwrap();
        let mut info = BarecatFileInfo::new("a/b.bin");
        info.size = 10;
        idx.add_file(&info).unwrap();
        idx.remove_recursively("a").unwrap();
        assert_eq!(idx.num_files().unwrap(), 0);
        assert_eq!(idx.total_size().unwrap(), 0);
        assert!(idx.lookup("a").is_err());
    }

    #[test]
    fn rename_dir_moves_subtree() {
        let dir = tempdir().unwrap();
        let idx = new_index(dir.path());
        idx.add_dir(&BarecatDirInfo::new("a"), false).unwrap();
        let mut info = BarecatFileInfo::new("a/b.bin");
        info.size = 5;
        idx.add_file(&info).unwrap();
        idx.rename_dir("a", "z").unwrap();
        assert!(idx.lookup_file("z/b.bin").is_ok());
        assert!(idx.lookup_file("a/b.bin").is_err());
    }

    #[test]
    fn verify_integrity_passes_on_consistent_index() {
        let dir = tempdir().unwrap();
        let idx = new_index(dir.path());
        idx.add_dir(&BarecatDirInfo::new("a"), false).unwrap();
        let mut info = BarecatFileInfo::new("a/b.bin");
        info.size = 7;
        idx.add_file(&info).unwrap();
        idx.verify_integrity().unwrap();
    }

    #[test]
    fn find_space_reuses_gap_after_removal() {
        let dir = tempdir().unwrap();
        let idx_dir = dir.path().join("arch");
        let mut idx = Index::create(&idx_dir, 1000).unwrap();
        for i in 0..3 {
            let mut info = BarecatFileInfo::new(&format!("f{i}.bin"));
            info.shard = 0;
            info.offset = i * 100;
            info.size = 100;
            idx.add_file(&info).unwrap();
        }
        idx.remove_file("f1.bin").unwrap();
        let addr = idx.find_space(100).unwrap();
        assert_eq!((addr.shard, addr.offset), (0, 100));
    }
}
