//! Defragmenter (§4.5): closes the gaps left behind by removed files,
//! either exhaustively (`defrag`) or within a time budget, working
//! backwards from the highest addresses (`defrag_quick`). Grounded on
//! `defrag.py`.

use std::time::{Duration, Instant};

use crate::archive::Archive;
use crate::error::Result;
use crate::shard::Address;

/// A gap between the end of one stored file and the start of the next (or
/// the shard's logical end), available for a later file to move into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentGap {
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefragInfo {
    pub num_gaps: usize,
    pub total_gap_bytes: u64,
}

/// Every gap in the archive, ordered by address — the same window-function
/// shape `Index::find_space` uses for its middle tier, but returning every
/// match instead of just the first.
///
/// The window-function scan alone only sees gaps *between* two files in the
/// same shard, so a shard with zero files, or one whose first file doesn't
/// start at offset 0, is invisible to it; both cases are synthesized as an
/// explicit leading gap so an emptied-out shard is still reclaimable.
pub fn get_gaps(archive: &Archive) -> Result<Vec<FragmentGap>> {
    let conn = archive.index.connection();
    let mut stmt = conn.prepare(
        "WITH gaps AS ( \
           SELECT shard, offset + size AS gap_offset, \
                  LEAD(offset, 1, NULL) OVER (PARTITION BY shard ORDER BY offset) AS next_offset \
           FROM files \
         ) \
         SELECT shard, gap_offset, next_offset - gap_offset AS gap_size \
         FROM gaps WHERE next_offset IS NOT NULL AND next_offset > gap_offset",
    )?;
    let mut gaps = stmt
        .query_map([], |r| {
            Ok(FragmentGap {
                shard: r.get(0)?,
                offset: r.get::<_, i64>(1)? as u64,
                size: r.get::<_, i64>(2)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let limit: i64 = conn.query_row(
        "SELECT value_int FROM config WHERE key = 'shard_size_limit'",
        [],
        |r| r.get(0),
    )?;
    let num_shards = archive.index.num_used_shards()?;
    for shard in 0..num_shards {
        let first_offset: Option<i64> = conn.query_row(
            "SELECT MIN(offset) FROM files WHERE shard = ?1",
            rusqlite::params![shard],
            |r| r.get(0),
        )?;
        let gap_end = first_offset.unwrap_or(limit).max(0) as u64;
        if gap_end > 0 {
            gaps.push(FragmentGap { shard, offset: 0, size: gap_end });
        }
    }
    gaps.sort_by_key(|g| (g.shard, g.offset));
    Ok(gaps)
}

pub fn needs_defrag(archive: &Archive) -> Result<bool> {
    Ok(!get_gaps(archive)?.is_empty())
}

pub fn get_defrag_info(archive: &Archive) -> Result<DefragInfo> {
    let gaps = get_gaps(archive)?;
    Ok(DefragInfo {
        num_gaps: gaps.len(),
        total_gap_bytes: gaps.iter().map(|g| g.size).sum(),
    })
}

/// Relocate one file into an earlier gap, invariant: the copy only ever
/// moves bytes to a lower (shard, offset) address, so source and
/// destination never overlap in a way that would corrupt the read.
fn move_to_earlier_gap(archive: &mut Archive, path: &str, dest: Address) -> Result<()> {
    let info = archive.index.lookup_file(path)?;
    let src = Address {
        shard: info.shard as u32,
        offset: info.offset as u64,
        size: info.size as u64,
    };
    let data = archive.shards.read_from_address(src, info.crc32c)?;
    archive.shards.write_at(dest, &data)?;
    archive.index.move_file(path, dest.shard, dest.offset)?;
    Ok(())
}

/// Full defragmentation: repeatedly pull the lowest-addressed gap and the
/// lowest-addressed file that comes after it, and move that file into the
/// gap, until no gaps remain. Always leaves `reopen_shards`-equivalent
/// cleanup to run even on error.
pub fn defrag(archive: &mut Archive) -> Result<()> {
    archive.raise_if_readonly()?;
    let result = defrag_inner(archive);
    let ends = archive.index.logical_shard_ends()?;
    archive.shards.truncate_all_to_logical(&ends)?;
    result
}

fn defrag_inner(archive: &mut Archive) -> Result<()> {
    loop {
        let gaps = get_gaps(archive)?;
        let Some(gap) = gaps.into_iter().next() else {
            break;
        };
        let Some(path) = next_file_after(archive, gap)? else {
            continue;
        };
        let info = archive.index.lookup_file(&path)?;
        let dest = Address {
            shard: gap.shard,
            offset: gap.offset,
            size: info.size as u64,
        };
        move_to_earlier_gap(archive, &path, dest)?;
    }
    Ok(())
}

/// The file with the next-lowest `(shard, offset)` address strictly after
/// `gap`'s own address, searching across every shard rather than just
/// `gap.shard` — an empty shard's synthesized gap has no later file within
/// the same shard, so the fill must come from whatever shard holds the next
/// file in overall address order.
fn next_file_after(archive: &Archive, gap: FragmentGap) -> Result<Option<String>> {
    use rusqlite::OptionalExtension;
    let conn = archive.index.connection();
    let path: Option<String> = conn
        .query_row(
            "SELECT path FROM files \
             WHERE shard > ?1 OR (shard = ?1 AND offset > ?2) \
             ORDER BY shard, offset LIMIT 1",
            rusqlite::params![gap.shard, gap.offset],
            |r| r.get(0),
        )
        .optional()?;
    Ok(path)
}

/// Time-bounded defragmentation: walk files in reverse address order and,
/// for each, move it into the first gap that precedes it, stopping once
/// `time_max` elapses. Unlike [`defrag`], this never guarantees a
/// completely gap-free archive.
pub fn defrag_quick(archive: &mut Archive, time_max: Duration) -> Result<()> {
    archive.raise_if_readonly()?;
    let deadline = Instant::now() + time_max;
    loop {
        if Instant::now() >= deadline {
            break;
        }
        let gaps = get_gaps(archive)?;
        if gaps.is_empty() {
            break;
        }
        let mut moved_any = false;
        for gap in gaps {
            if Instant::now() >= deadline {
                break;
            }
            if let Some(path) = next_file_after(archive, gap)? {
                let info = archive.index.lookup_file(&path)?;
                if (info.size as u64) <= gap.size {
                    let dest = Address {
                        shard: gap.shard,
                        offset: gap.offset,
                        size: info.size as u64,
                    };
                    move_to_earlier_gap(archive, &path, dest)?;
                    moved_any = true;
                }
            }
        }
        if !moved_any {
            break;
        }
    }
    let ends = archive.index.logical_shard_ends()?;
    archive.shards.truncate_all_to_logical(&ends)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SHARD_SIZE_UNLIMITED;
    use tempfile::tempdir;

    #[test]
    fn defrag_closes_gap_left_by_removal() {
        let dir = tempdir().unwrap();
        let mut arch = crate::archive::Archive::create(
            &dir.path().join("arch"),
            SHARD_SIZE_UNLIMITED,
            false,
        )
        .unwrap();
        arch.add("a.bin", &vec![1u8; 100]).unwrap();
        arch.add("b.bin", &vec![2u8; 100]).unwrap();
        arch.add("c.bin", &vec![3u8; 100]).unwrap();
        arch.remove("b.bin").unwrap();
        assert!(needs_defrag(&arch).unwrap());
        defrag(&mut arch).unwrap();
        assert!(!needs_defrag(&arch).unwrap());
        assert_eq!(arch.read("c.bin").unwrap(), vec![3u8; 100]);
    }

    #[test]
    fn defrag_quick_respects_time_budget_shape() {
        let dir = tempdir().unwrap();
        let mut arch = crate::archive::Archive::create(
            &dir.path().join("arch"),
            SHARD_SIZE_UNLIMITED,
            false,
        )
        .unwrap();
        arch.add("a.bin", &vec![1u8; 50]).unwrap();
        arch.add("b.bin", &vec![2u8; 50]).unwrap();
        arch.remove("a.bin").unwrap();
        defrag_quick(&mut arch, Duration::from_secs(5)).unwrap();
        assert_eq!(arch.read("b.bin").unwrap(), vec![2u8; 50]);
    }
}
