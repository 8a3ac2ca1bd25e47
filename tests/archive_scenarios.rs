//! End-to-end scenarios exercising the archive façade, ingest pipeline,
//! and defragmenter together against a real temp-directory archive.

use barecat::archive::{Archive, ArchiveMode};
use barecat::common::SHARD_SIZE_UNLIMITED;
use barecat::defrag;
use barecat::pipeline::{run_ingest, IngestOptions, IngestSource};
use tempfile::tempdir;

#[test]
fn s1_add_then_reopen_readonly_sees_same_contents() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("arch");
    {
        let mut arch = Archive::create(&prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
        arch.add("greeting.txt", b"hello barecat").unwrap();
        arch.close().unwrap();
    }
    let mut reopened = Archive::open(&prefix, ArchiveMode::Readonly, true).unwrap();
    assert_eq!(reopened.read("greeting.txt").unwrap(), b"hello barecat");
    assert!(reopened.add("nope.txt", b"x").is_err());
}

#[test]
fn s2_remove_last_file_truncates_shard_to_zero() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("arch");
    let mut arch = Archive::create(&prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
    arch.add("only.bin", &vec![7u8; 256]).unwrap();
    arch.remove("only.bin").unwrap();
    let shard_path = barecat::config::ArchivePaths::new(&prefix).shard_path(0);
    assert_eq!(std::fs::metadata(shard_path).unwrap().len(), 0);
}

fn file_addr(arch: &Archive, path: &str) -> (i64, i64, i64) {
    match arch.lookup(path).unwrap() {
        barecat::common::Info::File(f) => (f.shard, f.offset, f.size),
        barecat::common::Info::Dir(_) => panic!("{path} is a directory"),
    }
}

#[test]
fn s2_defrag_relocates_file_out_of_emptied_shard() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("arch");
    let mut arch = Archive::create(&prefix, 1000, false).unwrap();
    arch.add("a/b.txt", &vec![1u8; 600]).unwrap();
    arch.add("a/c.txt", &vec![2u8; 500]).unwrap();
    assert_eq!(file_addr(&arch, "a/b.txt"), (0, 0, 600));
    assert_eq!(file_addr(&arch, "a/c.txt"), (1, 0, 500));

    arch.remove("a/b.txt").unwrap();
    let shard0 = barecat::config::ArchivePaths::new(&prefix).shard_path(0);
    assert_eq!(std::fs::metadata(&shard0).unwrap().len(), 0);
    assert_eq!(arch.total_size().unwrap(), 500);

    defrag::defrag(&mut arch).unwrap();
    assert_eq!(file_addr(&arch, "a/c.txt"), (0, 0, 500));
    assert!(!barecat::config::ArchivePaths::new(&prefix)
        .shard_path(1)
        .exists());
    assert_eq!(arch.read("a/c.txt").unwrap(), vec![2u8; 500]);
}

#[test]
fn crash_recovery_truncates_last_shard_to_logical_end_on_open() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("arch");
    {
        let mut arch = Archive::create(&prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
        arch.add("a.bin", &vec![9u8; 100]).unwrap();
        arch.close().unwrap();
    }
    // Simulate a crash after `reserve` zero-filled extra bytes but before any
    // index row referenced them.
    let shard0 = barecat::config::ArchivePaths::new(&prefix).shard_path(0);
    let f = std::fs::OpenOptions::new().write(true).open(&shard0).unwrap();
    f.set_len(500).unwrap();
    drop(f);
    assert_eq!(std::fs::metadata(&shard0).unwrap().len(), 500);

    let arch = Archive::open(&prefix, ArchiveMode::ReadWrite, false).unwrap();
    drop(arch);
    assert_eq!(std::fs::metadata(&shard0).unwrap().len(), 100);
}

#[test]
fn s3_rename_directory_moves_whole_subtree() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("arch");
    let mut arch = Archive::create(&prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
    arch.add("old/a.bin", b"1").unwrap();
    arch.add("old/b.bin", b"2").unwrap();
    arch.rename("old", "new").unwrap();
    assert_eq!(arch.read("new/a.bin").unwrap(), b"1");
    assert_eq!(arch.read("new/b.bin").unwrap(), b"2");
    assert!(arch.lookup("old").is_err());
}

#[test]
fn s4_shard_rolls_over_when_limit_exceeded() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("arch");
    let mut arch = Archive::create(&prefix, 512, false).unwrap();
    for i in 0..10 {
        arch.add(&format!("f{i}.bin"), &vec![i as u8; 100]).unwrap();
    }
    assert!(barecat::config::ArchivePaths::new(&prefix)
        .shard_path(1)
        .exists());
}

#[test]
fn s5_defrag_after_removals_eliminates_all_gaps() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("arch");
    let mut arch = Archive::create(&prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
    for i in 0..5 {
        arch.add(&format!("f{i}.bin"), &vec![i as u8; 64]).unwrap();
    }
    arch.remove("f1.bin").unwrap();
    arch.remove("f3.bin").unwrap();
    assert!(defrag::needs_defrag(&arch).unwrap());
    defrag::defrag(&mut arch).unwrap();
    assert!(!defrag::needs_defrag(&arch).unwrap());
    for i in [0, 2, 4] {
        assert_eq!(arch.read(&format!("f{i}.bin")).unwrap(), vec![i as u8; 64]);
    }
}

#[test]
fn s6_bulk_ingest_then_verify_integrity() {
    let src = tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("a/b")).unwrap();
    for i in 0..20 {
        std::fs::write(src.path().join(format!("a/b/file{i}.bin")), vec![i as u8; 37]).unwrap();
    }

    let out = tempdir().unwrap();
    let prefix = out.path().join("arch");
    let archive = Archive::create(&prefix, SHARD_SIZE_UNLIMITED, false).unwrap();
    let opts = IngestOptions {
        source: IngestSource::Directory {
            root: src.path().to_path_buf(),
            strip_root: true,
        },
        workers: 4,
        channel_capacity: 0,
        strict: true,
        show_progress: false,
    };
    let (mut archive, summary) = run_ingest(archive, opts).unwrap();
    assert_eq!(summary.num_files, 20);
    archive.verify_integrity().unwrap();
}
