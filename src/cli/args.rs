//! Command-line surface (§6): subcommands mirroring the original tool's
//! create/extract/merge/verify/defrag/convert operations, built with
//! `clap` derive the way the teacher's own CLI skeleton was.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "barecat", version, about = "Sharded archive format for huge ML datasets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new archive by ingesting a list of paths read from stdin
    /// (or `--file`), one per line unless `--null` is given.
    Create {
        /// Archive path prefix (files land at `<prefix>-shard-NNNNN` etc).
        target: PathBuf,
        /// Read the path list from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Paths are NUL-delimited instead of newline-delimited.
        #[arg(long)]
        null: bool,
        /// Shard size limit, e.g. "1G", "500M". Defaults to unlimited.
        #[arg(long)]
        shard_size_limit: Option<String>,
        /// Number of ingest worker threads. Auto-detected from drive type if omitted.
        #[arg(long, default_value_t = 0)]
        workers: usize,
        /// Replace an existing archive at `target` instead of failing.
        #[arg(long)]
        overwrite: bool,
        /// Abort on the first file error instead of skipping and continuing.
        #[arg(long)]
        strict: bool,
    },

    /// Extract every file from an archive into a directory.
    Extract {
        archive: PathBuf,
        destination: PathBuf,
    },

    /// Extract a single file from an archive to stdout or a destination path.
    ExtractSingle {
        archive: PathBuf,
        path: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Byte-copy merge of N archives into a freshly created archive.
    Merge {
        /// Archives to merge, in order.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        shard_size_limit: Option<String>,
        #[arg(long)]
        ignore_duplicates: bool,
    },

    /// Verify an archive's integrity.
    Verify {
        archive: PathBuf,
        /// Skip the full CRC32C sweep and only check cached tree statistics.
        #[arg(long)]
        quick: bool,
    },

    /// Defragment an archive, closing gaps left by removed files.
    Defrag {
        archive: PathBuf,
        /// Defragment within a time budget instead of exhaustively.
        #[arg(long)]
        quick: bool,
        #[arg(long, default_value_t = 5)]
        time_max_seconds: u64,
    },

    /// Create a new archive by walking one or more directory trees
    /// recursively, instead of reading an explicit path list.
    CreateRecursive {
        /// Directories to walk.
        #[arg(required = true)]
        roots: Vec<PathBuf>,
        /// Archive path prefix (files land at `<target>-shard-NNNNN` etc).
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        shard_size_limit: Option<String>,
        #[arg(long, default_value_t = 0)]
        workers: usize,
        /// Store paths relative to each root itself, without its own directory name.
        #[arg(long)]
        strip_root: bool,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        strict: bool,
    },

    /// Link-based merge of N archives: shards are referenced by symlink
    /// rather than copied.
    MergeSymlink {
        /// Archives to merge, in order.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output: PathBuf,
    },

    /// Convert a plain directory tree directly into a new archive.
    Archive2Barecat {
        source: PathBuf,
        target: PathBuf,
        #[arg(long)]
        shard_size_limit: Option<String>,
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },

    /// Convert an archive back into a plain directory tree.
    Barecat2Archive { archive: PathBuf, destination: PathBuf },
}
