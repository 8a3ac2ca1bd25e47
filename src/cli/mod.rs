pub mod args;
pub mod commands;

use args::Commands;
pub use args::Cli;

use crate::error::Result;

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Create {
            target,
            file,
            null,
            shard_size_limit,
            workers,
            overwrite,
            strict,
        } => commands::create(
            file.as_deref(),
            null,
            &target,
            shard_size_limit.as_deref(),
            workers,
            overwrite,
            strict,
        ),
        Commands::Extract { archive, destination } => commands::extract(&archive, &destination),
        Commands::ExtractSingle { archive, path, out } => {
            commands::extract_single(&archive, &path, out.as_deref())
        }
        Commands::Merge {
            inputs,
            output,
            shard_size_limit,
            ignore_duplicates,
        } => commands::merge(&inputs, &output, shard_size_limit.as_deref(), ignore_duplicates),
        Commands::Verify { archive, quick } => commands::verify(&archive, quick),
        Commands::Defrag {
            archive,
            quick,
            time_max_seconds,
        } => commands::defrag_cmd(&archive, quick, time_max_seconds),
        Commands::CreateRecursive {
            roots,
            target,
            shard_size_limit,
            workers,
            strip_root,
            overwrite,
            strict,
        } => commands::create_recursive(
            &roots,
            &target,
            shard_size_limit.as_deref(),
            workers,
            strip_root,
            overwrite,
            strict,
        ),
        Commands::MergeSymlink { inputs, output } => commands::merge_symlink(&inputs, &output),
        Commands::Archive2Barecat {
            source,
            target,
            shard_size_limit,
            workers,
        } => commands::archive2barecat(&source, &target, shard_size_limit.as_deref(), workers),
        Commands::Barecat2Archive { archive, destination } => {
            commands::barecat2archive(&archive, &destination)
        }
    }
}
