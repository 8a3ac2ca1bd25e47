//! `barecat` CLI: create, extract, merge, verify, and defragment archives.

use std::time::Instant;

use anyhow::Result;
use clap::Parser;

use barecat::cli::{dispatch, Cli};
use barecat::logger::setup_logging;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    dispatch(cli)?;

    log::debug!("total time: {:?}", start_time.elapsed());
    Ok(())
}
