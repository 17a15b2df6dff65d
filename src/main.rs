//! casewatch CLI: watch a case, run a worker agent, or report case status.

use anyhow::Result;
use casewatch::engine::arg_parser::Cli;
use casewatch::engine::handle_run;
use clap::Parser;
use std::time::Instant;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(())
}
