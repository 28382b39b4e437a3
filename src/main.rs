//! Command line entry point: load the snapshot, dispatch the subcommand

use anyhow::{Context, Result};
use clap::Parser;

use snapfuzz::{commands, CommandLineArgs, Snapshot, SubCommand};

fn main() -> Result<()> {
    let args = CommandLineArgs::parse();

    env_logger::Builder::new()
        .filter_level(args.verbosity.log_level_filter())
        .init();

    let mut snapshot = Snapshot::load(&args.snapshot)
        .with_context(|| format!("failed to load snapshot {}", args.snapshot.display()))?;

    match args.command {
        SubCommand::Run(ref run_args) => commands::run::run(&mut snapshot, run_args),
        SubCommand::Fuzz(ref fuzz_args) => commands::fuzz::fuzz(&mut snapshot, fuzz_args),
    }
}
