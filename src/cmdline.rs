//! Command line arguments

use clap::Parser;

use std::path::PathBuf;

use crate::backend::BackendType;
use crate::trace::TraceType;

/// Replay and fuzz a frozen guest snapshot
#[derive(Parser, Debug)]
pub struct CommandLineArgs {
    /// Path to the directory containing the target snapshot state
    /// (`mem.dmp`, `regs.json`, optional `symbol-store.json` and
    /// `config.toml`)
    #[clap(short, long, default_value = "./snapshot")]
    pub snapshot: PathBuf,

    /// Verbosity to print information messages
    #[clap(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity,

    /// Command to execute
    #[clap(subcommand)]
    pub command: SubCommand,
}

/// Subcommands available for the command line
#[derive(Parser, Debug)]
pub enum SubCommand {
    /// Execute a single input and write its trace
    Run(Run),

    /// Fuzz the snapshot with mutated inputs
    Fuzz(Fuzz),
}

/// Run subcommand
#[derive(Parser, Debug)]
pub struct Run {
    /// Input file injected into the guest before execution
    pub input: Option<PathBuf>,

    /// Execution backend (emulator, kvm, whv)
    #[clap(short, long, default_value = "emulator")]
    pub backend: BackendType,

    /// Execution limit for the run. Instructions for the emulator, seconds
    /// for the hardware backends. Zero disables the limit.
    #[clap(short, long, default_value_t = 0)]
    pub limit: u64,

    /// Trace type to record (none, rip, uniquerip, tenet). Defaults to the
    /// backend's preferred type.
    #[clap(short, long)]
    pub trace_type: Option<TraceType>,

    /// Directory the trace file is written into. Defaults to the snapshot
    /// directory.
    #[clap(long)]
    pub trace_dir: Option<PathBuf>,
}

/// Fuzz subcommand
#[derive(Parser, Debug)]
pub struct Fuzz {
    /// Execution backend (emulator, kvm, whv)
    #[clap(short, long, default_value = "emulator")]
    pub backend: BackendType,

    /// Execution limit per run. Instructions for the emulator, seconds for
    /// the hardware backends.
    #[clap(short, long, default_value_t = 1_000_000)]
    pub limit: u64,

    /// Number of runs to execute before stopping. Zero fuzzes forever.
    #[clap(short, long, default_value_t = 0)]
    pub runs: u64,

    /// Seed for the mutation RNG, for reproducible campaigns
    #[clap(long)]
    pub seed: Option<u64>,

    /// Directory with the initial input corpus. Defaults to
    /// `<snapshot_dir>/input`.
    #[clap(short, long)]
    pub input_dir: Option<PathBuf>,

    /// Use control flow edge coverage feedback (emulator only)
    #[clap(short, long)]
    pub edges: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_parse() {
        let args = CommandLineArgs::parse_from([
            "snapfuzz",
            "--snapshot",
            "/tmp/proj",
            "run",
            "input.bin",
            "--backend",
            "emulator",
            "--limit",
            "5000",
            "--trace-type",
            "rip",
        ]);

        assert_eq!(args.snapshot, PathBuf::from("/tmp/proj"));
        let SubCommand::Run(run) = args.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.input, Some(PathBuf::from("input.bin")));
        assert_eq!(run.backend, BackendType::Emulator);
        assert_eq!(run.limit, 5000);
        assert_eq!(run.trace_type, Some(TraceType::Rip));
    }

    #[test]
    fn fuzz_args_defaults() {
        let args = CommandLineArgs::parse_from(["snapfuzz", "fuzz"]);

        assert_eq!(args.snapshot, PathBuf::from("./snapshot"));
        let SubCommand::Fuzz(fuzz) = args.command else {
            panic!("expected fuzz subcommand");
        };
        assert_eq!(fuzz.backend, BackendType::Emulator);
        assert_eq!(fuzz.limit, 1_000_000);
        assert_eq!(fuzz.runs, 0);
        assert!(!fuzz.edges);
    }
}
