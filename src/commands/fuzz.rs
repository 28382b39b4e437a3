//! Coverage guided fuzzing loop

use anyhow::{ensure, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::addrs::VirtAddr;
use crate::backend::{self, RunOutcome};
use crate::cmdline;
use crate::mutators::mutate_input;
use crate::sanitize::sanitize;
use crate::snapshot::Snapshot;
use crate::trace::TraceType;
use crate::utils::{write_corpus_input, write_crash_input};
use crate::FxIndexSet;

/// Campaign-wide counters reported in the periodic stats line
#[derive(Default)]
struct Stats {
    /// Total executions
    execs: u64,

    /// Executions that crashed
    crashes: u64,

    /// Executions that hit the limit
    timeouts: u64,

    /// Dirty pages restored, summed over all restores
    dirty_pages: u64,
}

/// Fuzz the snapshot until `--runs` executions (or forever when zero)
pub fn fuzz(snapshot: &mut Snapshot, args: &cmdline::Fuzz) -> Result<()> {
    ensure!(
        !args.edges || args.backend.supports_edge_coverage(),
        "the {} backend cannot record edge coverage",
        args.backend
    );

    {
        let memory = snapshot
            .memory
            .read()
            .map_err(|_| anyhow::anyhow!("clean snapshot lock poisoned"))?;
        sanitize(&mut snapshot.regs, &memory)?;
    }

    let project_dir = snapshot
        .path
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let mut backend = backend::create(args.backend, snapshot)?;
    backend.set_limit(args.limit);
    backend.set_trace_type(TraceType::UniqueRip)?;
    if args.edges {
        backend.enable_edge_coverage()?;
    }

    let max_input_size = snapshot.config.max_input_size;
    let input_dir = args
        .input_dir
        .clone()
        .unwrap_or_else(|| project_dir.join("input"));
    let mut corpus = load_corpus(&input_dir, &project_dir.join("corpus"), max_input_size)?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    log::info!(
        "fuzzing via {} with {} corpus inputs, limit {} {}",
        args.backend,
        corpus.len(),
        args.limit,
        args.backend.limit_unit(),
    );

    let mut coverage: FxIndexSet<VirtAddr> = FxIndexSet::default();
    let mut edge_count = 0;
    let mut stats = Stats::default();

    let start = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_execs = 0;

    loop {
        if args.runs != 0 && stats.execs >= args.runs {
            break;
        }

        let mut input = corpus[rng.gen_range(0..corpus.len())].clone();
        mutate_input(&mut input, &corpus, &mut rng, max_input_size);

        backend.restore()?;
        let outcome = backend.run(&input)?;
        stats.execs += 1;
        stats.dirty_pages += backend.dirty_pages() as u64;

        match outcome {
            RunOutcome::Crashed(fault) => {
                stats.crashes += 1;
                if let Some(path) = write_crash_input(&project_dir, &fault, &input)? {
                    log::info!("new crash ({fault}) saved to {}", path.display());
                }
            }

            RunOutcome::Completed | RunOutcome::LimitExceeded => {
                if outcome == RunOutcome::LimitExceeded {
                    stats.timeouts += 1;
                }

                // Keep inputs that reach anything not seen before
                let tracer = backend.take_trace();
                let mut new_coverage = false;
                for rip in tracer.unique_rips() {
                    new_coverage |= coverage.insert(*rip);
                }

                if let Some(edges) = backend.edges() {
                    if edges.len() > edge_count {
                        edge_count = edges.len();
                        new_coverage = true;
                    }
                }

                if new_coverage {
                    if let Some(path) = write_corpus_input(&project_dir, &input)? {
                        log::debug!("coverage increased, keeping {}", path.display());
                    }
                    corpus.push(input);
                }
            }
        }

        if last_stats.elapsed() >= snapshot.config.stats_interval {
            let interval_execs = stats.execs - last_execs;
            let rate = interval_execs as f64 / last_stats.elapsed().as_secs_f64();
            log::info!(
                "execs {} ({rate:.0}/sec) | corpus {} | coverage {} | edges {} | crashes {} | timeouts {} | avg dirty {:.1}",
                stats.execs,
                corpus.len(),
                coverage.len(),
                edge_count,
                stats.crashes,
                stats.timeouts,
                stats.dirty_pages as f64 / stats.execs as f64,
            );
            last_stats = Instant::now();
            last_execs = stats.execs;
        }
    }

    write_coverage_file(&project_dir, &coverage)?;

    log::info!(
        "campaign done: {} execs in {:?}, {} crashes, {} coverage addresses",
        stats.execs,
        start.elapsed(),
        stats.crashes,
        coverage.len(),
    );

    Ok(())
}

/// Read every file in the seed directory and in the project's own corpus
/// directory, so a resumed campaign picks up its previous finds. An empty
/// corpus is seeded with one zero-filled input.
fn load_corpus(
    input_dir: &Path,
    corpus_dir: &Path,
    max_input_size: usize,
) -> Result<Vec<Vec<u8>>> {
    let mut corpus = Vec::new();

    for dir in [input_dir, corpus_dir] {
        if !dir.is_dir() {
            continue;
        }

        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to read corpus dir {}", dir.display()))?
        {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let mut bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read corpus input {}", path.display()))?;
            bytes.truncate(max_input_size);
            corpus.push(bytes);
        }
    }

    if corpus.is_empty() {
        corpus.push(vec![0u8; max_input_size.min(64)]);
    }

    Ok(corpus)
}

/// Write the cumulative coverage addresses, one per line
fn write_coverage_file(project_dir: &Path, coverage: &FxIndexSet<VirtAddr>) -> Result<()> {
    let path = project_dir.join("coverage.addresses");
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?,
    );

    for addr in coverage {
        writeln!(out, "{:#x}", addr.0)?;
    }

    out.flush()?;
    log::info!("wrote {} coverage addresses to {}", coverage.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;
    use crate::config::Config;
    use crate::memory::Memory;
    use crate::snapshot::Snapshot;
    use crate::testutil;

    use std::sync::{Arc, RwLock};

    fn fuzz_args(runs: u64, edges: bool) -> cmdline::Fuzz {
        cmdline::Fuzz {
            backend: BackendType::Emulator,
            limit: 10_000,
            runs,
            seed: Some(0x1337),
            input_dir: None,
            edges,
        }
    }

    /// Snapshot whose project directory is a tempdir, taking input at the
    /// data page
    fn project_snapshot(dir: &Path, code: &[u8]) -> Snapshot {
        let memory = Memory::from_bytes(&testutil::build_image(code)).unwrap();
        let config = Config {
            input_addr: Some(VirtAddr(testutil::DATA_VADDR)),
            ..Config::default()
        };

        let mut snapshot =
            Snapshot::from_parts(testutil::build_regs(), Arc::new(RwLock::new(memory)), config);
        snapshot.path = Some(dir.to_path_buf());
        snapshot
    }

    #[test]
    fn crashing_guest_produces_crash_files() {
        let dir = tempfile::tempdir().unwrap();

        // mov rax, [0x500000] ; unmapped read on every run
        let mut snapshot =
            project_snapshot(dir.path(), &[0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x50, 0x00]);

        fuzz(&mut snapshot, &fuzz_args(5, false)).unwrap();

        let crash_dir = dir.path().join("crashes").join("read_unmapped_0x500000");
        assert!(crash_dir.is_dir());
        assert!(std::fs::read_dir(&crash_dir).unwrap().next().is_some());
    }

    #[test]
    fn completing_guest_records_coverage() {
        let dir = tempfile::tempdir().unwrap();

        let mut snapshot = project_snapshot(dir.path(), &[0x90, 0xf4]);
        fuzz(&mut snapshot, &fuzz_args(5, false)).unwrap();

        let coverage = std::fs::read_to_string(dir.path().join("coverage.addresses")).unwrap();
        let lines: Vec<_> = coverage.lines().collect();
        assert!(lines.contains(&format!("{:#x}", testutil::CODE_VADDR).as_str()));
        assert!(lines.contains(&format!("{:#x}", testutil::CODE_VADDR + 1).as_str()));

        // Nothing crashed
        assert!(!dir.path().join("crashes").exists());
    }

    #[test]
    fn first_run_adds_the_seed_input_to_the_corpus() {
        let dir = tempfile::tempdir().unwrap();

        let mut snapshot = project_snapshot(dir.path(), &[0xf4]);
        fuzz(&mut snapshot, &fuzz_args(1, false)).unwrap();

        // The sole run reached new coverage, so its input was kept
        let corpus_dir = dir.path().join("corpus");
        assert!(corpus_dir.is_dir());
        assert_eq!(std::fs::read_dir(&corpus_dir).unwrap().count(), 1);
    }

    #[test]
    fn resumed_campaign_reloads_previous_finds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("input")).unwrap();
        std::fs::write(dir.path().join("input/seed"), b"AAAA").unwrap();
        std::fs::create_dir(dir.path().join("corpus")).unwrap();
        std::fs::write(dir.path().join("corpus/find"), b"BBBB").unwrap();

        let corpus = load_corpus(
            &dir.path().join("input"),
            &dir.path().join("corpus"),
            0x1000,
        )
        .unwrap();

        assert_eq!(corpus.len(), 2);
        assert!(corpus.contains(&b"AAAA".to_vec()));
        assert!(corpus.contains(&b"BBBB".to_vec()));
    }

    #[test]
    fn edge_coverage_on_hardware_backend_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshot = project_snapshot(dir.path(), &[0xf4]);

        let mut args = fuzz_args(1, true);
        args.backend = BackendType::Kvm;

        assert!(fuzz(&mut snapshot, &args).is_err());
    }
}
