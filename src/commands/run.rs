//! Execute a single input against the snapshot and write its trace

use anyhow::{ensure, Context, Result};

use std::path::PathBuf;

use crate::backend;
use crate::cmdline;
use crate::sanitize::sanitize;
use crate::snapshot::Snapshot;
use crate::trace::TraceType;

/// Run one input through the chosen backend and write the resulting trace
/// next to the snapshot (or into `--trace-dir`)
pub fn run(snapshot: &mut Snapshot, args: &cmdline::Run) -> Result<()> {
    let input = match &args.input {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("failed to read input {}", path.display()))?,
        None => Vec::new(),
    };

    {
        let memory = snapshot
            .memory
            .read()
            .map_err(|_| anyhow::anyhow!("clean snapshot lock poisoned"))?;
        sanitize(&mut snapshot.regs, &memory)?;
    }

    let trace_type = args.trace_type.unwrap_or(args.backend.default_trace_type());
    ensure!(
        args.backend.supports_trace_type(trace_type),
        "the {} backend cannot record {trace_type} traces",
        args.backend
    );

    let mut backend = backend::create(args.backend, snapshot)?;
    backend.set_limit(args.limit);
    backend.set_trace_type(trace_type)?;

    // Hardware backends only see every instruction when stepping
    if trace_type == TraceType::Rip {
        backend.enable_single_step()?;
    }

    backend.restore()?;

    log::info!(
        "running {} via {} ({} {} limit)",
        args.input
            .as_deref()
            .map_or_else(|| "empty input".to_string(), |p| p.display().to_string()),
        args.backend,
        args.limit,
        args.backend.limit_unit(),
    );

    let outcome = backend.run(&input)?;
    let regs = backend.regs();

    log::info!("run finished: {outcome}");
    log::info!("  rip {:#x} rsp {:#x} rax {:#x}", regs.rip, regs.rsp, regs.rax);

    let tracer = backend.take_trace();
    if trace_type != TraceType::None {
        let stem = args
            .input
            .as_deref()
            .and_then(|p| p.file_stem())
            .map_or_else(|| "run".to_string(), |s| s.to_string_lossy().into_owned());

        let out_dir = args
            .trace_dir
            .clone()
            .or_else(|| snapshot.path.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let path = out_dir.join(format!("{stem}.{}", trace_type.file_extension()));
        tracer
            .write_to(&path, snapshot.symbols.as_deref())
            .with_context(|| format!("failed to write trace {}", path.display()))?;

        log::info!("wrote {} trace entries to {}", tracer.len(), path.display());
    }

    println!("{outcome}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::VirtAddr;
    use crate::backend::BackendType;
    use crate::testutil;
    use crate::trace::parse_rip_trace;

    #[test]
    fn run_writes_a_rip_trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("crash-1.bin");
        std::fs::write(&input_path, b"").unwrap();

        let mut snapshot = testutil::snapshot_with_code(&[0x90, 0xf4]);
        let args = cmdline::Run {
            input: Some(input_path),
            backend: BackendType::Emulator,
            limit: 100,
            trace_type: Some(TraceType::Rip),
            trace_dir: Some(dir.path().to_path_buf()),
        };

        run(&mut snapshot, &args).unwrap();

        let trace_path = dir.path().join("crash-1.trace");
        let rips = parse_rip_trace(&trace_path).unwrap();
        assert_eq!(
            rips,
            vec![
                VirtAddr(testutil::CODE_VADDR),
                VirtAddr(testutil::CODE_VADDR + 1)
            ]
        );
    }

    #[test]
    fn run_without_input_uses_default_stem() {
        let dir = tempfile::tempdir().unwrap();

        let mut snapshot = testutil::snapshot_with_code(&[0xf4]);
        let args = cmdline::Run {
            input: None,
            backend: BackendType::Emulator,
            limit: 0,
            trace_type: Some(TraceType::UniqueRip),
            trace_dir: Some(dir.path().to_path_buf()),
        };

        run(&mut snapshot, &args).unwrap();
        assert!(dir.path().join("run.cov").exists());
    }

    #[test]
    fn unsupported_trace_type_is_rejected_up_front() {
        let mut snapshot = testutil::snapshot_with_code(&[0xf4]);
        let args = cmdline::Run {
            input: None,
            backend: BackendType::Kvm,
            limit: 0,
            trace_type: Some(TraceType::Tenet),
            trace_dir: None,
        };

        assert!(run(&mut snapshot, &args).is_err());
    }
}
