//! Execution trace recording and serialization
//!
//! A [`Tracer`] is scoped to exactly one run. Backends feed it instruction
//! pointers (and for Tenet traces, register deltas and memory accesses)
//! while the guest executes; the orchestrator takes it at the run boundary
//! and flushes it to a file.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::addrs::VirtAddr;
use crate::regs::GuestRegs;
use crate::symbols::{get_symbol, Symbol};
use crate::FxIndexSet;

/// Granularity and format of the recorded execution history
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum TraceType {
    /// No trace is recorded
    #[default]
    None,

    /// Full ordered instruction pointer stream
    Rip,

    /// Deduplicated instruction pointers, insertion ordered
    UniqueRip,

    /// Register and memory delta trace consumed by the Tenet trace explorer
    Tenet,
}

impl TraceType {
    /// File extension used for trace files of this type
    #[must_use]
    pub fn file_extension(self) -> &'static str {
        match self {
            TraceType::None => "none",
            TraceType::Rip => "trace",
            TraceType::UniqueRip => "cov",
            TraceType::Tenet => "tenet.txt",
        }
    }
}

impl FromStr for TraceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(TraceType::None),
            "rip" => Ok(TraceType::Rip),
            "uniquerip" | "cov" => Ok(TraceType::UniqueRip),
            "tenet" => Ok(TraceType::Tenet),
            _ => Err(format!("unknown trace type: {s}")),
        }
    }
}

impl std::fmt::Display for TraceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TraceType::None => "none",
            TraceType::Rip => "rip",
            TraceType::UniqueRip => "uniquerip",
            TraceType::Tenet => "tenet",
        };
        f.write_str(name)
    }
}

/// Direction of a recorded guest memory access
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessKind {
    /// The guest read this memory
    Read,

    /// The guest wrote this memory
    Write,
}

/// One guest memory access observed during emulation
#[derive(Debug, Clone)]
pub struct MemAccess {
    /// Read or write
    pub kind: AccessKind,

    /// Accessed virtual address
    pub addr: VirtAddr,

    /// Bytes transferred
    pub data: Vec<u8>,
}

/// Collects execution events for a single run
#[derive(Debug)]
pub struct Tracer {
    kind: TraceType,
    rips: Vec<VirtAddr>,
    unique: FxIndexSet<VirtAddr>,
    tenet: Vec<String>,
    prev_regs: Option<Box<GuestRegs>>,
}

impl Tracer {
    /// Create an empty tracer of the given type
    #[must_use]
    pub fn new(kind: TraceType) -> Self {
        Self {
            kind,
            rips: Vec::new(),
            unique: FxIndexSet::default(),
            tenet: Vec::new(),
            prev_regs: None,
        }
    }

    /// The trace type this tracer records
    #[must_use]
    pub fn kind(&self) -> TraceType {
        self.kind
    }

    /// Record an executed instruction pointer
    pub fn record_rip(&mut self, rip: VirtAddr) {
        match self.kind {
            TraceType::Rip => self.rips.push(rip),
            TraceType::UniqueRip => {
                self.unique.insert(rip);
            }
            TraceType::None | TraceType::Tenet => {}
        }
    }

    /// Record a full Tenet frame: the register state after the instruction
    /// and the memory it touched
    pub fn record_tenet(&mut self, regs: &GuestRegs, accesses: &[MemAccess]) {
        if self.kind != TraceType::Tenet {
            return;
        }

        let mut line = String::with_capacity(128);

        /// Append `name=value` for registers that changed since the last
        /// frame. The first frame emits everything.
        macro_rules! emit {
            ($($field:ident),*) => {
                $(
                    let changed = self
                        .prev_regs
                        .as_ref()
                        .map_or(true, |prev| prev.$field != regs.$field);
                    if changed {
                        if !line.is_empty() {
                            line.push(',');
                        }
                        line.push_str(concat!(stringify!($field), "="));
                        line.push_str(&format!("{:#x}", regs.$field));
                    }
                )*
            };
        }

        emit!(
            rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp, r8, r9, r10, r11, r12, r13, r14, r15,
            rflags
        );

        // rip is always present so frames stay aligned with execution
        if !line.is_empty() {
            line.push(',');
        }
        line.push_str(&format!("rip={:#x}", regs.rip));

        for access in accesses {
            let tag = match access.kind {
                AccessKind::Read => "mr",
                AccessKind::Write => "mw",
            };
            let hex: String = access.data.iter().map(|b| format!("{b:02x}")).collect();
            line.push_str(&format!(",{tag}={:#x}:{hex}", access.addr.0));
        }

        self.tenet.push(line);
        self.prev_regs = Some(Box::new(regs.clone()));
    }

    /// Number of recorded events
    #[must_use]
    pub fn len(&self) -> usize {
        match self.kind {
            TraceType::None => 0,
            TraceType::Rip => self.rips.len(),
            TraceType::UniqueRip => self.unique.len(),
            TraceType::Tenet => self.tenet.len(),
        }
    }

    /// Returns `true` if nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The ordered instruction pointer stream (Rip traces)
    #[must_use]
    pub fn rips(&self) -> &[VirtAddr] {
        &self.rips
    }

    /// The deduplicated instruction pointers (UniqueRip traces)
    #[must_use]
    pub fn unique_rips(&self) -> &FxIndexSet<VirtAddr> {
        &self.unique
    }

    /// Serialize the trace to `path` in the format for its [`TraceType`]
    pub fn write_to(&self, path: &Path, symbols: Option<&[Symbol]>) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut out = BufWriter::new(file);

        let write_rip = |out: &mut BufWriter<std::fs::File>, rip: &VirtAddr| {
            match symbols.and_then(|syms| get_symbol(syms, rip.0)) {
                Some(symbol) => writeln!(out, "{:#018x} {symbol}", rip.0),
                None => writeln!(out, "{:#018x}", rip.0),
            }
        };

        match self.kind {
            TraceType::None => {}
            TraceType::Rip => {
                for rip in &self.rips {
                    write_rip(&mut out, rip)?;
                }
            }
            TraceType::UniqueRip => {
                for rip in &self.unique {
                    write_rip(&mut out, rip)?;
                }
            }
            TraceType::Tenet => {
                for line in &self.tenet {
                    writeln!(out, "{line}")?;
                }
            }
        }

        out.flush()
    }
}

/// Parse the instruction pointer column back out of a Rip or UniqueRip
/// trace file
pub fn parse_rip_trace(path: &Path) -> std::io::Result<Vec<VirtAddr>> {
    let contents = std::fs::read_to_string(path)?;
    let mut rips = Vec::new();

    for line in contents.lines() {
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        let addr = VirtAddr::from_str(first)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        rips.push(addr);
    }

    Ok(rips)
}
