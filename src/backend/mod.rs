//! Execution backend abstraction
//!
//! Every execution substrate (software emulator, KVM, WHV) implements
//! [`Backend`], so orchestration code drives runs, restores, limits, and
//! traces without knowing what is underneath. Backends form a closed set
//! selected once at startup via [`create`].

use thiserror::Error;

use std::str::FromStr;

use crate::addrs::VirtAddr;
use crate::regs::GuestRegs;
use crate::snapshot::Snapshot;
use crate::trace::{TraceType, Tracer};
use crate::FxIndexSet;

pub mod emulator;

#[cfg(target_os = "linux")]
pub mod kvm;

#[cfg(windows)]
pub mod whv;

/// The closed set of execution substrates
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BackendType {
    /// Software instruction emulator. Exact instruction limits, full
    /// tracing and edge coverage, slowest.
    Emulator,

    /// Linux KVM hardware virtualization. Wall-clock limits, coarse
    /// coverage, fastest on linux hosts.
    Kvm,

    /// Windows Hypervisor Platform. Wall-clock limits, coarse coverage,
    /// fastest on windows hosts.
    Whv,
}

impl BackendType {
    /// Whether this backend can record control-flow-edge coverage
    #[must_use]
    pub fn supports_edge_coverage(self) -> bool {
        matches!(self, BackendType::Emulator)
    }

    /// Whether this backend can record the given trace type
    #[must_use]
    pub fn supports_trace_type(self, kind: TraceType) -> bool {
        match self {
            BackendType::Emulator => true,
            // Hardware backends trap per instruction only for plain rip
            // traces; a full delta trace needs the emulator
            BackendType::Kvm | BackendType::Whv => kind != TraceType::Tenet,
        }
    }

    /// The trace type used when the caller does not pick one
    #[must_use]
    pub fn default_trace_type(self) -> TraceType {
        match self {
            BackendType::Emulator => TraceType::Rip,
            BackendType::Kvm | BackendType::Whv => TraceType::UniqueRip,
        }
    }

    /// Unit of the execution limit for this backend
    #[must_use]
    pub fn limit_unit(self) -> &'static str {
        match self {
            BackendType::Emulator => "instructions",
            BackendType::Kvm | BackendType::Whv => "seconds",
        }
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "emu" | "emulator" => Ok(BackendType::Emulator),
            "kvm" => Ok(BackendType::Kvm),
            "whv" => Ok(BackendType::Whv),
            _ => Err(format!("unknown backend: {s}")),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendType::Emulator => "emulator",
            BackendType::Kvm => "kvm",
            BackendType::Whv => "whv",
        };
        f.write_str(name)
    }
}

/// Classification of a guest-triggered fault
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// Read from an unmapped virtual address
    ReadUnmapped,

    /// Write to an unmapped virtual address
    WriteUnmapped,

    /// Write to mapped but read-only memory
    WriteReadOnly,

    /// Instruction fetch from non-executable or unmapped memory
    ExecViolation,

    /// The guest executed an undefined instruction
    InvalidOpcode,

    /// Division by zero or quotient overflow
    DivideError,

    /// A breakpoint not planted by the backend fired
    Breakpoint,

    /// The guest performed port or MMIO I/O, which a snapshot has no
    /// device model to answer
    UnexpectedIo,

    /// An exception the backend does not further classify
    Unknown(u32),
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::ReadUnmapped => f.write_str("read_unmapped"),
            FaultKind::WriteUnmapped => f.write_str("write_unmapped"),
            FaultKind::WriteReadOnly => f.write_str("write_readonly"),
            FaultKind::ExecViolation => f.write_str("exec_violation"),
            FaultKind::InvalidOpcode => f.write_str("invalid_opcode"),
            FaultKind::DivideError => f.write_str("divide_error"),
            FaultKind::Breakpoint => f.write_str("breakpoint"),
            FaultKind::UnexpectedIo => f.write_str("unexpected_io"),
            FaultKind::Unknown(vector) => write!(f, "exception_{vector}"),
        }
    }
}

/// Metadata describing one guest crash
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Fault {
    /// What kind of fault occurred
    pub kind: FaultKind,

    /// The address the fault refers to (accessed address for memory
    /// faults, zero when not applicable)
    pub addr: VirtAddr,

    /// Instruction pointer at the time of the fault
    pub ip: VirtAddr,
}

impl Fault {
    /// Short label used for crash directory names
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}_{:#x}", self.kind, self.addr.0)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {} (ip {})", self.kind, self.addr, self.ip)
    }
}

/// The classified result of one run.
///
/// Guest faults and limit exhaustion are expected, high-frequency outcomes
/// and live here; backend-internal failures are [`Error`]s instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunOutcome {
    /// The guest reached a reset address or halted
    Completed,

    /// The guest faulted
    Crashed(Fault),

    /// The execution limit fired before the guest finished
    LimitExceeded,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::Crashed(fault) => write!(f, "crashed: {fault}"),
            RunOutcome::LimitExceeded => f.write_str("limit exceeded"),
        }
    }
}

/// Backend-internal failures, fatal to the current iteration
#[derive(Error, Debug)]
pub enum Error {
    /// The requested backend cannot run on this host
    #[error("backend {0} unavailable: {1}")]
    Unavailable(BackendType, String),

    /// The requested instrumentation is not supported by this backend
    #[error("the {0} backend does not support {1}")]
    UnsupportedCapability(BackendType, &'static str),

    /// Instrumentation was reconfigured after the first restore
    #[error("{0} must be configured before the first restore")]
    ConfiguredAfterRestore(&'static str),

    /// A host-side guest memory access failed
    #[error("guest memory error: {0}")]
    Memory(#[from] crate::memory::Error),

    /// The emulator hit an instruction it does not implement
    #[error("unsupported instruction `{0}` at {1}")]
    UnsupportedInstruction(String, VirtAddr),

    /// The input does not fit the configured guest buffer
    #[error("input of {0} bytes exceeds the configured maximum of {1}")]
    InputTooLarge(usize, usize),

    /// No input buffer address is configured for this snapshot
    #[error("cannot inject input: no input_addr configured for this snapshot")]
    NoInputAddress,

    /// A restore failed. Continuing to fuzz would be unsound.
    #[error("restore failed: {0}")]
    Restore(String),

    /// The hypervisor reported an internal failure
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// A KVM ioctl failed
    #[cfg(target_os = "linux")]
    #[error("kvm error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),
}

/// The capability-uniform execution interface.
///
/// One backend instance is exclusively owned by one execution loop; no
/// concurrent runs against the same instance. Construction plays the role
/// of `Initialize`: it binds the backend to a snapshot and allocates
/// substrate resources.
pub trait Backend {
    /// Which substrate this is
    fn backend_type(&self) -> BackendType;

    /// Configure the execution limit. Zero disables limiting. The unit is
    /// backend defined ([`BackendType::limit_unit`]).
    fn set_limit(&mut self, limit: u64);

    /// Select the trace type recorded during each run
    fn set_trace_type(&mut self, kind: TraceType) -> Result<(), Error>;

    /// Request instruction-granular trapping. Hardware backends accept
    /// this only for [`TraceType::Rip`].
    fn enable_single_step(&mut self) -> Result<(), Error>;

    /// Enable per-control-flow-edge coverage. Emulator only.
    fn enable_edge_coverage(&mut self) -> Result<(), Error>;

    /// Reset registers to the sanitized baseline and revert exactly the
    /// dirty pages. Idempotent.
    fn restore(&mut self) -> Result<(), Error>;

    /// Inject `input` into the configured guest buffer and execute until
    /// completion, fault, or limit
    fn run(&mut self, input: &[u8]) -> Result<RunOutcome, Error>;

    /// Current guest registers
    fn regs(&self) -> &GuestRegs;

    /// Mutable guest registers, for harness setup between restore and run
    fn regs_mut(&mut self) -> &mut GuestRegs;

    /// Read guest virtual memory
    fn read_bytes(&mut self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Error>;

    /// Write guest virtual memory through the dirty tracking path, so the
    /// next restore reverts it
    fn write_bytes(&mut self, addr: VirtAddr, bytes: &[u8]) -> Result<(), Error>;

    /// Take the trace recorded by the last run, leaving an empty tracer
    fn take_trace(&mut self) -> Tracer;

    /// Cumulative control flow edges, if edge coverage is enabled
    fn edges(&self) -> Option<&FxIndexSet<(VirtAddr, VirtAddr)>>;

    /// Number of currently dirty guest pages
    fn dirty_pages(&self) -> usize;
}

/// Classify a page fault from its hardware error code. Bit 0 is set when
/// the faulting page was present (a protection violation rather than an
/// unmapped access), bit 1 when the access was a write, bit 4 when it was
/// an instruction fetch.
#[allow(dead_code)]
pub(crate) fn page_fault_kind(error_code: u32) -> FaultKind {
    if error_code & 0x10 != 0 {
        FaultKind::ExecViolation
    } else if error_code & 2 != 0 {
        if error_code & 1 != 0 {
            FaultKind::WriteReadOnly
        } else {
            FaultKind::WriteUnmapped
        }
    } else {
        FaultKind::ReadUnmapped
    }
}

/// Create the backend for `kind`, bound to `snapshot`.
///
/// Fails with [`Error::Unavailable`] when the substrate does not exist on
/// this host.
pub fn create(kind: BackendType, snapshot: &Snapshot) -> Result<Box<dyn Backend>, Error> {
    match kind {
        BackendType::Emulator => Ok(Box::new(emulator::EmulatorBackend::new(snapshot)?)),

        BackendType::Kvm => {
            #[cfg(target_os = "linux")]
            {
                Ok(Box::new(kvm::KvmBackend::new(snapshot)?))
            }

            #[cfg(not(target_os = "linux"))]
            {
                let _ = snapshot;
                Err(Error::Unavailable(
                    kind,
                    "kvm requires a linux host".to_string(),
                ))
            }
        }

        BackendType::Whv => {
            #[cfg(windows)]
            {
                Ok(Box::new(whv::WhvBackend::new(snapshot)?))
            }

            #[cfg(not(windows))]
            {
                let _ = snapshot;
                Err(Error::Unavailable(
                    kind,
                    "whv requires a windows host".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("emu".parse::<BackendType>().unwrap(), BackendType::Emulator);
        assert_eq!("KVM".parse::<BackendType>().unwrap(), BackendType::Kvm);
        assert_eq!("whv".parse::<BackendType>().unwrap(), BackendType::Whv);
        assert!("bochs".parse::<BackendType>().is_err());
    }

    #[test]
    fn capability_matrix() {
        assert!(BackendType::Emulator.supports_edge_coverage());
        assert!(!BackendType::Kvm.supports_edge_coverage());
        assert!(!BackendType::Whv.supports_edge_coverage());

        assert!(BackendType::Emulator.supports_trace_type(TraceType::Tenet));
        assert!(!BackendType::Kvm.supports_trace_type(TraceType::Tenet));
        assert!(BackendType::Kvm.supports_trace_type(TraceType::UniqueRip));

        assert_eq!(BackendType::Emulator.default_trace_type(), TraceType::Rip);
        assert_eq!(BackendType::Kvm.default_trace_type(), TraceType::UniqueRip);
    }

    #[test]
    fn fault_labels_are_path_safe() {
        let fault = Fault {
            kind: FaultKind::WriteUnmapped,
            addr: VirtAddr(0x50_0000),
            ip: VirtAddr(0x40_0000),
        };
        assert_eq!(fault.label(), "write_unmapped_0x500000");
    }

    #[test]
    fn page_fault_error_codes_classify() {
        // Write to an unmapped page
        assert_eq!(page_fault_kind(0b010), FaultKind::WriteUnmapped);

        // Write to a present read-only page
        assert_eq!(page_fault_kind(0b011), FaultKind::WriteReadOnly);

        // Reads classify the same whether the page was present or not
        assert_eq!(page_fault_kind(0b000), FaultKind::ReadUnmapped);
        assert_eq!(page_fault_kind(0b101), FaultKind::ReadUnmapped);

        // Instruction fetch
        assert_eq!(page_fault_kind(0b1_0001), FaultKind::ExecViolation);
    }

    #[cfg(not(windows))]
    #[test]
    fn whv_unavailable_off_windows() {
        let snapshot = crate::testutil::snapshot_with_code(&[0xf4]);
        let Err(err) = create(BackendType::Whv, &snapshot) else {
            panic!("expected whv to be unavailable here");
        };
        assert!(matches!(err, Error::Unavailable(BackendType::Whv, _)));
    }
}
