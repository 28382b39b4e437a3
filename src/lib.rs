//! # Snapfuzz
//!
//! Snapshot-based fuzzing of a frozen guest across interchangeable
//! execution backends.
//!
//! A snapshot directory (`mem.dmp` + `regs.json`, plus optional
//! `symbol-store.json` and `config.toml`) is loaded into an in-memory
//! [`Snapshot`]. A [`Backend`](backend::Backend) binds that snapshot to an
//! execution substrate, runs mutated inputs against it, and restores only
//! the dirty pages between runs so iteration cost tracks what the guest
//! actually touched rather than the size of the image.
//!
//! Three backends implement the same contract:
//!
//! * [`backend::emulator`] - a software x86-64 interpreter with exact
//!   instruction limits, full tracing, and edge coverage
//! * [`backend::kvm`] - Linux KVM hardware virtualization (linux only)
//! * [`backend::whv`] - Windows Hypervisor Platform (windows only)
//!
//! The `run` subcommand replays one input and writes its trace; the `fuzz`
//! subcommand drives the mutate/restore/run/classify loop with coverage
//! feedback.

#![deny(missing_docs)]

use std::hash::BuildHasherDefault;
use std::sync::atomic::AtomicBool;

use indexmap::IndexSet;
use rustc_hash::FxHasher;

/// Insertion ordered set with a fast non-cryptographic hasher, used for
/// coverage and deduplicated traces
pub type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;

/// Set when the kick timer fires to interrupt a blocking vCPU run
pub static KICK_GUEST: AtomicBool = AtomicBool::new(false);

pub mod addrs;
pub use addrs::{Cr3, PhysAddr, VirtAddr};

pub mod backend;
pub use backend::{Backend, BackendType, Fault, FaultKind, RunOutcome};

pub mod cmdline;
pub use cmdline::{CommandLineArgs, SubCommand};

pub mod commands;
pub mod config;
pub use config::Config;

pub mod memory;
pub use memory::Memory;

pub mod mutators;

pub mod page_table;

pub mod regs;
pub use regs::GuestRegs;

pub mod sanitize;

pub mod snapshot;
pub use snapshot::Snapshot;

pub mod symbols;
pub use symbols::Symbol;

#[cfg(target_os = "linux")]
pub mod timer;

pub mod trace;
pub use trace::{TraceType, Tracer};

pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;
