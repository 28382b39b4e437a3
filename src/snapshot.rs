//! Loading a persisted snapshot directory into the in-memory state model
//!
//! A snapshot directory contains:
//!
//! * `mem.dmp` - raw guest physical memory
//! * `regs.json` - [`GuestRegs`] as hex-encoded JSON
//! * `symbol-store.json` - optional symbol table for annotation
//! * `config.toml` - optional [`Config`]

use thiserror::Error;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::memory::Memory;
use crate::regs::GuestRegs;
use crate::symbols::Symbol;

/// Errors raised while loading a snapshot directory
#[derive(Error, Debug)]
pub enum Error {
    /// The snapshot directory does not exist
    #[error("snapshot directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    /// The physical memory dump is missing
    #[error("missing memory dump: {0}")]
    MissingMemoryDump(PathBuf),

    /// The register file is missing
    #[error("missing register file: {0}")]
    MissingRegisters(PathBuf),

    /// Failed to read a snapshot file
    #[error("failed to read snapshot file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to map the memory dump
    #[error("failed to load memory dump: {0}")]
    Memory(#[from] crate::memory::Error),

    /// The register file is not valid JSON
    #[error("malformed register file: {0}")]
    MalformedRegisters(#[source] serde_json::Error),

    /// The symbol store is not valid JSON
    #[error("malformed symbol store: {0}")]
    MalformedSymbols(#[source] serde_json::Error),

    /// The config file is not valid TOML
    #[error("malformed config: {0}")]
    MalformedConfig(#[from] toml::de::Error),
}

/// A frozen guest: sanitized registers, the clean memory baseline, and the
/// metadata needed to fuzz it
#[derive(Debug)]
pub struct Snapshot {
    /// Register state at the moment the snapshot was taken
    pub regs: GuestRegs,

    /// Clean physical memory baseline, shared read-only with backends
    pub memory: Arc<RwLock<Memory>>,

    /// Optional symbol table, sorted by address
    pub symbols: Option<Vec<Symbol>>,

    /// Per-snapshot configuration
    pub config: Config,

    /// Directory this snapshot was loaded from, if any
    pub path: Option<PathBuf>,
}

impl Snapshot {
    /// Assemble a snapshot from already-loaded parts
    #[must_use]
    pub fn from_parts(regs: GuestRegs, memory: Arc<RwLock<Memory>>, config: Config) -> Self {
        Self {
            regs,
            memory,
            symbols: None,
            config,
            path: None,
        }
    }

    /// Load a snapshot from a directory on disk
    pub fn load(dir: &Path) -> Result<Self, Error> {
        if !dir.is_dir() {
            return Err(Error::DirectoryNotFound(dir.to_path_buf()));
        }

        let mem_path = dir.join("mem.dmp");
        if !mem_path.exists() {
            return Err(Error::MissingMemoryDump(mem_path));
        }

        let regs_path = dir.join("regs.json");
        if !regs_path.exists() {
            return Err(Error::MissingRegisters(regs_path));
        }

        log::info!("loading physical memory from {}", mem_path.display());
        let memory = Memory::from_file(&mem_path)?;
        log::info!("guest physical memory: {:#x} bytes", memory.size());

        let regs: GuestRegs = serde_json::from_str(&std::fs::read_to_string(&regs_path)?)
            .map_err(Error::MalformedRegisters)?;

        let symbols_path = dir.join("symbol-store.json");
        let symbols = if symbols_path.exists() {
            let mut symbols: Vec<Symbol> =
                serde_json::from_str(&std::fs::read_to_string(&symbols_path)?)
                    .map_err(Error::MalformedSymbols)?;
            symbols.sort_by_key(|sym| sym.address);
            log::info!("loaded {} symbols", symbols.len());
            Some(symbols)
        } else {
            None
        };

        let config_path = dir.join("config.toml");
        let config = if config_path.exists() {
            toml::from_str(&std::fs::read_to_string(&config_path)?)?
        } else {
            Config::default()
        };

        Ok(Self {
            regs,
            memory: Arc::new(RwLock::new(memory)),
            symbols,
            config,
            path: Some(dir.to_path_buf()),
        })
    }
}
