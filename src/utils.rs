//! Various utility functions

use anyhow::{Context, Result};
use rustc_hash::FxHasher;

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::backend::Fault;

/// Calculate the hash of the given data
#[must_use]
pub fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut hasher = FxHasher::default();
    t.hash(&mut hasher);
    hasher.finish()
}

/// Calculate the hash of the given data as a hex string
#[must_use]
pub fn hexdigest<T: Hash>(t: &T) -> String {
    format!("{:016x}", calculate_hash(t))
}

/// Save a crashing input under `crashes/<fault label>/<hash>` inside the
/// project directory.
///
/// Returns the written path for a newly seen crash, `None` when this exact
/// input was already saved for this fault.
pub fn write_crash_input(
    project_dir: &Path,
    fault: &Fault,
    input: &[u8],
) -> Result<Option<PathBuf>> {
    let crash_dir = project_dir.join("crashes").join(fault.label());
    std::fs::create_dir_all(&crash_dir)
        .with_context(|| format!("failed to create {}", crash_dir.display()))?;

    let path = crash_dir.join(hexdigest(&input));
    if path.exists() {
        return Ok(None);
    }

    std::fs::write(&path, input)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

/// Save a coverage increasing input under `corpus/<hash>` inside the
/// project directory. Returns the path for a newly seen input.
pub fn write_corpus_input(project_dir: &Path, input: &[u8]) -> Result<Option<PathBuf>> {
    let corpus_dir = project_dir.join("corpus");
    std::fs::create_dir_all(&corpus_dir)
        .with_context(|| format!("failed to create {}", corpus_dir.display()))?;

    let path = corpus_dir.join(hexdigest(&input));
    if path.exists() {
        return Ok(None);
    }

    std::fs::write(&path, input)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::VirtAddr;
    use crate::backend::FaultKind;

    fn example_fault() -> Fault {
        Fault {
            kind: FaultKind::WriteUnmapped,
            addr: VirtAddr(0x50_0000),
            ip: VirtAddr(0x40_0000),
        }
    }

    #[test]
    fn crash_inputs_are_deduplicated_per_fault() {
        let dir = tempfile::tempdir().unwrap();
        let fault = example_fault();

        let first = write_crash_input(dir.path(), &fault, b"aaaa").unwrap();
        let path = first.unwrap();
        assert!(path.starts_with(dir.path().join("crashes/write_unmapped_0x500000")));
        assert_eq!(std::fs::read(&path).unwrap(), b"aaaa");

        // Same input again is recognized as a duplicate
        assert!(write_crash_input(dir.path(), &fault, b"aaaa")
            .unwrap()
            .is_none());

        // A different input for the same fault still lands
        assert!(write_crash_input(dir.path(), &fault, b"bbbb")
            .unwrap()
            .is_some());
    }

    #[test]
    fn hexdigest_is_stable() {
        assert_eq!(hexdigest(&b"abc".as_slice()), hexdigest(&b"abc".as_slice()));
        assert_ne!(hexdigest(&b"abc".as_slice()), hexdigest(&b"abd".as_slice()));
    }
}
