//! One-shot normalization of a freshly loaded guest state
//!
//! Snapshots inherit transient debug state from whatever captured them. A
//! trap flag or armed breakpoint register would make backends diverge, so
//! both are cleared before the first restore. The entry point and stack are
//! validated here so a bad snapshot fails before any fuzzing work begins.

use thiserror::Error;
use x86_64::registers::rflags::RFlags;

use crate::addrs::VirtAddr;
use crate::memory::Memory;
use crate::regs::GuestRegs;

/// Errors raised when a loaded state cannot be fuzzed
#[derive(Error, Debug)]
pub enum Error {
    /// The instruction pointer does not translate to mapped memory
    #[error("instruction pointer is unmapped: {0}")]
    InstructionPointerUnmapped(VirtAddr),

    /// The instruction pointer resolves to non-executable memory
    #[error("instruction pointer is not executable: {0}")]
    InstructionPointerNotExecutable(VirtAddr),

    /// The stack pointer does not translate to mapped memory
    #[error("stack pointer is unmapped: {0}")]
    StackPointerUnmapped(VirtAddr),

    /// The stack pointer resolves to read-only memory
    #[error("stack pointer is not writable: {0}")]
    StackPointerNotWritable(VirtAddr),
}

/// Normalize `regs` for repeated execution and validate it against `memory`.
///
/// Applied exactly once per snapshot, before the backend takes its baseline
/// copy of the registers.
pub fn sanitize(regs: &mut GuestRegs, memory: &Memory) -> Result<(), Error> {
    // Clear single-step and debug-fault state inherited from the capture
    regs.rflags &= !(RFlags::TRAP_FLAG | RFlags::RESUME_FLAG).bits();

    // Disarm hardware breakpoints
    regs.dr0 = 0;
    regs.dr1 = 0;
    regs.dr2 = 0;
    regs.dr3 = 0;
    regs.dr6 = 0;
    regs.dr7 = 0;

    let cr3 = regs.cr3();

    let rip = regs.rip();
    let translation = memory.translate(rip, cr3);
    if translation.phys_addr().is_none() {
        return Err(Error::InstructionPointerUnmapped(rip));
    }
    if !translation.perms.executable {
        return Err(Error::InstructionPointerNotExecutable(rip));
    }

    let rsp = regs.rsp();
    let translation = memory.translate(rsp, cr3);
    if translation.phys_addr().is_none() {
        return Err(Error::StackPointerUnmapped(rsp));
    }
    if !translation.perms.writable {
        return Err(Error::StackPointerNotWritable(rsp));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn clears_trap_and_debug_state() {
        let memory = testutil::build_memory();
        let mut regs = testutil::build_regs();
        regs.rflags |= RFlags::TRAP_FLAG.bits();
        regs.dr0 = 0x40_0000;
        regs.dr7 = 0x401;

        sanitize(&mut regs, &memory).unwrap();

        assert_eq!(regs.rflags & RFlags::TRAP_FLAG.bits(), 0);
        assert_eq!(regs.dr0, 0);
        assert_eq!(regs.dr7, 0);

        // Interrupt flag and reserved bit survive
        assert_eq!(regs.rflags, 0x202);
    }

    #[test]
    fn rejects_unmapped_instruction_pointer() {
        let memory = testutil::build_memory();
        let mut regs = testutil::build_regs();
        regs.rip = 0x50_0000;

        let err = sanitize(&mut regs, &memory).unwrap_err();
        assert!(matches!(err, Error::InstructionPointerUnmapped(_)));
    }

    #[test]
    fn rejects_non_executable_instruction_pointer() {
        let memory = testutil::build_memory();
        let mut regs = testutil::build_regs();
        regs.rip = testutil::DATA_VADDR;

        let err = sanitize(&mut regs, &memory).unwrap_err();
        assert!(matches!(err, Error::InstructionPointerNotExecutable(_)));
    }

    #[test]
    fn rejects_read_only_stack() {
        let memory = testutil::build_memory();
        let mut regs = testutil::build_regs();
        regs.rsp = testutil::CODE_VADDR + 0x100;

        let err = sanitize(&mut regs, &memory).unwrap_err();
        assert!(matches!(err, Error::StackPointerNotWritable(_)));
    }
}
