//! Shared helpers that build a tiny synthetic snapshot for tests
//!
//! The image is 64 KiB of guest physical memory with a hand-built 4-level
//! page table hierarchy:
//!
//! ```text
//! phys 0x1000  PML4        [0] -> 0x2000
//! phys 0x2000  PDPT        [0] -> 0x3000
//! phys 0x3000  PD          [2] -> 0x4000
//! phys 0x4000  PT          [0] -> 0x5000 (code, read+exec)
//!                          [2] -> 0x6000 (data, read+write, nx)
//!                          [3] -> 0x7000 (stack, read+write, nx)
//! ```

use std::sync::{Arc, RwLock};

use crate::addrs::Cr3;
use crate::config::Config;
use crate::memory::Memory;
use crate::regs::{GuestRegs, Segment};
use crate::snapshot::Snapshot;

/// Virtual address of the executable code page
pub const CODE_VADDR: u64 = 0x40_0000;

/// Virtual address of the writable data page
pub const DATA_VADDR: u64 = 0x40_2000;

/// Virtual address of the writable stack page
pub const STACK_VADDR: u64 = 0x40_3000;

/// Initial stack pointer, inside the stack page
pub const INITIAL_RSP: u64 = STACK_VADDR + 0xf00;

const PRESENT: u64 = 1;
const WRITABLE: u64 = 1 << 1;
const NX: u64 = 1 << 63;

/// Page table base for the synthetic image
pub fn cr3() -> Cr3 {
    Cr3(0x1000)
}

fn put_entry(image: &mut [u8], table: usize, index: usize, entry: u64) {
    let offset = table + index * 8;
    image[offset..offset + 8].copy_from_slice(&entry.to_le_bytes());
}

/// Build the raw physical image with `code` placed at [`CODE_VADDR`]
pub fn build_image(code: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; 0x10000];

    put_entry(&mut image, 0x1000, 0, 0x2000 | PRESENT | WRITABLE);
    put_entry(&mut image, 0x2000, 0, 0x3000 | PRESENT | WRITABLE);
    put_entry(&mut image, 0x3000, 2, 0x4000 | PRESENT | WRITABLE);
    put_entry(&mut image, 0x4000, 0, 0x5000 | PRESENT);
    put_entry(&mut image, 0x4000, 2, 0x6000 | PRESENT | WRITABLE | NX);
    put_entry(&mut image, 0x4000, 3, 0x7000 | PRESENT | WRITABLE | NX);

    image[0x5000..0x5000 + code.len()].copy_from_slice(code);

    image
}

/// Build a clean [`Memory`] with no guest code
pub fn build_memory() -> Memory {
    Memory::from_bytes(&build_image(&[])).unwrap()
}

/// Register state entering at [`CODE_VADDR`] with the stack set up.
///
/// Carries a full 64 bit long mode configuration so the snapshot is also
/// valid for the hardware backends.
pub fn build_regs() -> GuestRegs {
    let mut regs = GuestRegs::default();
    regs.rip = CODE_VADDR;
    regs.rsp = INITIAL_RSP;
    regs.cr3 = 0x1000;
    regs.rflags = 0x202;

    // PG | WP | NE | ET | MP | PE
    regs.cr0 = 0x8005_0033;
    // PAE
    regs.cr4 = 0x20;
    // LMA | LME
    regs.efer = 0x500;

    // Flat ring 0 long mode code segment
    let code = Segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: 0x08,
        attr: 0xa09b,
    };
    // Flat ring 0 data segment
    let data = Segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: 0x10,
        attr: 0xc093,
    };
    // 64 bit TSS
    let tss = Segment {
        base: 0,
        limit: 0x67,
        selector: 0x18,
        attr: 0x8b,
    };

    regs.cs = code;
    regs.ds = data;
    regs.es = data;
    regs.fs = data;
    regs.gs = data;
    regs.ss = data;
    regs.tr = tss;

    regs
}

/// Build a full in-memory [`Snapshot`] running the given code
pub fn snapshot_with_code(code: &[u8]) -> Snapshot {
    let memory = Memory::from_bytes(&build_image(code)).unwrap();
    Snapshot::from_parts(build_regs(), Arc::new(RwLock::new(memory)), Config::default())
}
