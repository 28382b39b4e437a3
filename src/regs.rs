//! Guest register file loaded from a snapshot's `regs.json`

use serde::{Deserialize, Serialize};
use serde_hex::{CompactPfx, SerHex};

use crate::addrs::{Cr3, VirtAddr};

/// A segment register with its hidden descriptor state
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Segment {
    /// Base address of the segment
    #[serde(with = "SerHex::<CompactPfx>")]
    pub base: u64,

    /// Limit of the segment
    #[serde(with = "SerHex::<CompactPfx>")]
    pub limit: u32,

    /// Selector loaded into the segment register
    #[serde(with = "SerHex::<CompactPfx>")]
    pub selector: u16,

    /// Descriptor attribute bits (type, s, dpl, present, avl, l, db, g)
    #[serde(with = "SerHex::<CompactPfx>")]
    pub attr: u16,
}

impl Segment {
    /// Segment type field (bits 0..=3 of the attributes)
    #[must_use]
    pub fn type_(&self) -> u8 {
        (self.attr & 0xf) as u8
    }

    /// Descriptor type flag. Set for code/data segments
    #[must_use]
    pub fn s(&self) -> u8 {
        u8::from(self.attr & (1 << 4) > 0)
    }

    /// Descriptor privilege level
    #[must_use]
    pub fn dpl(&self) -> u8 {
        ((self.attr >> 5) & 0b11) as u8
    }

    /// Segment present flag
    #[must_use]
    pub fn present(&self) -> u8 {
        u8::from(self.attr & (1 << 7) > 0)
    }

    /// Available for use by system software
    #[must_use]
    pub fn avl(&self) -> u8 {
        u8::from(self.attr & (1 << 12) > 0)
    }

    /// 64 bit code segment flag
    #[must_use]
    pub fn l(&self) -> u8 {
        u8::from(self.attr & (1 << 13) > 0)
    }

    /// Default operation size flag
    #[must_use]
    pub fn db(&self) -> u8 {
        u8::from(self.attr & (1 << 14) > 0)
    }

    /// Granularity flag
    #[must_use]
    pub fn g(&self) -> u8 {
        u8::from(self.attr & (1 << 15) > 0)
    }
}

/// A descriptor table register (`gdtr`/`idtr`)
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TableReg {
    /// Base address of the table
    #[serde(with = "SerHex::<CompactPfx>")]
    pub base: u64,

    /// Limit of the table
    #[serde(with = "SerHex::<CompactPfx>")]
    pub limit: u16,
}

/// The complete register state of the frozen guest.
///
/// This is the structure persisted as `regs.json` in a snapshot directory.
/// Scalar fields are written as compact hex strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[allow(missing_docs)]
pub struct GuestRegs {
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rax: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rbx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rcx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rdx: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rsi: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rdi: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rbp: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rsp: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r8: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r9: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r10: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r11: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r12: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r13: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r14: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub r15: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rip: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub rflags: u64,

    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: TableReg,
    pub idtr: TableReg,

    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr0: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr2: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr3: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr4: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cr8: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub xcr0: u64,

    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr0: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr1: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr2: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr3: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr6: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub dr7: u64,

    #[serde(with = "SerHex::<CompactPfx>")]
    pub efer: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub star: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub lstar: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub cstar: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub sfmask: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub kernel_gs_base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub sysenter_cs: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub sysenter_esp: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub sysenter_eip: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub apic_base: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub pat: u64,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub tsc: u64,

    #[serde(with = "SerHex::<CompactPfx>")]
    pub fpcw: u16,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub fpsw: u16,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub fptw: u16,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub fpop: u16,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub mxcsr: u32,
    #[serde(with = "SerHex::<CompactPfx>")]
    pub mxcsr_mask: u32,

    /// x87 registers, low/high halves of the 80 bit values
    pub fpst: [[u64; 2]; 8],

    /// SSE registers, low/high 64 bit halves
    pub xmm: [[u64; 2]; 16],
}

impl GuestRegs {
    /// Get the instruction pointer as a [`VirtAddr`]
    #[must_use]
    pub fn rip(&self) -> VirtAddr {
        VirtAddr(self.rip)
    }

    /// Get the stack pointer as a [`VirtAddr`]
    #[must_use]
    pub fn rsp(&self) -> VirtAddr {
        VirtAddr(self.rsp)
    }

    /// Get the page table base as a [`Cr3`]
    #[must_use]
    pub fn cr3(&self) -> Cr3 {
        Cr3(self.cr3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let mut regs = GuestRegs::default();
        regs.rip = 0x7fff_dead_beef;
        regs.rsp = 0x403f00;
        regs.cr3 = 0x1000;
        regs.cs.selector = 0x33;
        regs.cs.attr = 0xa09b;
        regs.xmm[3] = [0x1122_3344, 0x5566];

        let json = serde_json::to_string(&regs).unwrap();
        assert!(json.contains("\"rip\":\"0x7fffdeadbeef\""));

        let back: GuestRegs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, regs);
    }

    #[test]
    fn missing_fields_default() {
        let regs: GuestRegs = serde_json::from_str(r#"{"rip":"0x401000","cr3":"0x1000"}"#).unwrap();
        assert_eq!(regs.rip, 0x401000);
        assert_eq!(regs.cr3, 0x1000);
        assert_eq!(regs.rax, 0);
        assert_eq!(regs.dr7, 0);
    }

    #[test]
    fn segment_attr_decode() {
        // Typical 64 bit ring 3 code segment
        let cs = Segment {
            base: 0,
            limit: 0xffff_ffff,
            selector: 0x33,
            attr: 0xa0fb,
        };

        assert_eq!(cs.type_(), 0xb);
        assert_eq!(cs.s(), 1);
        assert_eq!(cs.dpl(), 3);
        assert_eq!(cs.present(), 1);
        assert_eq!(cs.l(), 1);
        assert_eq!(cs.db(), 0);
        assert_eq!(cs.g(), 1);
    }
}
