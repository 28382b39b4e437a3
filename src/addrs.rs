//! Strongly typed guest address wrappers

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::ops::Deref;
use std::str::FromStr;

/// Size of a guest page
pub const PAGE_SIZE: u64 = 0x1000;

/// A guest virtual address
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

/// A guest physical address
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// A page table base address as found in the `cr3` register
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Cr3(pub u64);

impl VirtAddr {
    /// Get the address of the page containing this address
    #[must_use]
    pub fn page(&self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// Get the offset of this address into its page
    #[must_use]
    pub fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Get the address `offset` bytes after this address
    #[must_use]
    pub fn offset(&self, offset: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(offset))
    }

    /// Get the four page table indexes used to translate this address
    #[must_use]
    pub fn table_indexes(&self) -> [usize; 4] {
        /// Get the 9 bit page table index for the given level
        macro_rules! table_index {
            ($shift:expr) => {
                ((self.0 >> $shift) & 0x1ff) as usize
            };
        }

        [
            table_index!(39),
            table_index!(30),
            table_index!(21),
            table_index!(12),
        ]
    }
}

impl PhysAddr {
    /// Get the address of the page containing this address
    #[must_use]
    pub fn page(&self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// Get the offset of this address into its page
    #[must_use]
    pub fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Get the address `offset` bytes after this address
    #[must_use]
    pub fn offset(&self, offset: u64) -> PhysAddr {
        PhysAddr(self.0.wrapping_add(offset))
    }
}

impl Cr3 {
    /// Get the physical address of the top level page table
    #[must_use]
    pub fn table_base(&self) -> PhysAddr {
        PhysAddr(self.0 & 0x000f_ffff_ffff_f000)
    }
}

impl Deref for VirtAddr {
    type Target = u64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Deref for PhysAddr {
    type Target = u64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for VirtAddr {
    fn from(addr: u64) -> Self {
        VirtAddr(addr)
    }
}

impl From<u64> for Cr3 {
    fn from(addr: u64) -> Self {
        Cr3(addr)
    }
}

impl std::fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for VirtAddr {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_start_matches("0x");
        Ok(VirtAddr(u64::from_str_radix(trimmed, 16)?))
    }
}

// Addresses are serialized as hex strings so snapshot config files stay
// readable and kernel-half addresses survive TOML's signed integers.
impl Serialize for VirtAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl<'de> Deserialize<'de> for VirtAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VirtAddr::from_str(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let addr = VirtAddr(0x401fff);
        assert_eq!(addr.page(), VirtAddr(0x401000));
        assert_eq!(addr.page_offset(), 0xfff);
        assert_eq!(PhysAddr(0x5432).page(), PhysAddr(0x5000));
    }

    #[test]
    fn table_indexes_split_nine_bits() {
        // 0x400000 lives at pml4[0] pdpt[0] pd[2] pt[0]
        assert_eq!(VirtAddr(0x40_0000).table_indexes(), [0, 0, 2, 0]);

        // A canonical kernel-half address
        let addr = VirtAddr(0xffff_8000_0000_1000);
        assert_eq!(addr.table_indexes(), [0x100, 0, 0, 1]);
    }

    #[test]
    fn cr3_masks_flag_bits() {
        assert_eq!(Cr3(0x1018).table_base(), PhysAddr(0x1000));
    }

    #[test]
    fn parse_hex_addresses() {
        assert_eq!("0x402000".parse::<VirtAddr>().unwrap(), VirtAddr(0x402000));
        assert_eq!("deadbeef".parse::<VirtAddr>().unwrap(), VirtAddr(0xdead_beef));
        assert!("zzz".parse::<VirtAddr>().is_err());
    }
}
