//! Intel 4-level page table entries and translation results

use crate::addrs::{PhysAddr, VirtAddr};

/// A raw page table entry
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Entry(pub u64);

impl Entry {
    /// Returns `true` if the present bit is set
    #[must_use]
    pub fn present(self) -> bool {
        self.0 & (1 << 0) > 0
    }

    /// Returns `true` if the writable bit is set
    #[must_use]
    pub fn writable(self) -> bool {
        self.0 & (1 << 1) > 0
    }

    /// Returns `true` if this entry maps a large page (1 GiB or 2 MiB)
    #[must_use]
    pub fn page_size(self) -> bool {
        self.0 & (1 << 7) > 0
    }

    /// Returns `true` if the execute disable bit is not set
    #[must_use]
    pub fn executable(self) -> bool {
        self.0 & (1 << 63) == 0
    }

    /// Get the physical address this entry points to
    #[must_use]
    pub fn address(self) -> PhysAddr {
        PhysAddr(self.0 & 0x000f_ffff_ffff_f000)
    }
}

impl From<u64> for Entry {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

/// The size of the page mapping a translated address
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageSize {
    /// 1 GiB page mapped at the page directory pointer level
    Size1G,

    /// 2 MiB page mapped at the page directory level
    Size2M,

    /// 4 KiB page mapped at the page table level
    Size4K,
}

impl PageSize {
    /// Number of bytes covered by a page of this size
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            PageSize::Size1G => 1 << 30,
            PageSize::Size2M => 1 << 21,
            PageSize::Size4K => 1 << 12,
        }
    }
}

/// Effective permissions for a translated address.
///
/// Writability and executability are the AND across every level of the walk
/// since any level can revoke them.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Permissions {
    /// The page can be written
    pub writable: bool,

    /// The page can be executed
    pub executable: bool,
}

impl Permissions {
    /// Permissions before any entry has been applied
    #[must_use]
    pub fn all() -> Self {
        Self {
            writable: true,
            executable: true,
        }
    }

    /// Restrict these permissions by the given entry
    pub fn apply(&mut self, entry: Entry) {
        self.writable &= entry.writable();
        self.executable &= entry.executable();
    }
}

/// The result of walking the page tables for a virtual address
#[derive(Debug, Copy, Clone)]
pub struct Translation {
    /// The virtual address that was translated
    pub virt_addr: VirtAddr,

    /// The physical address, if the address is mapped
    pub phys_addr: Option<PhysAddr>,

    /// The size of the final mapping
    pub page_size: Option<PageSize>,

    /// Effective permissions accumulated over the walk
    pub perms: Permissions,
}

impl Translation {
    /// Create a [`Translation`] for a mapped address
    #[must_use]
    pub fn new(
        virt_addr: VirtAddr,
        phys_addr: PhysAddr,
        page_size: PageSize,
        perms: Permissions,
    ) -> Self {
        Self {
            virt_addr,
            phys_addr: Some(phys_addr),
            page_size: Some(page_size),
            perms,
        }
    }

    /// Create a [`Translation`] for an unmapped address
    #[must_use]
    pub fn not_present(virt_addr: VirtAddr) -> Self {
        Self {
            virt_addr,
            phys_addr: None,
            page_size: None,
            perms: Permissions {
                writable: false,
                executable: false,
            },
        }
    }

    /// Get the physical address for this translation
    #[must_use]
    pub fn phys_addr(&self) -> Option<PhysAddr> {
        self.phys_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_bits() {
        let entry = Entry(0x5003);
        assert!(entry.present());
        assert!(entry.writable());
        assert!(entry.executable());
        assert!(!entry.page_size());
        assert_eq!(entry.address(), PhysAddr(0x5000));

        let nx = Entry(0x8000_0000_0000_6001);
        assert!(nx.present());
        assert!(!nx.writable());
        assert!(!nx.executable());
        assert_eq!(nx.address(), PhysAddr(0x6000));
    }

    #[test]
    fn permissions_accumulate_across_levels() {
        let mut perms = Permissions::all();

        // Upper level allows writes, leaf revokes them
        perms.apply(Entry(0x2003));
        assert!(perms.writable);

        perms.apply(Entry(0x8000_0000_0000_5001));
        assert!(!perms.writable);
        assert!(!perms.executable);

        // Once revoked, a later permissive entry cannot grant it back
        perms.apply(Entry(0x7003));
        assert!(!perms.writable);
    }
}
