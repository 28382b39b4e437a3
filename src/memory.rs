//! Guest physical memory arena with page-granular dirty tracking
//!
//! The guest image is held in one anonymous mapping. Every write path marks
//! the touched physical pages dirty so a restore only copies the pages that
//! actually changed since the last restore.

use memmap2::MmapMut;
use thiserror::Error;

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use crate::addrs::{Cr3, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::page_table::{Entry, PageSize, Permissions, Translation};

/// Errors raised by guest memory accesses
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to map or fill the backing memory
    #[error("memory backing io error: {0}")]
    Io(#[from] std::io::Error),

    /// A physical access fell outside the guest image
    #[error("physical address out of bounds: {0:#x}")]
    PhysicalAddressOutOfBounds(PhysAddr),

    /// Attempted to read a virtual address with no mapping
    #[error("read from unmapped virtual address: {0}")]
    ReadFromUnmappedVirtualAddress(VirtAddr),

    /// Attempted to write a virtual address with no mapping
    #[error("write to unmapped virtual address: {0}")]
    WriteToUnmappedVirtualAddress(VirtAddr),

    /// Attempted to write a mapped but read-only virtual address
    #[error("write to read-only virtual address: {0}")]
    WriteToReadOnlyMemory(VirtAddr),

    /// The two memory images have different sizes
    #[error("restore source size mismatch: {0:#x} != {1:#x}")]
    RestoreSizeMismatch(u64, u64),
}

/// The guest physical memory image
pub struct Memory {
    /// Backing bytes for the entire guest physical address space
    backing: MmapMut,

    /// Physical pages written since the last restore
    dirty_pages: BTreeSet<PhysAddr>,
}

impl Memory {
    /// Create a guest image from raw bytes, rounding the size up to a page
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let size = (bytes.len() as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        #[allow(clippy::cast_possible_truncation)]
        let mut backing = MmapMut::map_anon(size as usize)?;
        backing[..bytes.len()].copy_from_slice(bytes);

        Ok(Self {
            backing,
            dirty_pages: BTreeSet::new(),
        })
    }

    /// Create a guest image by reading an entire memory dump file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let mut file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        let size = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        #[allow(clippy::cast_possible_truncation)]
        let mut backing = MmapMut::map_anon(size as usize)?;
        file.read_exact(&mut backing[..len as usize])?;

        Ok(Self {
            backing,
            dirty_pages: BTreeSet::new(),
        })
    }

    /// Create an identical copy of this image with an empty dirty set
    pub fn duplicate(&self) -> Result<Self, Error> {
        let mut backing = MmapMut::map_anon(self.backing.len())?;
        backing.copy_from_slice(&self.backing);

        Ok(Self {
            backing,
            dirty_pages: BTreeSet::new(),
        })
    }

    /// Size of the guest physical address space in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.backing.len() as u64
    }

    /// Host address of the backing, used to register the region with a
    /// hypervisor
    #[must_use]
    pub fn host_addr(&mut self) -> u64 {
        self.backing.as_mut_ptr() as u64
    }

    /// The entire image as a byte slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.backing
    }

    /// Physical pages written since the last restore
    #[must_use]
    pub fn dirty_pages(&self) -> &BTreeSet<PhysAddr> {
        &self.dirty_pages
    }

    /// Mark the given physical page dirty
    pub fn set_dirty(&mut self, page: PhysAddr) {
        self.dirty_pages.insert(page.page());
    }

    /// Bounds check a physical range against the image
    fn check_phys(&self, addr: PhysAddr, len: usize) -> Result<(), Error> {
        let end = addr
            .0
            .checked_add(len as u64)
            .ok_or(Error::PhysicalAddressOutOfBounds(addr))?;

        if end > self.size() {
            return Err(Error::PhysicalAddressOutOfBounds(addr));
        }

        Ok(())
    }

    /// Read bytes from a physical address
    pub fn read_phys(&self, addr: PhysAddr, buf: &mut [u8]) -> Result<(), Error> {
        self.check_phys(addr, buf.len())?;

        let start = addr.0 as usize;
        buf.copy_from_slice(&self.backing[start..start + buf.len()]);
        Ok(())
    }

    /// Read a little endian `u64` from a physical address
    pub fn read_phys_u64(&self, addr: PhysAddr) -> Result<u64, Error> {
        let mut bytes = [0u8; 8];
        self.read_phys(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write bytes to a physical address, marking the touched pages dirty
    pub fn write_phys_dirty(&mut self, addr: PhysAddr, bytes: &[u8]) -> Result<(), Error> {
        self.check_phys(addr, bytes.len())?;

        let start = addr.0 as usize;
        self.backing[start..start + bytes.len()].copy_from_slice(bytes);

        let mut page = addr.page();
        let last = addr.offset(bytes.len().saturating_sub(1) as u64).page();
        loop {
            self.dirty_pages.insert(page);
            if page == last {
                break;
            }
            page = page.offset(PAGE_SIZE);
        }

        Ok(())
    }

    /// Walk the 4-level page tables for `virt_addr` under `cr3`
    #[must_use]
    pub fn translate(&self, virt_addr: VirtAddr, cr3: Cr3) -> Translation {
        let indexes = virt_addr.table_indexes();
        let mut table = cr3.table_base();
        let mut perms = Permissions::all();

        for (level, &index) in indexes.iter().enumerate() {
            let Ok(raw) = self.read_phys_u64(table.offset(index as u64 * 8)) else {
                return Translation::not_present(virt_addr);
            };

            let entry = Entry(raw);
            if !entry.present() {
                return Translation::not_present(virt_addr);
            }

            perms.apply(entry);

            // Leaf of the walk, a 4 KiB mapping
            if level == 3 {
                let phys = entry.address().offset(virt_addr.page_offset());
                return Translation::new(virt_addr, phys, PageSize::Size4K, perms);
            }

            // Large page mapped above the page table level
            if entry.page_size() {
                let page_size = match level {
                    1 => PageSize::Size1G,
                    2 => PageSize::Size2M,
                    _ => return Translation::not_present(virt_addr),
                };

                let offset = virt_addr.0 & (page_size.bytes() - 1);
                let phys = entry.address().offset(offset);
                return Translation::new(virt_addr, phys, page_size, perms);
            }

            table = entry.address();
        }

        Translation::not_present(virt_addr)
    }

    /// Read guest virtual memory, splitting accesses at page boundaries
    pub fn read_bytes(&self, virt_addr: VirtAddr, cr3: Cr3, buf: &mut [u8]) -> Result<(), Error> {
        let mut curr = virt_addr;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let translation = self.translate(curr, cr3);
            let Some(phys) = translation.phys_addr() else {
                return Err(Error::ReadFromUnmappedVirtualAddress(curr));
            };

            let in_page = (PAGE_SIZE - curr.page_offset()) as usize;
            let chunk = remaining.len().min(in_page);

            let (head, tail) = remaining.split_at_mut(chunk);
            self.read_phys(phys, head)?;

            remaining = tail;
            curr = curr.offset(chunk as u64);
        }

        Ok(())
    }

    /// Write guest virtual memory through the dirty tracking path.
    ///
    /// Fails without a partial write if any page in the range is unmapped or
    /// read-only.
    pub fn write_bytes_dirty(
        &mut self,
        virt_addr: VirtAddr,
        cr3: Cr3,
        bytes: &[u8],
    ) -> Result<(), Error> {
        // Validate the whole range up front
        let mut curr = virt_addr;
        let end = virt_addr.offset(bytes.len().saturating_sub(1) as u64);
        loop {
            let translation = self.translate(curr, cr3);
            match translation.phys_addr() {
                None => return Err(Error::WriteToUnmappedVirtualAddress(curr)),
                Some(_) if !translation.perms.writable => {
                    return Err(Error::WriteToReadOnlyMemory(curr));
                }
                Some(_) => {}
            }

            if curr.page() == end.page() {
                break;
            }
            curr = curr.page().offset(PAGE_SIZE);
        }

        let mut curr = virt_addr;
        let mut remaining = bytes;

        while !remaining.is_empty() {
            let translation = self.translate(curr, cr3);
            let Some(phys) = translation.phys_addr() else {
                return Err(Error::WriteToUnmappedVirtualAddress(curr));
            };

            let in_page = (PAGE_SIZE - curr.page_offset()) as usize;
            let chunk = remaining.len().min(in_page);

            self.write_phys_dirty(phys, &remaining[..chunk])?;

            remaining = &remaining[chunk..];
            curr = curr.offset(chunk as u64);
        }

        Ok(())
    }

    /// Read a little endian `u64` from guest virtual memory
    pub fn read_u64(&self, virt_addr: VirtAddr, cr3: Cr3) -> Result<u64, Error> {
        let mut bytes = [0u8; 8];
        self.read_bytes(virt_addr, cr3, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Write a little endian `u64` to guest virtual memory
    pub fn write_u64_dirty(&mut self, virt_addr: VirtAddr, cr3: Cr3, val: u64) -> Result<(), Error> {
        self.write_bytes_dirty(virt_addr, cr3, &val.to_le_bytes())
    }

    /// Copy one page from the clean image into this image without marking
    /// it dirty
    pub fn restore_page(&mut self, page: PhysAddr, clean: &Memory) -> Result<(), Error> {
        let page = page.page();
        self.check_phys(page, PAGE_SIZE as usize)?;
        clean.check_phys(page, PAGE_SIZE as usize)?;

        let start = page.0 as usize;
        let end = start + PAGE_SIZE as usize;
        self.backing[start..end].copy_from_slice(&clean.backing[start..end]);
        Ok(())
    }

    /// Revert exactly the dirty pages back to the clean image and clear the
    /// dirty set. Returns the number of pages restored.
    pub fn restore_from(&mut self, clean: &Memory) -> Result<usize, Error> {
        if self.size() != clean.size() {
            return Err(Error::RestoreSizeMismatch(self.size(), clean.size()));
        }

        let dirty = std::mem::take(&mut self.dirty_pages);
        let restored = dirty.len();

        for page in dirty {
            self.restore_page(page, clean)?;
        }

        Ok(restored)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("size", &self.size())
            .field("dirty_pages", &self.dirty_pages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn translate_mapped_code_page() {
        let memory = testutil::build_memory();
        let translation = memory.translate(VirtAddr(testutil::CODE_VADDR), testutil::cr3());

        assert_eq!(translation.phys_addr(), Some(PhysAddr(0x5000)));
        assert_eq!(translation.page_size, Some(PageSize::Size4K));
        assert!(translation.perms.executable);
        assert!(!translation.perms.writable);
    }

    #[test]
    fn translate_data_page_is_writable_not_executable() {
        let memory = testutil::build_memory();
        let translation = memory.translate(VirtAddr(testutil::DATA_VADDR + 0x123), testutil::cr3());

        assert_eq!(translation.phys_addr(), Some(PhysAddr(0x6123)));
        assert!(translation.perms.writable);
        assert!(!translation.perms.executable);
    }

    #[test]
    fn translate_unmapped() {
        let memory = testutil::build_memory();
        let translation = memory.translate(VirtAddr(0x50_0000), testutil::cr3());
        assert_eq!(translation.phys_addr(), None);
    }

    #[test]
    fn virtual_read_write_round_trip() {
        let mut memory = testutil::build_memory();
        let cr3 = testutil::cr3();
        let addr = VirtAddr(testutil::DATA_VADDR + 8);

        memory.write_bytes_dirty(addr, cr3, b"hello").unwrap();

        let mut buf = [0u8; 5];
        memory.read_bytes(addr, cr3, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(
            memory.dirty_pages().iter().copied().collect::<Vec<_>>(),
            vec![PhysAddr(0x6000)]
        );
    }

    #[test]
    fn write_spanning_pages_marks_both_dirty() {
        let mut memory = testutil::build_memory();
        let cr3 = testutil::cr3();

        // Last 4 bytes of the data page and first 4 of the stack page
        let addr = VirtAddr(testutil::DATA_VADDR + 0xffc);
        memory.write_bytes_dirty(addr, cr3, &[0xaa; 8]).unwrap();

        let dirty: Vec<_> = memory.dirty_pages().iter().copied().collect();
        assert_eq!(dirty, vec![PhysAddr(0x6000), PhysAddr(0x7000)]);
    }

    #[test]
    fn write_to_read_only_page_fails_without_dirtying() {
        let mut memory = testutil::build_memory();
        let cr3 = testutil::cr3();

        let err = memory
            .write_bytes_dirty(VirtAddr(testutil::CODE_VADDR), cr3, &[0x90])
            .unwrap_err();
        assert!(matches!(err, Error::WriteToReadOnlyMemory(_)));
        assert!(memory.dirty_pages().is_empty());
    }

    #[test]
    fn write_to_unmapped_fails() {
        let mut memory = testutil::build_memory();
        let err = memory
            .write_bytes_dirty(VirtAddr(0x50_0000), testutil::cr3(), &[1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, Error::WriteToUnmappedVirtualAddress(_)));
    }

    #[test]
    fn restore_reverts_exactly_dirty_pages() {
        let clean = testutil::build_memory();
        let mut working = clean.duplicate().unwrap();
        let cr3 = testutil::cr3();

        working
            .write_bytes_dirty(VirtAddr(testutil::DATA_VADDR), cr3, &[0xff; 32])
            .unwrap();
        working
            .write_bytes_dirty(VirtAddr(testutil::STACK_VADDR + 0x10), cr3, &[0xee; 8])
            .unwrap();

        assert_ne!(working.as_slice(), clean.as_slice());

        let restored = working.restore_from(&clean).unwrap();
        assert_eq!(restored, 2);
        assert_eq!(working.as_slice(), clean.as_slice());
        assert!(working.dirty_pages().is_empty());

        // Second restore with no intervening writes is a no-op
        let restored = working.restore_from(&clean).unwrap();
        assert_eq!(restored, 0);
        assert_eq!(working.as_slice(), clean.as_slice());
    }

    #[test]
    fn phys_out_of_bounds() {
        let memory = testutil::build_memory();
        let mut buf = [0u8; 16];
        let err = memory
            .read_phys(PhysAddr(memory.size() - 8), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::PhysicalAddressOutOfBounds(_)));
    }
}
