//! Guest memory region abstraction.

use std::sync::Arc;

use crate::error::{Error, Result};

use super::GuestMemory;

/// Permission class of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Read-write RAM.
    Ram,
    /// Read-only ROM; guest writes are reported as MMIO exits.
    Rom,
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionKind::Ram => write!(f, "RAM"),
            RegionKind::Rom => write!(f, "ROM"),
        }
    }
}

/// A region of guest physical memory backed by a host buffer.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Guest physical address
    guest_base: u64,
    /// Size in bytes
    size: u64,
    /// RAM or ROM
    kind: RegionKind,
    /// Backing host buffer
    memory: Arc<GuestMemory>,
    /// Offset of the region's first byte within `memory`
    host_offset: usize,
}

impl MemoryRegion {
    /// Create a region covering a whole host buffer.
    pub fn new(guest_base: u64, kind: RegionKind, memory: Arc<GuestMemory>) -> Self {
        Self {
            guest_base,
            size: memory.size() as u64,
            kind,
            memory,
            host_offset: 0,
        }
    }

    /// Create a RAM region covering a whole host buffer.
    pub fn ram(guest_base: u64, memory: Arc<GuestMemory>) -> Self {
        Self::new(guest_base, RegionKind::Ram, memory)
    }

    /// Create a ROM region covering a whole host buffer.
    pub fn rom(guest_base: u64, memory: Arc<GuestMemory>) -> Self {
        Self::new(guest_base, RegionKind::Rom, memory)
    }

    /// Create a region over `size` bytes of `memory` starting at `host_offset`.
    ///
    /// The window only has to fit inside the buffer; alignment is checked
    /// when the region is registered with a VM.
    pub fn window(
        guest_base: u64,
        kind: RegionKind,
        memory: Arc<GuestMemory>,
        host_offset: usize,
        size: u64,
    ) -> Result<Self> {
        let fits = (host_offset as u64)
            .checked_add(size)
            .is_some_and(|end| end <= memory.size() as u64);
        if !fits {
            return Err(Error::RegionOutOfBounds {
                offset: host_offset,
                size,
                capacity: memory.size(),
            });
        }

        Ok(Self {
            guest_base,
            size,
            kind,
            memory,
            host_offset,
        })
    }

    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn is_readonly(&self) -> bool {
        self.kind == RegionKind::Rom
    }

    /// Exclusive end address, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.guest_base.saturating_add(self.size)
    }

    /// Host address of the region's first byte.
    pub fn host_addr(&self) -> usize {
        self.memory.host_addr() + self.host_offset
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_base && addr < self.end()
    }

    /// Check whether `[addr, addr + len)` lies entirely inside this region.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        self.contains(addr) && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    /// Get the offset of an address within this region.
    pub fn offset_of(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.guest_base)
        } else {
            None
        }
    }

    /// Check whether two regions share any guest-physical byte.
    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.guest_base < other.end() && other.guest_base < self.end()
    }

    /// Read from the region at a region-relative offset.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        self.memory.read(self.host_offset + offset as usize, buf)
    }

    /// Write to the region at a region-relative offset.
    ///
    /// This is a host-side write and ignores the ROM permission, which only
    /// restricts the guest.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.memory.write(self.host_offset + offset as usize, data)
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::InvalidGuestAddress(self.guest_base + offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(size: usize) -> Arc<GuestMemory> {
        Arc::new(GuestMemory::new(size).unwrap())
    }

    #[test]
    fn test_region_contains() {
        let region = MemoryRegion::rom(0xFFFF_0000, buffer(0x10000));
        assert!(region.contains(0xFFFF_FFF0));
        assert!(!region.contains(0xFFFE_FFFF));
        assert_eq!(region.end(), 0x1_0000_0000);
        assert_eq!(region.offset_of(0xFFFF_FFD8), Some(0xFFD8));
        assert_eq!(region.offset_of(0x1000), None);
    }

    #[test]
    fn test_region_contains_range() {
        let region = MemoryRegion::ram(0, buffer(0x1000));
        assert!(region.contains_range(0xff8, 8));
        assert!(!region.contains_range(0xffc, 8));
    }

    #[test]
    fn test_region_overlap() {
        let a = MemoryRegion::ram(0, buffer(0x2000));
        let b = MemoryRegion::ram(0x1000, buffer(0x1000));
        let c = MemoryRegion::ram(0x2000, buffer(0x1000));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_window_bounds() {
        let mem = buffer(0x2000);
        let region = MemoryRegion::window(0, RegionKind::Ram, mem.clone(), 0x1000, 0x1000).unwrap();
        assert_eq!(region.host_addr(), mem.host_addr() + 0x1000);

        let err = MemoryRegion::window(0, RegionKind::Ram, mem, 0x1000, 0x2000).unwrap_err();
        assert!(matches!(err, Error::RegionOutOfBounds { .. }));
    }

    #[test]
    fn test_window_read_write() {
        let mem = buffer(0x2000);
        let region = MemoryRegion::window(0x8000, RegionKind::Rom, mem.clone(), 0x1000, 0x1000).unwrap();
        region.write(4, &[0xaa, 0xbb]).unwrap();

        let mut raw = [0u8; 2];
        mem.read(0x1004, &mut raw).unwrap();
        assert_eq!(raw, [0xaa, 0xbb]);
        assert!(region.write(0xfff, &[0, 0]).is_err());
    }
}
