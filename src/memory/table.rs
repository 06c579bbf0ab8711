//! The set of regions registered with a VM.

use crate::error::{Error, Result};

use super::MemoryRegion;

/// Non-overlapping guest-physical regions, ordered by base address.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegionTable {
    regions: Vec<MemoryRegion>,
}

impl MemoryRegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region, rejecting any overlap with an existing one.
    pub fn insert(&mut self, region: MemoryRegion) -> Result<()> {
        if let Some(existing) = self.regions.iter().find(|r| r.overlaps(&region)) {
            return Err(Error::BackendRejected(format!(
                "{} at 0x{:x}..0x{:x} overlaps {} at 0x{:x}..0x{:x}",
                region.kind(),
                region.guest_base(),
                region.end(),
                existing.kind(),
                existing.guest_base(),
                existing.end()
            )));
        }

        let index = self
            .regions
            .partition_point(|r| r.guest_base() < region.guest_base());
        self.regions.insert(index, region);
        Ok(())
    }

    /// Find the region containing a guest-physical address.
    pub fn find(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Read guest-physical memory. The access must not straddle regions.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let region = self.region_for(addr, buf.len())?;
        region.read(addr - region.guest_base(), buf)
    }

    /// Write guest-physical memory from the host side (ROM included).
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let region = self.region_for(addr, data.len())?;
        region.write(addr - region.guest_base(), data)
    }

    /// Read a little-endian dword.
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn region_for(&self, addr: u64, len: usize) -> Result<&MemoryRegion> {
        self.regions
            .iter()
            .find(|r| r.contains_range(addr, len as u64))
            .ok_or(Error::InvalidGuestAddress(addr))
    }
}
