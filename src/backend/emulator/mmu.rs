//! Linear-to-physical translation and guest memory access.

use crate::backend::VcpuExit;
use crate::memory::{MemoryRegionTable, PAGE_SIZE};
use crate::regs::{cr0, cr4, RegisterSnapshot};

const PTE_PRESENT: u32 = 1 << 0;
const PDE_PAGE_SIZE: u32 = 1 << 7;

/// Page fault error code: the access was a write.
const PF_WRITE: u32 = 1 << 1;

/// Why an instruction could not retire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Access the backend hands to the VMM (MMIO)
    Exit(VcpuExit),
    Exception { vector: u8, error_code: u32 },
    PageFault { linear: u32, error_code: u32 },
}

impl Fault {
    pub(crate) const INVALID_OPCODE: Fault = Fault::Exception {
        vector: 6,
        error_code: 0,
    };

    pub(crate) fn general_protection(error_code: u32) -> Self {
        Fault::Exception {
            vector: 13,
            error_code,
        }
    }
}

/// Guest memory as seen through the current paging configuration.
pub(crate) struct Mmu<'a> {
    memory: &'a MemoryRegionTable,
    paging: bool,
    pse: bool,
    page_directory: u32,
}

impl<'a> Mmu<'a> {
    pub(crate) fn new(memory: &'a MemoryRegionTable, regs: &RegisterSnapshot) -> Self {
        Self {
            memory,
            paging: regs.cr0 & cr0::PG != 0 && regs.cr0 & cr0::PE != 0,
            pse: regs.cr4 & cr4::PSE != 0,
            page_directory: regs.cr3 & !0xFFF,
        }
    }

    /// Walk the two-level page tables.
    pub(crate) fn translate(&self, linear: u32, write: bool) -> Result<u64, Fault> {
        if !self.paging {
            return Ok(linear as u64);
        }

        let not_present = Fault::PageFault {
            linear,
            error_code: if write { PF_WRITE } else { 0 },
        };

        let pde_addr = self.page_directory as u64 + ((linear >> 22) as u64) * 4;
        let pde = self.read_entry(pde_addr)?;
        if pde & PTE_PRESENT == 0 {
            return Err(not_present);
        }

        if self.pse && pde & PDE_PAGE_SIZE != 0 {
            return Ok(((pde & 0xFFC0_0000) | (linear & 0x003F_FFFF)) as u64);
        }

        let pte_addr = (pde & !0xFFF) as u64 + (((linear >> 12) & 0x3FF) as u64) * 4;
        let pte = self.read_entry(pte_addr)?;
        if pte & PTE_PRESENT == 0 {
            return Err(not_present);
        }

        Ok(((pte & !0xFFF) | (linear & 0xFFF)) as u64)
    }

    fn read_entry(&self, addr: u64) -> Result<u32, Fault> {
        let mut bytes = [0u8; 4];
        self.read_physical(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_physical(&self, addr: u64, buf: &mut [u8]) -> Result<(), Fault> {
        self.memory.read(addr, buf).map_err(|_| {
            Fault::Exit(VcpuExit::MmioRead {
                addr,
                size: buf.len() as u8,
            })
        })
    }

    fn write_physical(&self, addr: u64, data: &[u8]) -> Result<(), Fault> {
        let mmio = || {
            Fault::Exit(VcpuExit::MmioWrite {
                addr,
                data: data.to_vec(),
            })
        };
        match self.memory.find(addr) {
            Some(region) if !region.is_readonly() => {
                self.memory.write(addr, data).map_err(|_| mmio())
            }
            _ => Err(mmio()),
        }
    }

    /// Read at a linear address. Accesses crossing a page are split.
    pub(crate) fn read(&self, linear: u32, buf: &mut [u8]) -> Result<(), Fault> {
        let (first, second) = split_at_page(linear, buf.len());
        let phys = self.translate(linear, false)?;
        if second == 0 {
            return self.read_physical(phys, buf);
        }
        let next = self.translate(linear.wrapping_add(first as u32), false)?;
        let (head, tail) = buf.split_at_mut(first);
        self.read_physical(phys, head)?;
        self.read_physical(next, tail)
    }

    /// Write at a linear address. Both halves of a page-crossing write are
    /// translated before anything is stored.
    pub(crate) fn write(&self, linear: u32, data: &[u8]) -> Result<(), Fault> {
        let (first, second) = split_at_page(linear, data.len());
        let phys = self.translate(linear, true)?;
        if second == 0 {
            return self.write_physical(phys, data);
        }
        let next = self.translate(linear.wrapping_add(first as u32), true)?;
        self.write_physical(phys, &data[..first])?;
        self.write_physical(next, &data[first..])
    }

    /// Read `size` (1, 2 or 4) bytes as a little-endian value.
    pub(crate) fn read_sized(&self, linear: u32, size: u8) -> Result<u32, Fault> {
        let mut bytes = [0u8; 4];
        self.read(linear, &mut bytes[..size as usize])?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub(crate) fn write_sized(&self, linear: u32, size: u8, value: u32) -> Result<(), Fault> {
        self.write(linear, &value.to_le_bytes()[..size as usize])
    }

    /// Descriptor tables live at guest-physical addresses.
    pub(crate) fn memory(&self) -> &'a MemoryRegionTable {
        self.memory
    }
}

fn split_at_page(linear: u32, len: usize) -> (usize, usize) {
    let room = (PAGE_SIZE - (linear as u64 & (PAGE_SIZE - 1))) as usize;
    if len <= room {
        (len, 0)
    } else {
        (room, len - room)
    }
}
