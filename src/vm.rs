//! VM Context: owns guest-physical memory registration.

use crate::backend::{Hypervisor, VmBackend};
use crate::error::{Error, Result};
use crate::memory::{is_page_aligned, MemoryRegion, MemoryRegionTable};
use crate::vcpu::VcpuContext;

/// Lifecycle of a [`VmContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Regions may still be registered.
    Configuring,
    /// At least one vCPU exists; the memory map is frozen.
    Sealed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Configuring => write!(f, "configuring"),
            VmState::Sealed => write!(f, "sealed"),
        }
    }
}

/// One VM on a backend and the regions registered with it.
///
/// Memory is build-once: every region must be registered before the first
/// vCPU is created, and registered regions are never moved or resized.
pub struct VmContext {
    backend: Box<dyn VmBackend>,
    backend_name: &'static str,
    regions: MemoryRegionTable,
    state: VmState,
    vcpu_count: u32,
}

impl VmContext {
    /// Create an empty VM on `hypervisor`.
    pub fn new(hypervisor: &dyn Hypervisor) -> Result<Self> {
        let backend = hypervisor.create_vm().map_err(|e| match e {
            Error::VmCreateFailed(_) => e,
            other => Error::VmCreateFailed(other.to_string()),
        })?;

        log::debug!(target: "vmm_harness::vm", "created VM on {}", hypervisor.name());
        Ok(Self {
            backend,
            backend_name: hypervisor.name(),
            regions: MemoryRegionTable::new(),
            state: VmState::Configuring,
            vcpu_count: 0,
        })
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Registered regions, ordered by guest-physical base.
    pub fn regions(&self) -> &MemoryRegionTable {
        &self.regions
    }

    pub fn vcpu_count(&self) -> u32 {
        self.vcpu_count
    }

    /// Make `region` visible to every vCPU created afterward.
    pub fn register_region(&mut self, region: MemoryRegion) -> Result<()> {
        if self.state != VmState::Configuring {
            return Err(Error::InvalidState {
                expected: VmState::Configuring.to_string(),
                actual: self.state.to_string(),
            });
        }

        if !is_page_aligned(region.host_addr() as u64) {
            return Err(Error::MisalignedHostBuffer(region.host_addr()));
        }
        if region.size() == 0 || !is_page_aligned(region.size()) {
            return Err(Error::MisalignedSize(region.size()));
        }
        if !is_page_aligned(region.guest_base()) {
            return Err(Error::MisalignedGuestAddress(region.guest_base()));
        }
        if region.guest_base().checked_add(region.size()).is_none() {
            return Err(Error::BackendRejected(format!(
                "region at 0x{:x} of 0x{:x} bytes wraps the address space",
                region.guest_base(),
                region.size()
            )));
        }

        // Check overlap before the backend sees the region, so a refused
        // region never reaches the hypervisor.
        let mut regions = self.regions.clone();
        regions.insert(region.clone())?;

        self.backend.map_region(&region).map_err(|e| match e {
            Error::BackendRejected(_) => e,
            other => Error::BackendRejected(other.to_string()),
        })?;
        self.regions = regions;

        log::info!(
            target: "vmm_harness::vm",
            "registered {} at 0x{:x}..0x{:x}",
            region.kind(),
            region.guest_base(),
            region.end()
        );
        Ok(())
    }

    /// Create the next vCPU. This freezes the memory map.
    pub fn create_vcpu(&mut self) -> Result<VcpuContext> {
        let id = self.vcpu_count;
        let backend = self.backend.create_vcpu(id).map_err(|e| match e {
            Error::VcpuCreateFailed(_) => e,
            other => Error::VcpuCreateFailed(other.to_string()),
        })?;

        self.vcpu_count += 1;
        self.state = VmState::Sealed;
        log::debug!(target: "vmm_harness::vm", "created vCPU {}", id);
        Ok(VcpuContext::new(id, backend))
    }
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext")
            .field("backend", &self.backend_name)
            .field("regions", &self.regions)
            .field("state", &self.state)
            .field("vcpu_count", &self.vcpu_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::emulator::Emulator;
    use crate::memory::{GuestMemory, RegionKind, PAGE_SIZE};

    fn vm() -> VmContext {
        VmContext::new(&Emulator::new()).unwrap()
    }

    fn ram(size: usize) -> Arc<GuestMemory> {
        Arc::new(GuestMemory::new(size).unwrap())
    }

    #[test]
    fn test_register_region() {
        let mut vm = vm();
        assert_eq!(vm.backend_name(), "emulator");
        vm.register_region(MemoryRegion::ram(0, ram(0x10000))).unwrap();
        assert_eq!(vm.regions().len(), 1);
        assert_eq!(vm.state(), VmState::Configuring);
    }

    #[test]
    fn test_region_past_top_of_address_space() {
        let mut vm = vm();
        vm.register_region(MemoryRegion::ram(0, ram(0x10000))).unwrap();
        let err = vm
            .register_region(MemoryRegion::ram(0xFFFF_FFFF_FFFF_F000, ram(0x2000)))
            .unwrap_err();
        assert!(matches!(err, Error::BackendRejected(_)));
        assert_eq!(vm.regions().len(), 1);

        // Ending just below the top is fine
        vm.register_region(MemoryRegion::ram(0xFFFF_FFFF_FFFF_E000, ram(0x1000)))
            .unwrap();
        assert_eq!(vm.regions().len(), 2);
    }

    #[test]
    fn test_misaligned_host_buffer() {
        let mut vm = vm();
        let buffer = ram(0x3000);
        let region =
            MemoryRegion::window(0, RegionKind::Ram, buffer, 0x800, PAGE_SIZE).unwrap();
        assert!(matches!(
            vm.register_region(region),
            Err(Error::MisalignedHostBuffer(_))
        ));
    }

    #[test]
    fn test_misaligned_size() {
        let mut vm = vm();
        let buffer = ram(0x3000);
        let region = MemoryRegion::window(0, RegionKind::Ram, buffer, 0, 0x1800).unwrap();
        assert!(matches!(
            vm.register_region(region),
            Err(Error::MisalignedSize(0x1800))
        ));
    }

    #[test]
    fn test_misaligned_guest_base() {
        let mut vm = vm();
        assert!(matches!(
            vm.register_region(MemoryRegion::ram(0x1234, ram(0x1000))),
            Err(Error::MisalignedGuestAddress(0x1234))
        ));
        assert!(vm.regions().is_empty());
    }

    #[test]
    fn test_host_buffer_checked_first() {
        let mut vm = vm();
        let buffer = ram(0x3000);
        // Everything is wrong; the host buffer is reported
        let region =
            MemoryRegion::window(0x123, RegionKind::Ram, buffer, 0x10, 0x100).unwrap();
        assert!(matches!(
            vm.register_region(region),
            Err(Error::MisalignedHostBuffer(_))
        ));
    }

    #[test]
    fn test_overlap_rejected() {
        let mut vm = vm();
        vm.register_region(MemoryRegion::ram(0, ram(0x10000))).unwrap();
        assert!(matches!(
            vm.register_region(MemoryRegion::ram(0x8000, ram(0x10000))),
            Err(Error::BackendRejected(_))
        ));
        assert_eq!(vm.regions().len(), 1);
    }

    #[test]
    fn test_memory_frozen_after_vcpu() {
        let mut vm = vm();
        vm.register_region(MemoryRegion::ram(0, ram(0x1000))).unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        assert_eq!(vcpu.id(), 0);
        assert_eq!(vm.state(), VmState::Sealed);

        let err = vm
            .register_region(MemoryRegion::ram(0x10000, ram(0x1000)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        assert_eq!(vm.create_vcpu().unwrap().id(), 1);
        assert_eq!(vm.vcpu_count(), 2);
    }
}
