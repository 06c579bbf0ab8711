//! Emulator VM: a guest-physical address space.

use crate::backend::{VcpuBackend, VmBackend};
use crate::error::{Error, Result};
use crate::memory::{MemoryRegion, MemoryRegionTable};

use super::vcpu::EmulatorVcpu;

/// Emulated VM.
#[derive(Debug, Default)]
pub struct EmulatorVm {
    memory: MemoryRegionTable,
    vcpu_ids: Vec<u32>,
    step_limit: Option<u64>,
}

impl EmulatorVm {
    pub fn new(step_limit: Option<u64>) -> Self {
        Self {
            step_limit,
            ..Self::default()
        }
    }

    /// Regions mapped so far.
    pub fn memory(&self) -> &MemoryRegionTable {
        &self.memory
    }
}

impl VmBackend for EmulatorVm {
    fn map_region(&mut self, region: &MemoryRegion) -> Result<()> {
        self.memory.insert(region.clone())?;
        log::debug!(
            target: "vmm_harness::backend",
            "emulator: mapped {} at 0x{:x} ({} bytes)",
            region.kind(),
            region.guest_base(),
            region.size()
        );
        Ok(())
    }

    fn create_vcpu(&mut self, id: u32) -> Result<Box<dyn VcpuBackend>> {
        if self.vcpu_ids.contains(&id) {
            return Err(Error::VcpuCreateFailed(format!("vCPU {} already exists", id)));
        }
        self.vcpu_ids.push(id);
        log::debug!(target: "vmm_harness::backend", "emulator: created vCPU {}", id);
        Ok(Box::new(EmulatorVcpu::new(
            id,
            self.memory.clone(),
            self.step_limit,
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::GuestMemory;

    #[test]
    fn test_map_rejects_overlap() {
        let mut vm = EmulatorVm::new(None);
        let ram = Arc::new(GuestMemory::new(0x2000).unwrap());
        vm.map_region(&MemoryRegion::ram(0, ram.clone())).unwrap();
        let err = vm.map_region(&MemoryRegion::ram(0x1000, ram)).unwrap_err();
        assert!(matches!(err, Error::BackendRejected(_)));
        assert_eq!(vm.memory().len(), 1);
    }

    #[test]
    fn test_duplicate_vcpu_id() {
        let mut vm = EmulatorVm::new(None);
        vm.create_vcpu(0).unwrap();
        assert!(matches!(vm.create_vcpu(0), Err(Error::VcpuCreateFailed(_))));
        assert!(vm.create_vcpu(1).is_ok());
    }
}
