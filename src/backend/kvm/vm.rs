//! KVM VM: memory slots and vCPU creation.

use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use kvm_ioctls::VmFd;

use crate::backend::{VcpuBackend, VmBackend};
use crate::error::{Error, Result};
use crate::memory::{MemoryRegion, RegionKind};

use super::vcpu::KvmVcpu;

/// A KVM VM file descriptor plus the regions mapped into it.
pub struct KvmVm {
    vm: VmFd,
    /// Keeps the host buffers alive for as long as KVM may touch them
    regions: Vec<MemoryRegion>,
}

impl KvmVm {
    pub(crate) fn new(vm: VmFd) -> Self {
        Self {
            vm,
            regions: Vec::new(),
        }
    }
}

impl VmBackend for KvmVm {
    fn map_region(&mut self, region: &MemoryRegion) -> Result<()> {
        let slot = self.regions.len() as u32;
        let flags = match region.kind() {
            RegionKind::Ram => 0,
            RegionKind::Rom => KVM_MEM_READONLY,
        };
        let mem_region = kvm_userspace_memory_region {
            slot,
            flags,
            guest_phys_addr: region.guest_base(),
            memory_size: region.size(),
            userspace_addr: region.host_addr() as u64,
        };

        // Safety: the host range belongs to an mmap'd GuestMemory that this
        // VM keeps alive through `self.regions`.
        unsafe { self.vm.set_user_memory_region(mem_region) }.map_err(|e| {
            Error::BackendRejected(format!(
                "KVM_SET_USER_MEMORY_REGION slot {} at 0x{:x}: {}",
                slot,
                region.guest_base(),
                e
            ))
        })?;

        log::debug!(
            target: "vmm_harness::backend",
            "kvm: slot {} {} 0x{:x}..0x{:x} -> host 0x{:x}",
            slot,
            region.kind(),
            region.guest_base(),
            region.end(),
            region.host_addr()
        );
        self.regions.push(region.clone());
        Ok(())
    }

    fn create_vcpu(&mut self, id: u32) -> Result<Box<dyn VcpuBackend>> {
        let vcpu = self
            .vm
            .create_vcpu(id as u64)
            .map_err(|e| Error::VcpuCreateFailed(format!("KVM_CREATE_VCPU {}: {}", id, e)))?;
        log::debug!(target: "vmm_harness::backend", "kvm: created vCPU {}", id);
        Ok(Box::new(KvmVcpu::new(id, vcpu, self.regions.clone())))
    }
}
