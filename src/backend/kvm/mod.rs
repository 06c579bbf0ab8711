//! Linux KVM backend.
//!
//! This module provides hardware-assisted execution on Linux using KVM,
//! through the rust-vmm `kvm-ioctls` crate.
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support
//! - Access to /dev/kvm
//! - CPU with VT-x (Intel) or AMD-V (AMD)

mod vcpu;
mod vm;

pub use vcpu::KvmVcpu;
pub use vm::KvmVm;

use kvm_ioctls::{Cap, Kvm};

use crate::backend::{Capabilities, Hypervisor, VmBackend};
use crate::error::{Error, Result};

/// KVM API version every supported kernel reports.
const KVM_API_VERSION: i32 = 12;

/// Three pages for the real-mode TSS, just below the boot ROM.
pub(crate) const TSS_ADDRESS: usize = 0xfffb_d000;

/// Check if KVM is available on this system.
pub fn is_available() -> bool {
    std::path::Path::new("/dev/kvm").exists()
}

/// KVM session: an open handle on /dev/kvm.
pub struct KvmHypervisor {
    kvm: Kvm,
}

impl KvmHypervisor {
    /// Open /dev/kvm.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::from_kvm_init)?;
        let version = kvm.get_api_version();
        if version != KVM_API_VERSION {
            return Err(Error::BackendInitFailed(version));
        }
        log::debug!(target: "vmm_harness::backend", "kvm: API version {}", version);
        Ok(Self { kvm })
    }
}

/// Read a `kvm_intel`/`kvm_amd` module parameter.
fn module_param(name: &str) -> Option<bool> {
    ["kvm_intel", "kvm_amd"].iter().find_map(|module| {
        let path = format!("/sys/module/{}/parameters/{}", module, name);
        std::fs::read_to_string(path)
            .ok()
            .map(|value| matches!(value.trim(), "Y" | "1"))
    })
}

impl Hypervisor for KvmHypervisor {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn version(&self) -> u32 {
        self.kvm.get_api_version() as u32
    }

    fn capabilities(&self) -> Capabilities {
        let user_memory = self.kvm.check_extension(Cap::UserMemory);
        let readonly = self.kvm.check_extension(Cap::ReadonlyMem);
        let tss = self.kvm.check_extension(Cap::SetTssAddr);
        let working = user_memory && readonly && tss;

        if !working {
            log::warn!(
                target: "vmm_harness::backend",
                "kvm: missing capabilities (user memory: {}, read-only memory: {}, TSS: {})",
                user_memory,
                readonly,
                tss
            );
        }

        // Without EPT/NPT there is no unrestricted guest either
        let ept = module_param("ept").or_else(|| module_param("npt")).unwrap_or(false);
        Capabilities {
            working,
            fast_mmio: self.kvm.check_extension(Cap::Ioeventfd),
            ept,
            unrestricted_guest: module_param("unrestricted_guest").unwrap_or(ept),
            ram_64bit: cfg!(target_pointer_width = "64"),
            mem_quota_mb: None,
            vt_unsupported: !working,
            nx_unsupported: false,
        }
    }

    fn create_vm(&self) -> Result<Box<dyn VmBackend>> {
        let vm = self
            .kvm
            .create_vm()
            .map_err(|e| Error::VmCreateFailed(format!("KVM_CREATE_VM: {}", e)))?;
        vm.set_tss_address(TSS_ADDRESS)
            .map_err(|e| Error::VmCreateFailed(format!("KVM_SET_TSS_ADDR: {}", e)))?;
        log::debug!(target: "vmm_harness::backend", "kvm: created VM");
        Ok(Box::new(KvmVm::new(vm)))
    }
}
