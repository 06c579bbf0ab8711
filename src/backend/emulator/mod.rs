//! Software x86 backend.
//!
//! A deterministic interpreter for the 16/32-bit subset of x86 a firmware-style
//! boot program uses: real mode, protected mode, two-level paging, the control
//! and descriptor-table registers, and a handful of integer instructions. It
//! honors the same contract as a hardware backend, so everything above the
//! [`Hypervisor`] seam runs unchanged on hosts without virtualization support.
//!
//! What it does not model: interrupts and exception delivery (faults become
//! exits), segment limit and privilege checks, the x87/SSE unit, and A/D bit
//! updates in page tables.

mod cpu;
mod decode;
mod mmu;
mod vcpu;
mod vm;

pub use vcpu::EmulatorVcpu;
pub use vm::EmulatorVm;

use crate::backend::{Capabilities, Hypervisor, VmBackend};
use crate::error::Result;

/// Interface version reported by [`Emulator::version`].
pub const EMULATOR_VERSION: u32 = 1;

/// The emulator needs nothing from the host.
pub fn is_available() -> bool {
    true
}

/// Emulator backend session.
#[derive(Debug, Clone, Default)]
pub struct Emulator {
    step_limit: Option<u64>,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of instructions a single `run()` may retire before
    /// it returns [`VcpuExit::Canceled`](crate::backend::VcpuExit::Canceled).
    pub fn with_step_limit(step_limit: Option<u64>) -> Self {
        Self { step_limit }
    }

    pub fn step_limit(&self) -> Option<u64> {
        self.step_limit
    }
}

impl Hypervisor for Emulator {
    fn name(&self) -> &'static str {
        "emulator"
    }

    fn version(&self) -> u32 {
        EMULATOR_VERSION
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            working: true,
            unrestricted_guest: true,
            ram_64bit: true,
            ..Capabilities::default()
        }
    }

    fn create_vm(&self) -> Result<Box<dyn VmBackend>> {
        log::debug!(target: "vmm_harness::backend", "emulator: creating VM");
        Ok(Box::new(EmulatorVm::new(self.step_limit)))
    }
}
