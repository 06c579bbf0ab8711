//! Emulator vCPU.

use crate::backend::{VcpuBackend, VcpuExit};
use crate::error::Result;
use crate::memory::MemoryRegionTable;
use crate::regs::{FpuState, RegisterSnapshot, FXSAVE_SIZE};

use super::cpu::Cpu;

/// Emulated vCPU bound to the regions its VM had mapped when it was created.
#[derive(Debug)]
pub struct EmulatorVcpu {
    id: u32,
    cpu: Cpu,
    memory: MemoryRegionTable,
    step_limit: Option<u64>,
    /// Instructions retired since creation
    retired: u64,
    /// x87/SSE state as an FXSAVE image; no instruction modifies it
    fxsave: [u8; FXSAVE_SIZE],
}

impl EmulatorVcpu {
    pub(crate) fn new(id: u32, memory: MemoryRegionTable, step_limit: Option<u64>) -> Self {
        Self {
            id,
            cpu: Cpu::reset(),
            memory,
            step_limit,
            retired: 0,
            fxsave: FpuState::default().to_fxsave(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Instructions (and REP iterations) retired so far.
    pub fn retired(&self) -> u64 {
        self.retired
    }
}

impl VcpuBackend for EmulatorVcpu {
    fn get_registers(&self) -> Result<RegisterSnapshot> {
        Ok(self.cpu.regs.clone())
    }

    fn set_registers(&mut self, regs: &RegisterSnapshot) -> Result<()> {
        self.cpu.regs = regs.clone();
        Ok(())
    }

    /// The emulator has no x87/SSE unit; the image stays in the FNINIT state.
    fn get_fpu(&self) -> Result<FpuState> {
        Ok(FpuState::from_fxsave(&self.fxsave))
    }

    fn run(&mut self) -> Result<VcpuExit> {
        let mut steps = 0u64;
        loop {
            if self.step_limit.is_some_and(|limit| steps >= limit) {
                log::debug!(
                    target: "vmm_harness::backend",
                    "emulator: vCPU {} hit step limit at {:04x}:{:08x}",
                    self.id,
                    self.cpu.regs.cs.selector,
                    self.cpu.regs.eip
                );
                return Ok(VcpuExit::Canceled);
            }
            steps += 1;

            // Commit only instructions that complete
            let mut next = self.cpu.clone();
            match next.step(&self.memory) {
                Ok(None) => {
                    self.cpu = next;
                    self.retired += 1;
                }
                Ok(Some(exit)) => {
                    self.cpu = next;
                    self.retired += 1;
                    return Ok(exit);
                }
                Err(fault) => return Ok(self.cpu.fault_exit(fault)),
            }
        }
    }
}
