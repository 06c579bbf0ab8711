//! Execution loop.
//!
//! Drives one vCPU from its loaded initial state to a terminal exit:
//!
//! ```text
//! Init -> Running -> ExitPending -> Terminal
//!            ^            |
//!            +-- Fixup <--+   (far transfer the backend did not complete)
//! ```
//!
//! Register state is re-read after every exit; a snapshot taken before a
//! resume is never trusted afterwards.

use crate::backend::VcpuExit;
use crate::descriptor;
use crate::error::Result;
use crate::image::FarTransfer;
use crate::regs::RegisterSnapshot;
use crate::vcpu::VcpuContext;
use crate::vm::VmContext;

/// Execution loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Registers loaded, guest not yet resumed.
    Init,
    /// Guest executing inside the backend.
    Running,
    /// Backend returned an exit; cached register state is stale.
    ExitPending,
    /// Harness is completing a control transfer for the guest.
    Fixup,
    /// Final exit accepted.
    Terminal,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Init => write!(f, "init"),
            LoopState::Running => write!(f, "running"),
            LoopState::ExitPending => write!(f, "exit-pending"),
            LoopState::Fixup => write!(f, "fixup"),
            LoopState::Terminal => write!(f, "terminal"),
        }
    }
}

/// Action to take after handling a VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Complete the far transfer, then resume the guest.
    Fixup(FarTransfer),
    /// Stop and report.
    Stop,
}

/// What the loop ended with.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// The exit that ended the run
    pub exit: VcpuExit,
    /// Registers read after that exit
    pub registers: RegisterSnapshot,
    /// Far transfers completed by the harness
    pub fixups: u32,
    /// Every state the loop passed through, in order
    pub trace: Vec<LoopState>,
}

/// Runs one vCPU of a VM until a terminal exit.
pub struct ExecutionLoop<'a> {
    vm: &'a VmContext,
    vcpu: &'a mut VcpuContext,
    far_transfer: Option<FarTransfer>,
    state: LoopState,
    trace: Vec<LoopState>,
    fixups: u32,
}

impl<'a> ExecutionLoop<'a> {
    pub fn new(vm: &'a VmContext, vcpu: &'a mut VcpuContext) -> Self {
        Self {
            vm,
            vcpu,
            far_transfer: None,
            state: LoopState::Init,
            trace: vec![LoopState::Init],
            fixups: 0,
        }
    }

    /// Far transfer the guest leaves for the harness to complete. It is
    /// completed at most once.
    pub fn far_transfer(mut self, transfer: Option<FarTransfer>) -> Self {
        self.far_transfer = transfer;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until a terminal exit.
    pub fn run(mut self) -> Result<LoopOutcome> {
        loop {
            self.transition(LoopState::Running);
            let exit = self.vcpu.resume()?;
            self.transition(LoopState::ExitPending);

            let registers = self.vcpu.read_registers()?;
            match self.dispatch(&exit, &registers) {
                ExitAction::Fixup(transfer) => {
                    self.transition(LoopState::Fixup);
                    self.complete_transfer(&transfer, registers)?;
                }
                ExitAction::Stop => {
                    self.transition(LoopState::Terminal);
                    log::debug!(
                        target: "vmm_harness::runner",
                        "terminal exit {} at {:04x}:{:08x}",
                        exit,
                        registers.cs.selector,
                        registers.eip
                    );
                    return Ok(LoopOutcome {
                        exit,
                        registers,
                        fixups: self.fixups,
                        trace: self.trace,
                    });
                }
            }
        }
    }

    /// Decide what an exit means for this run.
    fn dispatch(&mut self, exit: &VcpuExit, regs: &RegisterSnapshot) -> ExitAction {
        match (exit, self.far_transfer) {
            (VcpuExit::Hlt, Some(transfer)) if transfer.is_pending(regs) => {
                self.far_transfer = None;
                ExitAction::Fixup(transfer)
            }
            (VcpuExit::Unknown(code), _) => {
                log::warn!(target: "vmm_harness::runner", "unknown exit reason {}", code);
                ExitAction::Stop
            }
            _ => ExitAction::Stop,
        }
    }

    /// Patch CS:EIP to the transfer target and rebuild the CS cache from
    /// the active GDT, then write the registers back once.
    fn complete_transfer(&mut self, transfer: &FarTransfer, mut regs: RegisterSnapshot) -> Result<()> {
        regs.eip = transfer.offset;
        regs.cs = descriptor::resolve(self.vm.regions(), &regs.gdt, transfer.selector)?;
        self.vcpu.write_registers(&regs)?;
        self.fixups += 1;

        log::info!(
            target: "vmm_harness::runner",
            "completed far transfer to {:04x}:{:08x} (base 0x{:08x} limit 0x{:08x} ar 0x{:04x})",
            transfer.selector,
            transfer.offset,
            regs.cs.base,
            regs.cs.limit,
            regs.cs.access_rights
        );
        Ok(())
    }

    fn transition(&mut self, to: LoopState) {
        log::trace!(target: "vmm_harness::runner", "{} -> {}", self.state, to);
        self.state = to;
        self.trace.push(to);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::emulator::Emulator;
    use crate::backend::VcpuBackend;
    use crate::error::Error;
    use crate::image::{BootImage, TransferStrategy};
    use crate::memory::{layout, GuestMemory, MemoryRegion};
    use crate::regs::FpuState;
    use crate::vcpu::VcpuContext;

    /// Halts at the manual transfer placeholder, then fails whichever call
    /// comes next in `fail`.
    struct BrokenVcpu {
        regs: RegisterSnapshot,
        fail: &'static str,
    }

    impl BrokenVcpu {
        fn context(fail: &'static str) -> VcpuContext {
            let mut regs = RegisterSnapshot::reset();
            regs.eip = 0xFFCF;
            regs.cr0 |= crate::regs::cr0::PE;
            regs.gdt = crate::regs::TableRegister {
                base: 0xFFFF_FFD8,
                limit: 0x17,
            };
            VcpuContext::new(0, Box::new(BrokenVcpu { regs, fail }))
        }

        fn host_error() -> Error {
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "vcpu fd closed"))
        }
    }

    impl VcpuBackend for BrokenVcpu {
        fn get_registers(&self) -> Result<RegisterSnapshot> {
            match self.fail {
                "get" => Err(Self::host_error()),
                _ => Ok(self.regs.clone()),
            }
        }

        fn set_registers(&mut self, _regs: &RegisterSnapshot) -> Result<()> {
            Err(Self::host_error())
        }

        fn get_fpu(&self) -> Result<FpuState> {
            Err(Self::host_error())
        }

        fn run(&mut self) -> Result<VcpuExit> {
            match self.fail {
                "run" => Err(Self::host_error()),
                _ => Ok(VcpuExit::Hlt),
            }
        }
    }

    fn empty_vm() -> VmContext {
        VmContext::new(&Emulator::new()).unwrap()
    }

    use super::LoopState::*;

    fn boot(rom: &[u8]) -> (VmContext, VcpuContext) {
        let mut vm = VmContext::new(&Emulator::with_step_limit(Some(1_000_000))).unwrap();
        let ram = Arc::new(GuestMemory::new(layout::RAM_SIZE as usize).unwrap());
        vm.register_region(MemoryRegion::ram(layout::RAM_BASE, ram)).unwrap();
        let rom = Arc::new(GuestMemory::from_bytes(rom).unwrap());
        vm.register_region(MemoryRegion::rom(layout::ROM_BASE, rom)).unwrap();
        let vcpu = vm.create_vcpu().unwrap();
        (vm, vcpu)
    }

    #[test]
    fn test_halt_goes_straight_to_terminal() {
        let rom = vec![0xF4; layout::ROM_SIZE as usize];
        let (vm, mut vcpu) = boot(&rom);
        let outcome = ExecutionLoop::new(&vm, &mut vcpu).run().unwrap();

        assert_eq!(outcome.exit, VcpuExit::Hlt);
        assert_eq!(outcome.fixups, 0);
        assert_eq!(outcome.trace, vec![Init, Running, ExitPending, Terminal]);
        assert_eq!(outcome.registers.linear_ip(), 0xFFFF_FFF1);
    }

    #[test]
    fn test_manual_transfer_takes_fixup_path() {
        let image = BootImage::build(TransferStrategy::Manual).unwrap();
        let (vm, mut vcpu) = boot(&image.rom);
        let outcome = ExecutionLoop::new(&vm, &mut vcpu)
            .far_transfer(image.far_transfer)
            .run()
            .unwrap();

        assert_eq!(outcome.fixups, 1);
        assert_eq!(
            outcome.trace,
            vec![Init, Running, ExitPending, Fixup, Running, ExitPending, Terminal]
        );
        assert_eq!(outcome.exit, VcpuExit::Hlt);
        assert_eq!(outcome.registers.cs.selector, 0x08);
        assert_eq!(outcome.registers.cs.access_rights, 0xC09B);
        assert_eq!(outcome.registers.eip, 0xFFFF_FF9F);
        assert_eq!(outcome.registers.eax, 0xDEAD_BEEF);
    }

    #[test]
    fn test_manual_image_without_transfer_stops_at_placeholder() {
        let image = BootImage::build(TransferStrategy::Manual).unwrap();
        let (vm, mut vcpu) = boot(&image.rom);
        let outcome = ExecutionLoop::new(&vm, &mut vcpu).run().unwrap();

        assert_eq!(outcome.fixups, 0);
        assert_eq!(outcome.registers.linear_ip(), 0xFFFF_FFCF);
        assert!(!image.expectation.check(&outcome.exit, &outcome.registers).passed());
    }

    #[test]
    fn test_automatic_transfer_needs_no_fixup() {
        let image = BootImage::build(TransferStrategy::Automatic).unwrap();
        let (vm, mut vcpu) = boot(&image.rom);
        let outcome = ExecutionLoop::new(&vm, &mut vcpu)
            .far_transfer(image.far_transfer)
            .run()
            .unwrap();

        assert_eq!(outcome.fixups, 0);
        assert_eq!(outcome.trace, vec![Init, Running, ExitPending, Terminal]);
        assert!(image.expectation.check(&outcome.exit, &outcome.registers).passed());
    }

    #[test]
    fn test_non_halt_exit_is_terminal() {
        let mut rom = vec![0xF4; layout::ROM_SIZE as usize];
        // out 0x80, al at the reset vector
        rom[0xFFF0] = 0xE6;
        rom[0xFFF1] = 0x80;
        let (vm, mut vcpu) = boot(&rom);
        let outcome = ExecutionLoop::new(&vm, &mut vcpu).run().unwrap();
        assert!(matches!(outcome.exit, VcpuExit::IoOut { port: 0x80, .. }));
        assert_eq!(outcome.trace.last(), Some(&Terminal));
    }

    #[test]
    fn test_resume_failure_stops_without_fixup() {
        let vm = empty_vm();
        let mut vcpu = BrokenVcpu::context("run");
        let transfer = BootImage::build(TransferStrategy::Manual).unwrap().far_transfer;

        let err = ExecutionLoop::new(&vm, &mut vcpu)
            .far_transfer(transfer)
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::ResumeFailed(m) if m == "I/O error: vcpu fd closed"));
        assert_eq!(vcpu.exit_count(), 0);
    }

    #[test]
    fn test_register_query_failure_after_exit() {
        let vm = empty_vm();
        let mut vcpu = BrokenVcpu::context("get");
        let err = ExecutionLoop::new(&vm, &mut vcpu).run().unwrap_err();
        assert!(matches!(err, Error::QueryFailed(_)));
        assert_eq!(vcpu.exit_count(), 1);
    }

    #[test]
    fn test_fixup_write_failure_is_apply_failed() {
        // The halt matches the pending transfer, so the loop tries to write
        // the patched registers back and the backend refuses.
        let image = BootImage::build(TransferStrategy::Manual).unwrap();
        let (vm, _) = boot(&image.rom);
        let mut vcpu = BrokenVcpu::context("set");
        let err = ExecutionLoop::new(&vm, &mut vcpu)
            .far_transfer(image.far_transfer)
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::ApplyFailed(_)));
    }

    #[test]
    fn test_fixup_with_unmapped_gdt_fails() {
        let rom = vec![0xF4; layout::ROM_SIZE as usize];
        let (vm, mut vcpu) = boot(&rom);
        let mut regs = vcpu.read_registers().unwrap();
        regs.gdt.base = 0x4000_0000;
        regs.gdt.limit = 0x17;
        vcpu.write_registers(&regs).unwrap();

        let transfer = FarTransfer {
            halt_at: 0xFFFF_FFF0,
            selector: 0x08,
            offset: 0xFFFF_FF00,
        };
        let err = ExecutionLoop::new(&vm, &mut vcpu)
            .far_transfer(Some(transfer))
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::DescriptorTableUnmapped(0x4000_0000)));
    }

    #[test]
    fn test_transfer_completed_at_most_once() {
        // Every byte is HLT, so after the fixup the guest halts again at the
        // target; that halt is terminal even though it matches nothing new.
        let mut image = BootImage::build(TransferStrategy::Manual).unwrap();
        image.rom[0xFF00] = 0xF4;
        let (vm, mut vcpu) = boot(&image.rom);
        let outcome = ExecutionLoop::new(&vm, &mut vcpu)
            .far_transfer(image.far_transfer)
            .run()
            .unwrap();
        assert_eq!(outcome.fixups, 1);
        assert_eq!(outcome.registers.eip, 0xFFFF_FF01);
    }
}
