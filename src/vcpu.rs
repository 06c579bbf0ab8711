//! VCPU Context: one execution context bound to a VM.

use crate::backend::{VcpuBackend, VcpuExit};
use crate::error::{Error, Result};
use crate::regs::{FpuState, RegisterSnapshot};

/// A vCPU created by [`VmContext::create_vcpu`](crate::VmContext::create_vcpu).
///
/// `resume` and `write_registers` take `&mut self`, so register writes can
/// never race with guest execution.
pub struct VcpuContext {
    id: u32,
    backend: Box<dyn VcpuBackend>,
    exits: u64,
    last_exit: Option<VcpuExit>,
}

impl VcpuContext {
    pub(crate) fn new(id: u32, backend: Box<dyn VcpuBackend>) -> Self {
        Self {
            id,
            backend,
            exits: 0,
            last_exit: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of exits returned by [`resume`](Self::resume) so far.
    pub fn exit_count(&self) -> u64 {
        self.exits
    }

    pub fn last_exit(&self) -> Option<&VcpuExit> {
        self.last_exit.as_ref()
    }

    /// Read the architectural register state.
    pub fn read_registers(&self) -> Result<RegisterSnapshot> {
        self.backend.get_registers().map_err(|e| match e {
            Error::QueryFailed(_) => e,
            other => Error::QueryFailed(other.to_string()),
        })
    }

    /// Replace the register state. Reading back before the next `resume`
    /// returns exactly `regs`.
    pub fn write_registers(&mut self, regs: &RegisterSnapshot) -> Result<()> {
        self.backend.set_registers(regs).map_err(|e| match e {
            Error::ApplyFailed(_) => e,
            other => Error::ApplyFailed(other.to_string()),
        })
    }

    /// Read x87/SSE state.
    pub fn read_fpu_registers(&self) -> Result<FpuState> {
        self.backend.get_fpu().map_err(|e| match e {
            Error::QueryFailed(_) => e,
            other => Error::QueryFailed(other.to_string()),
        })
    }

    /// Run the guest until the backend reports an exit.
    pub fn resume(&mut self) -> Result<VcpuExit> {
        let exit = self.backend.run().map_err(|e| match e {
            Error::ResumeFailed(_) => e,
            other => Error::ResumeFailed(other.to_string()),
        })?;

        self.exits += 1;
        log::debug!(target: "vmm_harness::vcpu", "vCPU {} exit #{}: {}", self.id, self.exits, exit);
        self.last_exit = Some(exit.clone());
        Ok(exit)
    }
}

impl std::fmt::Debug for VcpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcpuContext")
            .field("id", &self.id)
            .field("exits", &self.exits)
            .field("last_exit", &self.last_exit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::emulator::Emulator;
    use crate::memory::{GuestMemory, MemoryRegion};
    use crate::regs::Segment;
    use crate::vm::VmContext;

    /// Backend whose every call fails, either with a host error or with an
    /// error that already names the failed operation.
    struct FailingVcpu {
        typed: bool,
    }

    impl FailingVcpu {
        fn error(&self, typed: fn(String) -> Error) -> Error {
            if self.typed {
                typed("backend detail".into())
            } else {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "device gone"))
            }
        }
    }

    impl VcpuBackend for FailingVcpu {
        fn get_registers(&self) -> Result<RegisterSnapshot> {
            Err(self.error(Error::QueryFailed))
        }

        fn set_registers(&mut self, _regs: &RegisterSnapshot) -> Result<()> {
            Err(self.error(Error::ApplyFailed))
        }

        fn get_fpu(&self) -> Result<FpuState> {
            Err(self.error(Error::QueryFailed))
        }

        fn run(&mut self) -> Result<VcpuExit> {
            Err(self.error(Error::ResumeFailed))
        }
    }

    fn failing(typed: bool) -> VcpuContext {
        VcpuContext::new(0, Box::new(FailingVcpu { typed }))
    }

    fn vcpu_with_code(code: &[u8]) -> VcpuContext {
        let mut vm = VmContext::new(&Emulator::new()).unwrap();
        let ram = Arc::new(GuestMemory::new(0x10000).unwrap());
        ram.write(0x1000, code).unwrap();
        vm.register_region(MemoryRegion::ram(0, ram)).unwrap();
        let mut vcpu = vm.create_vcpu().unwrap();

        let mut regs = vcpu.read_registers().unwrap();
        regs.cs = Segment::real_mode(0x0100, regs.cs.access_rights);
        regs.eip = 0;
        vcpu.write_registers(&regs).unwrap();
        vcpu
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut vcpu = vcpu_with_code(&[0xF4]);
        let mut regs = vcpu.read_registers().unwrap();
        regs.eax = 0xDEAD_BEEF;
        regs.esi = 0x1000_0000;
        regs.cr3 = 0x1000;
        regs.cs = Segment {
            selector: 0x08,
            base: 0,
            limit: 0xFFFF_FFFF,
            access_rights: 0xC09B,
        };
        regs.gdt.base = 0xFFFF_FFD8;
        regs.gdt.limit = 0x18;

        vcpu.write_registers(&regs).unwrap();
        assert_eq!(vcpu.read_registers().unwrap(), regs);
        // Reads are repeatable
        assert_eq!(vcpu.read_registers().unwrap(), regs);
    }

    #[test]
    fn test_resume_records_exits() {
        // out 0x80, al; hlt
        let mut vcpu = vcpu_with_code(&[0xE6, 0x80, 0xF4]);
        assert_eq!(vcpu.exit_count(), 0);
        assert!(vcpu.last_exit().is_none());

        assert!(matches!(vcpu.resume().unwrap(), VcpuExit::IoOut { port: 0x80, .. }));
        assert_eq!(vcpu.resume().unwrap(), VcpuExit::Hlt);
        assert_eq!(vcpu.exit_count(), 2);
        assert_eq!(vcpu.last_exit(), Some(&VcpuExit::Hlt));

        let regs = vcpu.read_registers().unwrap();
        assert_eq!(regs.linear_ip(), 0x1003);
    }

    #[test]
    fn test_fpu_read() {
        let vcpu = vcpu_with_code(&[0xF4]);
        let fpu = vcpu.read_fpu_registers().unwrap();
        assert_eq!(fpu.fcw, 0x037F);
        assert_eq!(fpu.mxcsr, 0x1F80);
    }

    #[test]
    fn test_backend_errors_are_wrapped_by_operation() {
        let mut vcpu = failing(false);
        let cause = "I/O error: device gone";

        assert!(matches!(vcpu.read_registers(), Err(Error::QueryFailed(m)) if m == cause));
        let regs = RegisterSnapshot::reset();
        assert!(matches!(vcpu.write_registers(&regs), Err(Error::ApplyFailed(m)) if m == cause));
        assert!(matches!(vcpu.read_fpu_registers(), Err(Error::QueryFailed(m)) if m == cause));
        assert!(matches!(vcpu.resume(), Err(Error::ResumeFailed(m)) if m == cause));

        // A failed resume is not an exit
        assert_eq!(vcpu.exit_count(), 0);
        assert!(vcpu.last_exit().is_none());
    }

    #[test]
    fn test_typed_backend_errors_pass_through() {
        let mut vcpu = failing(true);
        let regs = RegisterSnapshot::reset();

        let err = vcpu.read_registers().unwrap_err();
        assert_eq!(err.to_string(), "failed to read vCPU registers: backend detail");
        let err = vcpu.write_registers(&regs).unwrap_err();
        assert_eq!(err.to_string(), "failed to write vCPU registers: backend detail");
        let err = vcpu.resume().unwrap_err();
        assert_eq!(err.to_string(), "failed to resume vCPU: backend detail");
        assert!(!err.is_setup_failure());
    }
}
