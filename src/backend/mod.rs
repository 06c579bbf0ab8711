//! Virtualization backend abstraction.
//!
//! This module defines the contract the harness consumes from the privileged
//! component that actually executes guest instructions, and the logic to
//! select and create a backend. Three traits mirror the three handles a
//! hypervisor hands out: the session ([`Hypervisor`]), a VM ([`VmBackend`])
//! and a vCPU ([`VcpuBackend`]).

use crate::error::{Error, Result};
use crate::memory::MemoryRegion;
use crate::regs::{FpuState, RegisterSnapshot};

pub mod emulator;

#[cfg(all(target_os = "linux", feature = "kvm"))]
pub mod kvm;

/// Exit reason from vCPU execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest executed HLT
    Hlt,
    /// I/O port read
    IoIn { port: u16, size: u8 },
    /// I/O port write
    IoOut { port: u16, data: Vec<u8> },
    /// Read from guest-physical memory with no RAM/ROM behind it
    MmioRead { addr: u64, size: u8 },
    /// Write to unbacked or read-only guest-physical memory
    MmioWrite { addr: u64, data: Vec<u8> },
    /// Fault the backend does not deliver to the guest
    Exception { vector: u8, error_code: u32, eip: u32 },
    /// Guest shutdown (triple fault)
    Shutdown,
    /// Execution was canceled before the guest exited on its own
    Canceled,
    /// Unknown exit reason
    Unknown(u32),
}

impl VcpuExit {
    /// Stable numeric code for the exit reason.
    pub fn code(&self) -> u32 {
        match self {
            VcpuExit::Hlt => 1,
            VcpuExit::IoIn { .. } => 2,
            VcpuExit::IoOut { .. } => 3,
            VcpuExit::MmioRead { .. } => 4,
            VcpuExit::MmioWrite { .. } => 5,
            VcpuExit::Exception { .. } => 6,
            VcpuExit::Shutdown => 7,
            VcpuExit::Canceled => 8,
            VcpuExit::Unknown(_) => 0xFFFF,
        }
    }
}

impl std::fmt::Display for VcpuExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VcpuExit::Hlt => write!(f, "HLT"),
            VcpuExit::IoIn { port, size } => write!(f, "I/O read port 0x{:x} ({} bytes)", port, size),
            VcpuExit::IoOut { port, data } => write!(f, "I/O write port 0x{:x} {:02x?}", port, data),
            VcpuExit::MmioRead { addr, size } => write!(f, "MMIO read 0x{:x} ({} bytes)", addr, size),
            VcpuExit::MmioWrite { addr, data } => write!(f, "MMIO write 0x{:x} {:02x?}", addr, data),
            VcpuExit::Exception {
                vector,
                error_code,
                eip,
            } => write!(
                f,
                "exception {} (error 0x{:x}) at 0x{:08x}",
                vector, error_code, eip
            ),
            VcpuExit::Shutdown => write!(f, "shutdown"),
            VcpuExit::Canceled => write!(f, "canceled"),
            VcpuExit::Unknown(code) => write!(f, "unknown exit {}", code),
        }
    }
}

/// What a backend can do on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The backend is usable on this host
    pub working: bool,
    pub fast_mmio: bool,
    /// Extended page tables
    pub ept: bool,
    /// Unrestricted guest (real mode runs without emulation help)
    pub unrestricted_guest: bool,
    /// RAM can be registered with 64-bit sizes
    pub ram_64bit: bool,
    /// Global memory quota in MiB, if one is enforced
    pub mem_quota_mb: Option<u64>,
    /// Virtualization extensions missing or disabled
    pub vt_unsupported: bool,
    /// Execute-disable not supported or disabled
    pub nx_unsupported: bool,
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.working {
            writeln!(f, "  backend cannot be used on this host")?;
            if self.vt_unsupported {
                writeln!(f, "  hardware virtualization not supported or disabled")?;
            }
            if self.nx_unsupported {
                writeln!(f, "  execute disable (NX) not supported or disabled")?;
            }
            return Ok(());
        }

        writeln!(f, "  backend can be used on this host")?;
        if self.fast_mmio {
            writeln!(f, "  fast MMIO supported")?;
        }
        if self.ept {
            writeln!(f, "  extended page tables (EPT) supported")?;
        }
        if self.unrestricted_guest {
            writeln!(f, "  unrestricted guest supported")?;
        }
        if self.ram_64bit {
            writeln!(f, "  64-bit RAM sizes supported")?;
        }
        if let Some(quota) = self.mem_quota_mb {
            writeln!(f, "  global memory quota: {} MB available", quota)?;
        }
        Ok(())
    }
}

/// A backend session.
pub trait Hypervisor {
    /// Get the backend name (e.g., "emulator", "kvm").
    fn name(&self) -> &'static str;

    /// Backend API version.
    fn version(&self) -> u32;

    fn capabilities(&self) -> Capabilities;

    /// Create an empty VM.
    fn create_vm(&self) -> Result<Box<dyn VmBackend>>;
}

/// A VM handle: one guest-physical address space.
pub trait VmBackend {
    /// Map a region into the guest-physical address space.
    ///
    /// Alignment has already been checked by the caller; backends report
    /// refusals (capacity, overlap, permissions) as `BackendRejected`.
    fn map_region(&mut self, region: &MemoryRegion) -> Result<()>;

    /// Create a vCPU that sees every region mapped so far.
    fn create_vcpu(&mut self, id: u32) -> Result<Box<dyn VcpuBackend>>;
}

/// A vCPU handle.
pub trait VcpuBackend {
    fn get_registers(&self) -> Result<RegisterSnapshot>;

    fn set_registers(&mut self, regs: &RegisterSnapshot) -> Result<()>;

    fn get_fpu(&self) -> Result<FpuState>;

    /// Run the vCPU until an exit occurs.
    fn run(&mut self) -> Result<VcpuExit>;
}

/// Available backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Software x86 interpreter; always available.
    #[default]
    Emulator,
    /// Linux KVM (`kvm` feature).
    Kvm,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Emulator => "emulator",
            BackendKind::Kvm => "kvm",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "emulator" | "emu" => Ok(BackendKind::Emulator),
            "kvm" => Ok(BackendKind::Kvm),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

/// Check if a backend can be opened on this platform.
pub fn is_available(kind: BackendKind) -> bool {
    match kind {
        BackendKind::Emulator => emulator::is_available(),
        BackendKind::Kvm => {
            #[cfg(all(target_os = "linux", feature = "kvm"))]
            {
                kvm::is_available()
            }

            #[cfg(not(all(target_os = "linux", feature = "kvm")))]
            {
                false
            }
        }
    }
}

/// Preferred backend for this platform: hardware if it can be opened.
pub fn preferred() -> BackendKind {
    if is_available(BackendKind::Kvm) {
        BackendKind::Kvm
    } else {
        BackendKind::Emulator
    }
}

/// Open a backend session.
pub fn create(kind: BackendKind) -> Result<Box<dyn Hypervisor>> {
    match kind {
        BackendKind::Emulator => Ok(Box::new(emulator::Emulator::new())),
        BackendKind::Kvm => {
            #[cfg(all(target_os = "linux", feature = "kvm"))]
            {
                kvm::KvmHypervisor::new().map(|b| Box::new(b) as Box<dyn Hypervisor>)
            }

            #[cfg(not(all(target_os = "linux", feature = "kvm")))]
            {
                Err(Error::BackendUnavailable(libc::ENOSYS))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emulator_always_available() {
        assert!(is_available(BackendKind::Emulator));
        let hv = create(BackendKind::Emulator).unwrap();
        assert_eq!(hv.name(), "emulator");
        assert!(hv.capabilities().working);
    }

    #[cfg(not(all(target_os = "linux", feature = "kvm")))]
    #[test]
    fn test_kvm_unavailable_without_feature() {
        assert!(!is_available(BackendKind::Kvm));
        assert_eq!(preferred(), BackendKind::Emulator);
        assert!(matches!(
            create(BackendKind::Kvm),
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("kvm".parse::<BackendKind>(), Ok(BackendKind::Kvm));
        assert_eq!("emulator".parse::<BackendKind>(), Ok(BackendKind::Emulator));
        assert!("hvf".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_exit_codes_distinct() {
        let exits = [
            VcpuExit::Hlt,
            VcpuExit::IoIn { port: 0, size: 1 },
            VcpuExit::IoOut { port: 0, data: vec![] },
            VcpuExit::MmioRead { addr: 0, size: 1 },
            VcpuExit::MmioWrite { addr: 0, data: vec![] },
            VcpuExit::Exception {
                vector: 6,
                error_code: 0,
                eip: 0,
            },
            VcpuExit::Shutdown,
            VcpuExit::Canceled,
            VcpuExit::Unknown(3),
        ];
        let mut codes: Vec<u32> = exits.iter().map(VcpuExit::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), exits.len());
    }

    #[test]
    fn test_capabilities_report() {
        let caps = Capabilities {
            working: true,
            ept: true,
            mem_quota_mb: Some(512),
            ..Capabilities::default()
        };
        let report = caps.to_string();
        assert!(report.contains("EPT"));
        assert!(report.contains("512 MB"));

        let broken = Capabilities {
            vt_unsupported: true,
            ..Capabilities::default()
        };
        assert!(broken.to_string().contains("not supported"));
    }
}
