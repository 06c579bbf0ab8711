//! Harness builder: configures a backend and boots the guest program.

use std::sync::Arc;

use crate::backend::{self, emulator::Emulator, BackendKind, Capabilities, Hypervisor};
use crate::error::{Error, Result};
use crate::image::{BootImage, TransferStrategy, Verdict};
use crate::memory::{is_page_aligned, layout, GuestMemory, MemoryRegion};
use crate::regs::{FpuState, RegisterSnapshot};
use crate::runner::{ExecutionLoop, LoopOutcome};
use crate::vm::VmContext;

/// Validated harness configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub backend: BackendKind,
    /// Bytes of RAM mapped at guest-physical 0.
    pub ram_size: u64,
    pub strategy: TransferStrategy,
    /// Emulator only: instructions per resume before `Canceled`.
    pub step_limit: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Emulator,
            ram_size: layout::RAM_SIZE,
            strategy: TransferStrategy::Manual,
            step_limit: None,
        }
    }
}

/// Builder for creating a [`Harness`].
///
/// # Example
///
/// ```rust,no_run
/// use vmm_harness::{Harness, TransferStrategy};
///
/// let report = Harness::builder()
///     .strategy(TransferStrategy::Automatic)
///     .build()?
///     .run()?;
/// assert!(report.passed());
/// # Ok::<(), vmm_harness::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct HarnessBuilder {
    backend: Option<BackendKind>,
    ram_size: Option<u64>,
    strategy: Option<TransferStrategy>,
    step_limit: Option<u64>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the virtualization backend.
    ///
    /// Default: the built-in emulator
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    /// Set the amount of RAM mapped at guest-physical 0.
    ///
    /// Default: 1 MiB
    pub fn ram_size(mut self, bytes: u64) -> Self {
        self.ram_size = Some(bytes);
        self
    }

    /// Select how the guest enters 32-bit code.
    ///
    /// Default: [`TransferStrategy::Manual`]
    pub fn strategy(mut self, strategy: TransferStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Bound the emulator to `steps` instructions per resume.
    pub fn step_limit(mut self, steps: u64) -> Self {
        self.step_limit = Some(steps);
        self
    }

    /// Validate the configuration and open the backend.
    pub fn build(self) -> Result<Harness> {
        let defaults = HarnessConfig::default();
        let config = HarnessConfig {
            backend: self.backend.unwrap_or(defaults.backend),
            ram_size: self.ram_size.unwrap_or(defaults.ram_size),
            strategy: self.strategy.unwrap_or(defaults.strategy),
            step_limit: self.step_limit,
        };

        if config.ram_size == 0 || !is_page_aligned(config.ram_size) {
            return Err(Error::MisalignedSize(config.ram_size));
        }
        if layout::RAM_BASE + config.ram_size > layout::ROM_BASE {
            return Err(Error::InvalidGuestAddress(layout::RAM_BASE + config.ram_size));
        }

        let hypervisor: Box<dyn Hypervisor> = match config.backend {
            BackendKind::Emulator => Box::new(Emulator::with_step_limit(config.step_limit)),
            kind => {
                if config.step_limit.is_some() {
                    log::warn!(
                        target: "vmm_harness::builder",
                        "step limit ignored by the {} backend",
                        kind
                    );
                }
                backend::create(kind)?
            }
        };

        let capabilities = hypervisor.capabilities();
        if !capabilities.working {
            return Err(Error::BackendUnusable(capabilities.to_string()));
        }

        log::info!(
            target: "vmm_harness::builder",
            "{} v{} ready ({} transfer, {} KiB RAM)",
            hypervisor.name(),
            hypervisor.version(),
            config.strategy,
            config.ram_size / 1024
        );

        Ok(Harness {
            image: BootImage::build(config.strategy)?,
            config,
            hypervisor,
            capabilities,
        })
    }
}

/// A backend session plus the boot program to run on it.
pub struct Harness {
    config: HarnessConfig,
    hypervisor: Box<dyn Hypervisor>,
    capabilities: Capabilities,
    image: BootImage,
}

impl Harness {
    /// Create a new harness builder.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn image(&self) -> &BootImage {
        &self.image
    }

    pub fn backend_name(&self) -> &'static str {
        self.hypervisor.name()
    }

    /// Boot the guest on a fresh VM and check where it stopped.
    ///
    /// Every call builds a new VM, so a harness can be run repeatedly.
    pub fn run(&self) -> Result<BootReport> {
        let mut vm = VmContext::new(self.hypervisor.as_ref())?;

        let ram = Arc::new(GuestMemory::new(self.config.ram_size as usize)?);
        vm.register_region(MemoryRegion::ram(layout::RAM_BASE, ram))?;
        let rom = Arc::new(GuestMemory::from_bytes(&self.image.rom)?);
        vm.register_region(MemoryRegion::rom(self.image.rom_base, rom))?;

        let mut vcpu = vm.create_vcpu()?;
        vcpu.write_registers(&RegisterSnapshot::reset())?;

        let outcome = ExecutionLoop::new(&vm, &mut vcpu)
            .far_transfer(self.image.far_transfer)
            .run()?;
        let verdict = self.image.expectation.check(&outcome.exit, &outcome.registers);
        let fpu = vcpu.read_fpu_registers()?;

        log::info!(
            target: "vmm_harness::builder",
            "{} after {} exits: {}",
            outcome.exit,
            vcpu.exit_count(),
            if verdict.passed() { "passed" } else { "failed" }
        );

        Ok(BootReport {
            backend: self.hypervisor.name(),
            strategy: self.config.strategy,
            outcome,
            verdict,
            fpu,
            capabilities: self.capabilities.clone(),
        })
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("backend", &self.hypervisor.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Result of one boot.
#[derive(Debug, Clone)]
pub struct BootReport {
    pub backend: &'static str,
    pub strategy: TransferStrategy,
    pub outcome: LoopOutcome,
    pub verdict: Verdict,
    /// x87/SSE state at the terminal exit
    pub fpu: FpuState,
    pub capabilities: Capabilities,
}

impl BootReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

impl std::fmt::Display for BootReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Backend:  {} ({} transfer)", self.backend, self.strategy)?;
        writeln!(f, "Exit:     {} (reason {})", self.outcome.exit, self.outcome.exit.code())?;
        writeln!(f, "Fixups:   {}", self.outcome.fixups)?;
        writeln!(f)?;
        writeln!(f, "{}", self.outcome.registers)?;
        let check = |ok: bool| if ok { "ok" } else { "FAILED" };
        writeln!(f, "Halted:           {}", check(self.verdict.exit_was_halt))?;
        writeln!(f, "Expected address: {}", check(self.verdict.at_expected_address))?;
        writeln!(f, "Expected EAX:     {}", check(self.verdict.expected_result))?;
        write!(
            f,
            "Test {}",
            if self.passed() { "passed" } else { "failed" }
        )
    }
}
