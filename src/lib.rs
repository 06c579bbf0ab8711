//! # vmm-harness
//!
//! A minimal VMM harness that boots a hand-written x86 guest from the reset
//! vector, through 16-bit real mode, into 32-bit paged protected mode.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vmm_harness::{Harness, Result};
//!
//! fn main() -> Result<()> {
//!     let report = Harness::builder().build()?.run()?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! The pieces can also be driven one by one: a [`VmContext`] owns the
//! guest-physical memory map, a [`VcpuContext`] reads, writes and resumes
//! one vCPU, and [`runner::ExecutionLoop`] dispatches exits, completing the
//! real-mode to protected-mode far transfer when the guest leaves it to the
//! harness.
//!
//! ## Backends
//!
//! - **emulator**: built-in x86 interpreter, available everywhere
//! - **kvm**: Linux KVM, behind the `kvm` cargo feature

mod builder;
pub mod debug;
mod error;
mod vcpu;
mod vm;
pub mod runner;

pub mod backend;
pub mod descriptor;
pub mod image;
pub mod memory;
pub mod regs;

// Re-exports
pub use backend::{BackendKind, Capabilities, VcpuExit};
pub use builder::{BootReport, Harness, HarnessBuilder, HarnessConfig};
pub use error::{Error, Result};
pub use image::{BootImage, TransferStrategy};
pub use regs::{FpuState, RegisterSnapshot, Segment};
pub use vcpu::VcpuContext;
pub use vm::{VmContext, VmState};

/// Check if the current platform supports hardware virtualization.
///
/// The emulator backend works regardless of the answer.
pub fn is_supported() -> bool {
    backend::is_available(BackendKind::Kvm)
}

/// Name of the backend [`backend::preferred`] picks on this host.
pub fn backend_name() -> &'static str {
    backend::preferred().name()
}
