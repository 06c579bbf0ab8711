//! Error types for vmm-harness.

use thiserror::Error;

/// Result type alias using vmm-harness's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or driving a guest.
///
/// Nothing here is retried: the harness is a one-shot boot sequence and any
/// error aborts it with the originating cause.
#[derive(Error, Debug)]
pub enum Error {
    // Backend session errors
    #[error("virtualization backend not available (code {0})")]
    BackendUnavailable(i32),

    #[error("failed to initialize virtualization backend (code {0})")]
    BackendInitFailed(i32),

    #[error("virtualization backend cannot be used on this host: {0}")]
    BackendUnusable(String),

    #[error("failed to create VM: {0}")]
    VmCreateFailed(String),

    #[error("failed to create vCPU: {0}")]
    VcpuCreateFailed(String),

    // Region registration errors
    #[error("host buffer at 0x{0:x} is not page-aligned")]
    MisalignedHostBuffer(usize),

    #[error("region size 0x{0:x} is not a multiple of the page size")]
    MisalignedSize(u64),

    #[error("guest physical address 0x{0:x} is not page-aligned")]
    MisalignedGuestAddress(u64),

    #[error("backend rejected memory region: {0}")]
    BackendRejected(String),

    #[error("region window 0x{offset:x}+0x{size:x} exceeds host buffer of 0x{capacity:x} bytes")]
    RegionOutOfBounds {
        offset: usize,
        size: u64,
        capacity: usize,
    },

    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("image write of 0x{len:x} bytes at 0x{offset:x} overruns 0x{size:x}-byte image")]
    ImageOverrun { offset: usize, len: usize, size: usize },

    // Register synchronization errors
    #[error("failed to read vCPU registers: {0}")]
    QueryFailed(String),

    #[error("failed to write vCPU registers: {0}")]
    ApplyFailed(String),

    #[error("failed to resume vCPU: {0}")]
    ResumeFailed(String),

    // Descriptor resolution errors
    #[error("descriptor table at 0x{0:x} is not backed by a registered region")]
    DescriptorTableUnmapped(u64),

    #[error("selector 0x{selector:04x} lies outside descriptor table limit 0x{limit:x}")]
    SelectorOutOfRange { selector: u16, limit: u16 },

    // Lifecycle errors
    #[error("not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("invalid guest address: 0x{0:x}")]
    InvalidGuestAddress(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error happened before the guest could run at all.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_)
                | Error::BackendInitFailed(_)
                | Error::BackendUnusable(_)
                | Error::VmCreateFailed(_)
                | Error::VcpuCreateFailed(_)
                | Error::MisalignedHostBuffer(_)
                | Error::MisalignedSize(_)
                | Error::MisalignedGuestAddress(_)
                | Error::BackendRejected(_)
                | Error::RegionOutOfBounds { .. }
                | Error::MemoryAllocationFailed(_)
                | Error::ImageOverrun { .. }
        )
    }

    /// Create a backend error from a KVM errno.
    #[cfg(all(target_os = "linux", feature = "kvm"))]
    pub(crate) fn from_kvm_init(err: kvm_ioctls::Error) -> Self {
        match err.errno() {
            libc::ENOENT | libc::ENXIO | libc::ENODEV => Error::BackendUnavailable(err.errno()),
            code => Error::BackendInitFailed(code),
        }
    }
}
