//! Guest physical memory.
//!
//! Host buffers ([`GuestMemory`]) are allocated page-aligned and shared with
//! the backend that maps them. A [`MemoryRegion`] places (a window of) a
//! buffer at a guest-physical base, and the [`MemoryRegionTable`] keeps the
//! non-overlapping set of regions a VM has registered.

mod buffer;
mod guest;
mod table;

pub use buffer::GuestMemory;
pub use guest::{MemoryRegion, RegionKind};
pub use table::MemoryRegionTable;

/// Page size used for every alignment rule in the harness.
pub const PAGE_SIZE: u64 = 0x1000;

/// Check whether a value is a multiple of [`PAGE_SIZE`].
pub fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Memory layout used by the boot harness.
pub mod layout {
    /// RAM starts at physical address zero.
    pub const RAM_BASE: u64 = 0x0000_0000;

    /// Default RAM size (1 MiB).
    pub const RAM_SIZE: u64 = 256 * super::PAGE_SIZE;

    /// The boot ROM sits just below 4 GiB so the reset vector lands in it.
    pub const ROM_BASE: u64 = 0xFFFF_0000;

    /// Boot ROM size (64 KiB).
    pub const ROM_SIZE: u64 = 16 * super::PAGE_SIZE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(layout::ROM_BASE));
        assert!(!is_page_aligned(0x1800));
        assert!(!is_page_aligned(0xFFFF_FFF0));
    }

    #[test]
    fn test_layout_fits_below_4g() {
        assert_eq!(layout::ROM_BASE + layout::ROM_SIZE, 1 << 32);
        assert!(layout::RAM_BASE + layout::RAM_SIZE <= layout::ROM_BASE);
    }
}
