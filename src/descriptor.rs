//! Segment descriptor decoding and the descriptor resolver.
//!
//! When a far control transfer changes CS without the backend refreshing the
//! segment's cached base/limit/access rights, the harness rebuilds them from
//! the descriptor table in guest memory. The same decoding is used by the
//! emulator backend whenever it loads a segment register in protected mode.
//!
//! Descriptor layout (little-endian, 8 bytes):
//!
//! ```text
//!  63      56 55  52 51  48 47      40 39      32 31            16 15             0
//! +----------+------+------+----------+----------+----------------+----------------+
//! | base     | G D  | limit| access   | base     | base           | limit          |
//! | 31..24   | L AVL| 19..16 byte    | 23..16   | 15..0          | 15..0          |
//! +----------+------+------+----------+----------+----------------+----------------+
//! ```

use crate::error::{Error, Result};
use crate::memory::MemoryRegionTable;
use crate::regs::{access, Segment, TableRegister};

/// Size of one descriptor table entry.
pub const DESCRIPTOR_SIZE: u64 = 8;

/// Selector bits that are not part of the table offset (RPL and TI).
const SELECTOR_FLAGS: u16 = 0x7;

/// A raw 8-byte segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentDescriptor(pub u64);

impl SegmentDescriptor {
    /// The all-zero null descriptor.
    pub const NULL: SegmentDescriptor = SegmentDescriptor(0);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Build a descriptor from its fields.
    ///
    /// `limit` is the raw 20-bit value and `access_rights` uses the packed
    /// 16-bit layout (`0xF0FF` bits significant).
    pub fn encode(base: u32, limit: u32, access_rights: u16) -> Self {
        let base = base as u64;
        let limit = limit as u64;
        let access_rights = access_rights as u64;

        Self(
            ((base & 0xFF00_0000) << 32)
                | ((access_rights & 0xF0FF) << 40)
                | ((limit & 0x000F_0000) << 32)
                | ((base & 0x00FF_FFFF) << 16)
                | (limit & 0x0000_FFFF),
        )
    }

    /// 32-bit segment base assembled from its three split fields.
    pub fn base(self) -> u32 {
        let low = (self.0 >> 16) & 0xFFFF;
        let middle = (self.0 >> 32) & 0xFF;
        let high = (self.0 >> 56) & 0xFF;
        (low | (middle << 16) | (high << 24)) as u32
    }

    /// The 20-bit limit exactly as stored.
    pub fn raw_limit(self) -> u32 {
        ((self.0 & 0xFFFF) | (((self.0 >> 48) & 0xF) << 16)) as u32
    }

    /// Access byte plus flag nibble, packed into 16 bits.
    pub fn access_rights(self) -> u16 {
        ((self.0 >> 40) & 0xF0FF) as u16
    }

    /// Whether the limit is expressed in 4 KiB units (bit 55).
    pub fn granular(self) -> bool {
        self.access_rights() & access::GRANULARITY != 0
    }

    pub fn present(self) -> bool {
        self.access_rights() & access::PRESENT != 0
    }

    /// Byte-granular limit.
    pub fn limit(self) -> u32 {
        let raw = self.raw_limit();
        if self.granular() {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    /// The cached segment state a segment register holds after loading
    /// `selector` from this descriptor.
    pub fn to_segment(self, selector: u16) -> Segment {
        Segment {
            selector,
            base: self.base(),
            limit: self.limit(),
            access_rights: self.access_rights(),
        }
    }
}

/// Read the descriptor `selector` refers to from the table described by
/// `table`.
///
/// The table base is a guest-physical address. The RPL/TI bits of the
/// selector are ignored when indexing.
pub fn read_descriptor(
    memory: &MemoryRegionTable,
    table: &TableRegister,
    selector: u16,
) -> Result<SegmentDescriptor> {
    let offset = (selector & !SELECTOR_FLAGS) as u64;
    if offset + DESCRIPTOR_SIZE - 1 > table.limit as u64 {
        return Err(Error::SelectorOutOfRange {
            selector,
            limit: table.limit,
        });
    }

    let table_base = table.base as u64;
    let region = memory
        .find(table_base)
        .ok_or(Error::DescriptorTableUnmapped(table_base))?;

    let entry_addr = table_base + offset;
    if !region.contains_range(entry_addr, DESCRIPTOR_SIZE) {
        return Err(Error::DescriptorTableUnmapped(table_base));
    }

    let mut raw = [0u8; DESCRIPTOR_SIZE as usize];
    region.read(entry_addr - region.guest_base(), &mut raw)?;
    Ok(SegmentDescriptor::from_bytes(raw))
}

/// Produce the full cached segment record for `selector`.
pub fn resolve(
    memory: &MemoryRegionTable,
    table: &TableRegister,
    selector: u16,
) -> Result<Segment> {
    let descriptor = read_descriptor(memory, table, selector)?;
    let segment = descriptor.to_segment(selector);
    log::debug!(
        "resolved selector 0x{:04x}: base=0x{:08x} limit=0x{:08x} ar=0x{:04x}",
        selector,
        segment.base,
        segment.limit,
        segment.access_rights
    );
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::{GuestMemory, MemoryRegion};

    const FLAT_CODE: [u8; 8] = [0xff, 0xff, 0x00, 0x00, 0x00, 0x9b, 0xcf, 0x00];
    const FLAT_DATA: [u8; 8] = [0xff, 0xff, 0x00, 0x00, 0x00, 0x93, 0xcf, 0x00];

    fn table_in_rom() -> (MemoryRegionTable, TableRegister) {
        let rom = Arc::new(GuestMemory::filled(0x10000, 0xf4).unwrap());
        rom.write(0xffd8, &[0u8; 8]).unwrap();
        rom.write(0xffe0, &FLAT_CODE).unwrap();
        rom.write(0xffe8, &FLAT_DATA).unwrap();

        let mut memory = MemoryRegionTable::new();
        memory.insert(MemoryRegion::rom(0xFFFF_0000, rom)).unwrap();
        let gdt = TableRegister {
            base: 0xFFFF_FFD8,
            limit: 0x18,
        };
        (memory, gdt)
    }

    #[test]
    fn test_decode_flat_code() {
        let desc = SegmentDescriptor::from_bytes(FLAT_CODE);
        assert_eq!(desc.base(), 0);
        assert_eq!(desc.raw_limit(), 0xFFFFF);
        assert_eq!(desc.access_rights(), 0xC09B);
        assert!(desc.granular());
        assert!(desc.present());
        assert_eq!(desc.limit(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_decode_matches_bit_extraction() {
        // base 0x12345678, raw limit 0xABCDE, access 0x9A, flags 0x4
        let bytes = [0xde, 0xbc, 0x78, 0x56, 0x34, 0x9a, 0x4a, 0x12];
        let desc = SegmentDescriptor::from_bytes(bytes);
        let raw = u64::from_le_bytes(bytes);

        let base = ((raw >> 16) & 0xFF_FFFF) | (((raw >> 56) & 0xFF) << 24);
        let limit = (raw & 0xFFFF) | (((raw >> 48) & 0xF) << 16);
        assert_eq!(desc.base() as u64, base);
        assert_eq!(desc.base(), 0x1234_5678);
        assert_eq!(desc.raw_limit() as u64, limit);
        assert_eq!(desc.raw_limit(), 0xABCDE);
        assert_eq!(desc.access_rights(), 0x409A);
        assert!(!desc.granular());
        assert_eq!(desc.limit(), 0xABCDE);
    }

    #[test]
    fn test_granularity_scaling() {
        let granular = SegmentDescriptor::encode(0, 0xFFFFF, 0x8093);
        assert_eq!(granular.limit(), 0xFFFF_FFFF);

        let bytewise = SegmentDescriptor::encode(0, 0xFFFFF, 0x0093);
        assert_eq!(bytewise.limit(), 0xFFFFF);

        let small = SegmentDescriptor::encode(0, 0x1, 0x8093);
        assert_eq!(small.limit(), 0x1FFF);
    }

    #[test]
    fn test_encode_matches_literal_entries() {
        assert_eq!(
            SegmentDescriptor::encode(0, 0xFFFFF, 0xC09B).to_bytes(),
            FLAT_CODE
        );
        assert_eq!(
            SegmentDescriptor::encode(0, 0xFFFFF, 0xC093).to_bytes(),
            FLAT_DATA
        );
        let desc = SegmentDescriptor::encode(0xFEDC_BA98, 0x54321, 0x8092);
        assert_eq!(desc.base(), 0xFEDC_BA98);
        assert_eq!(desc.raw_limit(), 0x54321);
        assert_eq!(desc.access_rights(), 0x8092);
    }

    #[test]
    fn test_resolve_code_selector() {
        let (memory, gdt) = table_in_rom();
        let cs = resolve(&memory, &gdt, 0x08).unwrap();
        assert_eq!(
            cs,
            Segment {
                selector: 0x08,
                base: 0,
                limit: 0xFFFF_FFFF,
                access_rights: 0xC09B,
            }
        );

        let ds = resolve(&memory, &gdt, 0x10).unwrap();
        assert_eq!(ds.access_rights, 0xC093);
    }

    #[test]
    fn test_resolve_ignores_rpl_bits() {
        let (memory, gdt) = table_in_rom();
        let seg = resolve(&memory, &gdt, 0x0B).unwrap();
        assert_eq!(seg.selector, 0x0B);
        assert_eq!(seg.access_rights, 0xC09B);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let (memory, gdt) = table_in_rom();
        let first = resolve(&memory, &gdt, 0x10).unwrap();
        let second = resolve(&memory, &gdt, 0x10).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_unmapped_table() {
        let (memory, _) = table_in_rom();
        let gdt = TableRegister {
            base: 0x0010_0000,
            limit: 0x18,
        };
        assert!(matches!(
            resolve(&memory, &gdt, 0x08),
            Err(Error::DescriptorTableUnmapped(0x0010_0000))
        ));
    }

    #[test]
    fn test_resolve_beyond_limit() {
        let (memory, gdt) = table_in_rom();
        assert!(matches!(
            resolve(&memory, &gdt, 0x18),
            Err(Error::SelectorOutOfRange { selector: 0x18, .. })
        ));
    }

    #[test]
    fn test_resolve_entry_past_region_end() {
        let (memory, _) = table_in_rom();
        let gdt = TableRegister {
            base: 0xFFFF_FFF8,
            limit: 0xFF,
        };
        assert!(matches!(
            resolve(&memory, &gdt, 0x08),
            Err(Error::DescriptorTableUnmapped(0xFFFF_FFF8))
        ));
    }
}
