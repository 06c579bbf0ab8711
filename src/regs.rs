//! vCPU register state exchanged with a backend.
//!
//! A [`RegisterSnapshot`] is only valid as of the moment it was read: once
//! the vCPU resumes, the guest owns the registers again and the snapshot must
//! be re-read before it is trusted.

use std::fmt;

/// CR0 bits used by the harness.
pub mod cr0 {
    /// Protected mode enable
    pub const PE: u32 = 1 << 0;
    /// Extension type (x87 present)
    pub const ET: u32 = 1 << 4;
    /// Not write-through
    pub const NW: u32 = 1 << 29;
    /// Cache disable
    pub const CD: u32 = 1 << 30;
    /// Paging enable
    pub const PG: u32 = 1 << 31;
}

/// CR4 bits used by the harness.
pub mod cr4 {
    /// Debugging extensions
    pub const DE: u32 = 1 << 3;
    /// Page size extensions (4 MiB pages)
    pub const PSE: u32 = 1 << 4;
    /// Physical address extension
    pub const PAE: u32 = 1 << 5;
}

/// EFLAGS bits.
pub mod eflags {
    pub const CF: u32 = 1 << 0;
    /// Reserved, always set
    pub const FIXED: u32 = 1 << 1;
    pub const PF: u32 = 1 << 2;
    pub const ZF: u32 = 1 << 6;
    pub const SF: u32 = 1 << 7;
    pub const IF: u32 = 1 << 9;
    pub const DF: u32 = 1 << 10;
    pub const OF: u32 = 1 << 11;
}

/// Segment access-rights bits, in the packed 16-bit layout used by
/// [`Segment::access_rights`] (descriptor bits 40..47 and 52..55).
pub mod access {
    pub const ACCESSED: u16 = 1 << 0;
    /// Code: readable. Data: writable.
    pub const READ_WRITE: u16 = 1 << 1;
    pub const CODE: u16 = 1 << 3;
    /// Descriptor type: code/data (as opposed to system)
    pub const S: u16 = 1 << 4;
    pub const DPL_MASK: u16 = 3 << 5;
    pub const PRESENT: u16 = 1 << 7;
    pub const AVL: u16 = 1 << 12;
    /// 64-bit code segment
    pub const LONG: u16 = 1 << 13;
    /// Default operation size is 32 bits
    pub const DB: u16 = 1 << 14;
    /// Limit is in 4 KiB units
    pub const GRANULARITY: u16 = 1 << 15;
}

/// Cached state of one segment register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u32,
    /// Byte-granular limit (already scaled if the descriptor had G set)
    pub limit: u32,
    pub access_rights: u16,
}

impl Segment {
    /// A real-mode segment: base is `selector << 4`, 64 KiB limit.
    pub fn real_mode(selector: u16, access_rights: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access_rights,
        }
    }

    /// Whether the default operand/address size is 32 bits.
    pub fn is_32bit(&self) -> bool {
        self.access_rights & access::DB != 0
    }

    pub fn is_present(&self) -> bool {
        self.access_rights & access::PRESENT != 0
    }

    /// Descriptor privilege level.
    pub fn dpl(&self) -> u8 {
        ((self.access_rights & access::DPL_MASK) >> 5) as u8
    }
}

/// GDTR/IDTR contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRegister {
    pub base: u32,
    pub limit: u16,
}

/// Snapshot of the 32-bit architectural register state of a vCPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    // General purpose
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub esp: u32,
    pub ebp: u32,

    pub eip: u32,
    pub eflags: u32,

    // Control
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub efer: u64,

    // Debug
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,

    // Segments
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,

    // Descriptor tables
    pub gdt: TableRegister,
    pub idt: TableRegister,
}

impl RegisterSnapshot {
    /// Architectural state after RESET/INIT: real mode, executing at
    /// `F000:FFF0` with the CS base pointing at the top 64 KiB of 4 GiB.
    pub fn reset() -> Self {
        let data = Segment {
            selector: 0,
            base: 0,
            limit: 0xFFFF,
            access_rights: access::PRESENT | access::S | access::READ_WRITE | access::ACCESSED,
        };

        Self {
            eip: 0xFFF0,
            eflags: eflags::FIXED,
            cr0: cr0::CD | cr0::NW | cr0::ET,
            dr6: 0xFFFF_0FF0,
            dr7: 0x0000_0400,
            cs: Segment {
                selector: 0xF000,
                base: 0xFFFF_0000,
                limit: 0xFFFF,
                access_rights: access::PRESENT
                    | access::S
                    | access::CODE
                    | access::READ_WRITE
                    | access::ACCESSED,
            },
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            tr: Segment {
                limit: 0xFFFF,
                access_rights: access::PRESENT | 0x0B,
                ..Segment::default()
            },
            ldt: Segment {
                limit: 0xFFFF,
                access_rights: access::PRESENT | 0x02,
                ..Segment::default()
            },
            gdt: TableRegister { base: 0, limit: 0xFFFF },
            idt: TableRegister { base: 0, limit: 0xFFFF },
            ..Self::default()
        }
    }

    /// Linear address of the next instruction (`CS.base + EIP`).
    pub fn linear_ip(&self) -> u32 {
        self.cs.base.wrapping_add(self.eip)
    }

    pub fn protected_mode(&self) -> bool {
        self.cr0 & cr0::PE != 0
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0 & cr0::PG != 0
    }

    /// Whether code currently executes with 32-bit default operand size.
    pub fn code_is_32bit(&self) -> bool {
        self.protected_mode() && self.cs.is_32bit()
    }
}

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "EAX = {:08x}   EBX = {:08x}   ECX = {:08x}   EDX = {:08x}   ESI = {:08x}   EDI = {:08x}  EFER = {:08x}",
            self.eax, self.ebx, self.ecx, self.edx, self.esi, self.edi, self.efer
        )?;
        writeln!(
            f,
            "CR0 = {:08x}   CR2 = {:08x}   CR3 = {:08x}   CR4 = {:08x}   ESP = {:08x}   EBP = {:08x}   GDT = {:08x}:{:04x}",
            self.cr0, self.cr2, self.cr3, self.cr4, self.esp, self.ebp, self.gdt.base, self.gdt.limit
        )?;
        writeln!(
            f,
            "DR0 = {:08x}   DR1 = {:08x}   DR2 = {:08x}   DR3 = {:08x}   DR6 = {:08x}   DR7 = {:08x}   IDT = {:08x}:{:04x}",
            self.dr0, self.dr1, self.dr2, self.dr3, self.dr6, self.dr7, self.idt.base, self.idt.limit
        )?;
        writeln!(
            f,
            " CS = {:04x}   DS = {:04x}   ES = {:04x}   FS = {:04x}   GS = {:04x}   SS = {:04x}   TR = {:04x}   LDT = {:08x}:{:04x}",
            self.cs.selector,
            self.ds.selector,
            self.es.selector,
            self.fs.selector,
            self.gs.selector,
            self.ss.selector,
            self.tr.selector,
            self.ldt.base,
            self.ldt.limit
        )?;
        write!(f, "EIP = {:08x}   EFLAGS = {:08x}", self.eip, self.eflags)
    }
}

/// Size of an FXSAVE image.
pub const FXSAVE_SIZE: usize = 512;

/// x87/SSE state, decoded from the legacy FXSAVE layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpuState {
    pub fcw: u16,
    pub fsw: u16,
    /// Abridged tag word
    pub ftw: u8,
    pub fop: u16,
    pub fip: u32,
    pub fcs: u16,
    pub fdp: u32,
    pub fds: u16,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    /// ST0..ST7 / MM0..MM7, 80 significant bits in 16-byte slots
    pub st: [[u8; 16]; 8],
    pub xmm: [[u8; 16]; 8],
}

impl Default for FpuState {
    /// State after FNINIT with SSE defaults.
    fn default() -> Self {
        Self {
            fcw: 0x037F,
            fsw: 0,
            ftw: 0,
            fop: 0,
            fip: 0,
            fcs: 0,
            fdp: 0,
            fds: 0,
            mxcsr: 0x1F80,
            mxcsr_mask: 0xFFFF,
            st: [[0; 16]; 8],
            xmm: [[0; 16]; 8],
        }
    }
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl FpuState {
    /// Decode a 512-byte FXSAVE image.
    pub fn from_fxsave(image: &[u8; FXSAVE_SIZE]) -> Self {
        let mut st = [[0u8; 16]; 8];
        let mut xmm = [[0u8; 16]; 8];
        for i in 0..8 {
            st[i].copy_from_slice(&image[32 + i * 16..48 + i * 16]);
            xmm[i].copy_from_slice(&image[160 + i * 16..176 + i * 16]);
        }

        Self {
            fcw: le_u16(image, 0),
            fsw: le_u16(image, 2),
            ftw: image[4],
            fop: le_u16(image, 6),
            fip: le_u32(image, 8),
            fcs: le_u16(image, 12),
            fdp: le_u32(image, 16),
            fds: le_u16(image, 20),
            mxcsr: le_u32(image, 24),
            mxcsr_mask: le_u32(image, 28),
            st,
            xmm,
        }
    }

    /// Encode into a 512-byte FXSAVE image; reserved bytes are zero.
    pub fn to_fxsave(&self) -> [u8; FXSAVE_SIZE] {
        let mut image = [0u8; FXSAVE_SIZE];
        image[0..2].copy_from_slice(&self.fcw.to_le_bytes());
        image[2..4].copy_from_slice(&self.fsw.to_le_bytes());
        image[4] = self.ftw;
        image[6..8].copy_from_slice(&self.fop.to_le_bytes());
        image[8..12].copy_from_slice(&self.fip.to_le_bytes());
        image[12..14].copy_from_slice(&self.fcs.to_le_bytes());
        image[16..20].copy_from_slice(&self.fdp.to_le_bytes());
        image[20..22].copy_from_slice(&self.fds.to_le_bytes());
        image[24..28].copy_from_slice(&self.mxcsr.to_le_bytes());
        image[28..32].copy_from_slice(&self.mxcsr_mask.to_le_bytes());
        for i in 0..8 {
            image[32 + i * 16..48 + i * 16].copy_from_slice(&self.st[i]);
            image[160 + i * 16..176 + i * 16].copy_from_slice(&self.xmm[i]);
        }
        image
    }

    /// Raw 64-bit significand of ST(i), `None` past ST7.
    pub fn st_mantissa(&self, i: usize) -> Option<u64> {
        self.st.get(i).map(mantissa)
    }

    /// ST(i) converted from 80-bit extended precision to `f64`.
    pub fn st_f64(&self, i: usize) -> Option<f64> {
        self.st.get(i).map(extended_to_f64)
    }

    /// Lane `lane` (0..4) of XMM(i) as a dword.
    pub fn xmm_u32(&self, i: usize, lane: usize) -> Option<u32> {
        self.xmm
            .get(i)
            .and_then(|slot| slot_lane::<4>(slot, lane))
            .map(u32::from_le_bytes)
    }

    /// Lane `lane` (0..4) of XMM(i) as a single-precision float.
    pub fn xmm_f32(&self, i: usize, lane: usize) -> Option<f32> {
        self.xmm_u32(i, lane).map(f32::from_bits)
    }

    /// Lane `lane` (0..2) of XMM(i) as a double-precision float.
    pub fn xmm_f64(&self, i: usize, lane: usize) -> Option<f64> {
        self.xmm
            .get(i)
            .and_then(|slot| slot_lane::<8>(slot, lane))
            .map(|bytes| f64::from_bits(u64::from_le_bytes(bytes)))
    }
}

/// `N`-byte lane `lane` of a 16-byte register slot.
fn slot_lane<const N: usize>(slot: &[u8; 16], lane: usize) -> Option<[u8; N]> {
    let start = lane.checked_mul(N)?;
    slot.get(start..start.checked_add(N)?)?.try_into().ok()
}

fn mantissa(slot: &[u8; 16]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&slot[0..8]);
    u64::from_le_bytes(bytes)
}

/// Extended-precision value held in the low ten bytes of a slot.
fn extended_to_f64(slot: &[u8; 16]) -> f64 {
    let mantissa = mantissa(slot);
    let sign_exp = le_u16(slot, 8);
    let negative = sign_exp & 0x8000 != 0;
    let exponent = (sign_exp & 0x7FFF) as i32;

    let magnitude = if exponent == 0x7FFF {
        if mantissa << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if mantissa == 0 {
        0.0
    } else {
        // Explicit integer bit: value = mantissa * 2^(exponent - bias - 63)
        let exponent = if exponent == 0 { 1 } else { exponent };
        let scale = exponent - 16383 - 63;
        let half = scale / 2;
        (mantissa as f64) * 2f64.powi(half) * 2f64.powi(scale - half)
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

impl fmt::Display for FpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "FCW =     {:04x}   FSW =     {:04x}   FTW =       {:02x}   FOP =     {:04x}   MXCSR = {:08x}",
            self.fcw, self.fsw, self.ftw, self.fop, self.mxcsr
        )?;
        writeln!(
            f,
            "FIP = {:08x}   FCS =     {:04x}   FDP = {:08x}   FDS = {:08x}    mask = {:08x}",
            self.fip, self.fcs, self.fdp, self.fds, self.mxcsr_mask
        )?;
        for (i, slot) in self.st.iter().enumerate() {
            writeln!(
                f,
                "  ST{} = {:016x}   {:+.20e}",
                i,
                mantissa(slot),
                extended_to_f64(slot)
            )?;
        }
        for (i, slot) in self.xmm.iter().enumerate() {
            let dword = |lane| slot_lane::<4>(slot, lane).map_or(0, u32::from_le_bytes);
            let qword = |lane| slot_lane::<8>(slot, lane).map_or(0, u64::from_le_bytes);
            writeln!(
                f,
                " XMM{} = {:08x} {:08x} {:08x} {:08x}     {:+.7e} {:+.7e} {:+.7e} {:+.7e}     {:+.15e} {:+.15e}",
                i,
                dword(0),
                dword(1),
                dword(2),
                dword(3),
                f32::from_bits(dword(0)),
                f32::from_bits(dword(1)),
                f32::from_bits(dword(2)),
                f32::from_bits(dword(3)),
                f64::from_bits(qword(0)),
                f64::from_bits(qword(1))
            )?;
        }
        Ok(())
    }
}
