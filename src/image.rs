//! Guest image builder.
//!
//! Assembles the fixed boot program into a ROM image. The program starts at
//! the reset vector in real mode, loads a GDT/IDT, sets CR0.PE, transfers to
//! a flat 32-bit code segment, builds page tables that map virtual
//! `0x10000000` onto physical `0x5000`, enables paging, reads `0xDEADBEEF`
//! back through the mapping and halts.
//!
//! Page table layout in RAM:
//! - `0x1000` page directory
//! - `0x2000` page table identity-mapping the first 1 MiB of RAM
//! - `0x3000` page table identity-mapping the ROM
//! - `0x4000` page table mapping `0x10000xxx` to `0x00005xxx`
//! - `0x5000` data (first dword `0xDEADBEEF`)

use crate::backend::VcpuExit;
use crate::descriptor::SegmentDescriptor;
use crate::error::{Error, Result};
use crate::memory::layout;
use crate::regs::RegisterSnapshot;

/// Opcode used to fill unused ROM space.
pub const HLT: u8 = 0xF4;

/// Offset of the reset vector within the ROM.
pub const RESET_VECTOR: usize = 0xFFF0;

/// Offset of the 6-byte GDT/IDT pointer.
pub const TABLE_POINTER: usize = 0xFFF2;

/// Offset of the GDT.
pub const GDT_OFFSET: usize = 0xFFD8;

/// Offset of the real-mode setup code.
pub const SETUP_OFFSET: usize = 0xFFB8;

/// Offset of the instruction that completes the switch to 32-bit code.
pub const TRANSFER_OFFSET: usize = 0xFFCE;

/// Offset of the 32-bit code.
pub const PROTECTED_OFFSET: usize = 0xFF00;

/// Flat 4 GiB code segment selector.
pub const CODE_SELECTOR: u16 = 0x0008;

/// Flat 4 GiB data segment selector.
pub const DATA_SELECTOR: u16 = 0x0010;

/// How the boot program gets from 16-bit real mode into 32-bit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStrategy {
    /// The guest halts where the far jump would be and the harness completes
    /// the transfer itself (selector, EIP and CS cache).
    #[default]
    Manual,
    /// The guest executes `jmp dword 0x8:0xffffff00` and the backend performs
    /// the transfer.
    Automatic,
}

impl std::fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStrategy::Manual => write!(f, "manual"),
            TransferStrategy::Automatic => write!(f, "automatic"),
        }
    }
}

impl std::str::FromStr for TransferStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TransferStrategy::Manual),
            "automatic" | "auto" => Ok(TransferStrategy::Automatic),
            other => Err(format!("unknown transfer strategy: {}", other)),
        }
    }
}

/// A far control transfer the harness has to complete on the guest's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarTransfer {
    /// Linear address of the placeholder HLT.
    pub halt_at: u32,
    /// Target code segment selector.
    pub selector: u16,
    /// Target offset within that segment.
    pub offset: u32,
}

impl FarTransfer {
    /// Whether `regs` (read right after a halt exit) stopped on this
    /// transfer's placeholder.
    pub fn is_pending(&self, regs: &RegisterSnapshot) -> bool {
        regs.linear_ip().wrapping_sub(1) == self.halt_at && regs.cs.selector != self.selector
    }
}

/// Where and with what result the guest is designed to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub eip: u32,
    pub cs_selector: u16,
    pub eax: u32,
}

/// Result of comparing a terminal state against an [`Expectation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub exit_was_halt: bool,
    pub at_expected_address: bool,
    pub expected_result: bool,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.exit_was_halt && self.at_expected_address && self.expected_result
    }
}

impl Expectation {
    pub fn check(&self, exit: &VcpuExit, regs: &RegisterSnapshot) -> Verdict {
        Verdict {
            exit_was_halt: matches!(exit, VcpuExit::Hlt),
            at_expected_address: regs.eip == self.eip && regs.cs.selector == self.cs_selector,
            expected_result: regs.eax == self.eax,
        }
    }
}

/// Writes code and data at absolute offsets of a fixed-size image.
#[derive(Debug, Clone)]
pub struct RomAssembler {
    bytes: Vec<u8>,
    cursor: usize,
}

impl RomAssembler {
    /// Create an image of `size` bytes filled with HLT.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![HLT; size],
            cursor: 0,
        }
    }

    /// Move the write cursor.
    pub fn org(&mut self, offset: usize) -> &mut Self {
        self.cursor = offset;
        self
    }

    /// Current write cursor.
    pub fn here(&self) -> usize {
        self.cursor
    }

    /// Write bytes at the cursor and advance it.
    pub fn emit(&mut self, code: &[u8]) -> Result<&mut Self> {
        let end = match self.cursor.checked_add(code.len()) {
            Some(end) if end <= self.bytes.len() => end,
            _ => {
                return Err(Error::ImageOverrun {
                    offset: self.cursor,
                    len: code.len(),
                    size: self.bytes.len(),
                })
            }
        };
        self.bytes[self.cursor..end].copy_from_slice(code);
        self.cursor = end;
        Ok(self)
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// The assembled boot ROM plus what the harness needs to know to run it.
#[derive(Debug, Clone)]
pub struct BootImage {
    pub rom: Vec<u8>,
    pub rom_base: u64,
    pub strategy: TransferStrategy,
    /// Present when the harness has to complete the switch to 32-bit code.
    pub far_transfer: Option<FarTransfer>,
    pub expectation: Expectation,
}

impl BootImage {
    /// Assemble the boot program for the given transfer strategy.
    pub fn build(strategy: TransferStrategy) -> Result<Self> {
        let rom_base = layout::ROM_BASE;
        let linear = |offset: usize| (rom_base + offset as u64) as u32;
        let gdt_base = linear(GDT_OFFSET);
        let protected_entry = linear(PROTECTED_OFFSET);

        let mut asm = RomAssembler::new(layout::ROM_SIZE as usize);

        // Reset vector: jump to setup, followed by the GDT/IDT pointer
        let rel = (SETUP_OFFSET as i64 - (RESET_VECTOR as i64 + 2)) as i8;
        asm.org(RESET_VECTOR).emit(&[0xEB, rel as u8])?;
        let mut pointer = [0u8; 6];
        pointer[0..2].copy_from_slice(&0x0018u16.to_le_bytes());
        pointer[2..6].copy_from_slice(&gdt_base.to_le_bytes());
        asm.emit(&pointer)?;

        // GDT: null, flat code, flat data
        asm.org(GDT_OFFSET)
            .emit(&SegmentDescriptor::NULL.to_bytes())?
            .emit(&SegmentDescriptor::encode(0, 0xFFFFF, 0xC09B).to_bytes())?
            .emit(&SegmentDescriptor::encode(0, 0xFFFFF, 0xC093).to_bytes())?;

        // Real mode: load GDT/IDT and set CR0.PE
        let ptr = (TABLE_POINTER as u16).to_le_bytes();
        asm.org(SETUP_OFFSET)
            .emit(&[0x66, 0x2E, 0x0F, 0x01, 0x16, ptr[0], ptr[1]])? // lgdt [cs:ptr]
            .emit(&[0x66, 0x2E, 0x0F, 0x01, 0x1E, ptr[0], ptr[1]])? // lidt [cs:ptr]
            .emit(&[0x0F, 0x20, 0xC0])? // mov eax, cr0
            .emit(&[0x0C, 0x01])? // or al, 1
            .emit(&[0x0F, 0x22, 0xC0])?; // mov cr0, eax

        debug_assert_eq!(asm.here(), TRANSFER_OFFSET);
        let far_transfer = match strategy {
            TransferStrategy::Manual => {
                asm.emit(&[HLT])?;
                Some(FarTransfer {
                    halt_at: linear(TRANSFER_OFFSET),
                    selector: CODE_SELECTOR,
                    offset: protected_entry,
                })
            }
            TransferStrategy::Automatic => {
                // jmp dword 0x8:protected_entry
                let target = protected_entry.to_le_bytes();
                let sel = CODE_SELECTOR.to_le_bytes();
                asm.emit(&[
                    0x66, 0xEA, target[0], target[1], target[2], target[3], sel[0], sel[1],
                ])?;
                None
            }
        };

        // 32-bit code: flat data segments
        asm.org(PROTECTED_OFFSET)
            .emit(&[0x33, 0xC0])? // xor eax, eax
            .emit(&[0xB0, DATA_SELECTOR as u8])? // mov al, 0x10
            .emit(&[0x8E, 0xD8])? // mov ds, eax
            .emit(&[0x8E, 0xC0])? // mov es, eax
            .emit(&[0x8E, 0xD0])?; // mov ss, eax

        // Clear the page directory and page tables
        asm.emit(&[0xBF, 0x00, 0x10, 0x00, 0x00])? // mov edi, 0x1000
            .emit(&[0xB9, 0x00, 0x10, 0x00, 0x00])? // mov ecx, 0x1000
            .emit(&[0x31, 0xC0])? // xor eax, eax
            .emit(&[0xF3, 0xAB])?; // rep stosd

        // Store 0xdeadbeef at physical 0x5000
        asm.emit(&[0xBF, 0x00, 0x50, 0x00, 0x00])? // mov edi, 0x5000
            .emit(&[0xB8, 0xEF, 0xBE, 0xAD, 0xDE])? // mov eax, 0xdeadbeef
            .emit(&[0x89, 0x07])?; // mov [edi], eax

        // Identity map the RAM
        asm.emit(&[0xB9, 0x00, 0x01, 0x00, 0x00])? // mov ecx, 0x100
            .emit(&[0xBF, 0x00, 0x20, 0x00, 0x00])? // mov edi, 0x2000
            .emit(&[0xB8, 0x03, 0x00, 0x00, 0x00])? // mov eax, 0x0003
            .emit(&[0xAB])? // stosd
            .emit(&[0x05, 0x00, 0x10, 0x00, 0x00])? // add eax, 0x1000
            .emit(&[0xE2, 0xF8])?; // loop -8

        // Identity map the ROM
        asm.emit(&[0xB9, 0x10, 0x00, 0x00, 0x00])? // mov ecx, 0x10
            .emit(&[0xBF, 0xC0, 0x3F, 0x00, 0x00])? // mov edi, 0x3fc0
            .emit(&[0xB8, 0x03, 0x00, 0xFF, 0xFF])? // mov eax, 0xffff0003
            .emit(&[0xAB])? // stosd
            .emit(&[0x05, 0x00, 0x10, 0x00, 0x00])? // add eax, 0x1000
            .emit(&[0xE2, 0xF8])?; // loop -8

        // Map virtual 0x10000000 to physical 0x5000
        asm.emit(&[0xBF, 0x00, 0x40, 0x00, 0x00])? // mov edi, 0x4000
            .emit(&[0xB8, 0x03, 0x50, 0x00, 0x00])? // mov eax, 0x5003
            .emit(&[0x89, 0x07])?; // mov [edi], eax

        // Hook the page tables into the directory
        asm.emit(&[0xBF, 0x00, 0x10, 0x00, 0x00])? // mov edi, 0x1000
            .emit(&[0xB8, 0x03, 0x20, 0x00, 0x00])? // mov eax, 0x2003
            .emit(&[0x89, 0x07])? // mov [edi], eax
            .emit(&[0xBF, 0xFC, 0x1F, 0x00, 0x00])? // mov edi, 0x1ffc
            .emit(&[0xB8, 0x03, 0x30, 0x00, 0x00])? // mov eax, 0x3003
            .emit(&[0x89, 0x07])? // mov [edi], eax
            .emit(&[0xBF, 0x00, 0x11, 0x00, 0x00])? // mov edi, 0x1100
            .emit(&[0xB8, 0x03, 0x40, 0x00, 0x00])? // mov eax, 0x4003
            .emit(&[0x89, 0x07])?; // mov [edi], eax

        // CR3 = page directory, then CR0.PG
        asm.emit(&[0xB8, 0x00, 0x10, 0x00, 0x00])? // mov eax, 0x1000
            .emit(&[0x0F, 0x22, 0xD8])? // mov cr3, eax
            .emit(&[0x0F, 0x20, 0xC0])? // mov eax, cr0
            .emit(&[0x0D, 0x00, 0x00, 0x00, 0x80])? // or eax, 0x80000000
            .emit(&[0x0F, 0x22, 0xC0])?; // mov cr0, eax

        // Read back through the mapping: eax = 0xdeadbeef
        asm.emit(&[0x31, 0xC0])? // xor eax, eax
            .emit(&[0xBE, 0x00, 0x00, 0x00, 0x10])? // mov esi, 0x10000000
            .emit(&[0x8B, 0x06])? // mov eax, [esi]
            .emit(&[HLT])?;

        let expectation = Expectation {
            eip: linear(asm.here()),
            cs_selector: CODE_SELECTOR,
            eax: 0xDEAD_BEEF,
        };

        Ok(Self {
            rom: asm.finish(),
            rom_base,
            strategy,
            far_transfer,
            expectation,
        })
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic};

    use super::*;
    use crate::regs::Segment;

    #[test]
    fn test_assembler_fills_with_hlt() {
        let mut asm = RomAssembler::new(16);
        asm.org(4).emit(&[1, 2]).unwrap().emit(&[3]).unwrap();
        assert_eq!(asm.here(), 7);
        let bytes = asm.finish();
        assert_eq!(&bytes[3..8], &[HLT, 1, 2, 3, HLT]);
    }

    #[test]
    fn test_assembler_overrun() {
        let mut asm = RomAssembler::new(4);
        let err = asm.org(3).emit(&[0, 0]).unwrap_err();
        assert!(matches!(
            err,
            Error::ImageOverrun {
                offset: 3,
                len: 2,
                size: 4
            }
        ));
        assert!(err.is_setup_failure());

        // Nothing was written and the cursor did not move
        assert_eq!(asm.here(), 3);
        asm.org(usize::MAX).emit(&[0]).unwrap_err();
        assert_eq!(asm.finish(), vec![HLT; 4]);
    }

    #[test]
    fn test_boot_image_layout() {
        let image = BootImage::build(TransferStrategy::Manual).unwrap();
        assert_eq!(image.rom.len(), 0x10000);
        assert_eq!(&image.rom[0xfff0..0xfff8], &[0xeb, 0xc6, 0x18, 0x00, 0xd8, 0xff, 0xff, 0xff]);
        assert_eq!(&image.rom[0xffe0..0xffe8], &[0xff, 0xff, 0x00, 0x00, 0x00, 0x9b, 0xcf, 0x00]);
        assert_eq!(&image.rom[0xffe8..0xfff0], &[0xff, 0xff, 0x00, 0x00, 0x00, 0x93, 0xcf, 0x00]);
        assert_eq!(&image.rom[0xffb8..0xffbf], &[0x66, 0x2e, 0x0f, 0x01, 0x16, 0xf2, 0xff]);
        assert_eq!(image.rom[0xff9e], HLT);
        assert_eq!(&image.rom[0xff9c..0xff9e], &[0x8b, 0x06]);
        assert_eq!(image.expectation.eip, 0xFFFF_FF9F);
        assert_eq!(image.expectation.cs_selector, 0x0008);
        assert_eq!(image.expectation.eax, 0xDEAD_BEEF);
    }

    #[test]
    fn test_boot_program_disassembles() {
        let image = BootImage::build(TransferStrategy::Manual).unwrap();

        let setup = &image.rom[SETUP_OFFSET..TRANSFER_OFFSET];
        let mnemonics: Vec<Mnemonic> = Decoder::with_ip(16, setup, SETUP_OFFSET as u64, DecoderOptions::NONE)
            .iter()
            .map(|i| i.mnemonic())
            .collect();
        assert_eq!(
            mnemonics,
            vec![Mnemonic::Lgdt, Mnemonic::Lidt, Mnemonic::Mov, Mnemonic::Or, Mnemonic::Mov]
        );

        let end = (image.expectation.eip - 0xFFFF_0000) as usize;
        let code = &image.rom[PROTECTED_OFFSET..end];
        let instructions: Vec<Instruction> =
            Decoder::with_ip(32, code, 0xFFFF_FF00, DecoderOptions::NONE).iter().collect();
        assert!(instructions.iter().all(|i| !i.is_invalid()));
        assert_eq!(instructions.last().map(|i| i.mnemonic()), Some(Mnemonic::Hlt));

        // Both loops branch back to the stosd right before their add
        let stosd: Vec<u64> = instructions
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Stosd && !i.has_rep_prefix())
            .map(|i| i.ip())
            .collect();
        let loops: Vec<u64> = instructions
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Loop)
            .map(|i| i.near_branch_target())
            .collect();
        assert_eq!(loops, stosd);
        assert_eq!(loops.len(), 2);
    }

    #[test]
    fn test_manual_strategy_places_halt() {
        let image = BootImage::build(TransferStrategy::Manual).unwrap();
        assert_eq!(image.rom[TRANSFER_OFFSET], HLT);
        assert_eq!(
            image.far_transfer,
            Some(FarTransfer {
                halt_at: 0xFFFF_FFCE,
                selector: 0x0008,
                offset: 0xFFFF_FF00,
            })
        );
    }

    #[test]
    fn test_automatic_strategy_emits_far_jump() {
        let image = BootImage::build(TransferStrategy::Automatic).unwrap();
        assert_eq!(
            &image.rom[TRANSFER_OFFSET..TRANSFER_OFFSET + 8],
            &[0x66, 0xea, 0x00, 0xff, 0xff, 0xff, 0x08, 0x00]
        );
        assert!(image.far_transfer.is_none());
    }

    #[test]
    fn test_far_transfer_pending() {
        let transfer = BootImage::build(TransferStrategy::Manual).unwrap().far_transfer.unwrap();
        let mut regs = RegisterSnapshot::reset();
        regs.eip = 0xFFCF;
        assert!(transfer.is_pending(&regs));

        regs.eip = 0xFFF1;
        assert!(!transfer.is_pending(&regs));

        regs.eip = 0xFFCF;
        regs.cs = Segment {
            selector: 0x08,
            ..regs.cs
        };
        assert!(!transfer.is_pending(&regs));
    }

    #[test]
    fn test_expectation_check() {
        let expectation = BootImage::build(TransferStrategy::Manual).unwrap().expectation;
        let mut regs = RegisterSnapshot::reset();
        regs.eip = 0xFFFF_FF9F;
        regs.cs.selector = 0x08;
        regs.eax = 0xDEAD_BEEF;
        assert!(expectation.check(&VcpuExit::Hlt, &regs).passed());

        let verdict = expectation.check(&VcpuExit::Shutdown, &regs);
        assert!(!verdict.exit_was_halt);
        assert!(!verdict.passed());

        regs.eax = 0;
        let verdict = expectation.check(&VcpuExit::Hlt, &regs);
        assert!(verdict.at_expected_address);
        assert!(!verdict.expected_result);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("manual".parse::<TransferStrategy>(), Ok(TransferStrategy::Manual));
        assert_eq!("auto".parse::<TransferStrategy>(), Ok(TransferStrategy::Automatic));
        assert!("sideways".parse::<TransferStrategy>().is_err());
    }
}
