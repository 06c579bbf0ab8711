//! Instruction fetch and decode.
//!
//! Bytes are fetched through the MMU one at a time so a fault past the end of
//! a short instruction does not stop it from executing; the fault is only
//! raised when the decoder actually needs the missing bytes.

use iced_x86::{Decoder, DecoderError, DecoderOptions, Instruction, Register};

use crate::regs::RegisterSnapshot;

use super::mmu::{Fault, Mmu};

/// Longest legal x86 instruction, prefixes included.
pub(crate) const MAX_INSTRUCTION_LEN: usize = 15;

/// Decode the instruction at CS:EIP in the bitness CS.D selects.
pub(crate) fn fetch(mmu: &Mmu<'_>, regs: &RegisterSnapshot) -> Result<Instruction, Fault> {
    let code32 = regs.code_is_32bit();
    let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
    let mut len = 0;
    let mut fetch_fault = None;

    while len < MAX_INSTRUCTION_LEN {
        let mut ip = regs.eip.wrapping_add(len as u32);
        if !code32 {
            ip &= 0xFFFF;
        }
        match mmu.read_sized(regs.cs.base.wrapping_add(ip), 1) {
            Ok(byte) => {
                bytes[len] = byte as u8;
                len += 1;
            }
            Err(fault) => {
                fetch_fault = Some(fault);
                break;
            }
        }
    }

    let bitness = if code32 { 32 } else { 16 };
    let mut decoder = Decoder::with_ip(bitness, &bytes[..len], regs.eip as u64, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if !instruction.is_invalid() {
        return Ok(instruction);
    }

    // Running out of bytes only matters when the fetch itself faulted. With
    // all fifteen bytes in hand an undecodable sequence is #UD, including
    // one that is simply too long.
    Err(match (decoder.last_error(), fetch_fault) {
        (DecoderError::NoMoreBytes, Some(fault)) => fault,
        _ => Fault::INVALID_OPCODE,
    })
}

/// Register operand width in bytes.
pub(crate) fn register_width(reg: Register) -> u8 {
    reg.size() as u8
}

pub(crate) fn is_high_byte(reg: Register) -> bool {
    matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH)
}

/// Effective-address size of a memory operand in bytes.
///
/// The decoder reports registers rather than an address size, so this comes
/// from the base or index register and falls back to the displacement width
/// for absolute operands.
pub(crate) fn address_size(instruction: &Instruction) -> u8 {
    let base = instruction.memory_base();
    if base != Register::None {
        return register_width(base);
    }
    let index = instruction.memory_index();
    if index != Register::None {
        return register_width(index);
    }
    if instruction.memory_displ_size() == 2 {
        2
    } else {
        4
    }
}
