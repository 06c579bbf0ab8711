//! Architectural state and instruction execution.
//!
//! Instructions are decoded by `iced-x86` and executed on its `Instruction`
//! model: operands come from `op_kind`/`op_register`, memory operands from
//! the decoded base, index, scale, displacement and effective segment.

use iced_x86::{Code, Instruction, Mnemonic, OpKind, Register};

use crate::backend::VcpuExit;
use crate::descriptor;
use crate::memory::MemoryRegionTable;
use crate::regs::{access, cr0, eflags, RegisterSnapshot, Segment, TableRegister};

use super::decode::{self, address_size, is_high_byte, register_width};
use super::mmu::{Fault, Mmu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl SegReg {
    fn from_register(reg: Register) -> Option<Self> {
        match reg {
            Register::ES => Some(SegReg::Es),
            Register::CS => Some(SegReg::Cs),
            Register::SS => Some(SegReg::Ss),
            Register::DS => Some(SegReg::Ds),
            Register::FS => Some(SegReg::Fs),
            Register::GS => Some(SegReg::Gs),
            _ => None,
        }
    }
}

fn width_mask(width: u8) -> u32 {
    match width {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

fn accumulator(width: u8) -> Register {
    match width {
        1 => Register::AL,
        2 => Register::AX,
        _ => Register::EAX,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluOp {
    Add,
    Or,
    Xor,
}

/// What happens to EIP once an instruction has executed.
#[derive(Debug)]
enum Flow {
    /// Fall through to the next instruction
    Next,
    Jump(u32),
    /// Execute the same instruction again (REP with count remaining)
    Repeat,
    /// Retire, then hand control back to the VMM
    Exit(VcpuExit),
}

/// One emulated processor.
#[derive(Debug, Clone)]
pub(crate) struct Cpu {
    pub(crate) regs: RegisterSnapshot,
}

impl Cpu {
    pub(crate) fn reset() -> Self {
        Self {
            regs: RegisterSnapshot::reset(),
        }
    }

    /// Execute one instruction (or one REP iteration).
    ///
    /// On `Err` the state may be partially updated; callers run this on a
    /// scratch copy and keep it only on success.
    pub(crate) fn step(&mut self, memory: &MemoryRegionTable) -> Result<Option<VcpuExit>, Fault> {
        let mmu = Mmu::new(memory, &self.regs);
        let code32 = self.regs.code_is_32bit();
        let instruction = decode::fetch(&mmu, &self.regs)?;

        log::trace!(
            target: "vmm_harness::backend::emulator",
            "{:04x}:{:08x} {}",
            self.regs.cs.selector,
            self.regs.eip,
            instruction
        );

        let flow = self.execute(&mmu, &instruction)?;
        let next = if code32 {
            instruction.next_ip32()
        } else {
            instruction.next_ip32() & 0xFFFF
        };

        match flow {
            Flow::Next => self.regs.eip = next,
            Flow::Jump(target) => self.regs.eip = target,
            Flow::Repeat => {}
            Flow::Exit(exit) => {
                self.regs.eip = next;
                return Ok(Some(exit));
            }
        }
        Ok(None)
    }

    /// Turn a fault on the instruction at EIP into the exit the VMM sees.
    pub(crate) fn fault_exit(&mut self, fault: Fault) -> VcpuExit {
        match fault {
            Fault::Exit(exit) => exit,
            Fault::Exception { vector, error_code } => VcpuExit::Exception {
                vector,
                error_code,
                eip: self.regs.eip,
            },
            Fault::PageFault { linear, error_code } => {
                self.regs.cr2 = linear;
                VcpuExit::Exception {
                    vector: 14,
                    error_code,
                    eip: self.regs.eip,
                }
            }
        }
    }

    fn execute(&mut self, mmu: &Mmu<'_>, instr: &Instruction) -> Result<Flow, Fault> {
        match instr.mnemonic() {
            Mnemonic::Add => self.alu_form(mmu, instr, AluOp::Add),
            Mnemonic::Or => self.alu_form(mmu, instr, AluOp::Or),
            Mnemonic::Xor => self.alu_form(mmu, instr, AluOp::Xor),
            Mnemonic::Mov => self.mov(mmu, instr),
            Mnemonic::Lgdt | Mnemonic::Lidt => self.load_table(mmu, instr),
            Mnemonic::Nop => Ok(Flow::Next),
            Mnemonic::Stosb => self.stos(mmu, instr, 1),
            Mnemonic::Stosw => self.stos(mmu, instr, 2),
            Mnemonic::Stosd => self.stos(mmu, instr, 4),
            Mnemonic::Loop => self.loop_branch(instr),
            Mnemonic::In => {
                let reg = instr.op0_register();
                let width = register_width(reg);
                let port = self.port(instr, 1)?;
                // No device model: reads float high
                self.write_reg(reg, width_mask(width))?;
                Ok(Flow::Exit(VcpuExit::IoIn { port, size: width }))
            }
            Mnemonic::Out => {
                let port = self.port(instr, 0)?;
                let reg = instr.op1_register();
                let width = register_width(reg) as usize;
                let data = self.read_reg(reg)?.to_le_bytes()[..width].to_vec();
                Ok(Flow::Exit(VcpuExit::IoOut { port, data }))
            }
            Mnemonic::Jmp => self.jmp(mmu, instr),
            Mnemonic::Hlt => Ok(Flow::Exit(VcpuExit::Hlt)),
            Mnemonic::Cli => {
                self.regs.eflags &= !eflags::IF;
                Ok(Flow::Next)
            }
            Mnemonic::Sti => {
                self.regs.eflags |= eflags::IF;
                Ok(Flow::Next)
            }
            Mnemonic::Cld => {
                self.regs.eflags &= !eflags::DF;
                Ok(Flow::Next)
            }
            Mnemonic::Std => {
                self.regs.eflags |= eflags::DF;
                Ok(Flow::Next)
            }
            _ => Err(Fault::INVALID_OPCODE),
        }
    }

    fn mov(&mut self, mmu: &Mmu<'_>, instr: &Instruction) -> Result<Flow, Fault> {
        match instr.code() {
            Code::Mov_Sreg_rm16 | Code::Mov_Sreg_r32m16 => {
                let seg = match SegReg::from_register(instr.op0_register()) {
                    Some(SegReg::Cs) | None => return Err(Fault::INVALID_OPCODE),
                    Some(seg) => seg,
                };
                let selector = self.read_operand(mmu, instr, 1, 2)? as u16;
                self.load_data_segment(mmu, seg, selector)?;
            }
            Code::Mov_rm16_Sreg | Code::Mov_r32m16_Sreg => {
                let seg = SegReg::from_register(instr.op1_register()).ok_or(Fault::INVALID_OPCODE)?;
                // A register destination takes the zero-extended selector
                let selector = self.segment(seg).selector as u32;
                self.write_operand(mmu, instr, 0, 2, selector)?;
            }
            Code::Mov_r32_cr => {
                let value = self.read_control(instr.op1_register())?;
                self.write_reg(instr.op0_register(), value)?;
            }
            Code::Mov_cr_r32 => {
                let value = self.read_reg(instr.op1_register())?;
                self.write_control(instr.op0_register(), value)?;
            }
            _ => {
                let width = self.operand_width(instr, 0);
                let value = self.read_operand(mmu, instr, 1, width)?;
                self.write_operand(mmu, instr, 0, width, value)?;
            }
        }
        Ok(Flow::Next)
    }

    /// LGDT/LIDT. With a 16-bit operand only 24 bits of the base are used.
    fn load_table(&mut self, mmu: &Mmu<'_>, instr: &Instruction) -> Result<Flow, Fault> {
        if instr.op0_kind() != OpKind::Memory {
            return Err(Fault::INVALID_OPCODE);
        }
        let linear = self.effective_address(instr)?;
        let limit = mmu.read_sized(linear, 2)? as u16;
        let mut base = mmu.read_sized(linear.wrapping_add(2), 4)?;
        if matches!(instr.code(), Code::Lgdt_m1632_16 | Code::Lidt_m1632_16) {
            base &= 0x00FF_FFFF;
        }

        let table = TableRegister { base, limit };
        if instr.mnemonic() == Mnemonic::Lgdt {
            self.regs.gdt = table;
        } else {
            self.regs.idt = table;
        }
        Ok(Flow::Next)
    }

    fn alu_form(&mut self, mmu: &Mmu<'_>, instr: &Instruction, op: AluOp) -> Result<Flow, Fault> {
        let width = self.operand_width(instr, 0);
        let a = self.read_operand(mmu, instr, 0, width)?;
        let b = self.read_operand(mmu, instr, 1, width)?;
        let result = self.alu(op, a, b, width);
        self.write_operand(mmu, instr, 0, width, result)?;
        Ok(Flow::Next)
    }

    fn alu(&mut self, op: AluOp, a: u32, b: u32, width: u8) -> u32 {
        let mask = width_mask(width);
        let sign = (mask >> 1).wrapping_add(1);
        let (a, b) = (a & mask, b & mask);

        let (result, carry, overflow) = match op {
            AluOp::Add => {
                let full = a as u64 + b as u64;
                let result = full as u32 & mask;
                let overflow = (a ^ result) & (b ^ result) & sign != 0;
                (result, full > mask as u64, overflow)
            }
            AluOp::Or => (a | b, false, false),
            AluOp::Xor => (a ^ b, false, false),
        };

        let mut flags = self.regs.eflags
            & !(eflags::CF | eflags::PF | eflags::ZF | eflags::SF | eflags::OF);
        if carry {
            flags |= eflags::CF;
        }
        if overflow {
            flags |= eflags::OF;
        }
        if result == 0 {
            flags |= eflags::ZF;
        }
        if result & sign != 0 {
            flags |= eflags::SF;
        }
        if (result as u8).count_ones() % 2 == 0 {
            flags |= eflags::PF;
        }
        self.regs.eflags = flags;
        result
    }

    /// STOS: one element per step; with REP the instruction repeats until
    /// the count reaches zero.
    fn stos(&mut self, mmu: &Mmu<'_>, instr: &Instruction, width: u8) -> Result<Flow, Fault> {
        let (count, index) = match instr.op0_kind() {
            OpKind::MemoryESDI => (Register::CX, Register::DI),
            _ => (Register::ECX, Register::EDI),
        };
        let rep = instr.has_rep_prefix() || instr.has_repne_prefix();
        if rep && self.read_reg(count)? == 0 {
            return Ok(Flow::Next);
        }

        let di = self.read_reg(index)?;
        let value = self.read_reg(accumulator(width))?;
        mmu.write_sized(self.regs.es.base.wrapping_add(di), width, value)?;

        let di = if self.regs.eflags & eflags::DF != 0 {
            di.wrapping_sub(width as u32)
        } else {
            di.wrapping_add(width as u32)
        };
        self.write_reg(index, di)?;

        if rep {
            let remaining = self.read_reg(count)? - 1;
            self.write_reg(count, remaining)?;
            if remaining != 0 {
                return Ok(Flow::Repeat);
            }
        }
        Ok(Flow::Next)
    }

    /// LOOP decrements CX or ECX, as the address size selects.
    fn loop_branch(&mut self, instr: &Instruction) -> Result<Flow, Fault> {
        let counter = match instr.code() {
            Code::Loop_rel8_16_CX | Code::Loop_rel8_32_CX => Register::CX,
            _ => Register::ECX,
        };
        let count = self.read_reg(counter)?.wrapping_sub(1) & width_mask(register_width(counter));
        self.write_reg(counter, count)?;
        if count != 0 {
            Ok(Flow::Jump(instr.near_branch_target() as u32))
        } else {
            Ok(Flow::Next)
        }
    }

    fn jmp(&mut self, mmu: &Mmu<'_>, instr: &Instruction) -> Result<Flow, Fault> {
        match instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 => {
                Ok(Flow::Jump(instr.near_branch_target() as u32))
            }
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                let offset = if instr.op0_kind() == OpKind::FarBranch16 {
                    instr.far_branch16() as u32
                } else {
                    instr.far_branch32()
                };
                self.load_code_segment(mmu, instr.far_branch_selector())?;
                Ok(Flow::Jump(offset))
            }
            _ if matches!(instr.code(), Code::Jmp_rm16 | Code::Jmp_rm32) => {
                let width = self.operand_width(instr, 0);
                Ok(Flow::Jump(self.read_operand(mmu, instr, 0, width)?))
            }
            // Indirect far jumps are not modeled
            _ => Err(Fault::INVALID_OPCODE),
        }
    }

    fn port(&self, instr: &Instruction, operand: u32) -> Result<u16, Fault> {
        match instr.op_kind(operand) {
            OpKind::Immediate8 => Ok(instr.immediate8() as u16),
            _ => Ok(self.read_reg(instr.op_register(operand))? as u16),
        }
    }

    fn load_code_segment(&mut self, mmu: &Mmu<'_>, selector: u16) -> Result<(), Fault> {
        if !self.regs.protected_mode() {
            self.regs.cs = Segment {
                selector,
                base: (selector as u32) << 4,
                ..self.regs.cs
            };
            return Ok(());
        }

        let segment = self.descriptor(mmu, selector)?;
        if segment.access_rights & access::CODE == 0 {
            return Err(Fault::general_protection(selector as u32 & 0xFFFC));
        }
        if !segment.is_present() {
            return Err(Fault::Exception {
                vector: 11,
                error_code: selector as u32 & 0xFFFC,
            });
        }
        self.regs.cs = segment;
        Ok(())
    }

    fn load_data_segment(&mut self, mmu: &Mmu<'_>, seg: SegReg, selector: u16) -> Result<(), Fault> {
        let loaded = if !self.regs.protected_mode() {
            Segment {
                selector,
                base: (selector as u32) << 4,
                ..*self.segment(seg)
            }
        } else if selector & 0xFFFC == 0 {
            if seg == SegReg::Ss {
                return Err(Fault::general_protection(0));
            }
            // Null selector: segment becomes unusable
            Segment {
                selector,
                ..Segment::default()
            }
        } else {
            let segment = self.descriptor(mmu, selector)?;
            if !segment.is_present() {
                return Err(Fault::Exception {
                    vector: if seg == SegReg::Ss { 12 } else { 11 },
                    error_code: selector as u32 & 0xFFFC,
                });
            }
            segment
        };

        *self.segment_mut(seg) = loaded;
        Ok(())
    }

    fn descriptor(&self, mmu: &Mmu<'_>, selector: u16) -> Result<Segment, Fault> {
        // LDT selectors are not supported
        if selector & 0x4 != 0 || selector & 0xFFFC == 0 {
            return Err(Fault::general_protection(selector as u32 & 0xFFFC));
        }
        descriptor::resolve(mmu.memory(), &self.regs.gdt, selector)
            .map_err(|_| Fault::general_protection(selector as u32 & 0xFFFC))
    }

    fn segment(&self, seg: SegReg) -> &Segment {
        match seg {
            SegReg::Es => &self.regs.es,
            SegReg::Cs => &self.regs.cs,
            SegReg::Ss => &self.regs.ss,
            SegReg::Ds => &self.regs.ds,
            SegReg::Fs => &self.regs.fs,
            SegReg::Gs => &self.regs.gs,
        }
    }

    fn segment_mut(&mut self, seg: SegReg) -> &mut Segment {
        match seg {
            SegReg::Es => &mut self.regs.es,
            SegReg::Cs => &mut self.regs.cs,
            SegReg::Ss => &mut self.regs.ss,
            SegReg::Ds => &mut self.regs.ds,
            SegReg::Fs => &mut self.regs.fs,
            SegReg::Gs => &mut self.regs.gs,
        }
    }

    fn read_control(&self, reg: Register) -> Result<u32, Fault> {
        match reg {
            Register::CR0 => Ok(self.regs.cr0),
            Register::CR2 => Ok(self.regs.cr2),
            Register::CR3 => Ok(self.regs.cr3),
            Register::CR4 => Ok(self.regs.cr4),
            _ => Err(Fault::INVALID_OPCODE),
        }
    }

    fn write_control(&mut self, reg: Register, value: u32) -> Result<(), Fault> {
        match reg {
            Register::CR0 => {
                if value & cr0::PG != 0 && value & cr0::PE == 0 {
                    return Err(Fault::general_protection(0));
                }
                self.regs.cr0 = value | cr0::ET;
            }
            Register::CR2 => self.regs.cr2 = value,
            Register::CR3 => self.regs.cr3 = value,
            Register::CR4 => self.regs.cr4 = value,
            _ => return Err(Fault::INVALID_OPCODE),
        }
        Ok(())
    }

    fn gpr(&self, reg: Register) -> Option<u32> {
        Some(match reg.full_register32() {
            Register::EAX => self.regs.eax,
            Register::ECX => self.regs.ecx,
            Register::EDX => self.regs.edx,
            Register::EBX => self.regs.ebx,
            Register::ESP => self.regs.esp,
            Register::EBP => self.regs.ebp,
            Register::ESI => self.regs.esi,
            Register::EDI => self.regs.edi,
            _ => return None,
        })
    }

    fn gpr_mut(&mut self, reg: Register) -> Option<&mut u32> {
        Some(match reg.full_register32() {
            Register::EAX => &mut self.regs.eax,
            Register::ECX => &mut self.regs.ecx,
            Register::EDX => &mut self.regs.edx,
            Register::EBX => &mut self.regs.ebx,
            Register::ESP => &mut self.regs.esp,
            Register::EBP => &mut self.regs.ebp,
            Register::ESI => &mut self.regs.esi,
            Register::EDI => &mut self.regs.edi,
            _ => return None,
        })
    }

    /// Read a general-purpose or segment register at its own width.
    fn read_reg(&self, reg: Register) -> Result<u32, Fault> {
        if let Some(seg) = SegReg::from_register(reg) {
            return Ok(self.segment(seg).selector as u32);
        }
        let full = self.gpr(reg).ok_or(Fault::INVALID_OPCODE)?;
        Ok(match register_width(reg) {
            1 if is_high_byte(reg) => (full >> 8) & 0xFF,
            1 => full & 0xFF,
            2 => full & 0xFFFF,
            _ => full,
        })
    }

    /// Write a general-purpose register, leaving the bytes outside it intact.
    fn write_reg(&mut self, reg: Register, value: u32) -> Result<(), Fault> {
        let width = register_width(reg);
        let high = is_high_byte(reg);
        let full = self.gpr_mut(reg).ok_or(Fault::INVALID_OPCODE)?;
        *full = match width {
            1 if high => (*full & !0xFF00) | ((value & 0xFF) << 8),
            1 => (*full & !0xFF) | (value & 0xFF),
            2 => (*full & !0xFFFF) | (value & 0xFFFF),
            _ => value,
        };
        Ok(())
    }

    fn operand_width(&self, instr: &Instruction, operand: u32) -> u8 {
        match instr.op_kind(operand) {
            OpKind::Register => register_width(instr.op_register(operand)),
            _ => instr.memory_size().size() as u8,
        }
    }

    /// Linear address of the instruction's memory operand.
    fn effective_address(&self, instr: &Instruction) -> Result<u32, Fault> {
        let mut offset = instr.memory_displacement32();
        if instr.memory_base() != Register::None {
            offset = offset.wrapping_add(self.read_reg(instr.memory_base())?);
        }
        if instr.memory_index() != Register::None {
            let index = self.read_reg(instr.memory_index())?;
            offset = offset.wrapping_add(index.wrapping_mul(instr.memory_index_scale()));
        }
        if address_size(instr) == 2 {
            offset &= 0xFFFF;
        }
        let seg = SegReg::from_register(instr.memory_segment()).ok_or(Fault::INVALID_OPCODE)?;
        Ok(self.segment(seg).base.wrapping_add(offset))
    }

    fn read_operand(
        &self,
        mmu: &Mmu<'_>,
        instr: &Instruction,
        operand: u32,
        width: u8,
    ) -> Result<u32, Fault> {
        match instr.op_kind(operand) {
            OpKind::Register => self.read_reg(instr.op_register(operand)),
            OpKind::Memory => mmu.read_sized(self.effective_address(instr)?, width),
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32 => Ok(instr.immediate(operand) as u32 & width_mask(width)),
            _ => Err(Fault::INVALID_OPCODE),
        }
    }

    fn write_operand(
        &mut self,
        mmu: &Mmu<'_>,
        instr: &Instruction,
        operand: u32,
        width: u8,
        value: u32,
    ) -> Result<(), Fault> {
        match instr.op_kind(operand) {
            OpKind::Register => self.write_reg(instr.op_register(operand), value),
            OpKind::Memory => mmu.write_sized(self.effective_address(instr)?, width, value),
            _ => Err(Fault::INVALID_OPCODE),
        }
    }
}
