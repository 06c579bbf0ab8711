//! KVM vCPU: register marshalling and exit translation.

use kvm_bindings::{kvm_dtable, kvm_fpu, kvm_segment};
use kvm_ioctls::{VcpuExit as KvmExit, VcpuFd};

use crate::backend::{VcpuBackend, VcpuExit};
use crate::error::{Error, Result};
use crate::memory::MemoryRegion;
use crate::regs::{access, FpuState, RegisterSnapshot, Segment, TableRegister, FXSAVE_SIZE};

/// A KVM vCPU.
pub struct KvmVcpu {
    id: u32,
    vcpu: VcpuFd,
    _regions: Vec<MemoryRegion>,
}

impl KvmVcpu {
    pub(crate) fn new(id: u32, vcpu: VcpuFd, regions: Vec<MemoryRegion>) -> Self {
        Self {
            id,
            vcpu,
            _regions: regions,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Lay `kvm_fpu` out as a 32-bit FXSAVE image. KVM does not report the
/// selectors or MXCSR_MASK; the mask takes its architectural default.
pub(crate) fn fxsave_from_kvm(fpu: &kvm_fpu) -> [u8; FXSAVE_SIZE] {
    let mut image = [0u8; FXSAVE_SIZE];
    image[0..2].copy_from_slice(&fpu.fcw.to_le_bytes());
    image[2..4].copy_from_slice(&fpu.fsw.to_le_bytes());
    image[4] = fpu.ftwx;
    image[6..8].copy_from_slice(&fpu.last_opcode.to_le_bytes());
    image[8..12].copy_from_slice(&(fpu.last_ip as u32).to_le_bytes());
    image[16..20].copy_from_slice(&(fpu.last_dp as u32).to_le_bytes());
    image[24..28].copy_from_slice(&fpu.mxcsr.to_le_bytes());
    image[28..32].copy_from_slice(&FpuState::default().mxcsr_mask.to_le_bytes());
    for (i, st) in fpu.fpr.iter().enumerate() {
        image[32 + i * 16..48 + i * 16].copy_from_slice(st);
    }
    for (i, xmm) in fpu.xmm.iter().take(8).enumerate() {
        image[160 + i * 16..176 + i * 16].copy_from_slice(xmm);
    }
    image
}

/// Pack a `kvm_segment` into the 16-bit access-rights layout.
pub(crate) fn segment_from_kvm(seg: &kvm_segment) -> Segment {
    let mut ar = (seg.type_ as u16) & 0xF;
    if seg.s != 0 {
        ar |= access::S;
    }
    ar |= ((seg.dpl as u16) & 3) << 5;
    if seg.present != 0 && seg.unusable == 0 {
        ar |= access::PRESENT;
    }
    if seg.avl != 0 {
        ar |= access::AVL;
    }
    if seg.l != 0 {
        ar |= access::LONG;
    }
    if seg.db != 0 {
        ar |= access::DB;
    }
    if seg.g != 0 {
        ar |= access::GRANULARITY;
    }

    Segment {
        selector: seg.selector,
        base: seg.base as u32,
        limit: seg.limit,
        access_rights: ar,
    }
}

/// Unpack a [`Segment`] into KVM's field-per-bit form.
pub(crate) fn segment_to_kvm(seg: &Segment) -> kvm_segment {
    let ar = seg.access_rights;
    let present = ar & access::PRESENT != 0;
    kvm_segment {
        base: seg.base as u64,
        limit: seg.limit,
        selector: seg.selector,
        type_: (ar & 0xF) as u8,
        present: present as u8,
        dpl: seg.dpl(),
        db: (ar & access::DB != 0) as u8,
        s: (ar & access::S != 0) as u8,
        l: (ar & access::LONG != 0) as u8,
        g: (ar & access::GRANULARITY != 0) as u8,
        avl: (ar & access::AVL != 0) as u8,
        unusable: (!present) as u8,
        padding: 0,
    }
}

fn table_from_kvm(table: &kvm_dtable) -> TableRegister {
    TableRegister {
        base: table.base as u32,
        limit: table.limit,
    }
}

fn table_to_kvm(table: &TableRegister) -> kvm_dtable {
    kvm_dtable {
        base: table.base as u64,
        limit: table.limit,
        ..Default::default()
    }
}

impl VcpuBackend for KvmVcpu {
    fn get_registers(&self) -> Result<RegisterSnapshot> {
        let query = |what: &str, e: kvm_ioctls::Error| Error::QueryFailed(format!("{}: {}", what, e));
        let regs = self.vcpu.get_regs().map_err(|e| query("KVM_GET_REGS", e))?;
        let sregs = self.vcpu.get_sregs().map_err(|e| query("KVM_GET_SREGS", e))?;
        let debug = self
            .vcpu
            .get_debug_regs()
            .map_err(|e| query("KVM_GET_DEBUGREGS", e))?;

        Ok(RegisterSnapshot {
            eax: regs.rax as u32,
            ebx: regs.rbx as u32,
            ecx: regs.rcx as u32,
            edx: regs.rdx as u32,
            esi: regs.rsi as u32,
            edi: regs.rdi as u32,
            esp: regs.rsp as u32,
            ebp: regs.rbp as u32,
            eip: regs.rip as u32,
            eflags: regs.rflags as u32,
            cr0: sregs.cr0 as u32,
            cr2: sregs.cr2 as u32,
            cr3: sregs.cr3 as u32,
            cr4: sregs.cr4 as u32,
            efer: sregs.efer,
            dr0: debug.db[0] as u32,
            dr1: debug.db[1] as u32,
            dr2: debug.db[2] as u32,
            dr3: debug.db[3] as u32,
            dr6: debug.dr6 as u32,
            dr7: debug.dr7 as u32,
            cs: segment_from_kvm(&sregs.cs),
            ds: segment_from_kvm(&sregs.ds),
            es: segment_from_kvm(&sregs.es),
            fs: segment_from_kvm(&sregs.fs),
            gs: segment_from_kvm(&sregs.gs),
            ss: segment_from_kvm(&sregs.ss),
            tr: segment_from_kvm(&sregs.tr),
            ldt: segment_from_kvm(&sregs.ldt),
            gdt: table_from_kvm(&sregs.gdt),
            idt: table_from_kvm(&sregs.idt),
        })
    }

    fn set_registers(&mut self, snapshot: &RegisterSnapshot) -> Result<()> {
        let apply = |what: &str, e: kvm_ioctls::Error| Error::ApplyFailed(format!("{}: {}", what, e));

        // Read-modify-write keeps the fields the snapshot does not carry
        let mut regs = self.vcpu.get_regs().map_err(|e| apply("KVM_GET_REGS", e))?;
        regs.rax = snapshot.eax as u64;
        regs.rbx = snapshot.ebx as u64;
        regs.rcx = snapshot.ecx as u64;
        regs.rdx = snapshot.edx as u64;
        regs.rsi = snapshot.esi as u64;
        regs.rdi = snapshot.edi as u64;
        regs.rsp = snapshot.esp as u64;
        regs.rbp = snapshot.ebp as u64;
        regs.rip = snapshot.eip as u64;
        regs.rflags = snapshot.eflags as u64;
        self.vcpu.set_regs(&regs).map_err(|e| apply("KVM_SET_REGS", e))?;

        let mut sregs = self.vcpu.get_sregs().map_err(|e| apply("KVM_GET_SREGS", e))?;
        sregs.cr0 = snapshot.cr0 as u64;
        sregs.cr2 = snapshot.cr2 as u64;
        sregs.cr3 = snapshot.cr3 as u64;
        sregs.cr4 = snapshot.cr4 as u64;
        sregs.efer = snapshot.efer;
        sregs.cs = segment_to_kvm(&snapshot.cs);
        sregs.ds = segment_to_kvm(&snapshot.ds);
        sregs.es = segment_to_kvm(&snapshot.es);
        sregs.fs = segment_to_kvm(&snapshot.fs);
        sregs.gs = segment_to_kvm(&snapshot.gs);
        sregs.ss = segment_to_kvm(&snapshot.ss);
        sregs.tr = segment_to_kvm(&snapshot.tr);
        sregs.ldt = segment_to_kvm(&snapshot.ldt);
        sregs.gdt = table_to_kvm(&snapshot.gdt);
        sregs.idt = table_to_kvm(&snapshot.idt);
        self.vcpu.set_sregs(&sregs).map_err(|e| apply("KVM_SET_SREGS", e))?;

        let mut debug = self
            .vcpu
            .get_debug_regs()
            .map_err(|e| apply("KVM_GET_DEBUGREGS", e))?;
        debug.db = [
            snapshot.dr0 as u64,
            snapshot.dr1 as u64,
            snapshot.dr2 as u64,
            snapshot.dr3 as u64,
        ];
        debug.dr6 = snapshot.dr6 as u64;
        debug.dr7 = snapshot.dr7 as u64;
        self.vcpu
            .set_debug_regs(&debug)
            .map_err(|e| apply("KVM_SET_DEBUGREGS", e))?;

        Ok(())
    }

    fn get_fpu(&self) -> Result<FpuState> {
        let fpu = self
            .vcpu
            .get_fpu()
            .map_err(|e| Error::QueryFailed(format!("KVM_GET_FPU: {}", e)))?;

        Ok(FpuState::from_fxsave(&fxsave_from_kvm(&fpu)))
    }

    fn run(&mut self) -> Result<VcpuExit> {
        let id = self.id;
        let exit = self
            .vcpu
            .run()
            .map_err(|e| Error::ResumeFailed(format!("KVM_RUN on vCPU {}: {}", id, e)))?;

        Ok(match exit {
            KvmExit::Hlt => VcpuExit::Hlt,
            KvmExit::Shutdown => VcpuExit::Shutdown,
            KvmExit::IoIn(port, data) => {
                // No device model: reads float high
                data.fill(0xFF);
                VcpuExit::IoIn {
                    port,
                    size: data.len() as u8,
                }
            }
            KvmExit::IoOut(port, data) => VcpuExit::IoOut {
                port,
                data: data.to_vec(),
            },
            KvmExit::MmioRead(addr, data) => {
                data.fill(0xFF);
                VcpuExit::MmioRead {
                    addr,
                    size: data.len() as u8,
                }
            }
            KvmExit::MmioWrite(addr, data) => VcpuExit::MmioWrite {
                addr,
                data: data.to_vec(),
            },
            other => {
                log::warn!(target: "vmm_harness::backend", "kvm: unhandled exit {:?}", other);
                VcpuExit::Unknown(0)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fpu_goes_through_fxsave_layout() {
        let mut fpu = kvm_fpu {
            fcw: 0x037F,
            fsw: 0x3800,
            ftwx: 0x80,
            last_opcode: 0x05D9,
            last_ip: 0x1_0000_7C00,
            mxcsr: 0x1F80,
            ..Default::default()
        };
        fpu.fpr[7][9] = 0x3F;
        fpu.xmm[2][0..4].copy_from_slice(&0.5f32.to_bits().to_le_bytes());
        // Registers past XMM7 do not exist in 32-bit mode
        fpu.xmm[8][0] = 0xFF;

        let image = fxsave_from_kvm(&fpu);
        assert_eq!(&image[0..5], &[0x7F, 0x03, 0x00, 0x38, 0x80]);
        assert_eq!(&image[8..12], &0x7C00u32.to_le_bytes());
        assert!(image[288..].iter().all(|&b| b == 0));

        let state = FpuState::from_fxsave(&image);
        assert_eq!(state.fop, 0x05D9);
        assert_eq!(state.fip, 0x7C00);
        assert_eq!(state.mxcsr_mask, 0xFFFF);
        assert_eq!(state.st[7][9], 0x3F);
        assert_eq!(state.xmm_f32(2, 0), Some(0.5));
    }

    #[test]
    fn test_segment_packing_round_trip() {
        let flat_code = Segment {
            selector: 0x08,
            base: 0,
            limit: 0xFFFF_FFFF,
            access_rights: 0xC09B,
        };
        let kvm = segment_to_kvm(&flat_code);
        assert_eq!(kvm.type_, 0xB);
        assert_eq!(kvm.s, 1);
        assert_eq!(kvm.present, 1);
        assert_eq!(kvm.db, 1);
        assert_eq!(kvm.g, 1);
        assert_eq!(kvm.unusable, 0);
        assert_eq!(segment_from_kvm(&kvm), flat_code);
    }

    #[test]
    fn test_unusable_segment() {
        let kvm = kvm_segment {
            selector: 0,
            type_: 3,
            s: 1,
            present: 1,
            unusable: 1,
            ..Default::default()
        };
        assert!(!segment_from_kvm(&kvm).is_present());
        assert_eq!(segment_to_kvm(&Segment::default()).unusable, 1);
    }
}
