//! VMX instruction emulation, nested VM entry and nested VM exit.

use alloc::format;

use axerrno::ax_err_type;
use bit_field::BitField;

use axpv_types::{Gpfn, Mfn, PAGE_SHIFT, VcpuId};

use super::decode::{Decoded, InstructionInfo, Operand, decode_operand};
use super::vvmcs::{VmcsEncoding, Vvmcs, field};
use super::{CurrentVmcs, NestedVmx, VmxFault, VmxInstructionError, VmxStatus};
use crate::domain::{CR0_PE, CR0_PG, CR4_PAE, CR4_VMXE, Domain, GuestRegs, RFLAGS_VM, SegReg, Vcpu};
use crate::hypervisor::Hypervisor;
use crate::mm::p2m::P2mType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxInstruction {
    Vmxon,
    Vmxoff,
    Vmptrld,
    Vmptrst,
    Vmclear,
    Vmread,
    Vmwrite,
    Vmlaunch,
    Vmresume,
}

/// What the hardware reported for a VM exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub reason: u32,
    pub qualification: u64,
    pub instruction_info: u32,
    pub instruction_len: u32,
    pub intr_info: u32,
}

/// Basic exit reasons.
pub mod exit_reason {
    pub const EXCEPTION_NMI: u32 = 0;
    pub const EXTERNAL_INTERRUPT: u32 = 1;
    pub const CPUID: u32 = 10;
    pub const HLT: u32 = 12;
    pub const VMCALL: u32 = 18;
    pub const VMCLEAR: u32 = 19;
    pub const VMLAUNCH: u32 = 20;
    pub const VMPTRLD: u32 = 21;
    pub const VMPTRST: u32 = 22;
    pub const VMREAD: u32 = 23;
    pub const VMRESUME: u32 = 24;
    pub const VMWRITE: u32 = 25;
    pub const VMXOFF: u32 = 26;
    pub const VMXON: u32 = 27;
    pub const IO_INSTRUCTION: u32 = 30;
}

/// Outcome of an L2 exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2ExitAction {
    /// L1 asked for the exit and now runs at its host state.
    Reflected,
    /// The exit is the core's own business; L2 stays current.
    HandleInL0,
}

pub const PIN_EXTINT_EXITING: u64 = 1 << 0;
pub const PIN_NMI_EXITING: u64 = 1 << 3;
pub const CPU_HLT_EXITING: u64 = 1 << 7;
pub const CPU_UNCOND_IO_EXITING: u64 = 1 << 24;
pub const CPU_USE_IO_BITMAPS: u64 = 1 << 25;

/// Controls L0 keeps while any L2 runs.
const L0_PIN: u64 = PIN_EXTINT_EXITING | PIN_NMI_EXITING;
const L0_CPU: u64 = CPU_HLT_EXITING;
/// L2 memory is shadowed, so #PF always exits.
const L0_EXCEPTIONS: u64 = 1 << 14;
const L0_HOST_CR0: u64 = CR0_PE | CR0_PG | (1 << 16) | (1 << 5);
const L0_HOST_CR4: u64 = CR4_PAE | CR4_VMXE;

/// VMPTRST result with no current VMCS.
const VMCX_EADDR: u64 = u64::MAX;

const GUEST_FIELDS: [VmcsEncoding; 7] = [
    field::GUEST_CR0,
    field::GUEST_CR3,
    field::GUEST_CR4,
    field::GUEST_RSP,
    field::GUEST_RIP,
    field::GUEST_RFLAGS,
    field::GUEST_IA32_EFER,
];

const GUEST_SEG_FIELDS: [VmcsEncoding; 4] = [
    field::GUEST_ES_SELECTOR,
    field::GUEST_ES_BASE,
    field::GUEST_ES_LIMIT,
    field::GUEST_ES_AR,
];

fn save_guest_state(vv: &Vvmcs<'_>, regs: &GuestRegs) {
    vv.set(field::GUEST_CR0, regs.cr0);
    vv.set(field::GUEST_CR3, regs.cr3);
    vv.set(field::GUEST_CR4, regs.cr4);
    vv.set(field::GUEST_RSP, regs.gprs[4]);
    vv.set(field::GUEST_RIP, regs.rip);
    vv.set(field::GUEST_RFLAGS, regs.rflags);
    vv.set(field::GUEST_IA32_EFER, regs.efer);
    for (i, seg) in regs.segs.iter().enumerate() {
        vv.set(field::guest_seg(field::GUEST_ES_SELECTOR, i), seg.selector as u64);
        vv.set(field::guest_seg(field::GUEST_ES_BASE, i), seg.base);
        vv.set(field::guest_seg(field::GUEST_ES_LIMIT, i), seg.limit as u64);
        vv.set(field::guest_seg(field::GUEST_ES_AR, i), seg.attr as u64);
    }
}

fn load_guest_state(vv: &Vvmcs<'_>, regs: &mut GuestRegs) {
    regs.cr0 = vv.get(field::GUEST_CR0);
    regs.cr3 = vv.get(field::GUEST_CR3);
    regs.cr4 = vv.get(field::GUEST_CR4);
    regs.gprs[4] = vv.get(field::GUEST_RSP);
    regs.rip = vv.get(field::GUEST_RIP);
    regs.rflags = vv.get(field::GUEST_RFLAGS) | 0x2;
    regs.efer = vv.get(field::GUEST_IA32_EFER);
    for (i, seg) in regs.segs.iter_mut().enumerate() {
        seg.selector = vv.get(field::guest_seg(field::GUEST_ES_SELECTOR, i)) as u16;
        seg.base = vv.get(field::guest_seg(field::GUEST_ES_BASE, i));
        seg.limit = vv.get(field::guest_seg(field::GUEST_ES_LIMIT, i)) as u32;
        seg.attr = vv.get(field::guest_seg(field::GUEST_ES_AR, i)) as u32;
    }
}

/// Operand width of VMREAD and VMWRITE.
fn field_operand_len(regs: &GuestRegs) -> usize {
    if regs.long_mode() && regs.seg(SegReg::Cs).is_long() { 8 } else { 4 }
}

fn decode(regs: &GuestRegs, exit: &ExitInfo, len: usize) -> Result<Decoded, VmxFault> {
    decode_operand(regs, InstructionInfo(exit.instruction_info), exit.qualification, len)
}

/// Address operands of VMXON, VMPTRLD, VMPTRST and VMCLEAR are always in
/// memory.
fn memory_operand(regs: &GuestRegs, exit: &ExitInfo) -> Result<Decoded, VmxFault> {
    let dec = decode(regs, exit, 8)?;
    match dec.operand {
        Operand::Memory { .. } => Ok(dec),
        Operand::Register(_) => Err(VmxFault::InvalidOpcode),
    }
}

impl Hypervisor {
    /// Emulates a VMX instruction L1 executed on `vcpu`.
    ///
    /// A completed instruction updates the arithmetic flags and advances
    /// RIP; a successful VMLAUNCH or VMRESUME leaves the vCPU in L2 instead.
    /// A fault leaves the registers alone for the caller to inject.
    pub fn nvmx_handle(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        insn: VmxInstruction,
        exit: &ExitInfo,
    ) -> Result<VmxStatus, VmxFault> {
        let v = d.vcpu(vcpu)?;
        let mut regs = v.regs.lock().clone();
        let mut nvmx = v.nested.lock();
        if nvmx.guest_mode {
            return Err(ax_err_type!(BadState, "VMX instruction from L2 not reflected").into());
        }
        Self::check_privilege(d, &regs, &nvmx, insn == VmxInstruction::Vmxon)?;

        let status = match insn {
            VmxInstruction::Vmxon => self.vmxon(d, vcpu, &regs, &mut nvmx, exit)?,
            VmxInstruction::Vmxoff => {
                self.purge_vvmcs(&mut nvmx);
                nvmx.vmxon = None;
                info!("{} vcpu {}: VMXOFF", d.id(), vcpu.index());
                VmxStatus::Succeed
            }
            VmxInstruction::Vmptrld => self.vmptrld(d, vcpu, &regs, &mut nvmx, exit)?,
            VmxInstruction::Vmptrst => {
                let dec = memory_operand(&regs, exit)?;
                let gpa = nvmx.current.map_or(VMCX_EADDR, |c| c.gpa);
                self.write_operand(d, vcpu, &mut regs, &dec, gpa)?;
                VmxStatus::Succeed
            }
            VmxInstruction::Vmclear => self.vmclear(d, vcpu, &regs, &mut nvmx, exit)?,
            VmxInstruction::Vmread => self.vmread(d, vcpu, &mut regs, &nvmx, exit)?,
            VmxInstruction::Vmwrite => self.vmwrite(d, vcpu, &regs, &mut nvmx, exit)?,
            VmxInstruction::Vmlaunch => self.vmentry(d, &mut regs, &mut nvmx, true)?,
            VmxInstruction::Vmresume => self.vmentry(d, &mut regs, &mut nvmx, false)?,
        };

        if !nvmx.guest_mode {
            regs.rflags = status.apply(regs.rflags);
            regs.rip = regs.rip.wrapping_add(exit.instruction_len as u64);
        }
        if status != VmxStatus::Succeed {
            debug!("{} vcpu {}: {:?} -> {:?}", d.id(), vcpu.index(), insn, status);
        }
        *v.regs.lock() = regs;
        Ok(status)
    }

    fn check_privilege(
        d: &Domain,
        regs: &GuestRegs,
        nvmx: &NestedVmx,
        vmxon: bool,
    ) -> Result<(), VmxFault> {
        if !d.is_shadowed() {
            return Err(VmxFault::InvalidOpcode);
        }
        if vmxon {
            if regs.cr0 & CR0_PE == 0 || regs.cr4 & CR4_VMXE == 0 {
                return Err(VmxFault::InvalidOpcode);
            }
        } else if !nvmx.in_vmx_operation() {
            return Err(VmxFault::InvalidOpcode);
        }
        if regs.rflags & RFLAGS_VM != 0 || (regs.long_mode() && !regs.seg(SegReg::Cs).is_long()) {
            return Err(VmxFault::InvalidOpcode);
        }
        if regs.cpl() > 0 {
            warn!("{}: VMX instruction at cpl {}", d.id(), regs.cpl());
            return Err(VmxFault::GeneralProtection);
        }
        Ok(())
    }

    fn read_operand(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        regs: &GuestRegs,
        dec: &Decoded,
    ) -> Result<u64, VmxFault> {
        match dec.operand {
            Operand::Register(r) => Ok(regs.gprs[r]),
            Operand::Memory { va, len } => {
                let mut buf = [0u8; 8];
                self.guest_read(d, vcpu, va, &mut buf[..len])?
                    .map_err(VmxFault::PageFault)?;
                Ok(u64::from_le_bytes(buf))
            }
        }
    }

    fn write_operand(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        regs: &mut GuestRegs,
        dec: &Decoded,
        val: u64,
    ) -> Result<(), VmxFault> {
        match dec.operand {
            Operand::Register(r) => {
                let wide = field_operand_len(regs) == 8;
                regs.gprs[r] = if wide { val } else { val & 0xffff_ffff };
                Ok(())
            }
            Operand::Memory { va, len } => {
                let bytes = val.to_le_bytes();
                self.guest_write(d, vcpu, va, &bytes[..len])?
                    .map_err(VmxFault::PageFault)
            }
        }
    }

    /// VMfailValid when a VMCS is current, VMfailInvalid otherwise.
    fn vmfail(&self, nvmx: &NestedVmx, err: VmxInstructionError) -> VmxStatus {
        match nvmx.current {
            Some(cur) => {
                Vvmcs::new(&self.frames, cur.mfn).set(field::VM_INSTRUCTION_ERROR, err as u64);
                VmxStatus::FailValid(err)
            }
            None => VmxStatus::FailInvalid,
        }
    }

    /// Takes a general reference on the RAM frame at `gpa`.
    fn map_guest_frame(&self, d: &Domain, gpa: u64, write: bool) -> Option<Mfn> {
        let (mfn, ty) = d.p2m.lookup(Gpfn::new(gpa >> PAGE_SHIFT));
        if !ty.is_ram() || (write && ty == P2mType::RamRo) {
            return None;
        }
        self.frames.get_page(mfn, d.id()).then_some(mfn)
    }

    fn purge_vvmcs(&self, nvmx: &mut NestedVmx) {
        if let Some(cur) = nvmx.current.take() {
            self.frames.put_page(cur.mfn);
        }
        for bitmap in nvmx.io_bitmap.iter_mut() {
            if let Some(mfn) = bitmap.take() {
                self.frames.put_page(mfn);
            }
        }
    }

    fn map_io_bitmap(&self, d: &Domain, nvmx: &mut NestedVmx, which: usize) {
        if let Some(old) = nvmx.io_bitmap[which].take() {
            self.frames.put_page(old);
        }
        let Some(cur) = nvmx.current else {
            return;
        };
        let enc = if which == 0 { field::IO_BITMAP_A } else { field::IO_BITMAP_B };
        let gpa = Vvmcs::new(&self.frames, cur.mfn).get(enc);
        nvmx.io_bitmap[which] = self.map_guest_frame(d, gpa, false);
    }

    fn vmxon(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        regs: &GuestRegs,
        nvmx: &mut NestedVmx,
        exit: &ExitInfo,
    ) -> Result<VmxStatus, VmxFault> {
        let dec = memory_operand(regs, exit)?;
        let gpa = self.read_operand(d, vcpu, regs, &dec)?;
        if let Some(region) = nvmx.vmxon {
            warn!("{}: VMXON again, region {:#x} new {:#x}", d.id(), region, gpa);
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmxonInRoot));
        }
        if gpa & 0xfff != 0 || !d.p2m.lookup(Gpfn::new(gpa >> PAGE_SHIFT)).1.is_ram() {
            return Ok(VmxStatus::FailInvalid);
        }
        if nvmx.n2vmcs.is_none() {
            nvmx.n2vmcs = Some(self.frames.alloc_xen_page(None)?);
        }
        nvmx.vmxon = Some(gpa);
        info!("{} vcpu {}: VMXON, region {:#x}", d.id(), vcpu.index(), gpa);
        Ok(VmxStatus::Succeed)
    }

    fn vmptrld(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        regs: &GuestRegs,
        nvmx: &mut NestedVmx,
        exit: &ExitInfo,
    ) -> Result<VmxStatus, VmxFault> {
        let dec = memory_operand(regs, exit)?;
        let gpa = self.read_operand(d, vcpu, regs, &dec)?;
        if gpa & 0xfff != 0 {
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmptrldInvalidAddress));
        }
        if nvmx.vmxon == Some(gpa) {
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmptrldVmxonPointer));
        }
        if nvmx.current.is_some_and(|c| c.gpa == gpa) {
            return Ok(VmxStatus::Succeed);
        }
        let Some(mfn) = self.map_guest_frame(d, gpa, true) else {
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmptrldInvalidAddress));
        };
        self.purge_vvmcs(nvmx);
        nvmx.current = Some(CurrentVmcs { gpa, mfn });
        self.map_io_bitmap(d, nvmx, 0);
        self.map_io_bitmap(d, nvmx, 1);
        debug!("{} vcpu {}: current VMCS {:#x}", d.id(), vcpu.index(), gpa);
        Ok(VmxStatus::Succeed)
    }

    fn vmclear(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        regs: &GuestRegs,
        nvmx: &mut NestedVmx,
        exit: &ExitInfo,
    ) -> Result<VmxStatus, VmxFault> {
        let dec = memory_operand(regs, exit)?;
        let gpa = self.read_operand(d, vcpu, regs, &dec)?;
        if gpa & 0xfff != 0 {
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmclearInvalidAddress));
        }
        if nvmx.vmxon == Some(gpa) {
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmclearVmxonPointer));
        }
        match nvmx.current {
            Some(cur) if cur.gpa == gpa => {
                Vvmcs::new(&self.frames, cur.mfn).set(field::LAUNCH_STATE, 0);
                self.purge_vvmcs(nvmx);
            }
            _ => {
                let Some(mfn) = self.map_guest_frame(d, gpa, true) else {
                    return Ok(self.vmfail(nvmx, VmxInstructionError::VmclearInvalidAddress));
                };
                Vvmcs::new(&self.frames, mfn).set(field::LAUNCH_STATE, 0);
                self.frames.put_page(mfn);
            }
        }
        Ok(VmxStatus::Succeed)
    }

    fn vmread(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        regs: &mut GuestRegs,
        nvmx: &NestedVmx,
        exit: &ExitInfo,
    ) -> Result<VmxStatus, VmxFault> {
        let dec = decode(regs, exit, field_operand_len(regs))?;
        let Some(cur) = nvmx.current else {
            return Ok(VmxStatus::FailInvalid);
        };
        let Some(enc) = supported_field(regs.gprs[dec.reg2]) else {
            return Ok(self.vmfail(nvmx, VmxInstructionError::UnsupportedField));
        };
        let val = Vvmcs::new(&self.frames, cur.mfn).get(enc);
        self.write_operand(d, vcpu, regs, &dec, val)?;
        Ok(VmxStatus::Succeed)
    }

    fn vmwrite(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        regs: &GuestRegs,
        nvmx: &mut NestedVmx,
        exit: &ExitInfo,
    ) -> Result<VmxStatus, VmxFault> {
        let dec = decode(regs, exit, field_operand_len(regs))?;
        let val = self.read_operand(d, vcpu, regs, &dec)?;
        let Some(cur) = nvmx.current else {
            return Ok(VmxStatus::FailInvalid);
        };
        let Some(enc) = supported_field(regs.gprs[dec.reg2]) else {
            return Ok(self.vmfail(nvmx, VmxInstructionError::UnsupportedField));
        };
        if enc.is_read_only() {
            return Ok(self.vmfail(nvmx, VmxInstructionError::WriteReadOnlyField));
        }
        Vvmcs::new(&self.frames, cur.mfn).set(enc, val);
        if enc == field::IO_BITMAP_A || enc == field::IO_BITMAP_A_HIGH {
            self.map_io_bitmap(d, nvmx, 0);
        } else if enc == field::IO_BITMAP_B || enc == field::IO_BITMAP_B_HIGH {
            self.map_io_bitmap(d, nvmx, 1);
        }
        Ok(VmxStatus::Succeed)
    }

    /// VMLAUNCH (`launch`) or VMRESUME.
    fn vmentry(
        &self,
        d: &Domain,
        regs: &mut GuestRegs,
        nvmx: &mut NestedVmx,
        launch: bool,
    ) -> Result<VmxStatus, VmxFault> {
        let Some(cur) = nvmx.current else {
            return Ok(VmxStatus::FailInvalid);
        };
        let Some(n2) = nvmx.n2vmcs else {
            return Err(ax_err_type!(BadState, "in VMX operation without a VMCS page").into());
        };
        let vv = Vvmcs::new(&self.frames, cur.mfn);
        let launched = vv.get(field::LAUNCH_STATE) != 0;
        if launch && launched {
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmlaunchNonClear));
        }
        if !launch && !launched {
            return Ok(self.vmfail(nvmx, VmxInstructionError::VmresumeNonLaunched));
        }
        if vv.get(field::CPU_BASED_CONTROLS) & CPU_USE_IO_BITMAPS != 0
            && nvmx.io_bitmap.iter().any(Option::is_none)
        {
            return Ok(self.vmfail(nvmx, VmxInstructionError::EntryInvalidControl));
        }
        if vv.get(field::HOST_CR0) & CR0_PE == 0 {
            return Ok(self.vmfail(nvmx, VmxInstructionError::EntryInvalidHostState));
        }

        self.synthesize_n2(&vv, n2, nvmx);
        vv.set(field::LAUNCH_STATE, 1);
        nvmx.l1_regs = Some(regs.clone());
        load_guest_state(&vv, regs);
        nvmx.guest_mode = true;
        debug!(
            "{}: entering L2 at {:#x} ({})",
            d.id(),
            regs.rip,
            if launch { "launch" } else { "resume" }
        );
        Ok(VmxStatus::Succeed)
    }

    /// Builds the VMCS L2 runs on: the guest state L1 asked for, L0's host
    /// state, and L1's controls widened by what L0 needs.
    fn synthesize_n2(&self, vv: &Vvmcs<'_>, n2: Mfn, nvmx: &NestedVmx) {
        self.frames.clear_page(n2);
        let hw = Vvmcs::new(&self.frames, n2);
        for enc in GUEST_FIELDS {
            hw.set(enc, vv.get(enc));
        }
        for base in GUEST_SEG_FIELDS {
            for seg in 0..6 {
                let enc = field::guest_seg(base, seg);
                hw.set(enc, vv.get(enc));
            }
        }
        hw.set(field::VMCS_LINK_POINTER, u64::MAX);

        hw.set(field::HOST_CR0, L0_HOST_CR0);
        hw.set(field::HOST_CR4, L0_HOST_CR4);

        hw.set(field::PIN_BASED_CONTROLS, vv.get(field::PIN_BASED_CONTROLS) | L0_PIN);
        let mut cpu = vv.get(field::CPU_BASED_CONTROLS) | L0_CPU;
        if cpu & CPU_USE_IO_BITMAPS != 0 {
            let [a, b] = nvmx.io_bitmap;
            hw.set(field::IO_BITMAP_A, a.map_or(0, |m| m.raw() << PAGE_SHIFT));
            hw.set(field::IO_BITMAP_B, b.map_or(0, |m| m.raw() << PAGE_SHIFT));
        } else {
            // L1's devices are emulated by the core.
            cpu |= CPU_UNCOND_IO_EXITING;
        }
        hw.set(field::CPU_BASED_CONTROLS, cpu);
        hw.set(
            field::EXCEPTION_BITMAP,
            vv.get(field::EXCEPTION_BITMAP) | L0_EXCEPTIONS,
        );
        hw.set(field::EXIT_CONTROLS, vv.get(field::EXIT_CONTROLS));
        hw.set(field::ENTRY_CONTROLS, vv.get(field::ENTRY_CONTROLS));
    }

    /// Reads a field of the VMCS built for L2.
    pub fn nvmx_n2_field(&self, vcpu: &Vcpu, enc: VmcsEncoding) -> Option<u64> {
        let nvmx = vcpu.nested.lock();
        nvmx.n2vmcs.map(|n2| Vvmcs::new(&self.frames, n2).get(enc))
    }

    /// Whether L1's I/O bitmaps claim any port of a `size`-byte access at
    /// `port`.
    fn l1_io_intercepted(&self, nvmx: &NestedVmx, port: u16, size: u16) -> bool {
        let last = port as u32 + size as u32 - 1;
        if last > 0xffff {
            return true;
        }
        (port as u32..=last).any(|p| {
            let (which, bit) = if p < 0x8000 { (0, p) } else { (1, p - 0x8000) };
            match nvmx.io_bitmap[which] {
                Some(mfn) => {
                    let mut byte = [0u8];
                    self.frames.read_bytes(mfn, (bit / 8) as usize, &mut byte);
                    byte[0].get_bit((bit % 8) as usize)
                }
                None => true,
            }
        })
    }

    /// Routes an exit taken while L2 runs: reflected into L1 when L1's
    /// controls ask for it, otherwise left to the core.
    pub fn nvmx_l2_exit(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        exit: &ExitInfo,
    ) -> Result<L2ExitAction, VmxFault> {
        use self::exit_reason::*;

        let v = d.vcpu(vcpu)?;
        let mut nvmx = v.nested.lock();
        let cur = match nvmx.current {
            Some(cur) if nvmx.guest_mode => cur,
            _ => return Err(ax_err_type!(BadState, format!("{}: no L2 running", d.id())).into()),
        };
        let vv = Vvmcs::new(&self.frames, cur.mfn);
        let reflect = match exit.reason {
            EXCEPTION_NMI => {
                let vector = exit.intr_info.get_bits(0..8) as u64;
                vector < 32 && vv.get(field::EXCEPTION_BITMAP).get_bit(vector as usize)
            }
            EXTERNAL_INTERRUPT => vv.get(field::PIN_BASED_CONTROLS) & PIN_EXTINT_EXITING != 0,
            HLT => vv.get(field::CPU_BASED_CONTROLS) & CPU_HLT_EXITING != 0,
            IO_INSTRUCTION => {
                let cpu = vv.get(field::CPU_BASED_CONTROLS);
                if cpu & CPU_USE_IO_BITMAPS != 0 {
                    let port = exit.qualification.get_bits(16..32) as u16;
                    let size = exit.qualification.get_bits(0..3) as u16 + 1;
                    self.l1_io_intercepted(&nvmx, port, size)
                } else {
                    cpu & CPU_UNCOND_IO_EXITING != 0
                }
            }
            _ => true,
        };
        if !reflect {
            return Ok(L2ExitAction::HandleInL0);
        }

        let mut regs = v.regs.lock();
        save_guest_state(&vv, &regs);
        vv.set(field::EXIT_REASON, exit.reason as u64);
        vv.set(field::EXIT_QUALIFICATION, exit.qualification);
        vv.set(field::EXIT_INTR_INFO, exit.intr_info as u64);
        vv.set(field::EXIT_INSTRUCTION_LEN, exit.instruction_len as u64);
        vv.set(field::VMX_INSTRUCTION_INFO, exit.instruction_info as u64);

        let l1 = nvmx.l1_regs.take().unwrap_or_else(|| regs.clone());
        regs.rip = vv.get(field::HOST_RIP);
        regs.gprs[4] = vv.get(field::HOST_RSP);
        regs.rflags = 0x2;
        regs.cr0 = vv.get(field::HOST_CR0);
        regs.cr3 = vv.get(field::HOST_CR3);
        regs.cr4 = vv.get(field::HOST_CR4);
        regs.efer = l1.efer;
        regs.segs = l1.segs;
        for (i, seg) in regs.segs.iter_mut().enumerate() {
            let sel = VmcsEncoding(field::HOST_ES_SELECTOR.0 + 2 * i as u32);
            seg.selector = vv.get(sel) as u16;
        }
        nvmx.guest_mode = false;
        debug!("{}: L2 exit {} reflected to L1", d.id(), exit.reason);
        Ok(L2ExitAction::Reflected)
    }

    /// Writes a running L2's registers back into its virtual VMCS.
    pub(crate) fn nvmx_flush(&self, vcpu: &Vcpu) {
        let nvmx = vcpu.nested.lock();
        if let (true, Some(cur)) = (nvmx.guest_mode, nvmx.current) {
            let regs = vcpu.regs.lock();
            save_guest_state(&Vvmcs::new(&self.frames, cur.mfn), &regs);
        }
    }

    /// Drops every frame nested VMX holds for `vcpu`.
    pub(crate) fn nvmx_vcpu_destroy(&self, vcpu: &Vcpu) {
        let mut nvmx = vcpu.nested.lock();
        self.purge_vvmcs(&mut nvmx);
        if let Some(n2) = nvmx.n2vmcs.take() {
            self.frames.free_xen_page(n2);
        }
        nvmx.vmxon = None;
        nvmx.guest_mode = false;
        nvmx.l1_regs = None;
    }
}

fn supported_field(raw: u64) -> Option<VmcsEncoding> {
    VmcsEncoding::from_operand(raw).filter(|e| e.is_valid() && *e != field::LAUNCH_STATE)
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use axpv_types::{DomainId, GuestVirtAddr};

    use super::*;
    use crate::domain::EFER_LMA;
    use crate::hypervisor::tests::{dom, machine, shadow_dom};
    use crate::vmx::RFLAGS_ZF;

    const V0: VcpuId = VcpuId::new(0);
    const URW: u64 = 0x7;
    /// [disp] with 64-bit addressing through DS, no base or index.
    const MEM: u32 = (2 << 7) | (3 << 15) | (1 << 22) | (1 << 27);

    const fn reg_form(reg1: u32, reg2: u32) -> u32 {
        (reg1 << 3) | (1 << 10) | (reg2 << 28)
    }

    /// Long-mode L1 with guest frame 10 mapped at va 0. Frames 20..24 are
    /// spare RAM for VMCS, VMXON region and I/O bitmaps.
    fn l1(hv: &Hypervisor) -> Arc<Domain> {
        let d = hv.domain(DomainId::new(1)).unwrap();
        let t = [1, 2, 3, 4].map(|g| hv.populate_physmap(&d, Gpfn::new(g), 0).unwrap());
        for g in [10, 20, 21, 22, 23] {
            hv.populate_physmap(&d, Gpfn::new(g), 0).unwrap();
        }
        let f = hv.frames();
        f.write_word(t[0], 0, (2 << 12) | URW);
        f.write_word(t[1], 0, (3 << 12) | URW);
        f.write_word(t[2], 0, (4 << 12) | URW);
        f.write_word(t[3], 0, (10 << 12) | URW);
        hv.shadow_write_cr3(&d, V0, 1 << 12).unwrap();
        let mut r = d.vcpu(V0).unwrap().regs.lock();
        r.cr0 = CR0_PE | CR0_PG;
        r.cr4 = CR4_PAE | CR4_VMXE;
        r.efer = EFER_LMA;
        r.seg_mut(SegReg::Cs).attr = 1 << 13;
        drop(r);
        d
    }

    fn exec(hv: &Hypervisor, d: &Domain, insn: VmxInstruction, info: u32, disp: u64) -> Result<VmxStatus, VmxFault> {
        let exit = ExitInfo {
            qualification: disp,
            instruction_info: info,
            instruction_len: 3,
            ..Default::default()
        };
        hv.nvmx_handle(d, V0, insn, &exit)
    }

    /// Runs an address-operand instruction on `gpa` stored at va 0x100.
    fn with_gpa(hv: &Hypervisor, d: &Domain, insn: VmxInstruction, gpa: u64) -> VmxStatus {
        hv.guest_write(d, V0, GuestVirtAddr::from(0x100usize), &gpa.to_le_bytes())
            .unwrap()
            .unwrap();
        exec(hv, d, insn, MEM, 0x100).unwrap()
    }

    fn vmwrite(hv: &Hypervisor, d: &Domain, enc: VmcsEncoding, val: u64) -> VmxStatus {
        {
            let mut r = d.vcpu(V0).unwrap().regs.lock();
            r.gprs[0] = val;
            r.gprs[1] = enc.0 as u64;
        }
        exec(hv, d, VmxInstruction::Vmwrite, reg_form(0, 1), 0).unwrap()
    }

    fn regs(d: &Domain) -> GuestRegs {
        d.vcpu(V0).unwrap().regs.lock().clone()
    }

    fn gfn(d: &Domain, g: u64) -> Mfn {
        d.p2m.gpfn_to_mfn(Gpfn::new(g))
    }

    #[test]
    fn vmcs_pointer_and_field_access() {
        let hv = machine(vec![shadow_dom(1)]);
        let d = l1(&hv);
        assert_eq!(with_gpa(&hv, &d, VmxInstruction::Vmxon, 0x15000), VmxStatus::Succeed);
        assert_eq!(regs(&d).rip, 3);
        assert_eq!(
            with_gpa(&hv, &d, VmxInstruction::Vmxon, 0x15000),
            VmxStatus::FailInvalid
        );
        assert_eq!(
            with_gpa(&hv, &d, VmxInstruction::Vmptrld, 0x15000),
            VmxStatus::FailInvalid
        );
        assert_eq!(with_gpa(&hv, &d, VmxInstruction::Vmptrld, 0x14000), VmxStatus::Succeed);
        assert_eq!(hv.frames().info(gfn(&d, 20)).general_count, 1);

        assert_eq!(vmwrite(&hv, &d, field::GUEST_RIP, 0x7777), VmxStatus::Succeed);
        assert_eq!(
            hv.frames().read_word(gfn(&d, 20), field::GUEST_RIP.offset()),
            0x7777
        );
        d.vcpu(V0).unwrap().regs.lock().gprs[1] = field::GUEST_RIP.0 as u64;
        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmread, reg_form(2, 1), 0),
            Ok(VmxStatus::Succeed)
        );
        assert_eq!(regs(&d).gprs[2], 0x7777);

        assert_eq!(
            vmwrite(&hv, &d, field::EXIT_REASON, 1),
            VmxStatus::FailValid(VmxInstructionError::WriteReadOnlyField)
        );
        assert_ne!(regs(&d).rflags & RFLAGS_ZF, 0);
        assert_eq!(
            hv.frames().read_word(gfn(&d, 20), field::VM_INSTRUCTION_ERROR.offset()),
            13
        );
        assert_eq!(
            vmwrite(&hv, &d, VmcsEncoding(0x1000), 1),
            VmxStatus::FailValid(VmxInstructionError::UnsupportedField)
        );

        // VMREAD to memory, then VMPTRST.
        d.vcpu(V0).unwrap().regs.lock().gprs[1] = field::GUEST_RIP.0 as u64;
        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmread, MEM | (1 << 28), 0x300),
            Ok(VmxStatus::Succeed)
        );
        assert_eq!(exec(&hv, &d, VmxInstruction::Vmptrst, MEM, 0x200), Ok(VmxStatus::Succeed));
        let mut buf = [0u8; 16];
        hv.guest_read(&d, V0, GuestVirtAddr::from(0x200usize), &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x14000);
        hv.guest_read(&d, V0, GuestVirtAddr::from(0x300usize), &mut buf[..8])
            .unwrap()
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x7777);

        assert_eq!(with_gpa(&hv, &d, VmxInstruction::Vmclear, 0x14000), VmxStatus::Succeed);
        assert_eq!(hv.frames().info(gfn(&d, 20)).general_count, 0);
        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmread, reg_form(2, 1), 0),
            Ok(VmxStatus::FailInvalid)
        );
        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmptrld, reg_form(0, 0), 0),
            Err(VmxFault::InvalidOpcode)
        );
    }

    #[test]
    fn privilege_checks() {
        let hv = machine(vec![shadow_dom(1), dom(2)]);
        let d = l1(&hv);
        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmptrld, MEM, 0x100),
            Err(VmxFault::InvalidOpcode)
        );
        d.vcpu(V0).unwrap().regs.lock().cr4 = CR4_PAE;
        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmxon, MEM, 0x100),
            Err(VmxFault::InvalidOpcode)
        );
        {
            let mut r = d.vcpu(V0).unwrap().regs.lock();
            r.cr4 = CR4_PAE | CR4_VMXE;
            r.seg_mut(SegReg::Ss).attr = 3 << 5;
        }
        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmxon, MEM, 0x100),
            Err(VmxFault::GeneralProtection)
        );
        let rip = regs(&d).rip;
        assert_eq!(rip, 0);

        let pv = hv.domain(DomainId::new(2)).unwrap();
        assert_eq!(
            exec(&hv, &pv, VmxInstruction::Vmxon, MEM, 0x100),
            Err(VmxFault::InvalidOpcode)
        );
    }

    #[test]
    fn launch_and_reflect_io_exit() {
        let hv = machine(vec![shadow_dom(1)]);
        let d = l1(&hv);
        let v = d.vcpu(V0).unwrap().clone();
        with_gpa(&hv, &d, VmxInstruction::Vmxon, 0x15000);
        with_gpa(&hv, &d, VmxInstruction::Vmptrld, 0x14000);
        for (enc, val) in [
            (field::GUEST_RIP, 0x4000),
            (field::GUEST_RSP, 0x8000),
            (field::GUEST_RFLAGS, 0x202),
            (field::GUEST_CR0, CR0_PE),
            (field::HOST_RIP, 0xffff_0000),
            (field::HOST_RSP, 0x9000),
            (field::HOST_CR0, CR0_PE | CR0_PG),
            (field::CPU_BASED_CONTROLS, CPU_USE_IO_BITMAPS),
            (field::IO_BITMAP_A, 0x16000),
            (field::IO_BITMAP_B, 0x17000),
        ] {
            assert_eq!(vmwrite(&hv, &d, enc, val), VmxStatus::Succeed);
        }
        // Intercept port 0x60 only.
        hv.frames().write_bytes(gfn(&d, 22), 0x60 / 8, &[1]);

        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmresume, 0, 0),
            Ok(VmxStatus::FailValid(VmxInstructionError::VmresumeNonLaunched))
        );
        assert_eq!(exec(&hv, &d, VmxInstruction::Vmlaunch, 0, 0), Ok(VmxStatus::Succeed));
        let r = regs(&d);
        assert_eq!((r.rip, r.gprs[4], r.rflags), (0x4000, 0x8000, 0x202));
        assert!(v.nested.lock().guest_mode);

        let n2 = |enc| hv.nvmx_n2_field(&v, enc).unwrap();
        assert_eq!(n2(field::PIN_BASED_CONTROLS) & L0_PIN, L0_PIN);
        assert_ne!(n2(field::EXCEPTION_BITMAP) & (1 << 14), 0);
        assert_eq!(n2(field::IO_BITMAP_A), gfn(&d, 22).raw() << 12);
        assert_eq!(n2(field::GUEST_RIP), 0x4000);

        let io = |port: u64| ExitInfo {
            reason: exit_reason::IO_INSTRUCTION,
            qualification: port << 16,
            ..Default::default()
        };
        assert_eq!(hv.nvmx_l2_exit(&d, V0, &io(0x70)), Ok(L2ExitAction::HandleInL0));
        let hlt = ExitInfo {
            reason: exit_reason::HLT,
            ..Default::default()
        };
        assert_eq!(hv.nvmx_l2_exit(&d, V0, &hlt), Ok(L2ExitAction::HandleInL0));

        v.regs.lock().rip = 0x4010;
        assert_eq!(hv.nvmx_l2_exit(&d, V0, &io(0x60)), Ok(L2ExitAction::Reflected));
        let r = regs(&d);
        assert_eq!((r.rip, r.gprs[4], r.rflags), (0xffff_0000, 0x9000, 0x2));
        assert_eq!(r.seg(SegReg::Cs).attr, 1 << 13);
        let vv = Vvmcs::new(hv.frames(), gfn(&d, 20));
        assert_eq!(vv.get(field::EXIT_REASON), 30);
        assert_eq!(vv.get(field::EXIT_QUALIFICATION), 0x60 << 16);
        assert_eq!(vv.get(field::GUEST_RIP), 0x4010);

        assert_eq!(
            exec(&hv, &d, VmxInstruction::Vmlaunch, 0, 0),
            Ok(VmxStatus::FailValid(VmxInstructionError::VmlaunchNonClear))
        );
        assert_eq!(exec(&hv, &d, VmxInstruction::Vmresume, 0, 0), Ok(VmxStatus::Succeed));
        assert_eq!(regs(&d).rip, 0x4010);

        hv.nvmx_vcpu_destroy(&v);
        for g in [20, 22, 23] {
            assert_eq!(hv.frames().info(gfn(&d, g)).general_count, 0);
        }
        assert!(v.nested.lock().n2vmcs.is_none());
    }
}
