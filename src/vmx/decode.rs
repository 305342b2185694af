//! Operand decode for trapped VMX instructions.

use bit_field::BitField;

use axpv_types::GuestVirtAddr;

use super::VmxFault;
use crate::domain::{GuestRegs, SegReg};

/// VM-exit instruction-information field of a VMX instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionInfo(pub u32);

impl InstructionInfo {
    pub fn scaling(self) -> u32 {
        self.0.get_bits(0..2)
    }

    pub fn reg1(self) -> usize {
        self.0.get_bits(3..7) as usize
    }

    /// 0, 1, 2 for 16, 32 and 64-bit addressing.
    pub fn addr_size(self) -> u32 {
        self.0.get_bits(7..10)
    }

    /// The operand is a register rather than memory.
    pub fn is_register(self) -> bool {
        self.0.get_bit(10)
    }

    pub fn segment(self) -> u64 {
        self.0.get_bits(15..18) as u64
    }

    pub fn index_reg(self) -> Option<usize> {
        (!self.0.get_bit(22)).then(|| self.0.get_bits(18..22) as usize)
    }

    pub fn base_reg(self) -> Option<usize> {
        (!self.0.get_bit(27)).then(|| self.0.get_bits(23..27) as usize)
    }

    pub fn reg2(self) -> usize {
        self.0.get_bits(28..32) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(usize),
    Memory { va: GuestVirtAddr, len: usize },
}

/// A decoded instruction: the primary operand and the second register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub operand: Operand,
    pub reg2: usize,
}

fn is_canonical(va: u64) -> bool {
    let top = (va as i64) >> 47;
    top == 0 || top == -1
}

/// Computes the operand of an instruction described by `info`, with
/// `displacement` taken from the exit qualification. Memory operands are
/// `len` bytes wide.
pub fn decode_operand(
    regs: &GuestRegs,
    info: InstructionInfo,
    displacement: u64,
    len: usize,
) -> Result<Decoded, VmxFault> {
    let reg2 = info.reg2();
    if info.is_register() {
        return Ok(Decoded {
            operand: Operand::Register(info.reg1()),
            reg2,
        });
    }

    let seg_reg = SegReg::from_index(info.segment()).ok_or(VmxFault::GeneralProtection)?;
    let seg = regs.seg(seg_reg);
    let base = info.base_reg().map_or(0, |r| regs.gprs[r]);
    let index = info.index_reg().map_or(0, |r| regs.gprs[r]);
    let mask = match info.addr_size() {
        0 => 0xffff,
        1 => 0xffff_ffff,
        2 => u64::MAX,
        _ => return Err(VmxFault::GeneralProtection),
    };
    let offset = base
        .wrapping_add(index.wrapping_shl(info.scaling()))
        .wrapping_add(displacement)
        & mask;

    let long = regs.long_mode() && regs.seg(SegReg::Cs).is_long();
    let va = if long {
        // Only FS and GS keep a base in 64-bit mode, and there are no limits.
        let base = match seg_reg {
            SegReg::Fs | SegReg::Gs => seg.base,
            _ => 0,
        };
        let va = base.wrapping_add(offset);
        if !is_canonical(va) || !is_canonical(va.wrapping_add(len as u64 - 1)) {
            return Err(VmxFault::GeneralProtection);
        }
        va
    } else {
        let last = offset + len as u64 - 1;
        if last > seg.limit as u64 {
            warn!("vmx operand {:#x}+{} beyond {:?} limit {:#x}", offset, len, seg_reg, seg.limit);
            return Err(VmxFault::GeneralProtection);
        }
        seg.base.wrapping_add(offset) & 0xffff_ffff
    };
    Ok(Decoded {
        operand: Operand::Memory {
            va: GuestVirtAddr::from(va as usize),
            len,
        },
        reg2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EFER_LMA;

    fn info(bits: &[(core::ops::Range<usize>, u32)]) -> InstructionInfo {
        let mut word = 0u32;
        for (range, val) in bits {
            word.set_bits(range.clone(), *val);
        }
        InstructionInfo(word)
    }

    #[test]
    fn register_operand() {
        let regs = GuestRegs::default();
        let i = info(&[(3..7, 5), (10..11, 1), (28..32, 9)]);
        assert_eq!(
            decode_operand(&regs, i, 0, 8),
            Ok(Decoded {
                operand: Operand::Register(5),
                reg2: 9
            })
        );
    }

    #[test]
    fn protected_mode_memory_operand_checks_limit() {
        let mut regs = GuestRegs::default();
        regs.seg_mut(SegReg::Ds).base = 0x10_0000;
        regs.seg_mut(SegReg::Ds).limit = 0xffff;
        regs.gprs[3] = 0x1000; // rbx
        regs.gprs[6] = 0x10; // rsi
        // [ds:rbx + rsi*4 + 8], 32-bit addressing.
        let i = info(&[(0..2, 2), (7..10, 1), (15..18, 3), (18..22, 6), (23..27, 3)]);
        let d = decode_operand(&regs, i, 8, 8).unwrap();
        assert_eq!(
            d.operand,
            Operand::Memory {
                va: GuestVirtAddr::from(0x10_1048usize),
                len: 8
            }
        );

        regs.gprs[3] = 0xfffc;
        assert_eq!(decode_operand(&regs, i, 0, 8), Err(VmxFault::GeneralProtection));
        let bad_seg = info(&[(7..10, 1), (15..18, 6), (22..23, 1), (27..28, 1)]);
        assert_eq!(decode_operand(&regs, bad_seg, 0, 8), Err(VmxFault::GeneralProtection));
    }

    #[test]
    fn long_mode_ignores_limits_but_not_canonical_form() {
        let mut regs = GuestRegs::default();
        regs.efer = EFER_LMA;
        regs.seg_mut(SegReg::Cs).attr = 1 << 13;
        regs.seg_mut(SegReg::Ds).base = 0x5000;
        regs.seg_mut(SegReg::Gs).base = 0x7000;
        regs.gprs[0] = 0x1_0000_0000;
        let ds = info(&[(7..10, 2), (15..18, 3), (22..23, 1), (23..27, 0)]);
        let gs = info(&[(7..10, 2), (15..18, 5), (22..23, 1), (23..27, 0)]);
        assert_eq!(
            decode_operand(&regs, ds, 0, 8).unwrap().operand,
            Operand::Memory {
                va: GuestVirtAddr::from(0x1_0000_0000usize),
                len: 8
            }
        );
        assert_eq!(
            decode_operand(&regs, gs, 0x10, 8).unwrap().operand,
            Operand::Memory {
                va: GuestVirtAddr::from(0x1_0000_7010usize),
                len: 8
            }
        );
        regs.gprs[0] = 0x0000_8000_0000_0000;
        assert_eq!(decode_operand(&regs, ds, 0, 8), Err(VmxFault::GeneralProtection));
    }
}
