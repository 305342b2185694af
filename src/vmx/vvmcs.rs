//! Virtual VMCS layout.
//!
//! A field encoding packs access type (bit 0), index (bits 1..10), type
//! (bits 10..12) and width (bits 13..15). The blob stores one 64-bit word per
//! (width, type, index & 0x1f), so a 4K frame covers every field. The high
//! half of a 64-bit field is the same word as the field itself.

use bit_field::BitField;

use axpv_types::Mfn;

use crate::mm::frame::FrameTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsWidth {
    Bits16,
    Bits64,
    Bits32,
    Natural,
}

/// Field types.
pub const TYPE_CONTROL: u32 = 0;
pub const TYPE_EXIT_INFO: u32 = 1;
pub const TYPE_GUEST: u32 = 2;
pub const TYPE_HOST: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmcsEncoding(pub u32);

impl VmcsEncoding {
    /// Decodes a field encoding taken from a 64-bit register, rejecting
    /// reserved bits.
    pub fn from_operand(raw: u64) -> Option<Self> {
        if raw >> 15 != 0 || raw.get_bit(12) {
            return None;
        }
        Some(Self(raw as u32))
    }

    /// Accesses the high 32 bits of a 64-bit field.
    pub fn is_high(self) -> bool {
        self.0.get_bit(0)
    }

    pub fn index(self) -> u32 {
        self.0.get_bits(1..10)
    }

    pub fn field_type(self) -> u32 {
        self.0.get_bits(10..12)
    }

    pub fn width(self) -> VmcsWidth {
        match self.0.get_bits(13..15) {
            0 => VmcsWidth::Bits16,
            1 => VmcsWidth::Bits64,
            2 => VmcsWidth::Bits32,
            _ => VmcsWidth::Natural,
        }
    }

    /// High-half access is only defined on 64-bit fields.
    pub fn is_valid(self) -> bool {
        !self.is_high() || self.width() == VmcsWidth::Bits64
    }

    pub fn is_read_only(self) -> bool {
        self.field_type() == TYPE_EXIT_INFO
    }

    /// Word offset in the blob.
    pub fn offset(self) -> usize {
        let offset = (self.index() & 0x1f) | self.field_type() << 5 | self.0.get_bits(13..15) << 7;
        // Word 0 holds the revision; the one field landing there moves.
        if offset == 0 { 0x3f } else { offset as usize }
    }
}

/// Field encodings the core interprets.
pub mod field {
    use super::VmcsEncoding as E;

    pub const VPID: E = E(0x0000);
    pub const GUEST_ES_SELECTOR: E = E(0x0800);
    pub const HOST_ES_SELECTOR: E = E(0x0c00);
    pub const IO_BITMAP_A: E = E(0x2000);
    pub const IO_BITMAP_A_HIGH: E = E(0x2001);
    pub const IO_BITMAP_B: E = E(0x2002);
    pub const IO_BITMAP_B_HIGH: E = E(0x2003);
    pub const VMCS_LINK_POINTER: E = E(0x2800);
    pub const GUEST_IA32_EFER: E = E(0x2806);
    pub const PIN_BASED_CONTROLS: E = E(0x4000);
    pub const CPU_BASED_CONTROLS: E = E(0x4002);
    pub const EXCEPTION_BITMAP: E = E(0x4004);
    pub const EXIT_CONTROLS: E = E(0x400c);
    pub const ENTRY_CONTROLS: E = E(0x4012);
    pub const VM_INSTRUCTION_ERROR: E = E(0x4400);
    pub const EXIT_REASON: E = E(0x4402);
    pub const EXIT_INTR_INFO: E = E(0x4404);
    pub const EXIT_INSTRUCTION_LEN: E = E(0x440c);
    pub const VMX_INSTRUCTION_INFO: E = E(0x440e);
    pub const GUEST_ES_LIMIT: E = E(0x4800);
    pub const GUEST_ES_AR: E = E(0x4814);
    pub const EXIT_QUALIFICATION: E = E(0x6400);
    pub const GUEST_CR0: E = E(0x6800);
    pub const GUEST_CR3: E = E(0x6802);
    pub const GUEST_CR4: E = E(0x6804);
    pub const GUEST_ES_BASE: E = E(0x6806);
    pub const GUEST_RSP: E = E(0x681c);
    pub const GUEST_RIP: E = E(0x681e);
    pub const GUEST_RFLAGS: E = E(0x6820);
    pub const HOST_CR0: E = E(0x6c00);
    pub const HOST_CR3: E = E(0x6c02);
    pub const HOST_CR4: E = E(0x6c04);
    pub const HOST_RSP: E = E(0x6c14);
    pub const HOST_RIP: E = E(0x6c16);
    /// Software field: nonzero once launched.
    pub const LAUNCH_STATE: E = E(0x6c3e);

    /// Guest segment fields come in strides of two, in ES..GS order.
    pub const fn guest_seg(base: E, seg: usize) -> E {
        E(base.0 + 2 * seg as u32)
    }
}

/// A virtual VMCS in machine frame `mfn`.
pub struct Vvmcs<'a> {
    frames: &'a FrameTable,
    mfn: Mfn,
}

impl<'a> Vvmcs<'a> {
    pub fn new(frames: &'a FrameTable, mfn: Mfn) -> Self {
        Self { frames, mfn }
    }

    pub fn get(&self, enc: VmcsEncoding) -> u64 {
        let raw = self.frames.read_word(self.mfn, enc.offset());
        match enc.width() {
            VmcsWidth::Bits16 => raw & 0xffff,
            VmcsWidth::Bits64 if enc.is_high() => raw >> 32,
            VmcsWidth::Bits32 => raw & 0xffff_ffff,
            _ => raw,
        }
    }

    pub fn set(&self, enc: VmcsEncoding, val: u64) {
        let offset = enc.offset();
        let new = match enc.width() {
            VmcsWidth::Bits16 => val & 0xffff,
            VmcsWidth::Bits64 if enc.is_high() => {
                let old = self.frames.read_word(self.mfn, offset);
                (old & 0xffff_ffff) | (val << 32)
            }
            VmcsWidth::Bits32 => val & 0xffff_ffff,
            _ => val,
        };
        self.frames.write_word(self.mfn, offset, new);
    }
}
