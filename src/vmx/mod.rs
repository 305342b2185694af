//! Nested VMX: running a guest hypervisor's own guests.
//!
//! The guest hypervisor (L1) executes VMX instructions that trap to the
//! core. They operate on a virtual VMCS kept in one of L1's frames
//! ([`vvmcs`]), with operands decoded from the VM-exit instruction
//! information ([`decode`]). VMLAUNCH and VMRESUME build the VMCS the nested
//! guest (L2) really runs on from L0 policy and L1's requests; exits of L2
//! are either handled by the core or reflected into L1 ([`nested`]).

use axerrno::AxError;
use axpv_types::Mfn;
use numeric_enum_macro::numeric_enum;
use thiserror::Error;

use crate::domain::GuestRegs;
use crate::paging::PfErrorCode;

pub mod decode;
pub mod nested;
pub mod vvmcs;

pub use decode::{InstructionInfo, Operand};
pub use nested::{ExitInfo, L2ExitAction, VmxInstruction};
pub use vvmcs::{VmcsEncoding, VmcsWidth};

/// Fault raised into L1 instead of completing a VMX instruction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmxFault {
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("general protection fault")]
    GeneralProtection,
    #[error("page fault on operand access ({0:?})")]
    PageFault(PfErrorCode),
    #[error("out of resources: {0:?}")]
    Resource(AxError),
}

impl From<AxError> for VmxFault {
    fn from(err: AxError) -> Self {
        VmxFault::Resource(err)
    }
}

numeric_enum! {
    #[repr(u32)]
    /// VM-instruction error numbers reported through VMfailValid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum VmxInstructionError {
        VmclearInvalidAddress = 2,
        VmclearVmxonPointer = 3,
        VmlaunchNonClear = 4,
        VmresumeNonLaunched = 5,
        EntryInvalidControl = 7,
        EntryInvalidHostState = 8,
        VmptrldInvalidAddress = 9,
        VmptrldVmxonPointer = 10,
        UnsupportedField = 12,
        WriteReadOnlyField = 13,
        VmxonInRoot = 15,
    }
}

/// How a VMX instruction completed, as seen through RFLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxStatus {
    Succeed,
    /// ZF set, error number in the current VMCS.
    FailValid(VmxInstructionError),
    /// CF set, no current VMCS.
    FailInvalid,
}

pub(crate) const RFLAGS_CF: u64 = 1 << 0;
pub(crate) const RFLAGS_PF: u64 = 1 << 2;
pub(crate) const RFLAGS_AF: u64 = 1 << 4;
pub(crate) const RFLAGS_ZF: u64 = 1 << 6;
pub(crate) const RFLAGS_SF: u64 = 1 << 7;
pub(crate) const RFLAGS_OF: u64 = 1 << 11;

impl VmxStatus {
    /// Applies the status to the arithmetic flags.
    pub fn apply(self, rflags: u64) -> u64 {
        let cleared = rflags
            & !(RFLAGS_CF | RFLAGS_PF | RFLAGS_AF | RFLAGS_ZF | RFLAGS_SF | RFLAGS_OF);
        match self {
            VmxStatus::Succeed => cleared,
            VmxStatus::FailValid(_) => cleared | RFLAGS_ZF,
            VmxStatus::FailInvalid => cleared | RFLAGS_CF,
        }
    }
}

/// Current virtual VMCS of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentVmcs {
    /// Guest-physical address L1 loaded.
    pub gpa: u64,
    /// Backing frame, holding a general reference.
    pub mfn: Mfn,
}

/// Per-vCPU nested VMX state.
#[derive(Debug, Default)]
pub struct NestedVmx {
    /// VMXON region address while L1 is in VMX operation.
    pub vmxon: Option<u64>,
    pub current: Option<CurrentVmcs>,
    /// I/O bitmaps A and B named by the current VMCS, read-only references.
    pub io_bitmap: [Option<Mfn>; 2],
    /// Hypervisor frame holding the VMCS L2 actually runs on.
    pub n2vmcs: Option<Mfn>,
    /// L2 is running.
    pub guest_mode: bool,
    /// L1 registers while L2 runs.
    pub l1_regs: Option<GuestRegs>,
}

impl NestedVmx {
    pub fn in_vmx_operation(&self) -> bool {
        self.vmxon.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flags() {
        let all = RFLAGS_CF | RFLAGS_ZF | RFLAGS_OF | 0x202;
        assert_eq!(VmxStatus::Succeed.apply(all), 0x202);
        assert_eq!(
            VmxStatus::FailValid(VmxInstructionError::UnsupportedField).apply(0x2),
            0x2 | RFLAGS_ZF
        );
        assert_eq!(VmxStatus::FailInvalid.apply(RFLAGS_ZF), RFLAGS_CF);
        assert_eq!(
            VmxInstructionError::try_from(13u32),
            Ok(VmxInstructionError::WriteReadOnlyField)
        );
    }
}
