//! Shared vocabulary types for the `axpv` hypervisor core.
//!
//! Frame numbers, domain identifiers, grant references and event-channel
//! ports are plain integers on the wire. They are wrapped in newtypes here so
//! that a guest frame number can never be handed to an API that expects a
//! machine frame number.

#![no_std]

use memory_addr::{def_usize_addr, def_usize_addr_formatter};

/// Size of a machine or guest page.
pub const PAGE_SHIFT: usize = 12;

def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
    /// Guest virtual address.
    pub type GuestVirtAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
    GuestVirtAddr = "GVA:{}";
}

/// Identifier of a domain.
///
/// Values at or above [`DomainId::FIRST_RESERVED`] never name a real domain.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
)]
#[display("d{_0}")]
pub struct DomainId(u16);

impl DomainId {
    pub const FIRST_RESERVED: Self = Self(0x7ff0);
    /// Refers to the calling domain in hypercall arguments.
    pub const SELF: Self = Self(0x7ff0);
    pub const IO: Self = Self(0x7ff1);
    pub const XEN: Self = Self(0x7ff2);
    pub const INVALID: Self = Self(0x7ff4);

    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_reserved(self) -> bool {
        self.0 >= Self::FIRST_RESERVED.0
    }
}

/// Machine frame number: a page of host RAM.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
)]
#[display("mfn:{_0:#x}")]
pub struct Mfn(u64);

/// Guest physical frame number.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
)]
#[display("gpfn:{_0:#x}")]
pub struct Gpfn(u64);

macro_rules! impl_frame_number {
    ($name:ident) => {
        impl $name {
            /// Sentinel for "no frame".
            pub const INVALID: Self = Self(u64::MAX);

            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }

            pub const fn index(self) -> usize {
                self.0 as usize
            }

            pub const fn is_invalid(self) -> bool {
                self.0 == u64::MAX
            }

            pub const fn add(self, n: u64) -> Self {
                Self(self.0 + n)
            }

            pub const fn from_addr(addr: u64) -> Self {
                Self(addr >> PAGE_SHIFT)
            }

            pub const fn to_addr(self) -> u64 {
                self.0 << PAGE_SHIFT
            }
        }
    };
}

impl_frame_number!(Mfn);
impl_frame_number!(Gpfn);

impl Gpfn {
    pub fn from_gpa(gpa: GuestPhysAddr) -> Self {
        Self((gpa.as_usize() >> PAGE_SHIFT) as u64)
    }

    pub fn to_gpa(self) -> GuestPhysAddr {
        GuestPhysAddr::from_usize((self.0 as usize) << PAGE_SHIFT)
    }
}

/// Index into a domain's grant table.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
)]
#[display("gref:{_0}")]
pub struct GrantRef(u32);

impl GrantRef {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Local event-channel port number. Port 0 is never handed out.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
)]
#[display("port:{_0}")]
pub struct Port(u32);

impl Port {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a virtual CPU inside its domain.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::From, derive_more::Into,
)]
pub struct VcpuId(u32);

impl VcpuId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}
