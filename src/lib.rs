//! Paravirtual hypervisor core.
//!
//! Memory ownership and typing, guest-physical translation, grant tables,
//! event channels, shadow paging, nested VMX emulation and the hypercall
//! surface of a type-1 hypervisor. Hardware access stays outside: machine
//! memory is modelled by [`mm::frame::FrameTable`] and CPUs by indices.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;
#[macro_use]
extern crate log;

#[macro_use]
mod error;

pub mod config;
pub mod domain;
pub mod event;
pub mod grant;
pub mod hypercall;
pub mod hypervisor;
pub mod mm;
pub mod paging;
pub mod save;
pub mod sched;
pub mod vmx;

pub use axpv_types;
pub use error::guest_errno;
pub use hypervisor::Hypervisor;
