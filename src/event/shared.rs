//! Event-channel bits of the shared info page.
//!
//! The pending and mask arrays hold one bit per port. A vCPU finds its
//! pending ports in two steps: each bit of its selector word names one
//! 64-port word of the pending array. The guest manipulates all of these
//! directly, so every access is an atomic bit operation.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axpv_types::{Port, VcpuId};

/// Largest port the two-level layout can describe.
pub const MAX_PORTS: usize = 64 * 64;

#[derive(Default)]
pub struct VcpuInfo {
    upcall_pending: AtomicBool,
    upcall_mask: AtomicBool,
    pending_sel: AtomicU64,
}

impl VcpuInfo {
    pub fn upcall_pending(&self) -> bool {
        self.upcall_pending.load(Ordering::Acquire)
    }

    pub fn set_upcall_mask(&self, masked: bool) {
        self.upcall_mask.store(masked, Ordering::Release);
    }

    pub fn upcall_masked(&self) -> bool {
        self.upcall_mask.load(Ordering::Acquire)
    }
}

pub struct SharedInfo {
    pending: Box<[AtomicU64]>,
    mask: Box<[AtomicU64]>,
    vcpu_info: Box<[VcpuInfo]>,
}

fn bit(port: Port) -> (usize, u64) {
    (port.index() / 64, 1u64 << (port.index() % 64))
}

impl SharedInfo {
    pub fn new(ports: usize, vcpus: usize) -> Self {
        let words = ports.min(MAX_PORTS).div_ceil(64);
        let array = || {
            (0..words)
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };
        Self {
            pending: array(),
            mask: array(),
            vcpu_info: (0..vcpus).map(|_| VcpuInfo::default()).collect(),
        }
    }

    pub fn vcpu_info(&self, vcpu: VcpuId) -> Option<&VcpuInfo> {
        self.vcpu_info.get(vcpu.index())
    }

    pub fn is_pending(&self, port: Port) -> bool {
        let (w, b) = bit(port);
        self.pending
            .get(w)
            .is_some_and(|p| p.load(Ordering::Acquire) & b != 0)
    }

    pub fn is_masked(&self, port: Port) -> bool {
        let (w, b) = bit(port);
        self.mask
            .get(w)
            .is_some_and(|m| m.load(Ordering::Acquire) & b != 0)
    }

    pub fn clear_pending(&self, port: Port) {
        let (w, b) = bit(port);
        if let Some(p) = self.pending.get(w) {
            p.fetch_and(!b, Ordering::AcqRel);
        }
    }

    pub fn mask(&self, port: Port) {
        let (w, b) = bit(port);
        if let Some(m) = self.mask.get(w) {
            m.fetch_or(b, Ordering::AcqRel);
        }
    }

    /// Raises the selector and upcall flag of `vcpu` for `port`. Returns
    /// whether the vCPU needs a kick.
    fn mark_vcpu(&self, port: Port, vcpu: VcpuId) -> bool {
        let Some(info) = self.vcpu_info(vcpu) else {
            return false;
        };
        let (w, _) = bit(port);
        let sel = 1u64 << w;
        if info.pending_sel.fetch_or(sel, Ordering::AcqRel) & sel != 0 {
            return false;
        }
        !info.upcall_pending.swap(true, Ordering::AcqRel)
    }

    /// Marks `port` pending for delivery to `vcpu`. Returns whether the vCPU
    /// must be woken.
    pub fn set_pending(&self, port: Port, vcpu: VcpuId) -> bool {
        let (w, b) = bit(port);
        let Some(p) = self.pending.get(w) else {
            return false;
        };
        if p.fetch_or(b, Ordering::AcqRel) & b != 0 {
            return false;
        }
        if self.is_masked(port) {
            return false;
        }
        self.mark_vcpu(port, vcpu)
    }

    /// Unmasks `port`, delivering it if it became pending while masked.
    pub fn unmask(&self, port: Port, vcpu: VcpuId) -> bool {
        let (w, b) = bit(port);
        let Some(m) = self.mask.get(w) else {
            return false;
        };
        if m.fetch_and(!b, Ordering::AcqRel) & b == 0 {
            return false;
        }
        self.is_pending(port) && self.mark_vcpu(port, vcpu)
    }

    /// The guest's upcall demultiplexer: consumes the selector and returns
    /// every pending unmasked port, clearing their pending bits.
    pub fn poll(&self, vcpu: VcpuId) -> Vec<Port> {
        let Some(info) = self.vcpu_info(vcpu) else {
            return Vec::new();
        };
        info.upcall_pending.store(false, Ordering::Release);
        let mut sel = info.pending_sel.swap(0, Ordering::AcqRel);
        let mut ports = Vec::new();
        while sel != 0 {
            let w = sel.trailing_zeros() as usize;
            sel &= sel - 1;
            let Some(p) = self.pending.get(w) else {
                continue;
            };
            let mut bits = p.load(Ordering::Acquire) & !self.mask[w].load(Ordering::Acquire);
            while bits != 0 {
                let b = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                p.fetch_and(!(1u64 << b), Ordering::AcqRel);
                ports.push(Port::new((w * 64 + b) as u32));
            }
        }
        ports
    }
}
