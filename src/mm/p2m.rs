//! Guest-physical to machine translation and its global inverse.
//!
//! Writers serialize on the per-domain P2M lock. Readers never lock: the two
//! tables are updated in an order that makes a torn update look unmapped.
//! Insertion writes M2P before P2M, removal clears P2M before M2P.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering, fence};

use axerrno::{AxResult, ax_err};
use bit_field::BitField;
use numeric_enum_macro::numeric_enum;
use spin::Mutex;

use axpv_types::{DomainId, Gpfn, Mfn};

use crate::config::PhysmapLayout;

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum P2mType {
        Invalid = 0,
        RamRw = 1,
        RamRo = 2,
        /// RAM whose writes are being logged.
        RamLogDirty = 3,
        MmioDirect = 4,
        Grant = 5,
    }
}

impl P2mType {
    pub fn is_ram(self) -> bool {
        matches!(self, P2mType::RamRw | P2mType::RamRo | P2mType::RamLogDirty)
    }
}

const MFN_BITS: core::ops::Range<usize> = 0..52;
const TYPE_BITS: core::ops::Range<usize> = 56..60;

fn pack(mfn: Mfn, ty: P2mType) -> u64 {
    let mut entry = 0u64;
    entry.set_bits(MFN_BITS, mfn.raw());
    entry.set_bits(TYPE_BITS, ty as u64);
    entry
}

fn unpack(entry: u64) -> (Mfn, P2mType) {
    let ty = P2mType::try_from(entry.get_bits(TYPE_BITS) as u8).unwrap_or(P2mType::Invalid);
    if ty == P2mType::Invalid {
        (Mfn::INVALID, ty)
    } else {
        (Mfn::new(entry.get_bits(MFN_BITS)), ty)
    }
}

/// Machine-to-physical table, shared by all domains.
pub struct M2pTable {
    entries: Box<[AtomicU64]>,
}

const M2P_INVALID: u64 = u64::MAX;

impl M2pTable {
    pub fn new(nr_frames: usize) -> Self {
        Self {
            entries: (0..nr_frames)
                .map(|_| AtomicU64::new(M2P_INVALID))
                .collect::<Vec<_>>()
                .into(),
        }
    }

    fn set(&self, mfn: Mfn, domain: DomainId, gpfn: Gpfn) {
        if let Some(e) = self.entries.get(mfn.index()) {
            e.store(((domain.raw() as u64) << 48) | gpfn.raw(), Ordering::Release);
        }
    }

    fn clear(&self, mfn: Mfn) {
        if let Some(e) = self.entries.get(mfn.index()) {
            e.store(M2P_INVALID, Ordering::Release);
        }
    }

    pub fn lookup(&self, mfn: Mfn) -> Option<(DomainId, Gpfn)> {
        let raw = self.entries.get(mfn.index())?.load(Ordering::Acquire);
        if raw == M2P_INVALID {
            return None;
        }
        Some((
            DomainId::new(raw.get_bits(48..64) as u16),
            Gpfn::new(raw.get_bits(0..48)),
        ))
    }
}

pub struct P2mTable {
    domain: DomainId,
    privileged: bool,
    layout: PhysmapLayout,
    ram: Box<[AtomicU64]>,
    mmio: Box<[AtomicU64]>,
    grant_frames: Mutex<Vec<Mfn>>,
    lock: Mutex<()>,
}

impl P2mTable {
    pub fn new(domain: DomainId, privileged: bool, layout: PhysmapLayout) -> Self {
        let table = |n: u64| {
            (0..n)
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };
        Self {
            domain,
            privileged,
            layout,
            ram: table(layout.ram_pages),
            mmio: table(layout.mmio_pages),
            grant_frames: Mutex::new(Vec::new()),
            lock: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &PhysmapLayout {
        &self.layout
    }

    pub fn ram_pages(&self) -> u64 {
        self.layout.ram_pages
    }

    fn in_window(gpfn: Gpfn, base: u64, len: u64) -> Option<usize> {
        let raw = gpfn.raw();
        (raw >= base && raw - base < len).then(|| (raw - base) as usize)
    }

    /// Translates `gpfn`, returning the frame and how it is mapped.
    pub fn lookup(&self, gpfn: Gpfn) -> (Mfn, P2mType) {
        if let Some(e) = self.ram.get(gpfn.index()) {
            return unpack(e.load(Ordering::Acquire));
        }
        let l = &self.layout;
        if let Some(idx) = Self::in_window(gpfn, l.grant_base, u64::MAX) {
            if let Some(&mfn) = self.grant_frames.lock().get(idx) {
                return (mfn, P2mType::Grant);
            }
        }
        if let Some(idx) = Self::in_window(gpfn, l.mmio_base, l.mmio_pages) {
            return unpack(self.mmio[idx].load(Ordering::Acquire));
        }
        if self.privileged {
            if let Some(idx) = Self::in_window(gpfn, l.passthrough_base, l.passthrough_pages) {
                return (Mfn::new(idx as u64), P2mType::MmioDirect);
            }
        }
        (Mfn::INVALID, P2mType::Invalid)
    }

    pub fn gpfn_to_mfn(&self, gpfn: Gpfn) -> Mfn {
        self.lookup(gpfn).0
    }

    /// Reverse translation, confirmed against this domain's P2M.
    pub fn mfn_to_gpfn(&self, m2p: &M2pTable, mfn: Mfn) -> Gpfn {
        match m2p.lookup(mfn) {
            Some((domain, gpfn)) if domain == self.domain && self.gpfn_to_mfn(gpfn) == mfn => gpfn,
            _ => Gpfn::INVALID,
        }
    }

    fn ram_entry(&self, gpfn: Gpfn) -> AxResult<&AtomicU64> {
        match self.ram.get(gpfn.index()) {
            Some(e) => Ok(e),
            None => ax_err!(
                InvalidInput,
                format!("{}: {} outside guest RAM", self.domain, gpfn)
            ),
        }
    }

    fn unmap_locked(&self, m2p: &M2pTable, gpfn: Gpfn, entry: &AtomicU64) -> Mfn {
        let (old, _) = unpack(entry.swap(0, Ordering::AcqRel));
        if !old.is_invalid() {
            fence(Ordering::SeqCst);
            if m2p.lookup(old) == Some((self.domain, gpfn)) {
                m2p.clear(old);
            }
        }
        old
    }

    /// Maps `mfn` at `gpfn`, replacing what was there and dropping any
    /// other mapping of `mfn` in this domain. Returns the frame that was
    /// replaced.
    pub fn add_to_physmap(
        &self,
        m2p: &M2pTable,
        gpfn: Gpfn,
        mfn: Mfn,
        ty: P2mType,
    ) -> AxResult<Option<Mfn>> {
        if !ty.is_ram() {
            return ax_err!(InvalidInput, format!("{:?} is not a RAM mapping", ty));
        }
        let entry = self.ram_entry(gpfn)?;
        let _guard = self.lock.lock();

        if let Some((d, other)) = m2p.lookup(mfn) {
            if d == self.domain && other != gpfn && self.gpfn_to_mfn(other) == mfn {
                if let Ok(e) = self.ram_entry(other) {
                    debug!("{}: {} moves from {} to {}", self.domain, mfn, other, gpfn);
                    self.unmap_locked(m2p, other, e);
                }
            }
        }
        let old = self.unmap_locked(m2p, gpfn, entry);

        m2p.set(mfn, self.domain, gpfn);
        fence(Ordering::SeqCst);
        entry.store(pack(mfn, ty), Ordering::Release);
        trace!("{}: p2m {} -> {} ({:?})", self.domain, gpfn, mfn, ty);
        Ok((!old.is_invalid() && old != mfn).then_some(old))
    }

    /// Unmaps `gpfn`, returning the frame it named.
    pub fn remove_from_physmap(&self, m2p: &M2pTable, gpfn: Gpfn) -> AxResult<Mfn> {
        let entry = self.ram_entry(gpfn)?;
        let _guard = self.lock.lock();
        let old = self.unmap_locked(m2p, gpfn, entry);
        if old.is_invalid() {
            return ax_err!(NotFound, format!("{}: {} not mapped", self.domain, gpfn));
        }
        trace!("{}: p2m {} removed ({})", self.domain, gpfn, old);
        Ok(old)
    }

    /// Changes the type of a present RAM mapping.
    pub fn set_type(&self, gpfn: Gpfn, ty: P2mType) -> AxResult {
        if !ty.is_ram() {
            return ax_err!(InvalidInput);
        }
        let entry = self.ram_entry(gpfn)?;
        let _guard = self.lock.lock();
        let (mfn, old) = unpack(entry.load(Ordering::Acquire));
        if !old.is_ram() {
            return ax_err!(NotFound, format!("{}: {} not mapped", self.domain, gpfn));
        }
        entry.store(pack(mfn, ty), Ordering::Release);
        Ok(())
    }

    /// Flips every RAM entry of type `from` to `to`.
    pub fn change_type_all(&self, from: P2mType, to: P2mType) -> usize {
        let _guard = self.lock.lock();
        let mut changed = 0;
        for entry in self.ram.iter() {
            let (mfn, ty) = unpack(entry.load(Ordering::Acquire));
            if ty == from {
                entry.store(pack(mfn, to), Ordering::Release);
                changed += 1;
            }
        }
        changed
    }

    pub fn set_mmio_entry(&self, gpfn: Gpfn, mfn: Mfn) -> AxResult {
        let l = &self.layout;
        let Some(idx) = Self::in_window(gpfn, l.mmio_base, l.mmio_pages) else {
            return ax_err!(InvalidInput, format!("{} outside the I/O window", gpfn));
        };
        let _guard = self.lock.lock();
        self.mmio[idx].store(pack(mfn, P2mType::MmioDirect), Ordering::Release);
        Ok(())
    }

    pub fn clear_mmio_entry(&self, gpfn: Gpfn) -> AxResult {
        let l = &self.layout;
        let Some(idx) = Self::in_window(gpfn, l.mmio_base, l.mmio_pages) else {
            return ax_err!(InvalidInput, format!("{} outside the I/O window", gpfn));
        };
        let _guard = self.lock.lock();
        if self.mmio[idx].swap(0, Ordering::AcqRel) == 0 {
            return ax_err!(NotFound);
        }
        Ok(())
    }

    /// Installs the frames backing the grant-table window.
    pub fn set_grant_frames(&self, frames: Vec<Mfn>) {
        *self.grant_frames.lock() = frames;
    }

    /// Present RAM mappings, in guest frame order.
    pub fn ram_mappings(&self) -> Vec<(Gpfn, Mfn, P2mType)> {
        self.ram
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                let (mfn, ty) = unpack(e.load(Ordering::Acquire));
                ty.is_ram().then(|| (Gpfn::new(i as u64), mfn, ty))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2m(privileged: bool) -> (M2pTable, P2mTable) {
        (
            M2pTable::new(256),
            P2mTable::new(DomainId::new(1), privileged, PhysmapLayout::default()),
        )
    }

    #[test]
    fn add_then_remove_clears_both_directions() {
        let (m2p, p2m) = p2m(false);
        let gpfn = Gpfn::new(0x1000);
        let mfn = Mfn::new(0x50);
        assert!(p2m.gpfn_to_mfn(gpfn).is_invalid());
        p2m.add_to_physmap(&m2p, gpfn, mfn, P2mType::RamRw).unwrap();
        assert_eq!(p2m.gpfn_to_mfn(gpfn), mfn);
        assert_eq!(p2m.mfn_to_gpfn(&m2p, mfn), gpfn);
        assert_eq!(p2m.remove_from_physmap(&m2p, gpfn).unwrap(), mfn);
        assert!(p2m.gpfn_to_mfn(gpfn).is_invalid());
        assert!(p2m.mfn_to_gpfn(&m2p, mfn).is_invalid());
        assert!(p2m.remove_from_physmap(&m2p, gpfn).is_err());
    }

    #[test]
    fn remap_drops_stale_directions() {
        let (m2p, p2m) = p2m(false);
        let a = Gpfn::new(3);
        let b = Gpfn::new(4);
        p2m.add_to_physmap(&m2p, a, Mfn::new(10), P2mType::RamRw).unwrap();
        // Same frame at a new place: the old place goes away.
        p2m.add_to_physmap(&m2p, b, Mfn::new(10), P2mType::RamRw).unwrap();
        assert!(p2m.gpfn_to_mfn(a).is_invalid());
        assert_eq!(p2m.mfn_to_gpfn(&m2p, Mfn::new(10)), b);
        // New frame at an old place: the old frame loses its inverse.
        let old = p2m.add_to_physmap(&m2p, b, Mfn::new(11), P2mType::RamRw).unwrap();
        assert_eq!(old, Some(Mfn::new(10)));
        assert!(m2p.lookup(Mfn::new(10)).is_none());
    }

    #[test]
    fn other_domains_do_not_resolve() {
        let (m2p, p2m) = p2m(false);
        let other = P2mTable::new(DomainId::new(2), false, PhysmapLayout::default());
        other.add_to_physmap(&m2p, Gpfn::new(1), Mfn::new(20), P2mType::RamRw).unwrap();
        assert!(p2m.mfn_to_gpfn(&m2p, Mfn::new(20)).is_invalid());
        assert!(p2m.add_to_physmap(&m2p, Gpfn::new(0x5000), Mfn::new(1), P2mType::RamRw).is_err());
        assert!(p2m.add_to_physmap(&m2p, Gpfn::new(1), Mfn::new(1), P2mType::Grant).is_err());
    }

    #[test]
    fn computed_windows() {
        let (_, p2m) = p2m(true);
        let l = *p2m.layout();
        p2m.set_grant_frames(alloc::vec![Mfn::new(7), Mfn::new(8)]);
        assert_eq!(p2m.lookup(Gpfn::new(l.grant_base + 1)), (Mfn::new(8), P2mType::Grant));
        assert!(p2m.gpfn_to_mfn(Gpfn::new(l.grant_base + 2)).is_invalid());

        let io = Gpfn::new(l.mmio_base + 5);
        p2m.set_mmio_entry(io, Mfn::new(0xfee00)).unwrap();
        assert_eq!(p2m.lookup(io), (Mfn::new(0xfee00), P2mType::MmioDirect));
        p2m.clear_mmio_entry(io).unwrap();
        assert!(p2m.gpfn_to_mfn(io).is_invalid());

        let pt = Gpfn::new(l.passthrough_base + 0x42);
        assert_eq!(p2m.gpfn_to_mfn(pt), Mfn::new(0x42));
        let (_, unprivileged) = self::p2m(false);
        assert!(unprivileged.gpfn_to_mfn(pt).is_invalid());
    }

    #[test]
    fn concurrent_readers_never_see_wrong_frames() {
        let m2p = alloc::sync::Arc::new(M2pTable::new(64));
        let p2m = alloc::sync::Arc::new(P2mTable::new(
            DomainId::new(1),
            false,
            PhysmapLayout::default(),
        ));
        let gpfn = Gpfn::new(9);
        let writer = {
            let (m2p, p2m) = (m2p.clone(), p2m.clone());
            std::thread::spawn(move || {
                for i in 0..2000u64 {
                    let mfn = Mfn::new(1 + i % 2);
                    p2m.add_to_physmap(&m2p, gpfn, mfn, P2mType::RamRw).unwrap();
                    p2m.remove_from_physmap(&m2p, gpfn).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            for mfn in [Mfn::new(1), Mfn::new(2)] {
                let back = p2m.mfn_to_gpfn(&m2p, mfn);
                assert!(back.is_invalid() || back == gpfn);
            }
            let fwd = p2m.gpfn_to_mfn(gpfn);
            assert!(fwd.is_invalid() || fwd == Mfn::new(1) || fwd == Mfn::new(2));
        }
        writer.join().unwrap();
    }
}
