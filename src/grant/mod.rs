//! Grant tables.
//!
//! A domain's grant table is an array of 8-byte entries living in
//! hypervisor-owned frames that are also visible to the guest through its
//! grant window. Each entry is a 32-bit header (flags in the low half, the
//! authorized domain in the high half) followed by a 32-bit frame field.
//!
//! This module holds the issuing side, run by the granting guest: a
//! lock-free free list of references, the offer/end protocol on entries and
//! free callbacks. The mapping side run by the hypervisor is in [`hyp`].

mod hyp;

pub use hyp::{GntMapFlags, GrantHandle, GrantMapping};

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

use axerrno::{AxResult, ax_err, ax_err_type};
use bitflags::bitflags;
use spin::Mutex;

use axpv_types::{DomainId, Gpfn, GrantRef, Mfn};

use crate::config::PvConfig;
use crate::mm::frame::FrameTable;

use hyp::{ActiveGrant, MaptrackEntry};

/// Grant entries per table frame.
pub const ENTRIES_PER_FRAME: u32 = 512;
/// References kept off the free list for well-known uses.
pub const NR_RESERVED_ENTRIES: u32 = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrantFlags: u16 {
        const PERMIT_ACCESS = 1;
        const ACCEPT_TRANSFER = 2;
        const READONLY = 1 << 2;
        const READING = 1 << 3;
        const WRITING = 1 << 4;
        const TRANSFER_COMMITTED = 1 << 5;
        const TRANSFER_COMPLETED = 1 << 6;
    }
}

impl GrantFlags {
    pub const TYPE_MASK: Self = Self::PERMIT_ACCESS.union(Self::ACCEPT_TRANSFER);
    pub const IN_USE: Self = Self::READING.union(Self::WRITING);
}

fn header(flags: GrantFlags, domid: DomainId) -> u32 {
    flags.bits() as u32 | ((domid.raw() as u32) << 16)
}

fn header_flags(h: u32) -> GrantFlags {
    GrantFlags::from_bits_retain(h as u16)
}

fn header_domid(h: u32) -> DomainId {
    DomainId::new((h >> 16) as u16)
}

/// Notification run when enough grant references become free.
pub struct GrantFreeCallback {
    count: u32,
    queued: AtomicBool,
    func: Box<dyn Fn() + Send + Sync>,
}

impl GrantFreeCallback {
    pub fn new(count: u32, func: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            count,
            queued: AtomicBool::new(false),
            func: Box::new(func),
        })
    }
}

/// References taken off the free list in one batch, for private use.
#[derive(Debug)]
pub struct GrantRefChain {
    head: u32,
    len: u32,
}

impl GrantRefChain {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct GrantTable {
    owner: DomainId,
    frames: Arc<FrameTable>,
    table_frames: Vec<Mfn>,
    nr_entries: u32,
    end_retries: usize,
    map_retries: usize,
    next: Box<[AtomicU32]>,
    /// Set while the entry sits on the free list.
    on_free: Box<[AtomicBool]>,
    /// Generation tag in the high half, top index in the low half.
    free_head: AtomicU64,
    free_count: AtomicU32,
    callbacks: Mutex<VecDeque<Arc<GrantFreeCallback>>>,
    active: Mutex<Vec<ActiveGrant>>,
    maptrack: Mutex<Vec<Option<MaptrackEntry>>>,
}

impl GrantTable {
    pub fn new(owner: DomainId, frames: Arc<FrameTable>, machine: &PvConfig) -> AxResult<Self> {
        let mut table_frames = Vec::with_capacity(machine.grant_frames);
        for _ in 0..machine.grant_frames {
            match frames.alloc_xen_page(None) {
                Ok(mfn) => table_frames.push(mfn),
                Err(e) => {
                    for mfn in table_frames {
                        frames.free_xen_page(mfn);
                    }
                    return Err(e);
                }
            }
        }
        let nr_entries = machine.grant_frames as u32 * ENTRIES_PER_FRAME;
        // Reserved entries never reach the list; the rest chain upwards.
        let next: Box<[AtomicU32]> = (0..nr_entries)
            .map(|i| AtomicU32::new(i + 1))
            .collect::<Vec<_>>()
            .into();
        let on_free: Box<[AtomicBool]> = (0..nr_entries)
            .map(|i| AtomicBool::new(i >= NR_RESERVED_ENTRIES))
            .collect::<Vec<_>>()
            .into();
        let free = nr_entries.saturating_sub(NR_RESERVED_ENTRIES);
        let head = if free == 0 { nr_entries } else { NR_RESERVED_ENTRIES };
        Ok(Self {
            owner,
            frames,
            table_frames,
            nr_entries,
            end_retries: machine.grant_end_retries,
            map_retries: machine.grant_map_retries,
            next,
            on_free,
            free_head: AtomicU64::new(head as u64),
            free_count: AtomicU32::new(free),
            callbacks: Mutex::new(VecDeque::new()),
            active: Mutex::new((0..nr_entries).map(|_| ActiveGrant::default()).collect()),
            maptrack: Mutex::new(Vec::new()),
        })
    }

    /// Hypervisor frames holding the shared entries.
    pub fn frames(&self) -> &[Mfn] {
        &self.table_frames
    }

    pub fn nr_entries(&self) -> u32 {
        self.nr_entries
    }

    pub fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::Acquire)
    }

    fn slot(&self, gref: GrantRef) -> AxResult<(Mfn, usize)> {
        if gref.index() >= self.nr_entries as usize {
            return ax_err!(
                InvalidInput,
                format!("{}: bad grant reference {}", self.owner, gref)
            );
        }
        let frame = self.table_frames[gref.index() / ENTRIES_PER_FRAME as usize];
        Ok((frame, (gref.index() % ENTRIES_PER_FRAME as usize) * 2))
    }

    fn load_header(&self, gref: GrantRef) -> AxResult<u32> {
        let (mfn, idx) = self.slot(gref)?;
        Ok(self.frames.read_u32(mfn, idx))
    }

    fn store_header(&self, gref: GrantRef, h: u32) -> AxResult {
        let (mfn, idx) = self.slot(gref)?;
        self.frames.write_u32(mfn, idx, h);
        Ok(())
    }

    fn cas_header(&self, gref: GrantRef, old: u32, new: u32) -> AxResult<Result<u32, u32>> {
        let (mfn, idx) = self.slot(gref)?;
        Ok(self.frames.cmpxchg_u32(mfn, idx, old, new))
    }

    fn load_frame(&self, gref: GrantRef) -> AxResult<u32> {
        let (mfn, idx) = self.slot(gref)?;
        Ok(self.frames.read_u32(mfn, idx + 1))
    }

    fn store_frame(&self, gref: GrantRef, frame: u32) -> AxResult {
        let (mfn, idx) = self.slot(gref)?;
        self.frames.write_u32(mfn, idx + 1, frame);
        Ok(())
    }

    /// Raw entry contents: flags, authorized domain and frame field.
    pub fn entry(&self, gref: GrantRef) -> AxResult<(GrantFlags, DomainId, u32)> {
        let h = self.load_header(gref)?;
        Ok((header_flags(h), header_domid(h), self.load_frame(gref)?))
    }

    fn get_free_entry(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let idx = head as u32;
            if idx == self.nr_entries {
                return None;
            }
            let next = self.next[idx as usize].load(Ordering::Acquire);
            let tag = (head >> 32).wrapping_add(1);
            match self.free_head.compare_exchange_weak(
                head,
                (tag << 32) | next as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.on_free[idx as usize].store(false, Ordering::Release);
                    self.free_count.fetch_sub(1, Ordering::AcqRel);
                    return Some(idx);
                }
                Err(cur) => {
                    trace!("grant free list pop raced");
                    head = cur;
                }
            }
        }
    }

    fn push_free(&self, idx: u32) {
        // Counted before it is poppable so the count never underflows.
        self.free_count.fetch_add(1, Ordering::AcqRel);
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            self.next[idx as usize].store(head as u32, Ordering::Release);
            let tag = (head >> 32).wrapping_add(1);
            match self.free_head.compare_exchange_weak(
                head,
                (tag << 32) | idx as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
    }

    fn is_free(&self, gref: GrantRef) -> bool {
        self.on_free
            .get(gref.index())
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    fn put_free_entry(&self, gref: GrantRef) -> AxResult {
        match self.load_header(gref) {
            Ok(h) if h & 0xffff == 0 => {}
            Ok(h) => bug!(
                "{}: {} returned to the free list with flags {:?}",
                self.owner,
                gref,
                header_flags(h)
            ),
            Err(_) => bug!("{}: freeing out-of-range {}", self.owner, gref),
        }
        if self.on_free[gref.index()].swap(true, Ordering::AcqRel) {
            warn!("{}: {} freed twice", self.owner, gref);
            return ax_err!(InvalidInput, format!("{} is already free", gref));
        }
        self.push_free(gref.index() as u32);
        self.run_free_callbacks();
        Ok(())
    }

    fn run_free_callbacks(&self) {
        let ready: Vec<_> = {
            let mut queue = self.callbacks.lock();
            let free = self.free_count();
            let mut ready = Vec::new();
            queue.retain(|cb| {
                if cb.count <= free {
                    cb.queued.store(false, Ordering::Release);
                    ready.push(cb.clone());
                    false
                } else {
                    true
                }
            });
            ready
        };
        for cb in ready {
            (cb.func)();
        }
    }

    /// Offers `gpfn` to `remote`.
    pub fn grant_foreign_access(
        &self,
        remote: DomainId,
        gpfn: Gpfn,
        readonly: bool,
    ) -> AxResult<GrantRef> {
        let Some(idx) = self.get_free_entry() else {
            warn!("{}: grant table full", self.owner);
            return ax_err!(StorageFull, "no free grant entries");
        };
        let gref = GrantRef::new(idx);
        self.grant_foreign_access_ref(gref, remote, gpfn, readonly)?;
        Ok(gref)
    }

    /// Offers `gpfn` to `remote` through a reference the caller already owns.
    pub fn grant_foreign_access_ref(
        &self,
        gref: GrantRef,
        remote: DomainId,
        gpfn: Gpfn,
        readonly: bool,
    ) -> AxResult {
        let frame = u32::try_from(gpfn.raw())
            .map_err(|_| ax_err_type!(InvalidInput, format!("{} does not fit an entry", gpfn)))?;
        self.store_frame(gref, frame)?;
        // The remote side trusts the frame once it sees the flags.
        fence(Ordering::Release);
        let mut flags = GrantFlags::PERMIT_ACCESS;
        if readonly {
            flags |= GrantFlags::READONLY;
        }
        self.store_header(gref, header(flags, remote))?;
        debug!("{}: {} offered to {} ({:?})", self.owner, gref, remote, flags);
        Ok(())
    }

    /// In-progress access bits of an entry.
    pub fn query_foreign_access(&self, gref: GrantRef) -> AxResult<GrantFlags> {
        Ok(header_flags(self.load_header(gref)?) & GrantFlags::IN_USE)
    }

    /// Revokes an offer without freeing the reference.
    ///
    /// Polls while the remote side still has the frame mapped and gives up
    /// after the configured number of attempts.
    pub fn end_foreign_access_ref(&self, gref: GrantRef, readonly: bool) -> AxResult {
        let mut h = self.load_header(gref)?;
        for _ in 0..self.end_retries.max(1) {
            if header_flags(h).intersects(GrantFlags::IN_USE) {
                core::hint::spin_loop();
                h = self.load_header(gref)?;
                continue;
            }
            match self.cas_header(gref, h, 0)? {
                Ok(_) => {
                    trace!("{}: {} ended (readonly {})", self.owner, gref, readonly);
                    return Ok(());
                }
                Err(cur) => h = cur,
            }
        }
        warn!("{}: {} still in use, not reclaimed", self.owner, gref);
        ax_err!(ResourceBusy, format!("{} still in use", gref))
    }

    /// Revokes an offer and returns the reference to the free list.
    pub fn end_foreign_access(&self, gref: GrantRef, readonly: bool) -> AxResult {
        if self.is_free(gref) {
            return ax_err!(InvalidInput, format!("{} is not allocated", gref));
        }
        self.end_foreign_access_ref(gref, readonly)?;
        self.put_free_entry(gref)
    }

    /// Declares willingness to receive a frame from `remote`.
    pub fn grant_foreign_transfer(&self, remote: DomainId) -> AxResult<GrantRef> {
        let Some(idx) = self.get_free_entry() else {
            warn!("{}: grant table full", self.owner);
            return ax_err!(StorageFull, "no free grant entries");
        };
        let gref = GrantRef::new(idx);
        self.grant_foreign_transfer_ref(gref, remote)?;
        Ok(gref)
    }

    pub fn grant_foreign_transfer_ref(&self, gref: GrantRef, remote: DomainId) -> AxResult {
        self.store_frame(gref, 0)?;
        fence(Ordering::Release);
        self.store_header(gref, header(GrantFlags::ACCEPT_TRANSFER, remote))
    }

    /// Ends a transfer offer without freeing the reference.
    ///
    /// An offer nobody committed to is withdrawn and `None` returned.
    /// Once committed, the transfer cannot be abandoned: the giver no longer
    /// has the frame. The caller spins until the frame number appears. This
    /// may run where sleeping is impossible, so it never blocks.
    pub fn end_foreign_transfer_ref(&self, gref: GrantRef) -> AxResult<Option<Mfn>> {
        let mut h = self.load_header(gref)?;
        loop {
            let flags = header_flags(h);
            if flags.contains(GrantFlags::TRANSFER_COMMITTED) {
                break;
            }
            if !flags.contains(GrantFlags::ACCEPT_TRANSFER) {
                return ax_err!(InvalidInput, format!("{} is not a transfer offer", gref));
            }
            match self.cas_header(gref, h, 0)? {
                Ok(_) => return Ok(None),
                Err(cur) => h = cur,
            }
        }
        let frame = loop {
            let frame = self.load_frame(gref)?;
            if frame != 0 {
                break frame;
            }
            core::hint::spin_loop();
        };
        fence(Ordering::Acquire);
        self.store_header(gref, 0)?;
        debug!("{}: {} received {}", self.owner, gref, Mfn::new(frame as u64));
        Ok(Some(Mfn::new(frame as u64)))
    }

    pub fn end_foreign_transfer(&self, gref: GrantRef) -> AxResult<Option<Mfn>> {
        if self.is_free(gref) {
            return ax_err!(InvalidInput, format!("{} is not allocated", gref));
        }
        let frame = self.end_foreign_transfer_ref(gref)?;
        self.put_free_entry(gref)?;
        Ok(frame)
    }

    /// Frees a reference the caller owns but is not offering.
    pub fn free_grant_reference(&self, gref: GrantRef) -> AxResult {
        let h = self.load_header(gref)?;
        if h & 0xffff != 0 {
            return ax_err!(ResourceBusy, format!("{} is still offered", gref));
        }
        self.put_free_entry(gref)
    }

    /// Takes `count` references at once, all or nothing.
    pub fn alloc_grant_references(&self, count: u32) -> AxResult<GrantRefChain> {
        let mut chain = GrantRefChain {
            head: self.nr_entries,
            len: 0,
        };
        for _ in 0..count {
            let Some(idx) = self.get_free_entry() else {
                self.free_grant_references(chain);
                return ax_err!(StorageFull, format!("fewer than {} free grant entries", count));
            };
            self.next[idx as usize].store(chain.head, Ordering::Relaxed);
            chain.head = idx;
            chain.len += 1;
        }
        Ok(chain)
    }

    pub fn claim_grant_reference(&self, chain: &mut GrantRefChain) -> AxResult<GrantRef> {
        if chain.head == self.nr_entries {
            return ax_err!(StorageFull, "private grant chain exhausted");
        }
        let idx = chain.head;
        chain.head = self.next[idx as usize].load(Ordering::Relaxed);
        chain.len -= 1;
        Ok(GrantRef::new(idx))
    }

    pub fn release_grant_reference(&self, chain: &mut GrantRefChain, gref: GrantRef) {
        self.next[gref.index()].store(chain.head, Ordering::Relaxed);
        chain.head = gref.index() as u32;
        chain.len += 1;
    }

    pub fn free_grant_references(&self, mut chain: GrantRefChain) {
        while chain.head != self.nr_entries {
            let idx = chain.head;
            chain.head = self.next[idx as usize].load(Ordering::Relaxed);
            if let Err(e) = self.put_free_entry(GrantRef::new(idx)) {
                warn!("{}: chain release of {} refused: {:?}", self.owner, idx, e);
            }
        }
    }

    /// Queues `cb` to run once `cb`'s count of references are free. A
    /// callback already queued stays queued once.
    pub fn request_free_callback(&self, cb: &Arc<GrantFreeCallback>) {
        {
            let mut queue = self.callbacks.lock();
            if cb.queued.swap(true, Ordering::AcqRel) {
                return;
            }
            queue.push_back(cb.clone());
        }
        self.run_free_callbacks();
    }

    /// Removes `cb` if it has not run yet. Returns whether it was queued.
    pub fn cancel_free_callback(&self, cb: &Arc<GrantFreeCallback>) -> bool {
        let mut queue = self.callbacks.lock();
        let before = queue.len();
        queue.retain(|q| !Arc::ptr_eq(q, cb));
        cb.queued.store(false, Ordering::Release);
        queue.len() != before
    }

    /// Logs every entry in use.
    pub fn dump(&self) {
        debug!(
            "{}: grant table, {} entries, {} free",
            self.owner,
            self.nr_entries,
            self.free_count()
        );
        let active = self.active.lock();
        for i in 0..self.nr_entries {
            let gref = GrantRef::new(i);
            let Ok((flags, domid, frame)) = self.entry(gref) else {
                continue;
            };
            if flags.is_empty() {
                continue;
            }
            let act = &active[i as usize];
            debug!(
                "  [{:4}] {:?} -> {} frame {:#x} pins r{} w{}",
                i, flags, domid, frame, act.pin_ro, act.pin_rw
            );
        }
    }
}

impl Drop for GrantTable {
    fn drop(&mut self) {
        for &mfn in &self.table_frames {
            self.frames.free_xen_page(mfn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn table(grant_frames: usize) -> (Arc<FrameTable>, GrantTable) {
        let machine = PvConfig {
            machine_frames: 64,
            grant_frames,
            grant_end_retries: 16,
            ..Default::default()
        };
        let frames = Arc::new(FrameTable::new(64, 2));
        let gt = GrantTable::new(DomainId::new(1), frames.clone(), &machine).unwrap();
        (frames, gt)
    }

    #[test]
    fn offer_end_reuse() {
        let (_, gt) = table(1);
        let remote = DomainId::new(2);
        let r = gt.grant_foreign_access(remote, Gpfn::new(0x42), true).unwrap();
        assert_eq!(gt.query_foreign_access(r).unwrap(), GrantFlags::empty());
        let (flags, domid, frame) = gt.entry(r).unwrap();
        assert_eq!(flags, GrantFlags::PERMIT_ACCESS | GrantFlags::READONLY);
        assert_eq!(domid, remote);
        assert_eq!(frame, 0x42);
        gt.end_foreign_access(r, true).unwrap();
        assert_eq!(gt.grant_foreign_access(remote, Gpfn::new(1), false).unwrap(), r);
    }

    #[test]
    fn freeing_a_free_reference_is_refused() {
        let (_, gt) = table(1);
        let r = gt.grant_foreign_access(DomainId::new(2), Gpfn::new(7), false).unwrap();
        gt.end_foreign_access(r, false).unwrap();
        let free = gt.free_count();
        assert_eq!(gt.end_foreign_access(r, false), Err(axerrno::AxError::InvalidInput));
        assert_eq!(gt.free_grant_reference(r), Err(axerrno::AxError::InvalidInput));
        assert_eq!(gt.end_foreign_transfer(r), Err(axerrno::AxError::InvalidInput));
        assert_eq!(gt.free_count(), free);

        let a = gt.grant_foreign_access(DomainId::new(2), Gpfn::new(8), false).unwrap();
        let b = gt.grant_foreign_access(DomainId::new(3), Gpfn::new(9), false).unwrap();
        assert_ne!(a, b);
        assert_eq!(gt.entry(a).unwrap().1, DomainId::new(2));
        assert_eq!(gt.entry(b).unwrap().1, DomainId::new(3));
        assert_eq!(gt.free_count(), free - 2);
    }

    #[test]
    fn in_use_entry_is_not_reclaimed() {
        let (_, gt) = table(1);
        let r = gt.grant_foreign_access(DomainId::new(2), Gpfn::new(5), false).unwrap();
        let h = gt.load_header(r).unwrap();
        gt.store_header(r, h | GrantFlags::READING.bits() as u32).unwrap();
        let free = gt.free_count();
        assert_eq!(gt.end_foreign_access(r, false), Err(axerrno::AxError::ResourceBusy));
        assert_eq!(gt.free_count(), free);
        assert_eq!(gt.query_foreign_access(r).unwrap(), GrantFlags::READING);
        assert!(gt.free_grant_reference(r).is_err());
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let (_, gt) = table(1);
        let usable = ENTRIES_PER_FRAME - NR_RESERVED_ENTRIES;
        let chain = gt.alloc_grant_references(usable).unwrap();
        assert_eq!(chain.len(), usable as usize);
        assert_eq!(
            gt.grant_foreign_access(DomainId::new(2), Gpfn::new(1), true),
            Err(axerrno::AxError::StorageFull)
        );
        assert!(gt.alloc_grant_references(1).is_err());
        gt.free_grant_references(chain);
        assert_eq!(gt.free_count(), usable);
    }

    #[test]
    fn private_chain_claim_release() {
        let (_, gt) = table(1);
        let mut chain = gt.alloc_grant_references(3).unwrap();
        let a = gt.claim_grant_reference(&mut chain).unwrap();
        let b = gt.claim_grant_reference(&mut chain).unwrap();
        assert_ne!(a, b);
        gt.release_grant_reference(&mut chain, a);
        assert_eq!(chain.len(), 2);
        assert_eq!(gt.claim_grant_reference(&mut chain).unwrap(), a);
        let _ = gt.claim_grant_reference(&mut chain).unwrap();
        assert!(gt.claim_grant_reference(&mut chain).is_err());
    }

    #[test]
    fn unclaimed_transfer_offer_is_withdrawn() {
        let (_, gt) = table(1);
        let r = gt.grant_foreign_transfer(DomainId::new(3)).unwrap();
        assert_eq!(gt.entry(r).unwrap().0, GrantFlags::ACCEPT_TRANSFER);
        assert_eq!(gt.end_foreign_transfer(r).unwrap(), None);
        assert!(gt.entry(r).unwrap().0.is_empty());
    }

    #[test]
    fn free_callbacks_are_one_shot() {
        let (_, gt) = table(1);
        let usable = ENTRIES_PER_FRAME - NR_RESERVED_ENTRIES;
        let chain = gt.alloc_grant_references(usable).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let cb = {
            let hits = hits.clone();
            GrantFreeCallback::new(2, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        gt.request_free_callback(&cb);
        gt.request_free_callback(&cb);
        let mut chain = chain;
        let a = gt.claim_grant_reference(&mut chain).unwrap();
        let b = gt.claim_grant_reference(&mut chain).unwrap();
        gt.free_grant_reference(a).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        gt.free_grant_reference(b).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        gt.free_grant_references(chain);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let cb2 = GrantFreeCallback::new(u32::MAX, || {});
        gt.request_free_callback(&cb2);
        assert!(gt.cancel_free_callback(&cb2));
        assert!(!gt.cancel_free_callback(&cb2));
    }

    #[test]
    fn concurrent_pop_push_keeps_every_reference() {
        let (_, gt) = table(2);
        let gt = Arc::new(gt);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let gt = gt.clone();
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let r = gt
                            .grant_foreign_access(DomainId::new(2), Gpfn::new(t * 1000 + i), true)
                            .unwrap();
                        assert_eq!(gt.entry(r).unwrap().2 as u64, t * 1000 + i);
                        gt.end_foreign_access(r, true).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let usable = 2 * ENTRIES_PER_FRAME - NR_RESERVED_ENTRIES;
        assert_eq!(gt.free_count(), usable);
        let chain = gt.alloc_grant_references(usable).unwrap();
        let mut chain = chain;
        let mut seen = std::collections::BTreeSet::new();
        while let Ok(r) = gt.claim_grant_reference(&mut chain) {
            assert!(seen.insert(r.index()));
        }
        assert_eq!(seen.len(), usable as usize);
    }

    #[test]
    fn table_frames_are_returned_on_drop() {
        let (frames, gt) = table(2);
        let owned = gt.frames().to_vec();
        assert!(owned.iter().all(|&m| !frames.heap().is_free(m)));
        drop(gt);
        assert!(owned.iter().all(|&m| frames.heap().is_free(m)));
    }
}
