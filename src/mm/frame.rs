//! Frame ownership table.
//!
//! One [`FrameDescriptor`] per machine frame records who owns the frame, in
//! what role it is currently used, and how many holders it has. Both the
//! general and the type information live in single packed words which are
//! only ever updated by compare-and-swap loops.
//!
//! `count_info` layout:
//!
//! | bits   | meaning                         |
//! |--------|---------------------------------|
//! | 0..32  | general reference count         |
//! | 32..48 | owner domain id                 |
//! | 62     | frame belongs to the hypervisor |
//! | 63     | frame is allocated              |
//!
//! `type_info` layout:
//!
//! | bits   | meaning                          |
//! |--------|----------------------------------|
//! | 0..16  | type reference count             |
//! | 16..27 | linear back pointer              |
//! | 27     | pinned                           |
//! | 28     | validated                        |
//! | 29..32 | type                             |

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering, fence};

use axerrno::{AxResult, ax_err, ax_err_type};
use bit_field::BitField;
use numeric_enum_macro::numeric_enum;

use axpv_types::{DomainId, Mfn};

use super::heap::FrameHeap;
use super::tlb::{CpuMask, TlbClock};
use crate::paging::{FOUR_LEVEL, Pte, PteFlags};

/// 64-bit words per frame.
pub const PAGE_WORDS: usize = 512;
pub const PAGE_BYTES: usize = PAGE_WORDS * 8;

const COUNT_BITS: core::ops::Range<usize> = 0..32;
const OWNER_BITS: core::ops::Range<usize> = 32..48;
const PGC_XEN_HEAP: usize = 62;
const PGC_ALLOCATED: usize = 63;
const GENERAL_COUNT_MAX: u64 = u32::MAX as u64;

const TYPE_COUNT_MASK: u64 = 0xffff;
const VA_BITS: core::ops::Range<usize> = 16..27;
const PGT_PINNED: usize = 27;
const PGT_VALIDATED: usize = 28;
const TYPE_BITS: core::ops::Range<usize> = 29..32;

/// Back pointer value meaning "may be updated by the next typed use".
pub const VA_MUTABLE: u16 = 0x7ff;
/// Back pointer value meaning "mapped at several places".
pub const VA_UNKNOWN: u16 = 0x7fe;

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum PageType {
        None = 0,
        L1 = 1,
        L2 = 2,
        L3 = 3,
        L4 = 4,
        Writable = 7,
    }
}

impl PageType {
    pub fn is_table(self) -> bool {
        matches!(self, PageType::L1 | PageType::L2 | PageType::L3 | PageType::L4)
    }

    /// Table type of page-table level `level` (1..=4).
    pub fn table(level: usize) -> Option<Self> {
        match level {
            1 => Some(PageType::L1),
            2 => Some(PageType::L2),
            3 => Some(PageType::L3),
            4 => Some(PageType::L4),
            _ => None,
        }
    }

    pub fn level(self) -> usize {
        match self {
            PageType::L1 => 1,
            PageType::L2 => 2,
            PageType::L3 => 3,
            PageType::L4 => 4,
            _ => 0,
        }
    }
}

/// What the type system needs to know about the domain owning a frame.
pub trait FrameOwner {
    fn owner_id(&self) -> DomainId;
    /// CPUs that may hold translations into this domain's memory.
    fn dirty_cpus(&self) -> CpuMask;
    fn is_dying(&self) -> bool;
    /// Page-table contents are checked when a frame gains a table type.
    /// Shadowed domains answer `false`: the shadow engine does its own
    /// translation.
    fn validates_tables(&self) -> bool;
}

#[derive(Default)]
pub struct FrameDescriptor {
    count_info: AtomicU64,
    type_info: AtomicU64,
    tlbflush_timestamp: AtomicU64,
}

/// Decoded view of a descriptor, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub owner: Option<DomainId>,
    pub allocated: bool,
    pub xen_heap: bool,
    pub general_count: u32,
    pub ty: PageType,
    pub type_count: u16,
    pub validated: bool,
    pub pinned: bool,
    pub backptr: u16,
    pub tlbflush_timestamp: u64,
}

fn owner_of(count_info: u64) -> Option<DomainId> {
    let raw = count_info.get_bits(OWNER_BITS) as u16;
    let id = DomainId::new(raw);
    if id == DomainId::INVALID { None } else { Some(id) }
}

fn with_owner(count_info: u64, owner: Option<DomainId>) -> u64 {
    let mut word = count_info;
    let raw = owner.unwrap_or(DomainId::INVALID).raw();
    word.set_bits(OWNER_BITS, raw as u64);
    word
}

fn type_of(mfn: Mfn, type_info: u64) -> PageType {
    match PageType::try_from(type_info.get_bits(TYPE_BITS) as u8) {
        Ok(ty) => ty,
        Err(raw) => bug!("{}: type word {:#x} holds illegal type {}", mfn, type_info, raw),
    }
}

fn set_type(type_info: &mut u64, ty: PageType) {
    type_info.set_bits(TYPE_BITS, ty as u64);
}

fn backptr_of(type_info: u64) -> u16 {
    type_info.get_bits(VA_BITS) as u16
}

fn set_backptr(type_info: &mut u64, va: u16) {
    type_info.set_bits(VA_BITS, (va & VA_MUTABLE) as u64);
}

/// Machine memory: descriptors, page contents, the free pool and the flush
/// clock.
pub struct FrameTable {
    descs: Box<[FrameDescriptor]>,
    memory: Box<[AtomicU64]>,
    heap: FrameHeap,
    tlb: TlbClock,
}

impl FrameTable {
    pub fn new(nr_frames: usize, cpus: usize) -> Self {
        info!("frame table: {} frames, {} cpus", nr_frames, cpus);
        Self {
            descs: (0..nr_frames)
                .map(|_| FrameDescriptor::default())
                .collect::<Vec<_>>()
                .into(),
            memory: (0..nr_frames * PAGE_WORDS)
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>()
                .into(),
            heap: FrameHeap::new(nr_frames),
            tlb: TlbClock::new(cpus),
        }
    }

    pub fn nr_frames(&self) -> usize {
        self.descs.len()
    }

    pub fn contains(&self, mfn: Mfn) -> bool {
        !mfn.is_invalid() && mfn.index() < self.descs.len()
    }

    pub fn heap(&self) -> &FrameHeap {
        &self.heap
    }

    pub fn tlb(&self) -> &TlbClock {
        &self.tlb
    }

    fn desc(&self, mfn: Mfn) -> &FrameDescriptor {
        match self.descs.get(mfn.index()) {
            Some(desc) => desc,
            None => bug!("{} outside the frame table", mfn),
        }
    }

    fn word(&self, mfn: Mfn, idx: usize) -> &AtomicU64 {
        if idx >= PAGE_WORDS {
            bug!("word {} outside frame {}", idx, mfn);
        }
        &self.memory[mfn.index() * PAGE_WORDS + idx]
    }

    // Page contents.

    pub fn read_word(&self, mfn: Mfn, idx: usize) -> u64 {
        self.word(mfn, idx).load(Ordering::Acquire)
    }

    pub fn write_word(&self, mfn: Mfn, idx: usize, val: u64) {
        self.word(mfn, idx).store(val, Ordering::Release)
    }

    pub fn cmpxchg_word(&self, mfn: Mfn, idx: usize, old: u64, new: u64) -> Result<u64, u64> {
        self.word(mfn, idx)
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Reads the `idx`th 32-bit half-word of a frame.
    pub fn read_u32(&self, mfn: Mfn, idx: usize) -> u32 {
        let word = self.read_word(mfn, idx / 2);
        (word >> ((idx % 2) * 32)) as u32
    }

    pub fn write_u32(&self, mfn: Mfn, idx: usize, val: u32) {
        let shift = (idx % 2) * 32;
        let mask = 0xffff_ffffu64 << shift;
        let _ = self
            .word(mfn, idx / 2)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word & !mask) | ((val as u64) << shift))
            });
    }

    pub fn cmpxchg_u32(&self, mfn: Mfn, idx: usize, old: u32, new: u32) -> Result<u32, u32> {
        let shift = (idx % 2) * 32;
        let mask = 0xffff_ffffu64 << shift;
        let cell = self.word(mfn, idx / 2);
        let mut word = cell.load(Ordering::Acquire);
        loop {
            let cur = (word >> shift) as u32;
            if cur != old {
                return Err(cur);
            }
            let next = (word & !mask) | ((new as u64) << shift);
            match cell.compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(old),
                Err(w) => word = w,
            }
        }
    }

    pub fn read_bytes(&self, mfn: Mfn, offset: usize, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let pos = offset + i;
            let word = self.read_word(mfn, pos / 8);
            *byte = (word >> ((pos % 8) * 8)) as u8;
        }
    }

    pub fn write_bytes(&self, mfn: Mfn, offset: usize, buf: &[u8]) {
        for (i, &byte) in buf.iter().enumerate() {
            let pos = offset + i;
            let shift = (pos % 8) * 8;
            let _ = self
                .word(mfn, pos / 8)
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                    Some((word & !(0xff << shift)) | ((byte as u64) << shift))
                });
        }
    }

    pub fn clear_page(&self, mfn: Mfn) {
        for idx in 0..PAGE_WORDS {
            self.write_word(mfn, idx, 0);
        }
    }

    pub fn copy_page(&self, dst: Mfn, src: Mfn) {
        for idx in 0..PAGE_WORDS {
            self.write_word(dst, idx, self.read_word(src, idx));
        }
    }

    // Descriptors.

    pub fn info(&self, mfn: Mfn) -> FrameInfo {
        let desc = self.desc(mfn);
        let c = desc.count_info.load(Ordering::Acquire);
        let t = desc.type_info.load(Ordering::Acquire);
        FrameInfo {
            owner: owner_of(c),
            allocated: c.get_bit(PGC_ALLOCATED),
            xen_heap: c.get_bit(PGC_XEN_HEAP),
            general_count: c.get_bits(COUNT_BITS) as u32,
            ty: type_of(mfn, t),
            type_count: (t & TYPE_COUNT_MASK) as u16,
            validated: t.get_bit(PGT_VALIDATED),
            pinned: t.get_bit(PGT_PINNED),
            backptr: backptr_of(t),
            tlbflush_timestamp: desc.tlbflush_timestamp.load(Ordering::Acquire),
        }
    }

    /// Owner of an allocated frame.
    pub fn owner(&self, mfn: Mfn) -> Option<DomainId> {
        if !self.contains(mfn) {
            return None;
        }
        let c = self.desc(mfn).count_info.load(Ordering::Acquire);
        if c.get_bit(PGC_ALLOCATED) { owner_of(c) } else { None }
    }

    /// Flushes CPUs which may still cache translations to a frame about to be
    /// reused.
    fn flush_for_reuse(&self, mfn: Mfn, mask: CpuMask) {
        let stamp = self.desc(mfn).tlbflush_timestamp.load(Ordering::Acquire);
        if stamp != 0 {
            self.tlb.flush_stale(mask, stamp);
        }
    }

    fn all_cpus(&self) -> CpuMask {
        let cpus = self.tlb.cpus();
        CpuMask::from_bits(if cpus >= 64 { u64::MAX } else { (1u64 << cpus) - 1 })
    }

    /// Allocates `1 << order` frames to `owner`.
    ///
    /// The frames come back allocated, untyped, with no references.
    pub fn alloc_domain_pages(
        &self,
        owner: DomainId,
        order: u32,
        address_bits: Option<u32>,
    ) -> AxResult<Mfn> {
        let base = self.heap.alloc(order, address_bits).ok_or_else(|| {
            ax_err_type!(NoMemory, format!("no order-{} extent for {}", order, owner))
        })?;
        let all = self.all_cpus();
        for i in 0..(1u64 << order) {
            let mfn = base.add(i);
            self.flush_for_reuse(mfn, all);
            let desc = self.desc(mfn);
            desc.type_info.store(0, Ordering::Relaxed);
            let mut word = with_owner(0, Some(owner));
            word.set_bit(PGC_ALLOCATED, true);
            desc.count_info.store(word, Ordering::Release);
        }
        debug!("{}: allocated order {} at {}", owner, order, base);
        Ok(base)
    }

    /// Hands the specific free frame `mfn` back to `owner`.
    pub fn reclaim_domain_page(&self, owner: DomainId, mfn: Mfn) -> AxResult {
        if !self.contains(mfn) || !self.heap.claim(mfn) {
            return ax_err!(ResourceBusy, format!("{} is no longer free", mfn));
        }
        self.flush_for_reuse(mfn, self.all_cpus());
        let desc = self.desc(mfn);
        desc.type_info.store(0, Ordering::Relaxed);
        let mut word = with_owner(0, Some(owner));
        word.set_bit(PGC_ALLOCATED, true);
        desc.count_info.store(word, Ordering::Release);
        Ok(())
    }

    /// Allocates a hypervisor-owned frame, zeroed.
    pub fn alloc_xen_page(&self, address_bits: Option<u32>) -> AxResult<Mfn> {
        let mfn = self
            .heap
            .alloc(0, address_bits)
            .ok_or_else(|| ax_err_type!(NoMemory, "out of hypervisor frames"))?;
        self.flush_for_reuse(mfn, self.all_cpus());
        self.clear_page(mfn);
        let desc = self.desc(mfn);
        desc.type_info.store(0, Ordering::Relaxed);
        let mut word = with_owner(0, None);
        word.set_bit(PGC_ALLOCATED, true);
        word.set_bit(PGC_XEN_HEAP, true);
        desc.count_info.store(word, Ordering::Release);
        Ok(mfn)
    }

    /// Returns a hypervisor-owned frame to the pool.
    pub fn free_xen_page(&self, mfn: Mfn) {
        let desc = self.desc(mfn);
        let c = desc.count_info.load(Ordering::Acquire);
        if !c.get_bit(PGC_XEN_HEAP) || c.get_bits(COUNT_BITS) != 0 {
            bug!("{}: freeing non-hypervisor frame (count_info {:#x})", mfn, c);
        }
        self.free_frame(mfn);
    }

    fn free_frame(&self, mfn: Mfn) {
        let desc = self.desc(mfn);
        desc.tlbflush_timestamp
            .store(self.tlb.now(), Ordering::Release);
        desc.type_info.store(0, Ordering::Relaxed);
        desc.count_info.store(0, Ordering::Release);
        self.clear_page(mfn);
        self.heap.free(mfn, 0);
    }

    /// Takes a general reference on a frame owned by `domain`.
    ///
    /// Fails when the frame is not allocated, belongs to someone else, or its
    /// count would overflow. A failed caller holds nothing.
    pub fn get_page(&self, mfn: Mfn, domain: DomainId) -> bool {
        if !self.contains(mfn) {
            return false;
        }
        let desc = self.desc(mfn);
        let mut x = desc.count_info.load(Ordering::Acquire);
        loop {
            let count = x.get_bits(COUNT_BITS);
            if !x.get_bit(PGC_ALLOCATED)
                || x.get_bit(PGC_XEN_HEAP)
                || owner_of(x) != Some(domain)
                || count == GENERAL_COUNT_MAX
            {
                debug!(
                    "get_page {} for {} refused (count_info {:#x})",
                    mfn, domain, x
                );
                return false;
            }
            match desc.count_info.compare_exchange_weak(
                x,
                x + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) => {
                    trace!("get_page {} raced", mfn);
                    x = cur;
                }
            }
        }
    }

    /// Drops a general reference.
    pub fn put_page(&self, mfn: Mfn) {
        let desc = self.desc(mfn);
        let mut x = desc.count_info.load(Ordering::Acquire);
        loop {
            if x.get_bits(COUNT_BITS) == 0 {
                bug!("{}: general count underflow (count_info {:#x})", mfn, x);
            }
            match desc.count_info.compare_exchange_weak(
                x,
                x - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => x = cur,
            }
        }
        if (x - 1).get_bits(COUNT_BITS) == 0 {
            desc.tlbflush_timestamp
                .store(self.tlb.now(), Ordering::Release);
        }
    }

    /// Gives an idle frame back to the pool, ending `domain`'s ownership.
    ///
    /// Refused while anyone still holds a reference.
    pub fn release_allocation(&self, mfn: Mfn, domain: DomainId) -> AxResult {
        if !self.contains(mfn) {
            return ax_err!(InvalidInput, format!("{} is not a frame", mfn));
        }
        let desc = self.desc(mfn);
        let x = desc.count_info.load(Ordering::Acquire);
        if !x.get_bit(PGC_ALLOCATED) || x.get_bit(PGC_XEN_HEAP) || owner_of(x) != Some(domain) {
            return ax_err!(PermissionDenied, format!("{} not owned by {}", mfn, domain));
        }
        if x.get_bits(COUNT_BITS) != 0
            || desc.type_info.load(Ordering::Acquire) & TYPE_COUNT_MASK != 0
        {
            return ax_err!(ResourceBusy, format!("{} still referenced", mfn));
        }
        if desc
            .count_info
            .compare_exchange(x, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ax_err!(ResourceBusy, format!("{} changed under release", mfn));
        }
        self.free_frame(mfn);
        trace!("{}: released {}", domain, mfn);
        Ok(())
    }

    /// Detaches an idle frame from `domain`, leaving it hypervisor-owned.
    pub fn steal_page(&self, mfn: Mfn, domain: DomainId) -> AxResult {
        if !self.contains(mfn) {
            return ax_err!(InvalidInput, format!("{} is not a frame", mfn));
        }
        let desc = self.desc(mfn);
        let x = desc.count_info.load(Ordering::Acquire);
        if !x.get_bit(PGC_ALLOCATED) || x.get_bit(PGC_XEN_HEAP) || owner_of(x) != Some(domain) {
            return ax_err!(PermissionDenied, format!("{} not owned by {}", mfn, domain));
        }
        if x.get_bits(COUNT_BITS) != 0
            || desc.type_info.load(Ordering::Acquire) & TYPE_COUNT_MASK != 0
        {
            return ax_err!(ResourceBusy, format!("{} busy, cannot steal", mfn));
        }
        let mut nx = with_owner(0, None);
        nx.set_bit(PGC_ALLOCATED, true);
        nx.set_bit(PGC_XEN_HEAP, true);
        desc.count_info
            .compare_exchange(x, nx, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ax_err_type!(ResourceBusy, format!("{} changed under steal", mfn)))?;
        desc.tlbflush_timestamp
            .store(self.tlb.now(), Ordering::Release);
        Ok(())
    }

    /// Hands a hypervisor-owned frame to `domain`.
    pub fn assign_page(&self, mfn: Mfn, domain: DomainId) -> AxResult {
        let desc = self.desc(mfn);
        let x = desc.count_info.load(Ordering::Acquire);
        if !x.get_bit(PGC_XEN_HEAP) || x.get_bits(COUNT_BITS) != 0 {
            return ax_err!(BadState, format!("{} is not a free hypervisor frame", mfn));
        }
        let mut nx = with_owner(0, Some(domain));
        nx.set_bit(PGC_ALLOCATED, true);
        desc.type_info.store(0, Ordering::Relaxed);
        desc.count_info
            .compare_exchange(x, nx, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ax_err_type!(ResourceBusy, format!("{} changed under assign", mfn)))?;
        Ok(())
    }

    /// Takes a type reference, changing the frame's type if it has none.
    pub fn get_page_type(&self, mfn: Mfn, ty: PageType, owner: &dyn FrameOwner) -> AxResult {
        self.get_page_type_va(mfn, ty, None, owner)
    }

    /// Like [`FrameTable::get_page_type`], also recording where the frame is
    /// linked from.
    pub fn get_page_type_va(
        &self,
        mfn: Mfn,
        ty: PageType,
        va: Option<u16>,
        owner: &dyn FrameOwner,
    ) -> AxResult {
        if ty == PageType::None {
            return ax_err!(InvalidInput, "cannot take a reference on the none type");
        }
        let desc = self.desc(mfn);
        let mut x = desc.type_info.load(Ordering::Acquire);
        let nx = loop {
            let count = x & TYPE_COUNT_MASK;
            if count == TYPE_COUNT_MASK {
                warn!("{}: type count overflow", mfn);
                return ax_err!(BadState, format!("{} type count overflow", mfn));
            }
            let mut nx = x + 1;
            let cur = type_of(mfn, x);
            if count == 0 {
                if cur != ty {
                    // The frame may still be reachable through translations
                    // cached for its previous role.
                    self.flush_for_reuse(mfn, owner.dirty_cpus());
                }
                nx &= !(1 << PGT_VALIDATED);
                set_type(&mut nx, ty);
                set_backptr(&mut nx, va.unwrap_or(VA_UNKNOWN));
                if ty == PageType::Writable {
                    nx.set_bit(PGT_VALIDATED, true);
                }
            } else {
                if cur != ty {
                    warn!(
                        "{}: type conflict, is {:?} x{}, wanted {:?}",
                        mfn, cur, count, ty
                    );
                    return ax_err!(BadState, format!("{} already typed {:?}", mfn, cur));
                }
                if let Some(va) = va {
                    let old = backptr_of(x);
                    if old == VA_MUTABLE {
                        set_backptr(&mut nx, va);
                    } else if old != va {
                        set_backptr(&mut nx, VA_UNKNOWN);
                    }
                }
                if !x.get_bit(PGT_VALIDATED) {
                    // Someone else is validating; wait for the word to change.
                    while desc.type_info.load(Ordering::Acquire) == x {
                        core::hint::spin_loop();
                    }
                    x = desc.type_info.load(Ordering::Acquire);
                    continue;
                }
            }
            match desc
                .type_info
                .compare_exchange_weak(x, nx, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break nx,
                Err(cur) => {
                    trace!("get_page_type {} raced", mfn);
                    x = cur;
                }
            }
        };

        if !nx.get_bit(PGT_VALIDATED) {
            if let Err(e) = self.validate_table(mfn, ty, owner) {
                warn!("{}: validation as {:?} failed", mfn, ty);
                desc.type_info.store(0, Ordering::Release);
                return Err(e);
            }
            fence(Ordering::Release);
            desc.type_info
                .fetch_or(1 << PGT_VALIDATED, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Drops a type reference. The last one strips a table type, undoing
    /// what validation took.
    pub fn put_page_type(&self, mfn: Mfn, owner: &dyn FrameOwner) {
        let desc = self.desc(mfn);
        let mut x = desc.type_info.load(Ordering::Acquire);
        loop {
            if x & TYPE_COUNT_MASK == 0 {
                bug!("{}: type count underflow (type_info {:#x})", mfn, x);
            }
            let mut nx = x - 1;
            let ty = type_of(mfn, x);
            if nx & TYPE_COUNT_MASK == 0 {
                if ty.is_table() && x.get_bit(PGT_VALIDATED) {
                    // Keep the reference while the contents are released so
                    // that concurrent users wait instead of trusting them.
                    let stripped = x & !(1 << PGT_VALIDATED);
                    if desc
                        .type_info
                        .compare_exchange(x, stripped, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        x = desc.type_info.load(Ordering::Acquire);
                        continue;
                    }
                    self.invalidate_table(mfn, ty, owner);
                    x = stripped;
                    nx = x - 1;
                }
                nx &= !(1 << PGT_VALIDATED);
                desc.tlbflush_timestamp
                    .store(self.tlb.now(), Ordering::Release);
            } else if nx & ((1 << PGT_PINNED) | TYPE_COUNT_MASK) == (1 << PGT_PINNED) | 1
                && ty != PageType::Writable
            {
                // Only the pin is left: the frame may be relinked anywhere.
                set_backptr(&mut nx, VA_MUTABLE);
            }
            match desc
                .type_info
                .compare_exchange_weak(x, nx, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(cur) => x = cur,
            }
        }
    }

    pub fn get_page_and_type(&self, mfn: Mfn, ty: PageType, owner: &dyn FrameOwner) -> AxResult {
        if !self.get_page(mfn, owner.owner_id()) {
            return ax_err!(PermissionDenied, format!("{} not usable by {}", mfn, owner.owner_id()));
        }
        self.get_page_type(mfn, ty, owner).inspect_err(|_| self.put_page(mfn))
    }

    pub fn put_page_and_type(&self, mfn: Mfn, owner: &dyn FrameOwner) {
        self.put_page_type(mfn, owner);
        self.put_page(mfn);
    }

    /// Sets the pinned bit on a frame the caller holds a type reference on.
    /// Returns whether the bit was already set.
    pub fn set_pinned(&self, mfn: Mfn) -> bool {
        let old = self
            .desc(mfn)
            .type_info
            .fetch_or(1 << PGT_PINNED, Ordering::AcqRel);
        old.get_bit(PGT_PINNED)
    }

    /// Clears the pinned bit. Returns whether it was set.
    pub fn clear_pinned(&self, mfn: Mfn) -> bool {
        let old = self
            .desc(mfn)
            .type_info
            .fetch_and(!(1 << PGT_PINNED), Ordering::AcqRel);
        old.get_bit(PGT_PINNED)
    }

    /// Pins a page table in its type, taking one general and one type
    /// reference held by the pin.
    pub fn pin_table(&self, mfn: Mfn, ty: PageType, owner: &dyn FrameOwner) -> AxResult {
        if !ty.is_table() {
            return ax_err!(InvalidInput, format!("cannot pin {:?}", ty));
        }
        self.get_page_and_type(mfn, ty, owner)?;
        if self.set_pinned(mfn) {
            self.put_page_and_type(mfn, owner);
            return ax_err!(AlreadyExists, format!("{} already pinned", mfn));
        }
        debug!("{}: pinned {} as {:?}", owner.owner_id(), mfn, ty);
        Ok(())
    }

    pub fn unpin_table(&self, mfn: Mfn, owner: &dyn FrameOwner) -> AxResult {
        if self.owner(mfn) != Some(owner.owner_id()) {
            return ax_err!(PermissionDenied, format!("{} not owned by {}", mfn, owner.owner_id()));
        }
        if !self.clear_pinned(mfn) {
            return ax_err!(InvalidInput, format!("{} is not pinned", mfn));
        }
        self.put_page_and_type(mfn, owner);
        Ok(())
    }

    /// Replaces entry `idx` of a validated table, moving the references the
    /// entries imply.
    pub fn update_table_entry(
        &self,
        mfn: Mfn,
        idx: usize,
        new: u64,
        owner: &dyn FrameOwner,
    ) -> AxResult {
        if idx >= PAGE_WORDS {
            return ax_err!(InvalidInput, "entry index out of range");
        }
        let info = self.info(mfn);
        if info.owner != Some(owner.owner_id()) {
            return ax_err!(PermissionDenied, format!("{} not owned by {}", mfn, owner.owner_id()));
        }
        if !info.ty.is_table() || info.type_count == 0 {
            return ax_err!(InvalidInput, format!("{} is not an active page table", mfn));
        }
        let check = owner.validates_tables();
        let new_pte = Pte::from_raw(new);
        if check && new_pte.is_present() {
            self.get_entry_ref(new_pte, info.ty, owner)?;
        }
        let old = self.read_word(mfn, idx);
        if self.cmpxchg_word(mfn, idx, old, new).is_err() {
            if check && new_pte.is_present() {
                self.put_entry_ref(new_pte, info.ty, owner);
            }
            return ax_err!(ResourceBusy, "page-table entry changed concurrently");
        }
        let old_pte = Pte::from_raw(old);
        if check && old_pte.is_present() {
            self.put_entry_ref(old_pte, info.ty, owner);
        }
        Ok(())
    }

    fn get_entry_ref(&self, pte: Pte, ty: PageType, owner: &dyn FrameOwner) -> AxResult {
        let target = pte.mfn(&FOUR_LEVEL);
        if !self.contains(target) {
            return ax_err!(InvalidInput, format!("entry names bad frame {}", target));
        }
        match ty {
            PageType::L1 => {
                if !self.get_page(target, owner.owner_id()) {
                    return ax_err!(
                        PermissionDenied,
                        format!("{} maps foreign frame {}", owner.owner_id(), target)
                    );
                }
                if pte.flags().contains(PteFlags::RW) {
                    self.get_page_type(target, PageType::Writable, owner)
                        .inspect_err(|_| self.put_page(target))?;
                }
                Ok(())
            }
            PageType::L2 | PageType::L3 | PageType::L4 => {
                if pte.flags().contains(PteFlags::PSE) {
                    return ax_err!(InvalidInput, "superpage in a paravirtual table");
                }
                let lower = PageType::table(ty.level() - 1).unwrap_or(PageType::L1);
                self.get_page_and_type(target, lower, owner)
            }
            _ => ax_err!(InvalidInput),
        }
    }

    fn put_entry_ref(&self, pte: Pte, ty: PageType, owner: &dyn FrameOwner) {
        let target = pte.mfn(&FOUR_LEVEL);
        match ty {
            PageType::L1 => {
                if pte.flags().contains(PteFlags::RW) {
                    self.put_page_type(target, owner);
                }
                self.put_page(target);
            }
            _ => self.put_page_and_type(target, owner),
        }
    }

    fn validate_table(&self, mfn: Mfn, ty: PageType, owner: &dyn FrameOwner) -> AxResult {
        if !ty.is_table() || !owner.validates_tables() {
            return Ok(());
        }
        for idx in 0..PAGE_WORDS {
            let pte = Pte::from_raw(self.read_word(mfn, idx));
            if !pte.is_present() {
                continue;
            }
            if let Err(e) = self.get_entry_ref(pte, ty, owner) {
                warn!("{}: bad entry {} ({:#x}) for {:?}", mfn, idx, pte.raw(), ty);
                for undo in (0..idx).rev() {
                    let pte = Pte::from_raw(self.read_word(mfn, undo));
                    if pte.is_present() {
                        self.put_entry_ref(pte, ty, owner);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn invalidate_table(&self, mfn: Mfn, ty: PageType, owner: &dyn FrameOwner) {
        if !owner.validates_tables() {
            return;
        }
        for idx in 0..PAGE_WORDS {
            let pte = Pte::from_raw(self.read_word(mfn, idx));
            if pte.is_present() {
                self.put_entry_ref(pte, ty, owner);
            }
        }
    }

    /// Checks the ownership invariants over every frame, returning the
    /// frames breaking them.
    pub fn audit(&self, is_dying: impl Fn(DomainId) -> bool) -> Vec<Mfn> {
        (0..self.nr_frames() as u64)
            .map(Mfn::new)
            .filter(|&mfn| {
                let info = self.info(mfn);
                let refs_ok =
                    info.general_count == 0 || (info.allocated && info.owner.is_some());
                let type_ok = info.type_count == 0
                    || info.validated
                    || info.owner.is_some_and(&is_dying);
                let validated_ok = !info.validated || info.type_count > 0;
                !(refs_ok && type_ok && validated_ok)
            })
            .collect()
    }
}
