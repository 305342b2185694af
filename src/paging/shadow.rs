//! Shadow page tables.
//!
//! Each guest frame in use as a page table gets one shadow frame of the same
//! geometry, holding machine frame numbers where the guest table holds guest
//! frames. A guest superpage gets a split shadow (`Fl1`) of 4K leaves. While
//! shadowed, a guest table is pinned in its table type, so it cannot also be
//! used in a conflicting role.
//!
//! Guest tables are write-protected through every shadow leaf while in sync.
//! A write fault on one lets the write through and marks the table out of
//! sync, remembering a snapshot of its contents; the shadow catches up on the
//! next [`ShadowDomain::sync_all`].
//!
//! All state lives under the domain's shadow lock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use axerrno::{AxError, AxResult, ax_err, ax_err_type};
use hashbrown::HashMap;

use axpv_types::{GuestVirtAddr, Gpfn, Mfn, PAGE_SHIFT, VcpuId};

use super::walk::{level_has_rights, read_entry, walk_guest, write_entry};
use super::{GuestWalk, PagingFormat, PagingLevels, PfErrorCode, Pte, PteFlags, SHADOW_LINK_FLAGS};
use crate::domain::Domain;
use crate::hypervisor::Hypervisor;
use crate::mm::frame::{FrameTable, PageType};
use crate::mm::p2m::P2mType;

/// Flags a shadow leaf copies from the guest.
const LEAF_FLAGS: PteFlags = PteFlags::PRESENT
    .union(PteFlags::RW)
    .union(PteFlags::USER)
    .union(PteFlags::PWT)
    .union(PteFlags::PCD)
    .union(PteFlags::ACCESSED)
    .union(PteFlags::DIRTY)
    .union(PteFlags::GLOBAL)
    .union(PteFlags::NX);

const ACCESS_BITS: PfErrorCode = PfErrorCode::WRITE
    .union(PfErrorCode::USER)
    .union(PfErrorCode::FETCH);

/// Shadow faults taken for one access before giving up.
const MAX_FAULT_RETRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShadowKind {
    L1,
    L2,
    L3,
    L4,
    /// 4K leaves splitting one guest superpage.
    Fl1,
}

impl ShadowKind {
    fn table(level: usize) -> Self {
        match level {
            1 => ShadowKind::L1,
            2 => ShadowKind::L2,
            3 => ShadowKind::L3,
            _ => ShadowKind::L4,
        }
    }

    pub fn level(self) -> usize {
        match self {
            ShadowKind::L1 | ShadowKind::Fl1 => 1,
            ShadowKind::L2 => 2,
            ShadowKind::L3 => 3,
            ShadowKind::L4 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowStats {
    pub faults: u64,
    pub fixed: u64,
    pub reflected: u64,
    pub mmio: u64,
    pub created: u64,
    pub destroyed: u64,
    pub unsyncs: u64,
    pub resyncs: u64,
}

/// What a shadow fault turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The shadow now maps the access; retry it.
    Fixed,
    /// A genuine guest fault: inject a page fault with this error code.
    Reflect(PfErrorCode),
    /// The access targets emulated I/O.
    Mmio,
}

/// Guest frame and kind. For `Fl1` the frame is the first of the superpage.
type Key = (Gpfn, ShadowKind);

/// A slot holding a shadow entry: shadow frame and index.
type Slot = (Mfn, usize);

struct Shadow {
    smfn: Mfn,
    /// Guest table frame, invalid for `Fl1`.
    gmfn: Mfn,
    /// Links from parent shadows plus vCPU roots.
    refs: u32,
    /// Guest entries as the shadow last reflected them, while out of sync.
    snapshot: Option<Box<[u64]>>,
}

pub struct ShadowDomain {
    format: &'static PagingFormat,
    shadows: HashMap<Key, Shadow>,
    by_smfn: HashMap<Mfn, Key>,
    by_gmfn: HashMap<Mfn, Key>,
    roots: BTreeMap<VcpuId, Key>,
    oos: Vec<Key>,
    /// Writable shadow leaves, by the frame they map.
    writable: HashMap<Mfn, Vec<Slot>>,
    /// One bit per guest RAM frame written since the last clean.
    dirty: Option<Vec<u64>>,
    flush: bool,
    stats: ShadowStats,
}

/// Leaf flags for the 4K pieces of guest superpage entry flags `g`. Access
/// rights are enforced by the link to the split shadow.
fn split_leaf_flags(g: PteFlags) -> PteFlags {
    let kept = PteFlags::PWT | PteFlags::PCD | PteFlags::GLOBAL | PteFlags::ACCESSED | PteFlags::DIRTY;
    (g & kept) | PteFlags::PRESENT | PteFlags::RW | PteFlags::USER
}

impl ShadowDomain {
    pub fn new(levels: PagingLevels) -> Self {
        Self {
            format: PagingFormat::of(levels),
            shadows: HashMap::new(),
            by_smfn: HashMap::new(),
            by_gmfn: HashMap::new(),
            roots: BTreeMap::new(),
            oos: Vec::new(),
            writable: HashMap::new(),
            dirty: None,
            flush: false,
            stats: ShadowStats::default(),
        }
    }

    pub fn format(&self) -> &'static PagingFormat {
        self.format
    }

    pub fn stats(&self) -> ShadowStats {
        self.stats
    }

    pub fn shadow_of(&self, gpfn: Gpfn, kind: ShadowKind) -> Option<Mfn> {
        self.shadows.get(&(gpfn, kind)).map(|s| s.smfn)
    }

    /// Top-level shadow `vcpu` runs on.
    pub fn root(&self, vcpu: VcpuId) -> Option<Mfn> {
        self.roots.get(&vcpu).and_then(|k| self.shadows.get(k)).map(|s| s.smfn)
    }

    pub fn is_out_of_sync(&self, gpfn: Gpfn) -> bool {
        self.oos.iter().any(|k| k.0 == gpfn)
    }

    pub fn is_log_dirty(&self) -> bool {
        self.dirty.is_some()
    }

    /// Whether shadow entries lost rights since the last call.
    pub(crate) fn take_flush(&mut self) -> bool {
        core::mem::take(&mut self.flush)
    }

    fn top_kind(&self) -> ShadowKind {
        ShadowKind::table(self.format.levels)
    }

    /// Shadow leaf for a guest mapping of `gpfn`, to be stored at `slot`.
    /// Takes the reference the entry holds.
    fn make_leaf(
        &mut self,
        frames: &FrameTable,
        d: &Domain,
        gpfn: Gpfn,
        gflags: PteFlags,
        slot: Slot,
    ) -> Pte {
        let (mfn, ty) = d.p2m.lookup(gpfn);
        match ty {
            P2mType::Grant => {}
            ty if ty.is_ram() => {
                if !frames.get_page(mfn, d.id()) {
                    debug!("{}: no reference on {} for a shadow leaf", d.id(), mfn);
                    return Pte::empty();
                }
            }
            _ => return Pte::empty(),
        }
        let mut flags = gflags & self.format.flag_mask() & LEAF_FLAGS;
        let mut writable = flags.contains(PteFlags::RW | PteFlags::DIRTY)
            && matches!(ty, P2mType::RamRw | P2mType::Grant);
        if writable {
            if let Some(table) = self.by_gmfn.get(&mfn).and_then(|k| self.shadows.get(k)) {
                if table.snapshot.is_some() {
                    flags |= PteFlags::SH_OOS;
                } else {
                    writable = false;
                }
            }
        }
        if writable {
            self.writable.entry(mfn).or_default().push(slot);
        } else {
            flags.remove(PteFlags::RW);
        }
        Pte::new(mfn, flags)
    }

    /// Shadow entry for guest entry `g` of a `level` table, to be stored at
    /// `slot`. Child shadows are found or built.
    fn propagate(
        &mut self,
        frames: &FrameTable,
        d: &Domain,
        level: usize,
        g: Pte,
        slot: Slot,
    ) -> AxResult<Pte> {
        let fmt = self.format;
        if !g.is_present() {
            return Ok(Pte::empty());
        }
        let gflags = g.flags() & fmt.flag_mask();
        if level == 1 {
            return Ok(self.make_leaf(frames, d, Gpfn::new(g.frame(fmt)), gflags, slot));
        }
        let rights = level_has_rights(fmt, level);
        let (key, split) = if rights && gflags.contains(PteFlags::PSE) {
            if !fmt.info(level).large_ok {
                return ax_err!(InvalidInput, format!("{}: superpage at level {}", d.id(), level));
            }
            let span = fmt.superpage_frames(level) as u64;
            (
                (Gpfn::new(g.frame(fmt) & !(span - 1)), ShadowKind::Fl1),
                split_leaf_flags(gflags),
            )
        } else {
            ((Gpfn::new(g.frame(fmt)), ShadowKind::table(level - 1)), PteFlags::empty())
        };
        let child = self.get_or_create(frames, d, key, split)?;
        let link = if rights {
            gflags & (SHADOW_LINK_FLAGS | PteFlags::NX)
        } else {
            PteFlags::PRESENT
        };
        Ok(Pte::new(child, link | PteFlags::PRESENT))
    }

    /// Like [`Self::propagate`], leaving the entry not present when the
    /// guest entry cannot be shadowed. The access will fault and the fault
    /// path reports why.
    fn propagate_or_empty(
        &mut self,
        frames: &FrameTable,
        d: &Domain,
        level: usize,
        g: Pte,
        slot: Slot,
    ) -> Pte {
        match self.propagate(frames, d, level, g, slot) {
            Ok(pte) => pte,
            Err(e) => {
                debug!("{}: level {} entry {:?} left unshadowed: {:?}", d.id(), level, g, e);
                Pte::empty()
            }
        }
    }

    fn get_or_create(
        &mut self,
        frames: &FrameTable,
        d: &Domain,
        key: Key,
        split: PteFlags,
    ) -> AxResult<Mfn> {
        if let Some(sh) = self.shadows.get_mut(&key) {
            sh.refs += 1;
            return Ok(sh.smfn);
        }
        let (gpfn, kind) = key;
        let gmfn = if kind == ShadowKind::Fl1 {
            Mfn::INVALID
        } else {
            let (gmfn, ty) = d.p2m.lookup(gpfn);
            if !ty.is_ram() {
                return ax_err!(InvalidInput, format!("{}: table {} is not RAM", d.id(), gpfn));
            }
            let ty = PageType::table(kind.level())
                .ok_or_else(|| ax_err_type!(InvalidInput, "no page type for level"))?;
            frames.pin_table(gmfn, ty, d)?;
            gmfn
        };
        let smfn = match frames.alloc_xen_page(None) {
            Ok(smfn) => smfn,
            Err(e) => {
                if !gmfn.is_invalid() {
                    let _ = frames.unpin_table(gmfn, d);
                }
                return Err(e);
            }
        };
        self.shadows.insert(
            key,
            Shadow {
                smfn,
                gmfn,
                refs: 1,
                snapshot: None,
            },
        );
        self.by_smfn.insert(smfn, key);
        if !gmfn.is_invalid() {
            self.by_gmfn.insert(gmfn, key);
        }
        self.stats.created += 1;
        trace!("{}: shadow {:?} of {} at {}", d.id(), kind, gpfn, smfn);

        let fmt = self.format;
        let level = kind.level();
        for idx in 0..fmt.entries(level) {
            let pte = if kind == ShadowKind::Fl1 {
                self.make_leaf(frames, d, gpfn.add(idx as u64), split, (smfn, idx))
            } else {
                let g = read_entry(frames, fmt, gmfn, idx);
                self.propagate_or_empty(frames, d, level, g, (smfn, idx))
            };
            write_entry(frames, fmt, smfn, idx, pte);
        }
        if !gmfn.is_invalid() {
            self.write_protect(frames, gmfn);
        }
        Ok(smfn)
    }

    /// Removes RW from every shadow leaf mapping `mfn`.
    fn write_protect(&mut self, frames: &FrameTable, mfn: Mfn) {
        let Some(slots) = self.writable.remove(&mfn) else {
            return;
        };
        let fmt = self.format;
        for (smfn, idx) in slots {
            let pte = read_entry(frames, fmt, smfn, idx);
            write_entry(frames, fmt, smfn, idx, pte.without_flags(PteFlags::RW | PteFlags::SH_OOS));
        }
        self.flush = true;
    }

    /// Releases what shadow entry `old` at `slot` of a `level` shadow holds.
    fn drop_entry(&mut self, frames: &FrameTable, d: &Domain, level: usize, slot: Slot, old: Pte) {
        if !old.is_present() {
            return;
        }
        let mfn = old.mfn(self.format);
        if level > 1 {
            match self.by_smfn.get(&mfn) {
                Some(&key) => self.put_shadow(frames, d, key),
                None => bug!("{}: shadow link at {:?} to unknown {}", d.id(), slot, mfn),
            }
            return;
        }
        if old.flags().contains(PteFlags::RW) {
            if let Some(slots) = self.writable.get_mut(&mfn) {
                if let Some(pos) = slots.iter().position(|&s| s == slot) {
                    slots.swap_remove(pos);
                }
                if slots.is_empty() {
                    self.writable.remove(&mfn);
                }
            }
        }
        if !frames.info(mfn).xen_heap {
            frames.put_page(mfn);
        }
    }

    /// Writes `new` at `slot`, releasing the entry it replaces.
    fn install(&mut self, frames: &FrameTable, d: &Domain, level: usize, slot: Slot, new: Pte, g: Pte) {
        let fmt = self.format;
        let old = read_entry(frames, fmt, slot.0, slot.1);
        write_entry(frames, fmt, slot.0, slot.1, new);
        self.drop_entry(frames, d, level, slot, old);
        if let Some(snapshot) = self
            .by_smfn
            .get(&slot.0)
            .and_then(|k| self.shadows.get_mut(k))
            .and_then(|s| s.snapshot.as_mut())
        {
            snapshot[slot.1] = g.raw();
        }
    }

    fn put_shadow(&mut self, frames: &FrameTable, d: &Domain, key: Key) {
        let Some(sh) = self.shadows.get_mut(&key) else {
            bug!("{}: dropping missing shadow {:?}", d.id(), key);
        };
        sh.refs -= 1;
        if sh.refs == 0 {
            self.destroy(frames, d, key);
        }
    }

    fn destroy(&mut self, frames: &FrameTable, d: &Domain, key: Key) {
        let Some(sh) = self.shadows.remove(&key) else {
            return;
        };
        self.by_smfn.remove(&sh.smfn);
        if !sh.gmfn.is_invalid() {
            self.by_gmfn.remove(&sh.gmfn);
        }
        self.oos.retain(|k| *k != key);
        let fmt = self.format;
        let level = key.1.level();
        for idx in 0..fmt.entries(level) {
            let old = read_entry(frames, fmt, sh.smfn, idx);
            self.drop_entry(frames, d, level, (sh.smfn, idx), old);
        }
        if !sh.gmfn.is_invalid() {
            if let Err(e) = frames.unpin_table(sh.gmfn, d) {
                warn!("{}: unpinning shadowed {}: {:?}", d.id(), sh.gmfn, e);
            }
        }
        frames.free_xen_page(sh.smfn);
        self.stats.destroyed += 1;
        trace!("{}: shadow {:?} of {} destroyed", d.id(), key.1, key.0);
    }

    fn unsync(&mut self, frames: &FrameTable, key: Key) {
        let fmt = self.format;
        let Some(sh) = self.shadows.get_mut(&key) else {
            return;
        };
        if sh.snapshot.is_some() {
            return;
        }
        let snapshot = (0..fmt.entries(key.1.level()))
            .map(|idx| read_entry(frames, fmt, sh.gmfn, idx).raw())
            .collect();
        sh.snapshot = Some(snapshot);
        self.oos.push(key);
        self.stats.unsyncs += 1;
        trace!("shadow of {} out of sync", key.0);
    }

    /// Brings an out-of-sync shadow up to date with its guest table and
    /// write-protects the table again.
    fn resync(&mut self, frames: &FrameTable, d: &Domain, key: Key) {
        let fmt = self.format;
        let Some(sh) = self.shadows.get_mut(&key) else {
            return;
        };
        let Some(snapshot) = sh.snapshot.take() else {
            return;
        };
        let (smfn, gmfn) = (sh.smfn, sh.gmfn);
        let level = key.1.level();
        let mut changed = 0;
        for (idx, &was) in snapshot.iter().enumerate() {
            let g = read_entry(frames, fmt, gmfn, idx);
            if g.raw() == was {
                continue;
            }
            changed += 1;
            let new = self.propagate_or_empty(frames, d, level, g, (smfn, idx));
            self.install(frames, d, level, (smfn, idx), new, g);
        }
        self.write_protect(frames, gmfn);
        self.stats.resyncs += 1;
        trace!("{}: resynced {} ({} entries changed)", d.id(), key.0, changed);
    }

    /// Resynchronizes every out-of-sync shadow.
    pub fn sync_all(&mut self, frames: &FrameTable, d: &Domain) {
        for key in core::mem::take(&mut self.oos) {
            self.resync(frames, d, key);
        }
    }

    /// Points `vcpu` at the shadow of the guest table rooted at `root`,
    /// building it as needed.
    pub fn update_cr3(&mut self, frames: &FrameTable, d: &Domain, vcpu: VcpuId, root: Gpfn) -> AxResult {
        self.sync_all(frames, d);
        let key = (root, self.top_kind());
        let smfn = self.get_or_create(frames, d, key, PteFlags::empty())?;
        if let Some(old) = self.roots.insert(vcpu, key) {
            self.put_shadow(frames, d, old);
        }
        self.flush = true;
        debug!("{}v{}: shadow root {} for {}", d.id(), vcpu.index(), smfn, root);
        Ok(())
    }

    /// Translates `va` through the shadow tables the way the MMU would.
    pub fn hw_translate(
        &self,
        frames: &FrameTable,
        vcpu: VcpuId,
        va: GuestVirtAddr,
        access: PfErrorCode,
    ) -> Result<Mfn, PfErrorCode> {
        let access = access & ACCESS_BITS;
        let fmt = self.format;
        let Some(mut table) = self.root(vcpu) else {
            return Err(access);
        };
        let (mut writable, mut user, mut exec) = (true, true, true);
        for level in (1..=fmt.levels).rev() {
            let pte = read_entry(frames, fmt, table, fmt.index(level, va));
            if !pte.is_present() {
                return Err(access);
            }
            let flags = pte.flags();
            if level_has_rights(fmt, level) {
                writable &= flags.contains(PteFlags::RW);
                user &= flags.contains(PteFlags::USER);
                exec &= !flags.contains(PteFlags::NX);
            }
            table = pte.mfn(fmt);
        }
        let denied = (access.contains(PfErrorCode::WRITE) && !writable)
            || (access.contains(PfErrorCode::USER) && !user)
            || (access.contains(PfErrorCode::FETCH) && !exec);
        if denied {
            return Err(access | PfErrorCode::PRESENT);
        }
        Ok(table)
    }

    /// Handles a page fault the hardware raised on the shadow tables.
    pub fn shadow_fault(
        &mut self,
        frames: &FrameTable,
        d: &Domain,
        vcpu: VcpuId,
        va: GuestVirtAddr,
        access: PfErrorCode,
    ) -> AxResult<FaultOutcome> {
        self.stats.faults += 1;
        let access = access & ACCESS_BITS;
        let Some(&root) = self.roots.get(&vcpu) else {
            return ax_err!(BadState, format!("{}v{}: no shadow root", d.id(), vcpu.index()));
        };
        let fmt = self.format;
        let write = access.contains(PfErrorCode::WRITE);
        let mut walk = match walk_guest(frames, &d.p2m, fmt, root.0, va, access) {
            Ok(walk) => walk,
            Err(fault) => {
                self.stats.reflected += 1;
                trace!("{}: guest fault at {:?}: {:?}", d.id(), va, fault);
                return Ok(FaultOutcome::Reflect(fault.error_code(access)));
            }
        };
        let (mfn, ty) = d.p2m.lookup(walk.gpfn);
        if !ty.is_ram() && ty != P2mType::Grant {
            self.stats.mmio += 1;
            return Ok(FaultOutcome::Mmio);
        }
        if write && ty == P2mType::RamRo {
            self.stats.reflected += 1;
            return Ok(FaultOutcome::Reflect(access | PfErrorCode::PRESENT));
        }
        walk.set_ad_bits(frames, fmt, write);
        if write {
            if ty == P2mType::RamLogDirty {
                self.mark_dirty(walk.gpfn);
                d.p2m.set_type(walk.gpfn, P2mType::RamRw)?;
            }
            if let Some(&table) = self.by_gmfn.get(&mfn) {
                self.unsync(frames, table);
            }
        }
        match self.fix_path(frames, d, root, &walk) {
            Ok(()) => {
                self.stats.fixed += 1;
                Ok(FaultOutcome::Fixed)
            }
            Err(AxError::NoMemory) => ax_err!(NoMemory, "shadow fault needs a frame"),
            Err(e) => {
                debug!("{}: cannot shadow the walk for {:?}: {:?}", d.id(), va, e);
                self.stats.reflected += 1;
                Ok(FaultOutcome::Reflect(access | PfErrorCode::PRESENT | PfErrorCode::RSVD))
            }
        }
    }

    /// Re-propagates every shadow entry on the walk from the guest entries.
    fn fix_path(&mut self, frames: &FrameTable, d: &Domain, root: Key, walk: &GuestWalk) -> AxResult {
        let fmt = self.format;
        let Some(mut smfn) = self.shadows.get(&root).map(|s| s.smfn) else {
            return ax_err!(BadState, "shadow root vanished");
        };
        for level in (walk.leaf_level..=fmt.levels).rev() {
            let idx = fmt.index(level, walk.va);
            let g = read_entry(frames, fmt, walk.tables[level - 1], idx);
            let new = self.propagate(frames, d, level, g, (smfn, idx))?;
            self.install(frames, d, level, (smfn, idx), new, g);
            if !new.is_present() {
                return ax_err!(BadState, format!("{}: level {} entry changed under the walk", d.id(), level));
            }
            if level == 1 {
                return Ok(());
            }
            smfn = new.mfn(fmt);
        }
        // Superpage: refresh the piece of the split shadow.
        let idx = fmt.index(1, walk.va);
        let flags = split_leaf_flags(walk.leaf().flags() & fmt.flag_mask());
        let leaf = self.make_leaf(frames, d, walk.gpfn, flags, (smfn, idx));
        self.install(frames, d, 1, (smfn, idx), leaf, leaf);
        Ok(())
    }

    /// Drops the shadow leaf for `va`, so the next access refaults.
    pub fn invlpg(&mut self, frames: &FrameTable, d: &Domain, vcpu: VcpuId, va: GuestVirtAddr) {
        let fmt = self.format;
        let Some(mut table) = self.root(vcpu) else {
            return;
        };
        for level in (1..=fmt.levels).rev() {
            let idx = fmt.index(level, va);
            let pte = read_entry(frames, fmt, table, idx);
            if !pte.is_present() {
                return;
            }
            if level == 1 {
                write_entry(frames, fmt, table, idx, Pte::empty());
                self.drop_entry(frames, d, 1, (table, idx), pte);
                self.flush = true;
                return;
            }
            table = pte.mfn(fmt);
        }
    }

    pub(crate) fn mark_dirty(&mut self, gpfn: Gpfn) {
        if let Some(word) = self
            .dirty
            .as_mut()
            .and_then(|map| map.get_mut(gpfn.index() / 64))
        {
            *word |= 1 << (gpfn.index() % 64);
        }
    }

    /// Accounts for the hypervisor writing guest frame `gpfn`. Must run
    /// before the bytes land so a shadowed table keeps its old snapshot.
    pub(crate) fn prepare_write(&mut self, frames: &FrameTable, gpfn: Gpfn, mfn: Mfn) {
        self.mark_dirty(gpfn);
        if let Some(&table) = self.by_gmfn.get(&mfn) {
            self.unsync(frames, table);
        }
    }

    fn strip_writable(&mut self, frames: &FrameTable) {
        let fmt = self.format;
        for (_, slots) in self.writable.drain() {
            for (smfn, idx) in slots {
                let pte = read_entry(frames, fmt, smfn, idx);
                write_entry(frames, fmt, smfn, idx, pte.without_flags(PteFlags::RW | PteFlags::SH_OOS));
            }
        }
        self.flush = true;
    }

    /// Starts logging writes: every RAM page is write-intercepted until it
    /// is first written.
    pub fn log_dirty_enable(&mut self, frames: &FrameTable, d: &Domain) -> AxResult {
        if self.dirty.is_some() {
            return ax_err!(AlreadyExists, format!("{}: log-dirty already on", d.id()));
        }
        self.sync_all(frames, d);
        self.dirty = Some(vec![0; (d.p2m.ram_pages() as usize).div_ceil(64)]);
        let armed = d.p2m.change_type_all(P2mType::RamRw, P2mType::RamLogDirty);
        self.strip_writable(frames);
        info!("{}: log-dirty on, {} pages armed", d.id(), armed);
        Ok(())
    }

    /// Returns the pages written since the last call and re-arms them.
    pub fn log_dirty_clean(&mut self, frames: &FrameTable, d: &Domain) -> AxResult<Vec<Gpfn>> {
        let Some(map) = self.dirty.as_mut() else {
            return ax_err!(BadState, format!("{}: log-dirty is off", d.id()));
        };
        let mut pages = Vec::new();
        for (w, word) in map.iter_mut().enumerate() {
            let mut bits = core::mem::take(word);
            while bits != 0 {
                let b = bits.trailing_zeros() as u64;
                bits &= bits - 1;
                pages.push(Gpfn::new(w as u64 * 64 + b));
            }
        }
        self.sync_all(frames, d);
        d.p2m.change_type_all(P2mType::RamRw, P2mType::RamLogDirty);
        self.strip_writable(frames);
        debug!("{}: log-dirty clean, {} pages dirty", d.id(), pages.len());
        Ok(pages)
    }

    pub fn log_dirty_disable(&mut self, d: &Domain) -> AxResult {
        if self.dirty.take().is_none() {
            return ax_err!(BadState, format!("{}: log-dirty is off", d.id()));
        }
        d.p2m.change_type_all(P2mType::RamLogDirty, P2mType::RamRw);
        info!("{}: log-dirty off", d.id());
        Ok(())
    }

    /// Removes every shadow leaf mapping `mfn` and, if `mfn` is a shadowed
    /// guest table, the shadow itself. Fails if it is a vCPU's root.
    pub fn remove_all_mappings(&mut self, frames: &FrameTable, d: &Domain, mfn: Mfn) -> AxResult<usize> {
        let fmt = self.format;
        let mut removed = 0;
        if let Some(&key) = self.by_gmfn.get(&mfn) {
            if self.roots.values().any(|&k| k == key) {
                return ax_err!(ResourceBusy, format!("{}: {} is a live shadow root", d.id(), mfn));
            }
            let smfn = self.shadows[&key].smfn;
            let parents: Vec<(Mfn, usize)> = self
                .shadows
                .iter()
                .filter(|(k, _)| k.1.level() == key.1.level() + 1)
                .map(|(k, s)| (s.smfn, k.1.level()))
                .collect();
            for (parent, level) in parents {
                for idx in 0..fmt.entries(level) {
                    let pte = read_entry(frames, fmt, parent, idx);
                    if pte.is_present() && pte.mfn(fmt) == smfn {
                        write_entry(frames, fmt, parent, idx, Pte::empty());
                        self.drop_entry(frames, d, level, (parent, idx), pte);
                        removed += 1;
                    }
                }
            }
        }
        let leaves: Vec<Mfn> = self
            .shadows
            .iter()
            .filter(|(k, _)| k.1.level() == 1)
            .map(|(_, s)| s.smfn)
            .collect();
        for smfn in leaves {
            for idx in 0..fmt.entries(1) {
                let pte = read_entry(frames, fmt, smfn, idx);
                if pte.is_present() && pte.mfn(fmt) == mfn {
                    write_entry(frames, fmt, smfn, idx, Pte::empty());
                    self.drop_entry(frames, d, 1, (smfn, idx), pte);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.flush = true;
        }
        Ok(removed)
    }

    /// Destroys every shadow, releasing the pins and references they hold.
    pub fn teardown(&mut self, frames: &FrameTable, d: &Domain) {
        for (_, key) in core::mem::take(&mut self.roots) {
            self.put_shadow(frames, d, key);
        }
        if !self.shadows.is_empty() {
            bug!("{}: {} shadows unreachable at teardown", d.id(), self.shadows.len());
        }
        self.oos.clear();
        self.writable.clear();
        self.dirty = None;
        self.flush = true;
        debug!("{}: shadows torn down ({:?})", d.id(), self.stats);
    }
}

impl Hypervisor {
    pub(crate) fn with_shadow<R>(&self, d: &Domain, f: impl FnOnce(&mut ShadowDomain) -> AxResult<R>) -> AxResult<R> {
        let mut guard = d.shadow.lock();
        let Some(shadow) = guard.as_mut() else {
            return ax_err!(Unsupported, format!("{} is not shadowed", d.id()));
        };
        let result = f(shadow);
        let flush = shadow.take_flush();
        drop(guard);
        if flush {
            self.flush_domain_tlbs(d);
        }
        result
    }

    /// Guest `mov cr3` on a shadowed vCPU.
    pub fn shadow_write_cr3(&self, d: &Domain, vcpu: VcpuId, cr3: u64) -> AxResult {
        let v = d.vcpu(vcpu)?;
        let root = Gpfn::new(cr3 >> PAGE_SHIFT);
        self.with_shadow(d, |s| s.update_cr3(&self.frames, d, vcpu, root))?;
        v.regs.lock().cr3 = cr3;
        Ok(())
    }

    pub fn shadow_page_fault(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        va: GuestVirtAddr,
        access: PfErrorCode,
    ) -> AxResult<FaultOutcome> {
        self.with_shadow(d, |s| s.shadow_fault(&self.frames, d, vcpu, va, access))
    }

    pub fn shadow_invlpg(&self, d: &Domain, vcpu: VcpuId, va: GuestVirtAddr) -> AxResult {
        self.with_shadow(d, |s| {
            s.invlpg(&self.frames, d, vcpu, va);
            Ok(())
        })
    }

    pub fn shadow_sync(&self, d: &Domain) -> AxResult {
        self.with_shadow(d, |s| {
            s.sync_all(&self.frames, d);
            Ok(())
        })
    }

    pub fn shadow_stats(&self, d: &Domain) -> AxResult<ShadowStats> {
        self.with_shadow(d, |s| Ok(s.stats()))
    }

    pub fn log_dirty_enable(&self, d: &Domain) -> AxResult {
        self.with_shadow(d, |s| s.log_dirty_enable(&self.frames, d))
    }

    pub fn log_dirty_clean(&self, d: &Domain) -> AxResult<Vec<Gpfn>> {
        self.with_shadow(d, |s| s.log_dirty_clean(&self.frames, d))
    }

    pub fn log_dirty_disable(&self, d: &Domain) -> AxResult {
        self.with_shadow(d, |s| s.log_dirty_disable(d))
    }

    /// Removes every shadow reference to `mfn` before it leaves `d`.
    pub(crate) fn drop_shadow_mappings(&self, d: &Domain, mfn: Mfn) -> AxResult {
        if !d.is_shadowed() {
            return Ok(());
        }
        let removed = self.with_shadow(d, |s| s.remove_all_mappings(&self.frames, d, mfn))?;
        if removed > 0 {
            trace!("{}: {} shadow mappings of {} removed", d.id(), removed, mfn);
        }
        Ok(())
    }

    /// Resolves a guest access the way the MMU would, taking shadow faults
    /// on the way. The inner error is the page fault the guest sees.
    pub fn guest_translate(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        va: GuestVirtAddr,
        access: PfErrorCode,
    ) -> AxResult<Result<Mfn, PfErrorCode>> {
        for _ in 0..MAX_FAULT_RETRIES {
            let hw = self.with_shadow(d, |s| Ok(s.hw_translate(&self.frames, vcpu, va, access)))?;
            if let Ok(mfn) = hw {
                return Ok(Ok(mfn));
            }
            match self.shadow_page_fault(d, vcpu, va, access)? {
                FaultOutcome::Fixed => {}
                FaultOutcome::Reflect(code) => {
                    d.vcpu(vcpu)?.regs.lock().cr2 = va.as_usize() as u64;
                    return Ok(Err(code));
                }
                FaultOutcome::Mmio => {
                    return ax_err!(Unsupported, format!("{}: emulated I/O at {:?}", d.id(), va));
                }
            }
        }
        ax_err!(BadState, format!("{}: shadow fault at {:?} does not resolve", d.id(), va))
    }

    fn guest_access(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        va: GuestVirtAddr,
        len: usize,
        write: bool,
        mut each: impl FnMut(Mfn, usize, core::ops::Range<usize>),
    ) -> AxResult<Result<(), PfErrorCode>> {
        let mut access = if write { PfErrorCode::WRITE } else { PfErrorCode::empty() };
        if d.vcpu(vcpu)?.regs.lock().cpl() == 3 {
            access |= PfErrorCode::USER;
        }
        let page = 1usize << PAGE_SHIFT;
        let mut done = 0;
        while done < len {
            let at = va.as_usize() + done;
            let offset = at & (page - 1);
            let n = (page - offset).min(len - done);
            match self.guest_translate(d, vcpu, GuestVirtAddr::from(at), access)? {
                Ok(mfn) => each(mfn, offset, done..done + n),
                Err(code) => return Ok(Err(code)),
            }
            done += n;
        }
        Ok(Ok(()))
    }

    /// Reads guest virtual memory of a shadowed vCPU.
    pub fn guest_read(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        va: GuestVirtAddr,
        buf: &mut [u8],
    ) -> AxResult<Result<(), PfErrorCode>> {
        let len = buf.len();
        self.guest_access(d, vcpu, va, len, false, |mfn, offset, range| {
            self.frames.read_bytes(mfn, offset, &mut buf[range]);
        })
    }

    /// Writes guest virtual memory of a shadowed vCPU.
    pub fn guest_write(
        &self,
        d: &Domain,
        vcpu: VcpuId,
        va: GuestVirtAddr,
        buf: &[u8],
    ) -> AxResult<Result<(), PfErrorCode>> {
        self.guest_access(d, vcpu, va, buf.len(), true, |mfn, offset, range| {
            self.frames.write_bytes(mfn, offset, &buf[range]);
        })
    }
}
