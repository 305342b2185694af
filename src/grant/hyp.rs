//! Hypervisor side of grant tables: mapping, unmapping and page transfer.
//!
//! Pins on an entry are counted in the granter's active table and mirrored
//! into the guest-visible header as `READING`/`WRITING`, so the granter can
//! see whether an offer is still in use. Each successful map also takes a
//! general reference on the frame, plus a writable type reference for
//! read-write maps.

use alloc::format;
use core::sync::atomic::{Ordering, fence};

use axerrno::{AxResult, ax_err, ax_err_type};
use bitflags::bitflags;

use axpv_types::{DomainId, Gpfn, GrantRef, Mfn};

use super::{GrantFlags, GrantTable, header_domid, header_flags};
use crate::domain::Domain;
use crate::hypervisor::Hypervisor;
use crate::mm::frame::{FrameOwner, PageType};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GntMapFlags: u32 {
        const DEVICE_MAP = 1;
        const HOST_MAP = 1 << 1;
        const READONLY = 1 << 2;
        const APPLICATION_MAP = 1 << 3;
        const CONTAINS_PTE = 1 << 4;
    }
}

/// Per-entry pin state, owned by the granting domain.
#[derive(Debug, Default)]
pub(super) struct ActiveGrant {
    pub pin_ro: u32,
    pub pin_rw: u32,
    pub mfn: Option<Mfn>,
    pub mapper: Option<DomainId>,
}

impl ActiveGrant {
    fn pinned(&self) -> bool {
        self.pin_ro + self.pin_rw > 0
    }
}

/// One mapping held by the mapping domain.
#[derive(Debug, Clone, Copy)]
pub(super) struct MaptrackEntry {
    granter: DomainId,
    gref: GrantRef,
    readonly: bool,
    mfn: Mfn,
}

/// Handle naming a mapping inside the mapper's maptrack table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::From, derive_more::Into)]
pub struct GrantHandle(u32);

impl GrantHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantMapping {
    pub handle: GrantHandle,
    pub mfn: Mfn,
    pub readonly: bool,
}

impl GrantTable {
    /// Sets in-use bits on an entry offered to `mapper`, bounded by the
    /// configured number of attempts.
    fn acquire_entry(&self, gref: GrantRef, mapper: DomainId, readonly: bool) -> AxResult {
        let mut set = GrantFlags::READING;
        if !readonly {
            set |= GrantFlags::WRITING;
        }
        let mut h = self.load_header(gref)?;
        for _ in 0..self.map_retries.max(1) {
            let flags = header_flags(h);
            if flags & GrantFlags::TYPE_MASK != GrantFlags::PERMIT_ACCESS
                || header_domid(h) != mapper
            {
                return ax_err!(
                    PermissionDenied,
                    format!("{}: {} not offered to {}", self.owner, gref, mapper)
                );
            }
            if !readonly && flags.contains(GrantFlags::READONLY) {
                return ax_err!(PermissionDenied, format!("{} is read-only", gref));
            }
            match self.cas_header(gref, h, h | set.bits() as u32)? {
                Ok(_) => return Ok(()),
                Err(cur) => h = cur,
            }
        }
        warn!("{}: {} header unstable while mapping", self.owner, gref);
        ax_err!(BadState, format!("{} changed during map", gref))
    }

    /// Clears in-use bits no longer backed by any pin.
    fn release_entry(&self, gref: GrantRef, act: &ActiveGrant) -> AxResult {
        let mut clear = GrantFlags::empty();
        if act.pin_rw == 0 {
            clear |= GrantFlags::WRITING;
        }
        if !act.pinned() {
            clear |= GrantFlags::READING;
        }
        if clear.is_empty() {
            return Ok(());
        }
        let mut h = self.load_header(gref)?;
        loop {
            match self.cas_header(gref, h, h & !(clear.bits() as u32))? {
                Ok(_) => return Ok(()),
                Err(cur) => h = cur,
            }
        }
    }

    fn track(&self, entry: MaptrackEntry) -> GrantHandle {
        let mut maptrack = self.maptrack.lock();
        let idx = match maptrack.iter().position(|e| e.is_none()) {
            Some(i) => {
                maptrack[i] = Some(entry);
                i
            }
            None => {
                maptrack.push(Some(entry));
                maptrack.len() - 1
            }
        };
        GrantHandle::new(idx as u32)
    }

    fn untrack(&self, handle: GrantHandle) -> AxResult<MaptrackEntry> {
        self.maptrack
            .lock()
            .get_mut(handle.raw() as usize)
            .and_then(|e| e.take())
            .ok_or_else(|| ax_err_type!(InvalidInput, format!("bad grant handle {}", handle.raw())))
    }
}

impl Hypervisor {
    fn granter(&self, mapper: &Domain, id: DomainId) -> AxResult<alloc::sync::Arc<Domain>> {
        if id == DomainId::SELF {
            self.domain(mapper.id())
        } else {
            self.domain(id)
        }
    }

    /// `GNTTABOP_map_grant_ref`: maps `gref` of `granter_id` into `mapper`.
    pub fn grant_map(
        &self,
        mapper: &Domain,
        granter_id: DomainId,
        gref: GrantRef,
        flags: GntMapFlags,
    ) -> AxResult<GrantMapping> {
        if !flags.intersects(GntMapFlags::HOST_MAP | GntMapFlags::DEVICE_MAP) {
            return ax_err!(InvalidInput, "map request names no mapping kind");
        }
        let readonly = flags.contains(GntMapFlags::READONLY);
        let granter = self.granter(mapper, granter_id)?;
        if granter.is_dying() {
            return ax_err!(BadState, format!("{} is dying", granter.id()));
        }
        let gt = &granter.grants;
        let mut active = gt.active.lock();
        let act = active
            .get_mut(gref.index())
            .ok_or_else(|| ax_err_type!(InvalidInput, format!("bad grant reference {}", gref)))?;

        let acquired = !act.pinned() || (!readonly && act.pin_rw == 0);
        if acquired {
            gt.acquire_entry(gref, mapper.id(), readonly)?;
        }
        let mfn = if act.pinned() {
            if act.mapper != Some(mapper.id()) {
                gt.release_entry(gref, act)?;
                return ax_err!(PermissionDenied, format!("{} pinned by another domain", gref));
            }
            act.mfn.unwrap_or(Mfn::INVALID)
        } else {
            // The frame is only trusted once the flags are set.
            fence(Ordering::Acquire);
            let frame = gt.load_frame(gref)?;
            granter.p2m.gpfn_to_mfn(Gpfn::new(frame as u64))
        };

        let refs_taken = !mfn.is_invalid()
            && self.frames.get_page(mfn, granter.id())
            && (readonly || {
                let typed = self.frames.get_page_type(mfn, PageType::Writable, granter.as_ref());
                if typed.is_err() {
                    self.frames.put_page(mfn);
                }
                typed.is_ok()
            });
        if !refs_taken {
            if acquired {
                gt.release_entry(gref, act)?;
            }
            return ax_err!(InvalidInput, format!("{} names no usable frame", gref));
        }

        if readonly {
            act.pin_ro += 1;
        } else {
            act.pin_rw += 1;
        }
        act.mfn = Some(mfn);
        act.mapper = Some(mapper.id());
        drop(active);

        let handle = mapper.grants.track(MaptrackEntry {
            granter: granter.id(),
            gref,
            readonly,
            mfn,
        });
        debug!(
            "{}: mapped {} of {} ({}) as handle {}",
            mapper.id(),
            gref,
            granter.id(),
            mfn,
            handle.raw()
        );
        Ok(GrantMapping {
            handle,
            mfn,
            readonly,
        })
    }

    /// `GNTTABOP_unmap_grant_ref`. The mapper's TLBs are flushed before the
    /// granter can observe the entry as idle.
    pub fn grant_unmap(&self, mapper: &Domain, handle: GrantHandle) -> AxResult {
        let entry = mapper.grants.untrack(handle)?;
        let granter = self.domain(entry.granter)?;
        self.flush_domain_tlbs(mapper);

        let gt = &granter.grants;
        let mut active = gt.active.lock();
        let act = &mut active[entry.gref.index()];
        if entry.readonly {
            act.pin_ro -= 1;
        } else {
            act.pin_rw -= 1;
            self.frames.put_page_type(entry.mfn, granter.as_ref());
        }
        self.frames.put_page(entry.mfn);
        if !act.pinned() {
            act.mfn = None;
            act.mapper = None;
        }
        gt.release_entry(entry.gref, act)?;
        debug!(
            "{}: unmapped handle {} ({} of {})",
            mapper.id(),
            handle.raw(),
            entry.gref,
            granter.id()
        );
        Ok(())
    }

    /// `GNTTABOP_setup_table`: the frames backing the first `nr_frames` of
    /// a domain's grant table.
    pub fn grant_setup_table(
        &self,
        caller: &alloc::sync::Arc<Domain>,
        dom: DomainId,
        nr_frames: usize,
    ) -> AxResult<alloc::vec::Vec<Mfn>> {
        if dom != DomainId::SELF && dom != caller.id() && !caller.is_privileged() {
            return ax_err!(PermissionDenied, "setting up a foreign grant table");
        }
        let d = self.resolve(caller, dom)?;
        let frames = d.grants.frames();
        if nr_frames > frames.len() {
            return ax_err!(
                InvalidInput,
                format!("{} grant frames requested, {} available", nr_frames, frames.len())
            );
        }
        Ok(frames[..nr_frames].to_vec())
    }

    /// `GNTTABOP_query_size`: current and maximum table frames.
    pub fn grant_query_size(
        &self,
        caller: &alloc::sync::Arc<Domain>,
        dom: DomainId,
    ) -> AxResult<(usize, usize)> {
        let d = self.resolve(caller, dom)?;
        Ok((d.grants.frames().len(), self.config.grant_frames))
    }

    /// `GNTTABOP_transfer`: gives the frame behind `gpfn` to the domain that
    /// offered `gref` for it.
    ///
    /// Either the transfer completes or the giver keeps the frame.
    pub fn grant_transfer(
        &self,
        giver: &Domain,
        gpfn: Gpfn,
        target_id: DomainId,
        gref: GrantRef,
    ) -> AxResult {
        let target = self.domain(target_id)?;
        if target.is_dying() {
            return ax_err!(BadState, format!("{} is dying", target_id));
        }
        let _guard = giver.balloon_lock.lock();
        let (mfn, ty) = giver.p2m.lookup(gpfn);
        if mfn.is_invalid() || !ty.is_ram() || self.frames.owner(mfn) != Some(giver.id()) {
            return ax_err!(InvalidInput, format!("{}: {} is not RAM it owns", giver.id(), gpfn));
        }
        self.drop_shadow_mappings(giver, mfn)?;
        self.frames.steal_page(mfn, giver.id())?;
        let restore = |err| {
            if let Err(e) = self.frames.assign_page(mfn, giver.id()) {
                bug!("{}: cannot return stolen {}: {:?}", giver.id(), mfn, e);
            }
            err
        };
        giver.p2m.remove_from_physmap(&self.m2p, gpfn).map_err(restore)?;
        let restore = |err| {
            let e = restore(err);
            if let Err(remap) = giver.p2m.add_to_physmap(&self.m2p, gpfn, mfn, ty) {
                error!("{}: cannot remap {} at {}: {:?}", giver.id(), mfn, gpfn, remap);
            }
            e
        };
        target.charge_pages(1).map_err(restore)?;

        let gt = &target.grants;
        let mut h = gt.load_header(gref).map_err(restore)?;
        loop {
            let flags = header_flags(h);
            if flags & GrantFlags::TYPE_MASK != GrantFlags::ACCEPT_TRANSFER
                || flags.contains(GrantFlags::TRANSFER_COMMITTED)
                || header_domid(h) != giver.id()
            {
                target.uncharge_pages(1);
                return Err(restore(ax_err_type!(
                    PermissionDenied,
                    format!("{}: {} does not accept a frame from {}", target_id, gref, giver.id())
                )));
            }
            let committed = h | GrantFlags::TRANSFER_COMMITTED.bits() as u32;
            match gt.cas_header(gref, h, committed) {
                Ok(Ok(_)) => {
                    h = committed;
                    break;
                }
                Ok(Err(cur)) => h = cur,
                Err(e) => {
                    target.uncharge_pages(1);
                    return Err(restore(e));
                }
            }
        }

        // Committed: nothing may fail from here on.
        giver.uncharge_pages(1);
        if let Err(e) = self.frames.assign_page(mfn, target_id) {
            bug!("{}: committed transfer of {} failed: {:?}", target_id, mfn, e);
        }
        let frame = mfn.raw() as u32;
        if gt.store_frame(gref, frame).is_err() {
            bug!("{}: {} vanished mid-transfer", target_id, gref);
        }
        fence(Ordering::Release);
        let completed = h | GrantFlags::TRANSFER_COMPLETED.bits() as u32;
        if gt.store_header(gref, completed).is_err() {
            bug!("{}: {} vanished mid-transfer", target_id, gref);
        }
        info!("{}: {} transferred to {} via {}", giver.id(), mfn, target_id, gref);
        Ok(())
    }

    /// Drops every mapping `domain` holds on other domains' grants.
    pub(crate) fn grant_release_mappings(&self, domain: &Domain) {
        let handles: alloc::vec::Vec<_> = domain
            .grants
            .maptrack
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| GrantHandle::new(i as u32))
            .collect();
        for handle in handles {
            if let Err(e) = self.grant_unmap(domain, handle) {
                warn!("{}: releasing grant handle {} failed: {:?}", domain.id(), handle.raw(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::tests::{dom, machine};
    use crate::mm::p2m::P2mType;
    use axerrno::AxError;

    #[test]
    fn read_only_map_blocks_end_until_unmap() {
        let hv = machine(alloc::vec![dom(1), dom(2)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();
        let mfn = hv.populate_physmap(&d1, Gpfn::new(0x10), 0).unwrap();

        let r = d1.grants.grant_foreign_access(d2.id(), Gpfn::new(0x10), true).unwrap();
        let rw = GntMapFlags::HOST_MAP;
        let ro = GntMapFlags::HOST_MAP | GntMapFlags::READONLY;
        assert_eq!(hv.grant_map(&d2, d1.id(), r, rw).unwrap_err(), AxError::PermissionDenied);
        assert_eq!(hv.grant_map(&d1, d1.id(), r, ro).unwrap_err(), AxError::PermissionDenied);

        let map = hv.grant_map(&d2, d1.id(), r, ro).unwrap();
        assert_eq!(map.mfn, mfn);
        assert_eq!(d1.grants.query_foreign_access(r).unwrap(), GrantFlags::READING);
        assert_eq!(hv.frames().info(mfn).general_count, 1);
        assert_eq!(d1.grants.end_foreign_access(r, true), Err(AxError::ResourceBusy));

        hv.grant_unmap(&d2, map.handle).unwrap();
        assert!(hv.grant_unmap(&d2, map.handle).is_err());
        assert!(d1.grants.query_foreign_access(r).unwrap().is_empty());
        assert_eq!(hv.frames().info(mfn).general_count, 0);
        d1.grants.end_foreign_access(r, true).unwrap();
        assert_eq!(d1.grants.grant_foreign_access(d2.id(), Gpfn::new(0x10), true).unwrap(), r);
    }

    #[test]
    fn writable_map_holds_a_type_reference() {
        let hv = machine(alloc::vec![dom(1), dom(2)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();
        let mfn = hv.populate_physmap(&d1, Gpfn::new(3), 0).unwrap();
        let r = d1.grants.grant_foreign_access(d2.id(), Gpfn::new(3), false).unwrap();

        let a = hv.grant_map(&d2, d1.id(), r, GntMapFlags::HOST_MAP).unwrap();
        let b = hv
            .grant_map(&d2, d1.id(), r, GntMapFlags::HOST_MAP | GntMapFlags::READONLY)
            .unwrap();
        let info = hv.frames().info(mfn);
        assert_eq!(info.ty, PageType::Writable);
        assert_eq!(info.type_count, 1);
        assert_eq!(info.general_count, 2);
        assert_eq!(
            d1.grants.query_foreign_access(r).unwrap(),
            GrantFlags::READING | GrantFlags::WRITING
        );
        // Cannot become a page table while writably mapped.
        assert!(hv.frames().get_page_type(mfn, PageType::L1, d1.as_ref()).is_err());

        hv.grant_unmap(&d2, a.handle).unwrap();
        assert_eq!(d1.grants.query_foreign_access(r).unwrap(), GrantFlags::READING);
        hv.grant_unmap(&d2, b.handle).unwrap();
        assert_eq!(hv.frames().info(mfn).type_count, 0);
        assert!(d1.grants.query_foreign_access(r).unwrap().is_empty());
    }

    #[test]
    fn transfer_moves_ownership() {
        let hv = machine(alloc::vec![dom(1), dom(2)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();
        let mfn = hv.populate_physmap(&d1, Gpfn::new(5), 0).unwrap();
        let r = d2.grants.grant_foreign_transfer(d1.id()).unwrap();
        let (before1, before2) = (d1.tot_pages(), d2.tot_pages());

        // Nobody offered this reference to d2.
        assert!(hv.grant_transfer(&d2, Gpfn::new(5), d1.id(), r).is_err());
        hv.grant_transfer(&d1, Gpfn::new(5), d2.id(), r).unwrap();
        assert_eq!(d1.tot_pages(), before1 - 1);
        assert_eq!(d2.tot_pages(), before2 + 1);
        assert!(d1.p2m.gpfn_to_mfn(Gpfn::new(5)).is_invalid());
        assert_eq!(hv.frames().owner(mfn), Some(d2.id()));
        // A second transfer into the same reference is refused.
        let kept = hv.populate_physmap(&d1, Gpfn::new(6), 0).unwrap();
        d1.p2m.set_type(Gpfn::new(6), P2mType::RamRo).unwrap();
        assert!(hv.grant_transfer(&d1, Gpfn::new(6), d2.id(), r).is_err());
        assert_eq!(d1.p2m.lookup(Gpfn::new(6)), (kept, P2mType::RamRo));

        assert_eq!(d2.grants.end_foreign_transfer(r).unwrap(), Some(mfn));
        hv.physmap_add(&d2, Gpfn::new(7), mfn).unwrap();
        assert_eq!(d2.p2m.gpfn_to_mfn(Gpfn::new(7)), mfn);
        assert!(hv.audit().is_empty());
    }

    #[test]
    fn busy_frame_is_not_transferred() {
        let hv = machine(alloc::vec![dom(1), dom(2)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();
        let mfn = hv.populate_physmap(&d1, Gpfn::new(5), 0).unwrap();
        assert!(hv.frames().get_page(mfn, d1.id()));
        let r = d2.grants.grant_foreign_transfer(d1.id()).unwrap();
        assert_eq!(
            hv.grant_transfer(&d1, Gpfn::new(5), d2.id(), r),
            Err(AxError::ResourceBusy)
        );
        assert_eq!(d1.p2m.gpfn_to_mfn(Gpfn::new(5)), mfn);
        assert_eq!(d2.grants.entry(r).unwrap().0, GrantFlags::ACCEPT_TRANSFER);
        hv.frames().put_page(mfn);
    }
}
