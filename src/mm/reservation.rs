//! Growing, shrinking and reshaping a domain's memory reservation.
//!
//! These are the per-extent back ends of the memory hypercalls. Each takes
//! the domain's balloon lock for the whole extent, so an extent is either
//! processed completely or, on failure, left the way it was found unless the
//! operation says otherwise.

use alloc::format;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};
use hashbrown::HashSet;

use axpv_types::{Gpfn, Mfn};

use super::heap::MAX_ORDER;
use super::p2m::P2mType;
use crate::domain::Domain;
use crate::hypervisor::Hypervisor;

fn extent_pages(order: u32) -> AxResult<u64> {
    if order > MAX_ORDER {
        return ax_err!(InvalidInput, format!("extent order {} too large", order));
    }
    Ok(1u64 << order)
}

impl Hypervisor {
    /// Allocates an extent to `d` without mapping it anywhere; the guest
    /// places it with a machine-to-physical update.
    pub fn increase_reservation(
        &self,
        d: &Domain,
        order: u32,
        address_bits: Option<u32>,
    ) -> AxResult<Mfn> {
        let count = extent_pages(order)?;
        let _balloon = d.balloon_lock.lock();
        d.charge_pages(count as usize)?;
        self.frames
            .alloc_domain_pages(d.id(), order, address_bits)
            .inspect_err(|_| d.uncharge_pages(count as usize))
    }

    /// Backs the `1 << order` unmapped guest frames at `gpfn` with new RAM.
    pub fn populate_physmap(&self, d: &Domain, gpfn: Gpfn, order: u32) -> AxResult<Mfn> {
        self.populate_extent(d, gpfn, order, None)
    }

    pub(crate) fn populate_extent(
        &self,
        d: &Domain,
        gpfn: Gpfn,
        order: u32,
        address_bits: Option<u32>,
    ) -> AxResult<Mfn> {
        let count = extent_pages(order)?;
        if gpfn.raw().saturating_add(count) > d.p2m.ram_pages() {
            return ax_err!(
                InvalidInput,
                format!("{}: {} +{} outside guest RAM", d.id(), gpfn, count)
            );
        }
        let _balloon = d.balloon_lock.lock();
        if let Some(used) = (0..count)
            .map(|i| gpfn.add(i))
            .find(|&g| d.p2m.lookup(g).1 != P2mType::Invalid)
        {
            return ax_err!(AlreadyExists, format!("{}: {} already populated", d.id(), used));
        }
        d.charge_pages(count as usize)?;
        let base = self
            .frames
            .alloc_domain_pages(d.id(), order, address_bits)
            .inspect_err(|_| d.uncharge_pages(count as usize))?;
        for i in 0..count {
            if let Err(e) = self.map_new_ram(d, gpfn.add(i), base.add(i)) {
                for j in 0..i {
                    let _ = d.p2m.remove_from_physmap(&self.m2p, gpfn.add(j));
                }
                for j in 0..count {
                    let _ = self.frames.release_allocation(base.add(j), d.id());
                }
                d.uncharge_pages(count as usize);
                return Err(e);
            }
        }
        trace!("{}: populated {} +{} from {}", d.id(), gpfn, count, base);
        Ok(base)
    }

    /// Maps a frame `d` owns as ordinary RAM. Under log-dirty the page
    /// starts dirty.
    fn map_new_ram(&self, d: &Domain, gpfn: Gpfn, mfn: Mfn) -> AxResult {
        d.p2m.add_to_physmap(&self.m2p, gpfn, mfn, P2mType::RamRw)?;
        if let Some(shadow) = d.shadow.lock().as_mut() {
            shadow.mark_dirty(gpfn);
        }
        Ok(())
    }

    /// Returns the RAM behind `1 << order` guest frames at `gpfn` to the
    /// pool. Pages are released one by one; the first page that cannot be
    /// released stops the extent and stays mapped.
    pub fn decrease_reservation(&self, d: &Domain, gpfn: Gpfn, order: u32) -> AxResult {
        let count = extent_pages(order)?;
        let _balloon = d.balloon_lock.lock();
        for i in 0..count {
            self.release_ram_page(d, gpfn.add(i))?;
        }
        trace!("{}: released {} +{}", d.id(), gpfn, count);
        Ok(())
    }

    fn release_ram_page(&self, d: &Domain, gpfn: Gpfn) -> AxResult {
        let (mfn, ty) = d.p2m.lookup(gpfn);
        if !ty.is_ram() || self.frames.owner(mfn) != Some(d.id()) {
            warn!("{}: freeing {} which is not its RAM", d.id(), gpfn);
            return ax_err!(InvalidInput, format!("{}: {} is not domain RAM", d.id(), gpfn));
        }
        self.drop_shadow_mappings(d, mfn)?;
        if self.frames.info(mfn).pinned && self.frames.clear_pinned(mfn) {
            self.frames.put_page_and_type(mfn, d);
        }
        d.p2m.remove_from_physmap(&self.m2p, gpfn)?;
        if let Err(e) = self.frames.release_allocation(mfn, d.id()) {
            warn!("{}: {} at {} still in use, kept", d.id(), mfn, gpfn);
            d.p2m.add_to_physmap(&self.m2p, gpfn, mfn, ty)?;
            return Err(e);
        }
        d.set_contiguous(gpfn, 1, false);
        d.uncharge_pages(1);
        Ok(())
    }

    /// Machine-to-physical update: records that frame `mfn` of `d` lives at
    /// guest frame `gpfn`.
    pub fn physmap_add(&self, d: &Domain, gpfn: Gpfn, mfn: Mfn) -> AxResult {
        if self.frames.owner(mfn) != Some(d.id()) {
            warn!("{}: machphys update of foreign {}", d.id(), mfn);
            return ax_err!(PermissionDenied, format!("{} not owned by {}", mfn, d.id()));
        }
        let _balloon = d.balloon_lock.lock();
        self.map_new_ram(d, gpfn, mfn)
    }

    /// Translates one guest frame of a shadowed domain.
    pub fn translate_gpfn(&self, d: &Domain, gpfn: Gpfn) -> AxResult<Mfn> {
        if !d.is_shadowed() {
            return ax_err!(
                InvalidInput,
                format!("{}: frame lists are machine frames already", d.id())
            );
        }
        Ok(d.p2m.gpfn_to_mfn(gpfn))
    }

    /// Swaps the RAM behind `inputs` (extents of `in_order`) for new extents
    /// of `out_order` mapped at `outputs`, returning the new extents.
    ///
    /// All or nothing: on failure every input frame is still mapped where it
    /// was and the domain's allocation is unchanged.
    pub fn exchange_extents(
        &self,
        d: &Domain,
        inputs: &[Gpfn],
        in_order: u32,
        outputs: &[Gpfn],
        out_order: u32,
        address_bits: Option<u32>,
    ) -> AxResult<Vec<Mfn>> {
        let in_pages = extent_pages(in_order)?;
        let out_pages = extent_pages(out_order)?;
        if inputs.len() as u64 * in_pages != outputs.len() as u64 * out_pages {
            return ax_err!(InvalidInput, "exchange sizes do not match");
        }
        let _balloon = d.balloon_lock.lock();

        let mut taken: Vec<(Gpfn, Mfn)> = Vec::with_capacity((inputs.len() as u64 * in_pages) as usize);
        for &first in inputs {
            for i in 0..in_pages {
                let g = first.add(i);
                let (mfn, ty) = d.p2m.lookup(g);
                if !ty.is_ram() || self.frames.owner(mfn) != Some(d.id()) {
                    return ax_err!(InvalidInput, format!("{}: {} is not domain RAM", d.id(), g));
                }
                taken.push((g, mfn));
            }
        }
        let freed: HashSet<Gpfn> = taken.iter().map(|&(g, _)| g).collect();
        if freed.len() != taken.len() {
            return ax_err!(InvalidInput, "exchange input names a frame twice");
        }
        for &first in outputs {
            if first.raw().saturating_add(out_pages) > d.p2m.ram_pages() {
                return ax_err!(InvalidInput, format!("{}: {} outside guest RAM", d.id(), first));
            }
            for i in 0..out_pages {
                let g = first.add(i);
                if d.p2m.lookup(g).1 != P2mType::Invalid && !freed.contains(&g) {
                    return ax_err!(AlreadyExists, format!("{}: {} already populated", d.id(), g));
                }
            }
        }

        let mut stolen = 0;
        let mut failure = None;
        for &(_, mfn) in &taken {
            if let Err(e) = self
                .drop_shadow_mappings(d, mfn)
                .and_then(|_| self.frames.steal_page(mfn, d.id()))
            {
                failure = Some(e);
                break;
            }
            stolen += 1;
        }
        let mut fresh = Vec::with_capacity(outputs.len());
        if failure.is_none() {
            for _ in outputs {
                match self.frames.alloc_domain_pages(d.id(), out_order, address_bits) {
                    Ok(base) => fresh.push(base),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(e) = failure {
            for &base in &fresh {
                for i in 0..out_pages {
                    let _ = self.frames.release_allocation(base.add(i), d.id());
                }
            }
            for &(_, mfn) in &taken[..stolen] {
                if let Err(e) = self.frames.assign_page(mfn, d.id()) {
                    bug!("{}: cannot return stolen {}: {:?}", d.id(), mfn, e);
                }
            }
            warn!("{}: exchange of {} extents failed: {:?}", d.id(), inputs.len(), e);
            return Err(e);
        }

        // Everything is in hand: nothing may fail from here on.
        for &(g, mfn) in &taken {
            let _ = d.p2m.remove_from_physmap(&self.m2p, g);
            d.set_contiguous(g, 1, false);
            self.frames.free_xen_page(mfn);
        }
        for (&first, &base) in outputs.iter().zip(&fresh) {
            for i in 0..out_pages {
                if let Err(e) = self.map_new_ram(d, first.add(i), base.add(i)) {
                    bug!("{}: mapping exchanged {} failed: {:?}", d.id(), base.add(i), e);
                }
            }
        }
        debug!(
            "{}: exchanged {} order-{} for {} order-{} extents",
            d.id(),
            inputs.len(),
            in_order,
            outputs.len(),
            out_order
        );
        Ok(fresh)
    }

    /// Frames still allocated to `d` that no guest frame maps.
    pub(crate) fn unmapped_frames(&self, d: &Domain) -> Vec<Mfn> {
        (1..self.frames.nr_frames() as u64)
            .map(Mfn::new)
            .filter(|&mfn| {
                self.frames.owner(mfn) == Some(d.id())
                    && d.p2m.mfn_to_gpfn(&self.m2p, mfn).is_invalid()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use axerrno::AxError;
    use axpv_types::DomainId;

    use crate::hypervisor::tests::{dom, machine, shadow_dom};
    use crate::mm::frame::PageType;

    use super::*;

    #[test]
    fn populate_and_decrease_balance_accounts() {
        let hv = machine(vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        let free = hv.frames().heap().usage().free;

        let base = hv.populate_physmap(&d, Gpfn::new(8), 2).unwrap();
        assert_eq!(d.tot_pages(), 4);
        assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(10)), base.add(2));
        assert_eq!(
            hv.populate_physmap(&d, Gpfn::new(10), 0),
            Err(AxError::AlreadyExists)
        );
        assert_eq!(d.tot_pages(), 4);

        hv.decrease_reservation(&d, Gpfn::new(8), 1).unwrap();
        assert_eq!(d.tot_pages(), 2);
        assert_eq!(d.p2m.lookup(Gpfn::new(9)).1, P2mType::Invalid);
        assert!(hv.frames().heap().is_free(base));
        assert_eq!(
            hv.decrease_reservation(&d, Gpfn::new(8), 0),
            Err(AxError::InvalidInput)
        );
        hv.decrease_reservation(&d, Gpfn::new(10), 1).unwrap();
        assert_eq!(hv.frames().heap().usage().free, free);
        assert!(hv.audit().is_empty());
    }

    #[test]
    fn allocation_limit_is_enforced() {
        let hv = machine(vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        d.set_max_pages(3);
        assert_eq!(hv.populate_physmap(&d, Gpfn::new(0), 2), Err(AxError::NoMemory));
        assert_eq!(d.tot_pages(), 0);
        hv.populate_physmap(&d, Gpfn::new(0), 1).unwrap();
        let mfn = hv.increase_reservation(&d, 0, None).unwrap();
        assert_eq!(hv.increase_reservation(&d, 0, None), Err(AxError::NoMemory));
        assert_eq!(hv.unmapped_frames(&d), vec![mfn]);

        hv.physmap_add(&d, Gpfn::new(5), mfn).unwrap();
        assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(5)), mfn);
        assert!(hv.unmapped_frames(&d).is_empty());
    }

    #[test]
    fn referenced_page_survives_decrease() {
        let hv = machine(vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        let base = hv.populate_physmap(&d, Gpfn::new(0), 1).unwrap();
        assert!(hv.frames().get_page(base.add(1), d.id()));

        assert_eq!(
            hv.decrease_reservation(&d, Gpfn::new(0), 1),
            Err(AxError::ResourceBusy)
        );
        // The first page went, the busy one stays mapped.
        assert_eq!(d.p2m.lookup(Gpfn::new(0)).1, P2mType::Invalid);
        assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(1)), base.add(1));
        assert_eq!(d.tot_pages(), 1);
        hv.frames().put_page(base.add(1));
    }

    #[test]
    fn decrease_drops_pins() {
        let hv = machine(vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        let mfn = hv.populate_physmap(&d, Gpfn::new(3), 0).unwrap();
        hv.frames().pin_table(mfn, PageType::L1, d.as_ref()).unwrap();
        hv.decrease_reservation(&d, Gpfn::new(3), 0).unwrap();
        assert!(hv.frames().heap().is_free(mfn));
        assert_eq!(d.tot_pages(), 0);
    }

    #[test]
    fn exchange_is_all_or_nothing() {
        let hv = machine(vec![shadow_dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        let before: Vec<Mfn> = (0..4)
            .map(|g| hv.populate_physmap(&d, Gpfn::new(g), 0).unwrap())
            .collect();
        let inputs: Vec<Gpfn> = (0..4).map(Gpfn::new).collect();

        // Second input frame is busy: nothing moves.
        assert!(hv.frames().get_page(before[1], d.id()));
        assert_eq!(
            hv.exchange_extents(&d, &inputs, 0, &[Gpfn::new(0)], 2, None),
            Err(AxError::ResourceBusy)
        );
        for (g, &mfn) in before.iter().enumerate() {
            assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(g as u64)), mfn);
            assert_eq!(hv.frames().owner(mfn), Some(d.id()));
        }
        hv.frames().put_page(before[1]);

        assert_eq!(
            hv.exchange_extents(&d, &inputs, 0, &[Gpfn::new(0)], 1, None),
            Err(AxError::InvalidInput)
        );

        let out = hv
            .exchange_extents(&d, &inputs, 0, &[Gpfn::new(0)], 2, None)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].raw() % 4, 0);
        for g in 0..4 {
            assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(g)), out[0].add(g));
        }
        assert_eq!(d.tot_pages(), 4);
        assert!(before.iter().all(|&m| hv.frames().heap().is_free(m)));
        assert!(hv.audit().is_empty());
    }

    #[test]
    fn exchange_refuses_mapped_targets() {
        let hv = machine(vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        hv.populate_physmap(&d, Gpfn::new(0), 0).unwrap();
        hv.populate_physmap(&d, Gpfn::new(1), 0).unwrap();
        assert_eq!(
            hv.exchange_extents(&d, &[Gpfn::new(0)], 0, &[Gpfn::new(1)], 0, None),
            Err(AxError::AlreadyExists)
        );
        assert_eq!(
            hv.exchange_extents(&d, &[Gpfn::new(0), Gpfn::new(0)], 0, &[Gpfn::new(4), Gpfn::new(5)], 0, None),
            Err(AxError::InvalidInput)
        );
        let old = d.p2m.gpfn_to_mfn(Gpfn::new(0));
        let out = hv
            .exchange_extents(&d, &[Gpfn::new(0)], 0, &[Gpfn::new(7)], 0, None)
            .unwrap();
        assert_ne!(out[0], old);
        assert_eq!(d.p2m.lookup(Gpfn::new(0)).1, P2mType::Invalid);
        assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(7)), out[0]);
    }
}
