//! Machine-contiguous regions of guest RAM.
//!
//! A guest driving a DMA engine without an IOMMU needs buffers that are
//! contiguous in machine memory, not just in its own physical space. The
//! region's frames are given back one at a time, then a single extent is
//! taken from the pool and mapped at the same guest frames. Contents of the
//! region are not preserved on creation.

use alloc::format;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};

use axpv_types::{Gpfn, Mfn};

use super::heap::MAX_ORDER;
use super::p2m::P2mType;
use crate::domain::Domain;
use crate::hypervisor::Hypervisor;

impl Hypervisor {
    /// Replaces the `1 << order` frames at `gpfn` with one machine extent
    /// lying below `address_bits`.
    ///
    /// On failure every frame given back is restored at its guest frame and
    /// the domain's allocation is unchanged.
    pub fn create_contiguous_region(
        &self,
        d: &Domain,
        gpfn: Gpfn,
        order: u32,
        address_bits: Option<u32>,
    ) -> AxResult {
        let count = region_pages(gpfn, order)?;
        let _balloon = d.balloon_lock.lock();

        let mut released: Vec<(Gpfn, Mfn, P2mType)> = Vec::with_capacity(count as usize);
        for i in 0..count {
            if let Err(e) = self.give_back(d, gpfn.add(i), &mut released) {
                self.restore_released(d, &released);
                return Err(e);
            }
        }

        let base = match self.frames.alloc_domain_pages(d.id(), order, address_bits) {
            Ok(base) => base,
            Err(e) => {
                warn!(
                    "{}: no order-{} extent below {:?} bits for {}, restoring",
                    d.id(),
                    order,
                    address_bits,
                    gpfn
                );
                self.restore_released(d, &released);
                return Err(e);
            }
        };
        for (i, &(g, _, ty)) in released.iter().enumerate() {
            if let Err(e) = d.p2m.add_to_physmap(&self.m2p, g, base.add(i as u64), ty) {
                warn!("{}: mapping {} of the new region failed, restoring", d.id(), g);
                for &(mapped, _, _) in &released[..i] {
                    if let Err(e) = d.p2m.remove_from_physmap(&self.m2p, mapped) {
                        warn!("{}: unmapping {} failed: {:?}", d.id(), mapped, e);
                    }
                }
                for j in 0..count {
                    self.discard_frame(d, base.add(j));
                }
                self.restore_released(d, &released);
                return Err(e);
            }
        }
        d.set_contiguous(gpfn, count, true);
        debug!(
            "{}: {} +{} now machine-contiguous at {}",
            d.id(),
            gpfn,
            count,
            base
        );
        Ok(())
    }

    /// Turns a region made by [`Hypervisor::create_contiguous_region`] back
    /// into ordinary frames, keeping its contents.
    ///
    /// Frames are swapped one at a time. A frame that cannot be swapped
    /// stays in place and the error is returned; frames already swapped
    /// stay split, and calling again finishes the rest.
    pub fn destroy_contiguous_region(&self, d: &Domain, gpfn: Gpfn, order: u32) -> AxResult {
        let count = region_pages(gpfn, order)?;
        let _balloon = d.balloon_lock.lock();
        if (0..count).all(|i| !d.is_contiguous(gpfn.add(i))) {
            return ax_err!(
                InvalidInput,
                format!("{}: {} +{} is not a contiguous region", d.id(), gpfn, count)
            );
        }

        for i in 0..count {
            let g = gpfn.add(i);
            if !d.is_contiguous(g) {
                continue;
            }
            let (old, ty) = d.p2m.lookup(g);
            if !ty.is_ram() {
                return ax_err!(BadState, format!("{}: region frame {} unmapped", d.id(), g));
            }
            let new = self.frames.alloc_domain_pages(d.id(), 0, None)?;
            self.replace_region_frame(d, g, old, new, ty)?;
            d.set_contiguous(g, 1, false);
        }
        debug!("{}: {} +{} released as single frames", d.id(), gpfn, count);
        Ok(())
    }

    /// Moves the contents and mapping of `g` from `old` to `new`. On failure
    /// `g` still maps `old` and `new` is back in the pool.
    fn replace_region_frame(&self, d: &Domain, g: Gpfn, old: Mfn, new: Mfn, ty: P2mType) -> AxResult {
        self.frames.copy_page(new, old);
        let moved = self
            .drop_shadow_mappings(d, old)
            .and_then(|()| d.p2m.add_to_physmap(&self.m2p, g, new, ty).map(|_| ()));
        if let Err(e) = moved {
            self.discard_frame(d, new);
            return Err(e);
        }
        let Err(e) = self.frames.release_allocation(old, d.id()) else {
            return Ok(());
        };
        // Still referenced elsewhere; keep the old frame mapped.
        match d.p2m.add_to_physmap(&self.m2p, g, old, ty) {
            Ok(_) => self.discard_frame(d, new),
            Err(remap) => error!("{}: {} stays at {}, {} unmapped: {:?}", d.id(), new, g, old, remap),
        }
        Err(e)
    }

    /// Returns a frame nothing maps to the pool.
    fn discard_frame(&self, d: &Domain, mfn: Mfn) {
        if let Err(e) = self.frames.release_allocation(mfn, d.id()) {
            warn!("{}: releasing {} failed: {:?}", d.id(), mfn, e);
        }
    }

    /// Unmaps one frame of a region and returns it to the pool.
    fn give_back(
        &self,
        d: &Domain,
        gpfn: Gpfn,
        released: &mut Vec<(Gpfn, Mfn, P2mType)>,
    ) -> AxResult {
        let (mfn, ty) = d.p2m.lookup(gpfn);
        if !ty.is_ram() || self.frames.owner(mfn) != Some(d.id()) {
            return ax_err!(InvalidInput, format!("{}: {} is not domain RAM", d.id(), gpfn));
        }
        self.drop_shadow_mappings(d, mfn)?;
        d.p2m.remove_from_physmap(&self.m2p, gpfn)?;
        if let Err(e) = self.frames.release_allocation(mfn, d.id()) {
            d.p2m.add_to_physmap(&self.m2p, gpfn, mfn, ty)?;
            return Err(e);
        }
        released.push((gpfn, mfn, ty));
        Ok(())
    }

    /// Maps frames given back by [`Hypervisor::give_back`] again, the same
    /// machine frames where the pool still has them.
    fn restore_released(&self, d: &Domain, released: &[(Gpfn, Mfn, P2mType)]) {
        for &(gpfn, mfn, ty) in released {
            let mfn = match self.frames.reclaim_domain_page(d.id(), mfn) {
                Ok(()) => mfn,
                Err(_) => match self.frames.alloc_domain_pages(d.id(), 0, None) {
                    Ok(other) => {
                        warn!("{}: {} taken meanwhile, {} gets {}", d.id(), mfn, gpfn, other);
                        other
                    }
                    Err(_) => {
                        error!("{}: cannot restore {}, frame lost", d.id(), gpfn);
                        d.uncharge_pages(1);
                        continue;
                    }
                },
            };
            if d.p2m.add_to_physmap(&self.m2p, gpfn, mfn, ty).is_err() {
                error!("{}: cannot remap {} at {}", d.id(), mfn, gpfn);
            }
        }
    }
}

fn region_pages(gpfn: Gpfn, order: u32) -> AxResult<u64> {
    if order > MAX_ORDER {
        return ax_err!(InvalidInput, format!("region order {} too large", order));
    }
    let count = 1u64 << order;
    if gpfn.raw() & (count - 1) != 0 {
        return ax_err!(InvalidInput, format!("{} not aligned to order {}", gpfn, order));
    }
    Ok(count)
}
