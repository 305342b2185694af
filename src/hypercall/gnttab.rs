//! `grant_table_op`.
//!
//! Every sub-operation takes an array of request structs. Failures of one
//! request land in its `status` field and the batch goes on; only faults
//! copying the requests themselves fail the call.

use alloc::format;
use alloc::vec::Vec;
use core::mem::size_of;

use axerrno::{AxError, AxResult, ax_err_type};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use axpv_types::{DomainId, Gpfn, GrantRef};

use super::abi::{
    CompatGnttabSetupTable, CompatGnttabTransfer, GNTST_BAD_DOMAIN, GNTST_BAD_GNTREF,
    GNTST_BAD_HANDLE, GNTST_BAD_PAGE, GNTST_BAD_VIRT_ADDR, GNTST_GENERAL_ERROR,
    GNTST_NO_DEVICE_SPACE, GNTST_OKAY, GNTST_PERMISSION_DENIED, GnttabDumpTable,
    GnttabMapGrantRef, GnttabOp, GnttabQuerySize, GnttabSetupTable, GnttabTransfer,
    GnttabUnmapGrantRef,
};
use super::guest::{ExtentList, GuestList};
use super::{HyperCall, HyperCallResult, HypercallOutcome};
use crate::config::PagingKind;
use crate::grant::{GntMapFlags, GrantHandle};

/// Status of one request; `invalid` is what a malformed argument reports.
fn status_of(res: AxResult, invalid: i16) -> i16 {
    match res {
        Ok(()) => GNTST_OKAY,
        Err(AxError::NotFound) => GNTST_BAD_DOMAIN,
        Err(AxError::InvalidInput) => invalid,
        Err(AxError::PermissionDenied) => GNTST_PERMISSION_DENIED,
        Err(AxError::NoMemory | AxError::StorageFull) => GNTST_NO_DEVICE_SPACE,
        Err(AxError::BadAddress) => GNTST_BAD_VIRT_ADDR,
        Err(_) => GNTST_GENERAL_ERROR,
    }
}

impl HyperCall<'_> {
    pub(super) fn grant_table_op(&self, cmd: u32, uop: u64, count: u64) -> HyperCallResult {
        let op = GnttabOp::try_from(cmd)
            .map_err(|raw| ax_err_type!(Unsupported, format!("grant_table_op {}", raw)))?;
        let compat = self.domain.is_compat();
        match op {
            GnttabOp::MapGrantRef => self.grant_batch(cmd, uop, count, |m: &mut GnttabMapGrantRef| {
                let flags = GntMapFlags::from_bits_truncate(m.flags);
                let res = self
                    .hv
                    .grant_map(&self.domain, DomainId::new(m.dom), GrantRef::new(m.gref), flags)
                    .map(|g| {
                        m.handle = g.handle.raw();
                        m.dev_bus_addr = g.mfn.to_addr();
                    });
                m.status = status_of(res, GNTST_BAD_GNTREF);
            }),
            GnttabOp::UnmapGrantRef => self.grant_batch(cmd, uop, count, |u: &mut GnttabUnmapGrantRef| {
                let res = self.hv.grant_unmap(&self.domain, GrantHandle::new(u.handle));
                u.status = status_of(res, GNTST_BAD_HANDLE);
            }),
            GnttabOp::SetupTable if compat => {
                self.grant_batch(cmd, uop, count, |s: &mut CompatGnttabSetupTable| {
                    let mut list = GuestList::compat(self.hv, &self.domain, s.frame_list as u64);
                    s.status = status_of(self.setup_table(s.dom, s.nr_frames, &mut list), GNTST_GENERAL_ERROR);
                })
            }
            GnttabOp::SetupTable => self.grant_batch(cmd, uop, count, |s: &mut GnttabSetupTable| {
                let mut list = GuestList::native(self.hv, &self.domain, s.frame_list);
                s.status = status_of(self.setup_table(s.dom, s.nr_frames, &mut list), GNTST_GENERAL_ERROR);
            }),
            GnttabOp::DumpTable => self.grant_batch(cmd, uop, count, |t: &mut GnttabDumpTable| {
                let res = self.foreign_target(DomainId::new(t.dom)).map(|d| d.grants.dump());
                t.status = status_of(res, GNTST_BAD_DOMAIN);
            }),
            GnttabOp::Transfer if compat => self.grant_batch(cmd, uop, count, |c: &mut CompatGnttabTransfer| {
                c.status = self.transfer(&GnttabTransfer::from(&*c));
            }),
            GnttabOp::Transfer => self.grant_batch(cmd, uop, count, |t: &mut GnttabTransfer| {
                t.status = self.transfer(t);
            }),
            GnttabOp::QuerySize => self.grant_batch(cmd, uop, count, |q: &mut GnttabQuerySize| {
                let dom = DomainId::new(q.dom);
                let res = self
                    .foreign_target(dom)
                    .and_then(|_| self.hv.grant_query_size(&self.domain, dom))
                    .map(|(nr, max)| {
                        q.nr_frames = nr as u32;
                        q.max_nr_frames = max as u32;
                    });
                q.status = status_of(res, GNTST_GENERAL_ERROR);
            }),
        }
    }

    /// Reads, applies and writes back `count` requests of type `T`.
    fn grant_batch<T>(&self, cmd: u32, uop: u64, count: u64, mut apply: impl FnMut(&mut T)) -> HyperCallResult
    where
        T: FromBytes + IntoBytes + Immutable,
    {
        let size = size_of::<T>() as u64;
        for i in 0..count {
            if self.preempt_check(i) {
                return self.continue_with(&[cmd as u64, uop + i * size, count - i]);
            }
            let at = uop + i * size;
            let mut req: T = self.hv.read_guest(&self.domain, at)?;
            apply(&mut req);
            self.hv.write_guest(&self.domain, at, &req)?;
        }
        Ok(HypercallOutcome::Done(0))
    }

    /// Reports the frames of a grant table: machine frames to paravirtual
    /// guests, the grant window of the physmap to translated ones.
    fn setup_table(&self, dom: u16, nr_frames: u32, list: &mut dyn ExtentList) -> AxResult {
        let dom = DomainId::new(dom);
        let mfns = self.hv.grant_setup_table(&self.domain, dom, nr_frames as usize)?;
        let target = self.hv.resolve(&self.domain, dom)?;
        let frames: Vec<u64> = match target.paging() {
            PagingKind::Paravirt => mfns.iter().map(|m| m.raw()).collect(),
            PagingKind::Shadow => {
                let base = target.p2m.layout().grant_base;
                (0..mfns.len() as u64).map(|i| base + i).collect()
            }
        };
        for (i, &f) in frames.iter().enumerate() {
            list.put(i as u64, f)?;
        }
        Ok(())
    }

    fn transfer(&self, t: &GnttabTransfer) -> i16 {
        let res = self.hv.grant_transfer(
            &self.domain,
            Gpfn::new(t.mfn),
            DomainId::new(t.domid),
            GrantRef::new(t.gref),
        );
        status_of(res, GNTST_BAD_PAGE)
    }
}
