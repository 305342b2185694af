//! `memory_op`: reservation changes, translation lists and exchange.
//!
//! Reservation commands return how many extents were completed; an extent
//! that fails ends the call without an error. The extent to resume from
//! rides in the command word above [`MEMOP_EXTENT_SHIFT`].

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::offset_of;

use axerrno::{AxError, AxResult, ax_err, ax_err_type};

use axpv_types::{DomainId, Gpfn};

use super::abi::{
    MEMOP_CMD_MASK, MEMOP_EXTENT_SHIFT, MemoryExchange, MemoryOp, MemoryReservation,
    TranslateGpfnList,
};
use super::guest::{ExtentList, GuestList, SplitList};
use super::{HyperCall, HyperCallResult, HypercallOutcome};
use crate::config::PagingKind;
use crate::domain::Domain;

pub(super) enum Stop {
    Finished,
    Preempted,
    Failed(AxError),
}

/// How far an extent loop got, as an absolute index.
pub(super) struct Progress {
    pub reached: u64,
    pub stop: Stop,
}

/// A reservation command resolved against its target domain.
pub(super) struct ReservationOp {
    pub op: MemoryOp,
    pub target: Arc<Domain>,
    pub order: u32,
    pub address_bits: Option<u32>,
}

/// Per-unit extent counts of an exchange: the side with the smaller order
/// contributes `1 << chunk` extents to each unit.
#[derive(Debug, Clone, Copy)]
pub(super) struct ExchangeGeometry {
    pub in_chunk: u32,
    pub out_chunk: u32,
}

impl ExchangeGeometry {
    pub fn new(input: &MemoryReservation, output: &MemoryReservation, nr_exchanged: u64) -> AxResult<Self> {
        let pages = |r: &MemoryReservation| {
            r.nr_extents
                .checked_shl(r.extent_order)
                .filter(|p| p >> r.extent_order == r.nr_extents)
        };
        match (pages(input), pages(output)) {
            (Some(a), Some(b)) if a == b => {}
            _ => return ax_err!(InvalidInput, "exchange lists differ in size"),
        }
        let geo = Self {
            in_chunk: output.extent_order.saturating_sub(input.extent_order),
            out_chunk: input.extent_order.saturating_sub(output.extent_order),
        };
        if nr_exchanged > input.nr_extents || nr_exchanged & ((1 << geo.in_chunk) - 1) != 0 {
            return ax_err!(
                InvalidInput,
                format!("exchange cannot resume at {}", nr_exchanged)
            );
        }
        Ok(geo)
    }

    pub fn units(&self, input: &MemoryReservation) -> u64 {
        input.nr_extents >> self.in_chunk
    }
}

fn unit_frames(list: &mut dyn ExtentList, unit: u64, chunk: u32) -> AxResult<Vec<Gpfn>> {
    (0..1u64 << chunk)
        .map(|j| list.get((unit << chunk) + j).map(Gpfn::new))
        .collect()
}

pub(super) fn memop(cmd: u64) -> AxResult<MemoryOp> {
    MemoryOp::try_from((cmd & MEMOP_CMD_MASK) as u32)
        .map_err(|raw| ax_err_type!(Unsupported, format!("memory_op {}", raw)))
}

pub(super) fn resume_cmd(op: MemoryOp, at: u64) -> u64 {
    op as u64 | (at << MEMOP_EXTENT_SHIFT)
}

impl HyperCall<'_> {
    pub(super) fn memory_op(&self, cmd: u64, arg: u64) -> HyperCallResult {
        let op = memop(cmd)?;
        let start = cmd >> MEMOP_EXTENT_SHIFT;
        match op {
            MemoryOp::IncreaseReservation
            | MemoryOp::DecreaseReservation
            | MemoryOp::PopulatePhysmap => {
                let r: MemoryReservation = self.hv.read_guest(&self.domain, arg)?;
                if r.nr_extents > u64::MAX >> MEMOP_EXTENT_SHIFT || start > r.nr_extents {
                    return ax_err!(InvalidInput, format!("extent {} of {}", start, r.nr_extents));
                }
                let rop = self.reservation_op(op, &r)?;
                let mut list = GuestList::native(self.hv, &self.domain, r.extent_start);
                let p = self.run_reservation(&rop, start, r.nr_extents, &mut list);
                match p.stop {
                    Stop::Preempted => self.continue_with(&[resume_cmd(op, p.reached), arg]),
                    _ => Ok(HypercallOutcome::Done(p.reached as i64)),
                }
            }
            MemoryOp::Exchange => self.memory_exchange(arg),
            MemoryOp::MaximumRamPage => Ok(HypercallOutcome::Done(self.hv.frames.nr_frames() as i64)),
            MemoryOp::CurrentReservation | MemoryOp::MaximumReservation => {
                let id: u16 = self.hv.read_guest(&self.domain, arg)?;
                let d = self.foreign_target(DomainId::new(id))?;
                let pages = if op == MemoryOp::CurrentReservation {
                    d.tot_pages()
                } else {
                    d.max_pages()
                };
                Ok(HypercallOutcome::Done(pages as i64))
            }
            MemoryOp::TranslateGpfnList => {
                let t: TranslateGpfnList = self.hv.read_guest(&self.domain, arg)?;
                if t.nr_gpfns > u64::MAX >> MEMOP_EXTENT_SHIFT || start > t.nr_gpfns {
                    return ax_err!(InvalidInput, format!("gpfn {} of {}", start, t.nr_gpfns));
                }
                let target = self.translate_target(t.domid)?;
                let mut list = SplitList {
                    src: GuestList::native(self.hv, &self.domain, t.gpfn_list),
                    dst: GuestList::native(self.hv, &self.domain, t.mfn_list),
                };
                let p = self.run_translate(&target, start, t.nr_gpfns, &mut list);
                match p.stop {
                    Stop::Finished => Ok(HypercallOutcome::Done(0)),
                    Stop::Preempted => self.continue_with(&[resume_cmd(op, p.reached), arg]),
                    Stop::Failed(e) => Err(e),
                }
            }
        }
    }

    pub(super) fn reservation_op(&self, op: MemoryOp, r: &MemoryReservation) -> AxResult<ReservationOp> {
        let target = self.foreign_target(DomainId::new(r.domid))?;
        if r.extent_order != 0 && !self.domain.is_privileged() {
            warn!("{}: order-{} extents need privilege", self.domain.id(), r.extent_order);
            return ax_err!(PermissionDenied);
        }
        Ok(ReservationOp {
            op,
            target,
            order: r.extent_order,
            address_bits: (r.address_bits != 0).then_some(r.address_bits),
        })
    }

    pub(super) fn translate_target(&self, domid: u16) -> AxResult<Arc<Domain>> {
        let target = self.foreign_target(DomainId::new(domid))?;
        if target.paging() == PagingKind::Paravirt {
            return ax_err!(InvalidInput, format!("{} has no translated physmap", target.id()));
        }
        Ok(target)
    }

    fn reservation_extent(&self, rop: &ReservationOp, i: u64, list: &mut dyn ExtentList) -> AxResult {
        let d = &rop.target;
        match rop.op {
            MemoryOp::IncreaseReservation => {
                let mfn = self.hv.increase_reservation(d, rop.order, rop.address_bits)?;
                if !list.is_null() {
                    list.put(i, mfn.raw())?;
                }
            }
            MemoryOp::DecreaseReservation => {
                let gpfn = Gpfn::new(list.get(i)?);
                self.hv.decrease_reservation(d, gpfn, rop.order)?;
            }
            MemoryOp::PopulatePhysmap => {
                let gpfn = Gpfn::new(list.get(i)?);
                let mfn = self.hv.populate_extent(d, gpfn, rop.order, rop.address_bits)?;
                if d.paging() == PagingKind::Paravirt {
                    list.put(i, mfn.raw())?;
                }
            }
            _ => return ax_err!(InvalidInput),
        }
        Ok(())
    }

    /// Runs extents `[start, end)` of a reservation command.
    pub(super) fn run_reservation(
        &self,
        rop: &ReservationOp,
        start: u64,
        end: u64,
        list: &mut dyn ExtentList,
    ) -> Progress {
        for i in start..end {
            if self.preempt_check(i - start) {
                return Progress {
                    reached: i,
                    stop: Stop::Preempted,
                };
            }
            if let Err(e) = self.reservation_extent(rop, i, list) {
                debug!(
                    "{}: {:?} stopped at extent {}: {:?}",
                    rop.target.id(),
                    rop.op,
                    i,
                    e
                );
                return Progress {
                    reached: i,
                    stop: Stop::Failed(e),
                };
            }
        }
        Progress {
            reached: end,
            stop: Stop::Finished,
        }
    }

    /// Translates entries `[start, end)`; unmapped frames come back as
    /// [`axpv_types::Mfn::INVALID`].
    pub(super) fn run_translate(
        &self,
        target: &Domain,
        start: u64,
        end: u64,
        list: &mut dyn ExtentList,
    ) -> Progress {
        for i in start..end {
            if self.preempt_check(i - start) {
                return Progress {
                    reached: i,
                    stop: Stop::Preempted,
                };
            }
            let res = list
                .get(i)
                .and_then(|gpfn| self.hv.translate_gpfn(target, Gpfn::new(gpfn)))
                .and_then(|mfn| list.put(i, mfn.raw()));
            if let Err(e) = res {
                return Progress {
                    reached: i,
                    stop: Stop::Failed(e),
                };
            }
        }
        Progress {
            reached: end,
            stop: Stop::Finished,
        }
    }

    pub(super) fn exchange_target(
        &self,
        input: &MemoryReservation,
        output: &MemoryReservation,
    ) -> AxResult<Arc<Domain>> {
        if input.domid != output.domid {
            return ax_err!(InvalidInput, "exchange lists name different domains");
        }
        if output.extent_order != 0 && !self.domain.is_privileged() {
            warn!("{}: order-{} outputs need privilege", self.domain.id(), output.extent_order);
            return ax_err!(PermissionDenied);
        }
        self.foreign_target(DomainId::new(input.domid))
    }

    /// Exchanges units `[start, end)`, each an all-or-nothing swap.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn run_exchange(
        &self,
        target: &Domain,
        input: &MemoryReservation,
        output: &MemoryReservation,
        geo: ExchangeGeometry,
        start: u64,
        end: u64,
        ins: &mut dyn ExtentList,
        outs: &mut dyn ExtentList,
    ) -> Progress {
        let address_bits = (output.address_bits != 0).then_some(output.address_bits);
        for unit in start..end {
            if self.preempt_check(unit - start) {
                return Progress {
                    reached: unit,
                    stop: Stop::Preempted,
                };
            }
            let res = unit_frames(ins, unit, geo.in_chunk).and_then(|inputs| {
                let outputs = unit_frames(outs, unit, geo.out_chunk)?;
                self.hv.exchange_extents(
                    target,
                    &inputs,
                    input.extent_order,
                    &outputs,
                    output.extent_order,
                    address_bits,
                )
            });
            let mfns = match res {
                Ok(mfns) => mfns,
                Err(e) => {
                    return Progress {
                        reached: unit,
                        stop: Stop::Failed(e),
                    };
                }
            };
            if target.paging() == PagingKind::Paravirt {
                for (j, mfn) in mfns.iter().enumerate() {
                    if let Err(e) = outs.put((unit << geo.out_chunk) + j as u64, mfn.raw()) {
                        return Progress {
                            reached: unit + 1,
                            stop: Stop::Failed(e),
                        };
                    }
                }
            }
        }
        Progress {
            reached: end,
            stop: Stop::Finished,
        }
    }

    fn memory_exchange(&self, arg: u64) -> HyperCallResult {
        let x: MemoryExchange = self.hv.read_guest(&self.domain, arg)?;
        let geo = ExchangeGeometry::new(&x.input, &x.output, x.nr_exchanged)?;
        let target = self.exchange_target(&x.input, &x.output)?;
        let mut ins = GuestList::native(self.hv, &self.domain, x.input.extent_start);
        let mut outs = GuestList::native(self.hv, &self.domain, x.output.extent_start);
        let p = self.run_exchange(
            &target,
            &x.input,
            &x.output,
            geo,
            x.nr_exchanged >> geo.in_chunk,
            geo.units(&x.input),
            &mut ins,
            &mut outs,
        );
        let nr_exchanged = p.reached << geo.in_chunk;
        self.hv.write_guest(
            &self.domain,
            arg + offset_of!(MemoryExchange, nr_exchanged) as u64,
            &nr_exchanged,
        )?;
        match p.stop {
            Stop::Finished => Ok(HypercallOutcome::Done(0)),
            Stop::Preempted => self.continue_with(&[MemoryOp::Exchange as u64, arg]),
            Stop::Failed(e) => Err(e),
        }
    }
}
