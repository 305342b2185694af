//! 32-bit guests on the 64-bit core.
//!
//! Compat argument blocks are widened field by field. Extent lists are
//! staged as 64-bit values in the vCPU's translation area and processed a
//! chunk at a time by the native loops; results are narrowed back into the
//! guest's list after each chunk. Between chunks a pending preemption turns
//! into a continuation.

use alloc::format;
use core::mem::offset_of;

use axerrno::ax_err;

use super::abi::{
    CompatMemoryExchange, CompatMemoryReservation, CompatTranslateGpfnList, MEMOP_EXTENT_SHIFT,
    MemoryOp, MemoryReservation,
};
use super::guest::{ExtentList, GuestList, StagedList};
use super::memory::{ExchangeGeometry, Stop, memop, resume_cmd};
use super::{HyperCall, HyperCallResult, HypercallOutcome};

/// Largest extent count whose resume point still fits the 32-bit command.
const COMPAT_MAX_EXTENTS: u64 = (u32::MAX >> MEMOP_EXTENT_SHIFT) as u64;

impl HyperCall<'_> {
    pub(super) fn compat_memory_op(&self, cmd: u64, arg: u64) -> HyperCallResult {
        let op = memop(cmd)?;
        let start = cmd >> MEMOP_EXTENT_SHIFT;
        match op {
            MemoryOp::IncreaseReservation
            | MemoryOp::DecreaseReservation
            | MemoryOp::PopulatePhysmap => self.compat_reservation(op, start, arg),
            MemoryOp::Exchange => self.compat_exchange(arg),
            MemoryOp::TranslateGpfnList => self.compat_translate(start, arg),
            // Domain ids and plain counts read the same in both layouts.
            MemoryOp::MaximumRamPage
            | MemoryOp::CurrentReservation
            | MemoryOp::MaximumReservation => self.memory_op(cmd, arg),
        }
    }

    fn compat_continue(&self, op: MemoryOp, at: u64, arg: u64) -> HyperCallResult {
        self.continue_with(&[resume_cmd(op, at), arg])
    }

    fn compat_reservation(&self, op: MemoryOp, mut start: u64, arg: u64) -> HyperCallResult {
        let c: CompatMemoryReservation = self.hv.read_guest(&self.domain, arg)?;
        let nr = c.nr_extents as u64;
        if nr > COMPAT_MAX_EXTENTS || start > nr {
            return ax_err!(InvalidInput, format!("extent {} of {}", start, nr));
        }
        let r = MemoryReservation::from(&c);
        let rop = self.reservation_op(op, &r)?;
        let mut guest = GuestList::compat(self.hv, &self.domain, c.extent_start as u64);
        if guest.is_null() {
            let p = self.run_reservation(&rop, start, nr, &mut guest);
            return match p.stop {
                Stop::Preempted => self.compat_continue(op, p.reached, arg),
                _ => Ok(HypercallOutcome::Done(p.reached as i64)),
            };
        }

        let mut xlat = self.vcpu.xlat.lock();
        loop {
            let mut staged = StagedList::new(&mut xlat[..], start);
            let mut end = (start + staged.capacity()).min(nr);
            let mut short = false;
            if op != MemoryOp::IncreaseReservation {
                for i in start..end {
                    match guest.get(i) {
                        Ok(v) => staged.put(i, v)?,
                        Err(_) => {
                            end = i;
                            short = true;
                            break;
                        }
                    }
                }
            }
            let p = self.run_reservation(&rop, start, end, &mut staged);
            if op != MemoryOp::DecreaseReservation {
                for i in start..p.reached {
                    if guest.put(i, staged.get(i)?).is_err() {
                        return match p.stop {
                            Stop::Preempted => self.compat_continue(op, i, arg),
                            _ => Ok(HypercallOutcome::Done(i as i64)),
                        };
                    }
                }
            }
            match p.stop {
                Stop::Preempted => return self.compat_continue(op, p.reached, arg),
                Stop::Failed(_) => return Ok(HypercallOutcome::Done(p.reached as i64)),
                Stop::Finished if short || end == nr => return Ok(HypercallOutcome::Done(end as i64)),
                Stop::Finished => {}
            }
            start = end;
            if self.vcpu.preempt_pending() {
                return self.compat_continue(op, start, arg);
            }
        }
    }

    fn compat_exchange(&self, arg: u64) -> HyperCallResult {
        let mut c: CompatMemoryExchange = self.hv.read_guest(&self.domain, arg)?;
        let input = MemoryReservation::from(&c.input);
        let output = MemoryReservation::from(&c.output);
        let geo = ExchangeGeometry::new(&input, &output, c.nr_exchanged as u64)?;
        let target = self.exchange_target(&input, &output)?;
        let mut ins_guest = GuestList::compat(self.hv, &self.domain, input.extent_start);
        let mut outs_guest = GuestList::compat(self.hv, &self.domain, output.extent_start);

        let mut xlat = self.vcpu.xlat.lock();
        let per_unit = (1u64 << geo.in_chunk) + (1u64 << geo.out_chunk);
        let units_per_chunk = (xlat.len() as u64 / 8) / per_unit;
        if units_per_chunk == 0 {
            warn!(
                "{}: order {}/{} exchange does not fit the translation area",
                self.domain.id(),
                input.extent_order,
                output.extent_order
            );
            return ax_err!(InvalidInput);
        }
        let total = geo.units(&input);
        let mut unit = c.nr_exchanged as u64 >> geo.in_chunk;
        loop {
            let end = (unit + units_per_chunk).min(total);
            let (a, b) = xlat.split_at_mut(((units_per_chunk << geo.in_chunk) * 8) as usize);
            let mut ins = StagedList::new(a, unit << geo.in_chunk);
            let mut outs = StagedList::new(b, unit << geo.out_chunk);
            for e in (unit << geo.in_chunk)..(end << geo.in_chunk) {
                ins.put(e, ins_guest.get(e)?)?;
            }
            for e in (unit << geo.out_chunk)..(end << geo.out_chunk) {
                outs.put(e, outs_guest.get(e)?)?;
            }
            let p = self.run_exchange(&target, &input, &output, geo, unit, end, &mut ins, &mut outs);
            for e in (unit << geo.out_chunk)..(p.reached << geo.out_chunk) {
                if let Err(err) = outs.get(e).and_then(|v| outs_guest.put(e, v)) {
                    debug!("{}: exchange output {} not written back: {:?}", self.domain.id(), e, err);
                }
            }
            c.nr_exchanged = (p.reached << geo.in_chunk) as u32;
            self.hv.write_guest(
                &self.domain,
                arg + offset_of!(CompatMemoryExchange, nr_exchanged) as u64,
                &c.nr_exchanged,
            )?;
            match p.stop {
                Stop::Preempted => return self.continue_with(&[MemoryOp::Exchange as u64, arg]),
                Stop::Failed(e) => return Err(e),
                Stop::Finished if end == total => return Ok(HypercallOutcome::Done(0)),
                Stop::Finished => {}
            }
            unit = end;
            if self.vcpu.preempt_pending() {
                return self.continue_with(&[MemoryOp::Exchange as u64, arg]);
            }
        }
    }

    fn compat_translate(&self, mut start: u64, arg: u64) -> HyperCallResult {
        let c: CompatTranslateGpfnList = self.hv.read_guest(&self.domain, arg)?;
        let nr = c.nr_gpfns as u64;
        if nr > COMPAT_MAX_EXTENTS || start > nr {
            return ax_err!(InvalidInput, format!("gpfn {} of {}", start, nr));
        }
        let target = self.translate_target(c.domid)?;
        let mut gpfns = GuestList::compat(self.hv, &self.domain, c.gpfn_list as u64);
        let mut mfns = GuestList::compat(self.hv, &self.domain, c.mfn_list as u64);

        let mut xlat = self.vcpu.xlat.lock();
        loop {
            // Translated in place: each staged gpfn is replaced by its frame.
            let mut staged = StagedList::new(&mut xlat[..], start);
            let end = (start + staged.capacity()).min(nr);
            for i in start..end {
                staged.put(i, gpfns.get(i)?)?;
            }
            let p = self.run_translate(&target, start, end, &mut staged);
            for i in start..p.reached {
                mfns.put(i, staged.get(i)?)?;
            }
            match p.stop {
                Stop::Preempted => return self.compat_continue(MemoryOp::TranslateGpfnList, p.reached, arg),
                Stop::Failed(e) => return Err(e),
                Stop::Finished if end == nr => return Ok(HypercallOutcome::Done(0)),
                Stop::Finished => {}
            }
            start = end;
            if self.vcpu.preempt_pending() {
                return self.compat_continue(MemoryOp::TranslateGpfnList, start, arg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, PvConfig};
    use crate::error::guest_errno;
    use crate::hypercall::HyperCallCode;
    use crate::hypercall::tests::{V0, call, call_to_end, scratch};
    use crate::hypervisor::Hypervisor;
    use axerrno::AxError;
    use axpv_types::{DomainId, Gpfn, Mfn};

    const ARG: u64 = 0x1000;
    const LIST: u64 = 0x2000;
    const LIST2: u64 = 0x3000;

    /// A machine whose compat guests stage 8 extents at a time.
    fn compat_machine(extra: DomainConfig) -> Hypervisor {
        Hypervisor::new(PvConfig {
            machine_frames: 1024,
            compat_xlat_size: 64,
            preempt_batch: 64,
            domains: alloc::vec![
                DomainConfig {
                    compat: true,
                    ..crate::hypervisor::tests::dom(1)
                },
                extra,
            ],
            ..Default::default()
        })
        .unwrap()
    }

    fn write_u32s(hv: &Hypervisor, d: &crate::domain::Domain, at: u64, vals: &[u32]) {
        for (i, v) in vals.iter().enumerate() {
            hv.write_guest(d, at + i as u64 * 4, v).unwrap();
        }
    }

    fn read_u32s(hv: &Hypervisor, d: &crate::domain::Domain, at: u64, n: u64) -> alloc::vec::Vec<u32> {
        (0..n).map(|i| hv.read_guest::<u32>(d, at + i * 4).unwrap()).collect()
    }

    #[test]
    fn populate_is_chunked_through_the_translation_area() {
        let hv = compat_machine(crate::hypervisor::tests::dom(2));
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 2);
        let gpfns: alloc::vec::Vec<u32> = (100..110).collect();
        write_u32s(&hv, &d, LIST, &gpfns);
        hv.write_guest(
            &d,
            ARG,
            &CompatMemoryReservation {
                extent_start: LIST as u32,
                nr_extents: 10,
                domid: DomainId::SELF.raw(),
                ..Default::default()
            },
        )
        .unwrap();
        let cmd = MemoryOp::PopulatePhysmap as u64;
        assert_eq!(call(&hv, &d, HyperCallCode::MemoryOp, &[cmd, ARG]), HypercallOutcome::Done(10));
        let mfns = read_u32s(&hv, &d, LIST, 10);
        for (g, mfn) in (100..110).zip(mfns) {
            assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(g)), Mfn::new(mfn as u64));
        }
    }

    #[test]
    fn preemption_between_chunks_continues() {
        let hv = compat_machine(crate::hypervisor::tests::dom(2));
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 2);
        let gpfns: alloc::vec::Vec<u32> = (100..112).collect();
        for &g in &gpfns {
            hv.populate_physmap(&d, Gpfn::new(g as u64), 0).unwrap();
        }
        write_u32s(&hv, &d, LIST, &gpfns);
        hv.write_guest(
            &d,
            ARG,
            &CompatMemoryReservation {
                extent_start: LIST as u32,
                nr_extents: 12,
                domid: DomainId::SELF.raw(),
                ..Default::default()
            },
        )
        .unwrap();
        let before = d.tot_pages();
        d.vcpu(V0).unwrap().set_preempt_pending(true);
        let cmd = MemoryOp::DecreaseReservation as u64;
        let resume = cmd | 8 << MEMOP_EXTENT_SHIFT;
        assert_eq!(
            call(&hv, &d, HyperCallCode::MemoryOp, &[cmd, ARG]),
            HypercallOutcome::Continuation {
                code: HyperCallCode::MemoryOp,
                args: [resume, ARG, 0, 0, 0, 0],
            }
        );
        assert_eq!(d.tot_pages(), before - 8);
        assert_eq!(call_to_end(&hv, &d, HyperCallCode::MemoryOp, &[resume, ARG]), (12, 0));
        assert_eq!(d.tot_pages(), before - 12);
    }

    #[test]
    fn unreadable_list_ends_the_call_early() {
        let hv = compat_machine(crate::hypervisor::tests::dom(2));
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 2);
        // The list runs off the end of guest RAM after two entries.
        let at = 3 * 0x1000 - 8;
        hv.write_guest(&d, at, &[120u32, 121u32]).unwrap();
        hv.write_guest(
            &d,
            ARG,
            &CompatMemoryReservation {
                extent_start: at as u32,
                nr_extents: 3,
                domid: DomainId::SELF.raw(),
                ..Default::default()
            },
        )
        .unwrap();
        let cmd = MemoryOp::PopulatePhysmap as u64;
        assert_eq!(call(&hv, &d, HyperCallCode::MemoryOp, &[cmd, ARG]), HypercallOutcome::Done(2));
        assert!(!d.p2m.gpfn_to_mfn(Gpfn::new(121)).is_invalid());
    }

    #[test]
    fn compat_exchange_and_translate() {
        let hv = compat_machine(DomainConfig {
            compat: true,
            paging: crate::config::PagingKind::Shadow,
            ..crate::hypervisor::tests::dom(2)
        });
        let d = hv.domain(DomainId::new(2)).unwrap();
        scratch(&hv, &d, 3);
        for g in 70..76 {
            hv.populate_physmap(&d, Gpfn::new(g), 0).unwrap();
        }
        write_u32s(&hv, &d, LIST, &[70, 71, 72, 73, 74, 75]);
        write_u32s(&hv, &d, LIST2, &[80, 81, 82, 83, 84, 85]);
        let rsv = |list: u64| CompatMemoryReservation {
            extent_start: list as u32,
            nr_extents: 6,
            domid: DomainId::SELF.raw(),
            ..Default::default()
        };
        hv.write_guest(
            &d,
            ARG,
            &CompatMemoryExchange {
                input: rsv(LIST),
                output: rsv(LIST2),
                nr_exchanged: 0,
            },
        )
        .unwrap();
        let before = d.tot_pages();
        let cmd = MemoryOp::Exchange as u64;
        // Four units fit the area at a time, so two chunks run.
        assert_eq!(call(&hv, &d, HyperCallCode::MemoryOp, &[cmd, ARG]), HypercallOutcome::Done(0));
        let back: CompatMemoryExchange = hv.read_guest(&d, ARG).unwrap();
        assert_eq!(back.nr_exchanged, 6);
        assert_eq!(d.tot_pages(), before);
        for g in 70..76 {
            assert!(d.p2m.gpfn_to_mfn(Gpfn::new(g)).is_invalid());
            assert!(!d.p2m.gpfn_to_mfn(Gpfn::new(g + 10)).is_invalid());
        }
        // Translated guests keep their gpfns in the output list.
        assert_eq!(read_u32s(&hv, &d, LIST2, 6), [80, 81, 82, 83, 84, 85]);

        write_u32s(&hv, &d, LIST, &[80, 81, 82, 83, 84, 70]);
        hv.write_guest(
            &d,
            ARG,
            &CompatTranslateGpfnList {
                domid: DomainId::SELF.raw(),
                nr_gpfns: 6,
                gpfn_list: LIST as u32,
                mfn_list: LIST2 as u32,
                ..Default::default()
            },
        )
        .unwrap();
        let cmd = MemoryOp::TranslateGpfnList as u64;
        assert_eq!(call(&hv, &d, HyperCallCode::MemoryOp, &[cmd, ARG]), HypercallOutcome::Done(0));
        let mfns = read_u32s(&hv, &d, LIST2, 6);
        for (i, g) in (80..85).enumerate() {
            assert_eq!(Mfn::new(mfns[i] as u64), d.p2m.gpfn_to_mfn(Gpfn::new(g)));
        }
        assert_eq!(mfns[5], u32::MAX);

        let big = CompatTranslateGpfnList {
            nr_gpfns: u32::MAX,
            ..Default::default()
        };
        hv.write_guest(&d, ARG, &big).unwrap();
        assert_eq!(
            call(&hv, &d, HyperCallCode::MemoryOp, &[cmd, ARG]),
            HypercallOutcome::Done(guest_errno(AxError::InvalidInput))
        );
    }
}
