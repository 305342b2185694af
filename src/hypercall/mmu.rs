//! `mmu_update` and `mmuext_op`.
//!
//! Both take a request array, a count and an optional done counter. A
//! preempted batch continues with the count reduced and
//! [`MMU_UPDATE_PREEMPTED`] set; the done counter keeps accumulating across
//! continuations.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use axerrno::{AxResult, ax_err, ax_err_type};
use bit_field::BitField;
use zerocopy::{FromBytes, IntoBytes};

use axpv_types::{DomainId, GuestVirtAddr, Gpfn, Mfn, PAGE_SHIFT};

use super::abi::{
    CompatMmuextOp, MMU_MACHPHYS_UPDATE, MMU_NORMAL_PT_UPDATE, MMU_UPDATE_PREEMPTED, MmuUpdate,
    MmuextCmd, MmuextOp,
};
use super::memory::{Progress, Stop};
use super::{HyperCall, HyperCallResult, HypercallOutcome};
use crate::domain::{Domain, Vcpu};
use crate::mm::frame::PageType;
use crate::mm::tlb::CpuMask;

/// A request batch after any earlier continuation has been folded in.
struct Batch {
    base: u64,
    stride: u64,
    count: u64,
    done: u32,
    pdone: u64,
    foreigndom: u16,
}

impl HyperCall<'_> {
    fn batch(&self, base: u64, stride: usize, count: u64, pdone: u64, foreigndom: u16) -> AxResult<Batch> {
        let mut done = 0;
        if count & MMU_UPDATE_PREEMPTED != 0 && pdone != 0 {
            done = self.hv.read_guest::<u32>(&self.domain, pdone)?;
        }
        Ok(Batch {
            base,
            stride: stride as u64,
            count: count & !MMU_UPDATE_PREEMPTED,
            done,
            pdone,
            foreigndom,
        })
    }

    fn finish_batch(&self, b: &Batch, p: Progress) -> HyperCallResult {
        if b.pdone != 0 {
            let done = b.done.wrapping_add(p.reached as u32);
            self.hv.write_guest(&self.domain, b.pdone, &done)?;
        }
        match p.stop {
            Stop::Finished => Ok(HypercallOutcome::Done(0)),
            Stop::Preempted => self.continue_with(&[
                b.base + p.reached * b.stride,
                (b.count - p.reached) | MMU_UPDATE_PREEMPTED,
                b.pdone,
                b.foreigndom as u64,
            ]),
            Stop::Failed(e) => Err(e),
        }
    }

    pub(super) fn mmu_update(&self, ureqs: u64, count: u64, pdone: u64, foreigndom: u16) -> HyperCallResult {
        let b = self.batch(ureqs, size_of::<MmuUpdate>(), count, pdone, foreigndom)?;
        let target = self.foreign_target(DomainId::new(foreigndom))?;
        let mut flush = false;
        let mut p = Progress {
            reached: b.count,
            stop: Stop::Finished,
        };
        for i in 0..b.count {
            if self.preempt_check(i) {
                p = Progress {
                    reached: i,
                    stop: Stop::Preempted,
                };
                break;
            }
            let res = self
                .hv
                .read_guest::<MmuUpdate>(&self.domain, ureqs + i * b.stride)
                .and_then(|req| self.mmu_update_one(&target, &req, &mut flush));
            if let Err(e) = res {
                debug!("{}: mmu_update {} failed: {:?}", self.domain.id(), i, e);
                p = Progress {
                    reached: i,
                    stop: Stop::Failed(e),
                };
                break;
            }
        }
        if flush {
            self.hv.flush_domain_tlbs(&target);
        }
        self.finish_batch(&b, p)
    }

    fn mmu_update_one(&self, target: &Domain, req: &MmuUpdate, flush: &mut bool) -> AxResult {
        let addr = req.ptr & !7;
        match req.ptr & 7 {
            MMU_NORMAL_PT_UPDATE => {
                if target.is_shadowed() {
                    return ax_err!(Unsupported, format!("{} has no machine page tables", target.id()));
                }
                let mfn = Mfn::from_addr(addr);
                if self.hv.frames.owner(mfn) != Some(target.id()) {
                    return ax_err!(PermissionDenied, format!("{} not owned by {}", mfn, target.id()));
                }
                let idx = ((addr & 0xfff) / 8) as usize;
                self.hv.frames.update_table_entry(mfn, idx, req.val, target)?;
                *flush = true;
                Ok(())
            }
            MMU_MACHPHYS_UPDATE => self.hv.physmap_add(target, Gpfn::new(req.val), Mfn::from_addr(addr)),
            cmd => ax_err!(InvalidInput, format!("mmu_update command {}", cmd)),
        }
    }

    pub(super) fn mmuext_op(&self, uops: u64, count: u64, pdone: u64, foreigndom: u16) -> HyperCallResult {
        let b = self.batch(uops, size_of::<MmuextOp>(), count, pdone, foreigndom)?;
        let target = self.foreign_target(DomainId::new(foreigndom))?;
        let mut fetch = |i: u64| self.hv.read_guest::<MmuextOp>(&self.domain, uops + i * b.stride);
        let p = self.run_mmuext(&target, 0, b.count, &mut fetch);
        self.finish_batch(&b, p)
    }

    /// Compat requests are widened into the translation area a chunk at a
    /// time.
    pub(super) fn compat_mmuext_op(&self, uops: u64, count: u64, pdone: u64, foreigndom: u16) -> HyperCallResult {
        let b = self.batch(uops, size_of::<CompatMmuextOp>(), count, pdone, foreigndom)?;
        let target = self.foreign_target(DomainId::new(foreigndom))?;
        let native = size_of::<MmuextOp>();
        let mut xlat = self.vcpu.xlat.lock();
        let cap = (xlat.len() / native) as u64;
        if cap == 0 {
            return ax_err!(InvalidInput, "translation area holds no mmuext request");
        }
        let mut p = Progress {
            reached: 0,
            stop: Stop::Finished,
        };
        while p.reached < b.count {
            if p.reached > 0 && self.vcpu.preempt_pending() {
                p.stop = Stop::Preempted;
                break;
            }
            let first = p.reached;
            let end = (first + cap).min(b.count);
            let staged = (first..end).try_for_each(|i| -> AxResult {
                let c: CompatMmuextOp = self.hv.read_guest(&self.domain, uops + i * b.stride)?;
                let off = (i - first) as usize * native;
                xlat[off..off + native].copy_from_slice(MmuextOp::from(&c).as_bytes());
                Ok(())
            });
            if let Err(e) = staged {
                p.stop = Stop::Failed(e);
                break;
            }
            let area = &xlat[..];
            let mut fetch = |i: u64| {
                let off = (i - first) as usize * native;
                MmuextOp::read_from_bytes(&area[off..off + native])
                    .map_err(|_| ax_err_type!(BadState, "staged mmuext request"))
            };
            p = self.run_mmuext(&target, first, end, &mut fetch);
            if !matches!(p.stop, Stop::Finished) {
                break;
            }
        }
        drop(xlat);
        self.finish_batch(&b, p)
    }

    fn run_mmuext(
        &self,
        target: &Arc<Domain>,
        start: u64,
        end: u64,
        fetch: &mut dyn FnMut(u64) -> AxResult<MmuextOp>,
    ) -> Progress {
        for i in start..end {
            if self.preempt_check(i - start) {
                return Progress {
                    reached: i,
                    stop: Stop::Preempted,
                };
            }
            if let Err(e) = fetch(i).and_then(|op| self.mmuext_one(target, &op)) {
                debug!("{}: mmuext_op {} failed: {:?}", self.domain.id(), i, e);
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

    fn mmuext_one(&self, target: &Arc<Domain>, op: &MmuextOp) -> AxResult {
        let cmd = MmuextCmd::try_from(op.cmd)
            .map_err(|raw| ax_err_type!(InvalidInput, format!("mmuext command {}", raw)))?;
        let tlb = self.hv.frames.tlb();
        let mfn = Mfn::new(op.arg1);
        match cmd {
            MmuextCmd::PinL1Table
            | MmuextCmd::PinL2Table
            | MmuextCmd::PinL3Table
            | MmuextCmd::PinL4Table => {
                Self::needs_machine_tables(target)?;
                let ty = PageType::table(cmd as usize + 1).ok_or_else(|| ax_err_type!(InvalidInput))?;
                self.hv.frames.pin_table(mfn, ty, &**target)
            }
            MmuextCmd::UnpinTable => {
                Self::needs_machine_tables(target)?;
                self.hv.frames.unpin_table(mfn, &**target)
            }
            MmuextCmd::NewBaseptr => self.new_baseptr(target, op.arg1),
            MmuextCmd::TlbFlushLocal => {
                tlb.flush_local(self.vcpu.processor());
                Ok(())
            }
            MmuextCmd::InvlpgLocal => {
                self.invlpg(&self.vcpu, op.arg1)?;
                tlb.flush_local(self.vcpu.processor());
                Ok(())
            }
            MmuextCmd::TlbFlushMulti | MmuextCmd::InvlpgMulti => {
                let vcpus = self.selected_vcpus(op.arg2)?;
                let mut mask = CpuMask::empty();
                for v in &vcpus {
                    if cmd == MmuextCmd::InvlpgMulti {
                        self.invlpg(v, op.arg1)?;
                    }
                    mask.set(v.processor());
                }
                tlb.flush_mask(mask);
                Ok(())
            }
            MmuextCmd::TlbFlushAll | MmuextCmd::InvlpgAll => {
                if cmd == MmuextCmd::InvlpgAll {
                    for v in self.domain.vcpus() {
                        self.invlpg(v, op.arg1)?;
                    }
                }
                self.hv.flush_domain_tlbs(&self.domain);
                Ok(())
            }
            MmuextCmd::FlushCache => {
                if !self.domain.is_privileged() {
                    return ax_err!(PermissionDenied, "cache flush needs privilege");
                }
                trace!("{}: cache flush", self.domain.id());
                Ok(())
            }
        }
    }

    fn needs_machine_tables(target: &Domain) -> AxResult {
        if target.is_shadowed() {
            return ax_err!(Unsupported, format!("{} has no machine page tables", target.id()));
        }
        Ok(())
    }

    /// Installs a new base table for the calling vCPU: a machine frame for
    /// paravirtual guests, a guest frame for shadowed ones.
    fn new_baseptr(&self, target: &Arc<Domain>, frame: u64) -> AxResult {
        if !Arc::ptr_eq(target, &self.domain) {
            return ax_err!(InvalidInput, "base pointer of a foreign domain");
        }
        if self.domain.is_shadowed() {
            return self
                .hv
                .shadow_write_cr3(&self.domain, self.vcpu.id(), frame << PAGE_SHIFT);
        }
        let mfn = Mfn::new(frame);
        self.hv
            .frames
            .get_page_and_type(mfn, PageType::L4, &*self.domain)?;
        if let Some(old) = self.vcpu.swap_guest_table(Some(mfn)) {
            self.hv.frames.put_page_and_type(old, &*self.domain);
        }
        self.hv.frames.tlb().flush_local(self.vcpu.processor());
        Ok(())
    }

    fn invlpg(&self, v: &Vcpu, va: u64) -> AxResult {
        if !self.domain.is_shadowed() {
            return Ok(());
        }
        self.hv
            .shadow_invlpg(&self.domain, v.id(), GuestVirtAddr::from(va as usize))
    }

    /// vCPUs of the caller named by the 64-bit mask at `gpa`.
    fn selected_vcpus(&self, gpa: u64) -> AxResult<Vec<Arc<Vcpu>>> {
        let bits: u64 = self.hv.read_guest(&self.domain, gpa)?;
        Ok(self
            .domain
            .vcpus()
            .iter()
            .filter(|v| v.id().index() < 64 && bits.get_bit(v.id().index()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, PvConfig};
    use crate::error::guest_errno;
    use crate::hypercall::HyperCallCode;
    use crate::hypercall::tests::{V0, call, scratch};
    use crate::hypervisor::Hypervisor;
    use crate::hypervisor::tests::{dom, machine};
    use crate::paging::{Pte, PteFlags};
    use axerrno::{AxError, LinuxError};

    const ARG: u64 = 0x1000;
    const DONE: u64 = 0x1800;
    const SELF: u64 = DomainId::SELF.raw() as u64;

    fn table(hv: &Hypervisor, d: &Domain, gpfn: u64) -> Mfn {
        hv.populate_physmap(d, Gpfn::new(gpfn), 0).unwrap();
        let mfn = d.p2m.gpfn_to_mfn(Gpfn::new(gpfn));
        hv.frames().clear_page(mfn);
        mfn
    }

    fn ext(cmd: MmuextCmd, arg1: u64) -> MmuextOp {
        MmuextOp {
            cmd: cmd as u32,
            arg1,
            ..Default::default()
        }
    }

    fn write_ops<T: IntoBytes + zerocopy::Immutable>(hv: &Hypervisor, d: &Domain, ops: &[T]) {
        hv.copy_to_guest(d, ARG, ops.as_bytes()).unwrap();
    }

    #[test]
    fn pinned_table_maps_a_data_frame() {
        let hv = machine(alloc::vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 1);
        let l1 = table(&hv, &d, 10);
        let data = table(&hv, &d, 11);

        write_ops(&hv, &d, &[ext(MmuextCmd::PinL1Table, l1.raw())]);
        assert_eq!(call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]), HypercallOutcome::Done(0));
        let info = hv.frames().info(l1);
        assert!(info.pinned);
        assert_eq!(info.ty, PageType::L1);
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]),
            HypercallOutcome::Done(-(LinuxError::EEXIST as i32 as i64))
        );

        let entry = Pte::new(data, PteFlags::PRESENT | PteFlags::RW).raw();
        write_ops(&hv, &d, &[MmuUpdate {
            ptr: (l1.to_addr() + 3 * 8) | MMU_NORMAL_PT_UPDATE,
            val: entry,
        }]);
        assert_eq!(call(&hv, &d, HyperCallCode::MmuUpdate, &[ARG, 1, 0, SELF]), HypercallOutcome::Done(0));
        assert_eq!(hv.frames().read_word(l1, 3), entry);
        assert_eq!(hv.frames().info(data).ty, PageType::Writable);
        assert_eq!(hv.frames().info(data).type_count, 1);
        // The guest cannot write its live table through a hypercall buffer.
        assert_eq!(hv.write_guest(&d, 10 << PAGE_SHIFT, &0u64), Err(AxError::BadAddress));

        write_ops(&hv, &d, &[ext(MmuextCmd::UnpinTable, l1.raw())]);
        assert_eq!(call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]), HypercallOutcome::Done(0));
        assert!(!hv.frames().info(l1).pinned);
        assert_eq!(hv.frames().info(data).type_count, 0);
    }

    #[test]
    fn unprivileged_and_shadowed_targets_are_refused() {
        let hv = machine(alloc::vec![dom(1), crate::hypervisor::tests::shadow_dom(2)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        let s = hv.domain(DomainId::new(2)).unwrap();
        scratch(&hv, &d, 1);
        scratch(&hv, &s, 1);
        let l1 = table(&hv, &d, 10);
        write_ops(&hv, &d, &[ext(MmuextCmd::PinL1Table, l1.raw())]);
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, 2]),
            HypercallOutcome::Done(guest_errno(AxError::PermissionDenied))
        );
        write_ops(&hv, &s, &[ext(MmuextCmd::PinL1Table, 0)]);
        assert_eq!(
            call(&hv, &s, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]),
            HypercallOutcome::Done(guest_errno(AxError::Unsupported))
        );
        write_ops(&hv, &d, &[ext(MmuextCmd::FlushCache, 0)]);
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]),
            HypercallOutcome::Done(guest_errno(AxError::PermissionDenied))
        );
        // A frame beyond the machine is not the caller's.
        write_ops(&hv, &d, &[MmuUpdate {
            ptr: 1 << 40,
            val: 0,
        }]);
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuUpdate, &[ARG, 1, 0, SELF]),
            HypercallOutcome::Done(guest_errno(AxError::PermissionDenied))
        );
    }

    #[test]
    fn machphys_update_moves_a_frame() {
        let hv = machine(alloc::vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 1);
        hv.populate_physmap(&d, Gpfn::new(12), 0).unwrap();
        let mfn = d.p2m.gpfn_to_mfn(Gpfn::new(12));
        write_ops(&hv, &d, &[MmuUpdate {
            ptr: mfn.to_addr() | MMU_MACHPHYS_UPDATE,
            val: 30,
        }]);
        assert_eq!(call(&hv, &d, HyperCallCode::MmuUpdate, &[ARG, 1, 0, SELF]), HypercallOutcome::Done(0));
        assert_eq!(d.p2m.gpfn_to_mfn(Gpfn::new(30)), mfn);
        assert!(d.p2m.gpfn_to_mfn(Gpfn::new(12)).is_invalid());
    }

    #[test]
    fn preempted_updates_keep_counting() {
        let hv = Hypervisor::new(PvConfig {
            machine_frames: 1024,
            preempt_batch: 2,
            domains: alloc::vec![dom(1)],
            ..Default::default()
        })
        .unwrap();
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 1);
        let l1 = table(&hv, &d, 10);
        hv.frames().pin_table(l1, PageType::L1, &*d).unwrap();
        let reqs: Vec<MmuUpdate> = (0..3)
            .map(|i| MmuUpdate {
                ptr: l1.to_addr() + i * 8,
                val: 0,
            })
            .collect();
        write_ops(&hv, &d, &reqs);

        d.vcpu(V0).unwrap().set_preempt_pending(true);
        let flag = MMU_UPDATE_PREEMPTED;
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuUpdate, &[ARG, 3, DONE, SELF]),
            HypercallOutcome::Continuation {
                code: HyperCallCode::MmuUpdate,
                args: [ARG + 32, 1 | flag, DONE, SELF, 0, 0],
            }
        );
        assert_eq!(hv.read_guest::<u32>(&d, DONE), Ok(2));
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuUpdate, &[ARG + 32, 1 | flag, DONE, SELF]),
            HypercallOutcome::Done(0)
        );
        assert_eq!(hv.read_guest::<u32>(&d, DONE), Ok(3));

        // A bad command stops the batch and reports how far it got.
        let bad = [
            MmuUpdate {
                ptr: l1.to_addr(),
                val: 0,
            },
            MmuUpdate {
                ptr: l1.to_addr() | 5,
                val: 0,
            },
        ];
        write_ops(&hv, &d, &bad);
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuUpdate, &[ARG, 2, DONE, SELF]),
            HypercallOutcome::Done(guest_errno(AxError::InvalidInput))
        );
        assert_eq!(hv.read_guest::<u32>(&d, DONE), Ok(1));
    }

    #[test]
    fn new_baseptr_moves_the_table_reference() {
        let hv = machine(alloc::vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        let v = d.vcpu(V0).unwrap().clone();
        scratch(&hv, &d, 1);
        let a = table(&hv, &d, 20);
        let b = table(&hv, &d, 21);
        let flushes = hv.frames().tlb().flush_count();

        write_ops(&hv, &d, &[ext(MmuextCmd::NewBaseptr, a.raw())]);
        assert_eq!(call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]), HypercallOutcome::Done(0));
        assert_eq!(v.guest_table(), Some(a));
        assert_eq!(hv.frames().info(a).ty, PageType::L4);
        assert!(hv.frames().tlb().flush_count() > flushes);

        write_ops(&hv, &d, &[ext(MmuextCmd::NewBaseptr, b.raw())]);
        assert_eq!(call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]), HypercallOutcome::Done(0));
        assert_eq!(v.guest_table(), Some(b));
        assert_eq!(hv.frames().info(a).type_count, 0);
        assert_eq!(hv.frames().info(b).type_count, 1);

        // A vCPU mask naming vCPU 0 flushes its processor.
        hv.write_guest(&d, DONE, &1u64).unwrap();
        let before = hv.frames().tlb().cpu_time(v.processor());
        write_ops(&hv, &d, &[MmuextOp {
            cmd: MmuextCmd::TlbFlushMulti as u32,
            arg2: DONE,
            ..Default::default()
        }]);
        assert_eq!(call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 1, 0, SELF]), HypercallOutcome::Done(0));
        assert!(hv.frames().tlb().cpu_time(v.processor()) > before);
    }

    #[test]
    fn compat_requests_are_widened_in_chunks() {
        let hv = Hypervisor::new(PvConfig {
            machine_frames: 1024,
            compat_xlat_size: 64,
            domains: alloc::vec![DomainConfig {
                compat: true,
                ..dom(1)
            }],
            ..Default::default()
        })
        .unwrap();
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 1);
        let tables: Vec<Mfn> = (10..13).map(|g| table(&hv, &d, g)).collect();
        let ops: Vec<CompatMmuextOp> = tables
            .iter()
            .map(|t| CompatMmuextOp {
                cmd: MmuextCmd::PinL1Table as u32,
                arg1: t.raw() as u32,
                arg2: 0,
            })
            .collect();
        write_ops(&hv, &d, &ops);

        // Two requests fit the area; the pending preemption is taken
        // between chunks.
        d.vcpu(V0).unwrap().set_preempt_pending(true);
        let flag = MMU_UPDATE_PREEMPTED;
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuextOp, &[ARG, 3, DONE, SELF]),
            HypercallOutcome::Continuation {
                code: HyperCallCode::MmuextOp,
                args: [ARG + 24, 1 | flag, DONE, SELF, 0, 0],
            }
        );
        assert!(hv.frames().info(tables[1]).pinned);
        assert!(!hv.frames().info(tables[2]).pinned);
        assert_eq!(
            call(&hv, &d, HyperCallCode::MmuextOp, &[ARG + 24, 1 | flag, DONE, SELF]),
            HypercallOutcome::Done(0)
        );
        assert!(hv.frames().info(tables[2]).pinned);
        assert_eq!(hv.read_guest::<u32>(&d, DONE), Ok(3));
    }
}
