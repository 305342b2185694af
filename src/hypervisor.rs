//! The hypervisor context.
//!
//! [`Hypervisor`] owns everything with machine lifetime: the frame table,
//! the machine-to-physical table, the domain arena and the run queues.
//! Every operation of the core is reached through it.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};

use axpv_types::{DomainId, Mfn};

use crate::config::{DomainConfig, PvConfig};
use crate::domain::{Domain, DomainList, Vcpu};
use crate::event::PirqController;
use crate::mm::frame::{FrameOwner, FrameTable};
use crate::mm::p2m::M2pTable;
use crate::sched::Scheduler;

pub struct Hypervisor {
    pub(crate) config: PvConfig,
    pub(crate) frames: Arc<FrameTable>,
    pub(crate) m2p: M2pTable,
    domains: DomainList,
    pub(crate) sched: Scheduler,
    pirq: Option<Box<dyn PirqController>>,
}

impl Hypervisor {
    /// Builds the machine described by `config` and creates its boot
    /// domains.
    pub fn new(config: PvConfig) -> AxResult<Self> {
        config.validate()?;
        let hv = Self {
            frames: Arc::new(FrameTable::new(config.machine_frames, config.cpus)),
            m2p: M2pTable::new(config.machine_frames),
            domains: DomainList::default(),
            sched: Scheduler::new(config.cpus),
            pirq: None,
            config,
        };
        for dom in hv.config.domains.clone() {
            hv.create_domain(&dom)?;
        }
        info!(
            "hypervisor up: {} frames, {} cpus, {} domains",
            hv.config.machine_frames,
            hv.config.cpus,
            hv.domains.all().len()
        );
        Ok(hv)
    }

    /// Attaches the host interrupt controller used for physical IRQs.
    pub fn with_pirq_controller(mut self, pirq: Box<dyn PirqController>) -> Self {
        self.pirq = Some(pirq);
        self
    }

    pub fn config(&self) -> &PvConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn m2p(&self) -> &M2pTable {
        &self.m2p
    }

    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    pub(crate) fn pirq(&self) -> AxResult<&dyn PirqController> {
        match &self.pirq {
            Some(p) => Ok(p.as_ref()),
            None => ax_err!(Unsupported, "no physical interrupt controller"),
        }
    }

    pub fn domain(&self, id: DomainId) -> AxResult<Arc<Domain>> {
        self.domains.get(id)
    }

    pub fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains.all()
    }

    /// Resolves a domain id from hypercall arguments, where
    /// [`DomainId::SELF`] names the caller.
    pub(crate) fn resolve(&self, caller: &Arc<Domain>, id: DomainId) -> AxResult<Arc<Domain>> {
        if id == DomainId::SELF || id == caller.id() {
            return Ok(caller.clone());
        }
        self.domain(id)
    }

    pub fn create_domain(&self, config: &DomainConfig) -> AxResult<Arc<Domain>> {
        let domain = Arc::new(Domain::new(&self.config, config, &self.frames)?);
        self.domains.insert(domain.clone())?;
        for vcpu in domain.vcpus() {
            self.sched.wake(vcpu);
        }
        info!(
            "{}: created ({:?}, {} vcpus, max {} pages)",
            domain.id(),
            domain.paging(),
            domain.vcpus().len(),
            domain.max_pages()
        );
        Ok(domain)
    }

    pub fn pause_domain(&self, domain: &Domain) {
        for vcpu in domain.vcpus() {
            vcpu.pause();
            self.sched.deschedule(vcpu);
        }
        debug!("{}: paused", domain.id());
    }

    pub fn unpause_domain(&self, domain: &Domain) {
        for vcpu in domain.vcpus() {
            vcpu.unpause();
        }
        debug!("{}: unpaused", domain.id());
    }

    /// Flushes every CPU that may hold translations for `domain`.
    pub fn flush_domain_tlbs(&self, domain: &Domain) {
        self.frames.tlb().flush_mask(domain.dirty_cpus());
    }

    /// Runs the scheduler on `cpu` and switches to its choice.
    pub fn schedule(&self, cpu: usize) -> Option<Arc<Vcpu>> {
        let switch = self.sched.schedule(cpu);
        let next = switch.next.clone()?;
        if switch.is_same() {
            return Some(next);
        }
        let Ok(domain) = self.domain(next.domain_id()) else {
            warn!("cpu{}: scheduled vcpu of vanished {}", cpu, next.domain_id());
            self.sched.remove(&next);
            return None;
        };
        self.context_switch(cpu, &domain, &next);
        Some(next)
    }

    fn context_switch(&self, cpu: usize, domain: &Domain, next: &Vcpu) {
        domain.mark_dirty_cpu(cpu);
        self.frames.tlb().flush_local(cpu);
        if let Some(shadow) = domain.shadow.lock().as_mut() {
            shadow.sync_all(&self.frames, domain);
        }
        trace!("cpu{}: switched to {:?}", cpu, next);
    }

    /// Checks ownership invariants over all machine frames.
    pub fn audit(&self) -> Vec<Mfn> {
        let bad = self.frames.audit(|id| {
            self.domains
                .get(id)
                .map(|d| d.is_dying())
                .unwrap_or(true)
        });
        for mfn in &bad {
            warn!("audit: {} breaks ownership invariants: {:?}", mfn, self.frames.info(*mfn));
        }
        bad
    }

    /// Tears a domain down. Frames still referenced by others keep the
    /// domain alive in the dying state; the call can be repeated once they
    /// are released.
    pub fn destroy_domain(&self, id: DomainId) -> AxResult {
        let domain = self.domain(id)?;
        if !domain.set_dying() {
            info!("{}: destroying", id);
            for vcpu in domain.vcpus() {
                vcpu.pause();
                self.sched.remove(vcpu);
            }
        }
        if let Some(shadow) = domain.shadow.lock().as_mut() {
            shadow.teardown(&self.frames, &domain);
        }
        self.evtchn_close_all(&domain);
        self.grant_release_mappings(&domain);
        for vcpu in domain.vcpus() {
            if let Some(base) = vcpu.swap_guest_table(None) {
                self.frames.put_page_and_type(base, domain.as_ref());
            }
            self.nvmx_vcpu_destroy(vcpu);
        }

        let mut busy = 0usize;
        let mappings = domain.p2m.ram_mappings();
        let unmapped = self.unmapped_frames(&domain);
        for mfn in mappings.iter().map(|&(_, mfn, _)| mfn).chain(unmapped.iter().copied()) {
            if self.frames.info(mfn).pinned && self.frames.clear_pinned(mfn) {
                self.frames.put_page_and_type(mfn, domain.as_ref());
            }
        }
        for mfn in unmapped {
            match self.frames.release_allocation(mfn, id) {
                Ok(()) => domain.uncharge_pages(1),
                Err(_) => busy += 1,
            }
        }
        for (gpfn, mfn, ty) in mappings {
            if let Err(e) = domain.p2m.remove_from_physmap(&self.m2p, gpfn) {
                warn!("{}: unmapping {} failed: {:?}", id, gpfn, e);
            }
            match self.frames.release_allocation(mfn, id) {
                Ok(()) => domain.uncharge_pages(1),
                Err(_) => {
                    if let Err(e) = domain.p2m.add_to_physmap(&self.m2p, gpfn, mfn, ty) {
                        error!("{}: busy {} cannot be remapped at {}: {:?}", id, mfn, gpfn, e);
                    }
                    busy += 1;
                }
            }
        }
        if busy > 0 {
            warn!("{}: {} frames still referenced, teardown deferred", id, busy);
            return ax_err!(ResourceBusy, format!("{} frames of {} still referenced", busy, id));
        }
        self.domains.remove(id);
        info!("{}: destroyed", id);
        Ok(())
    }
}
