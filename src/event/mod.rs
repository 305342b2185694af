//! Event channels.
//!
//! Each domain owns a table of ports allocated in buckets of
//! [`BUCKET_SIZE`]. An interdomain channel is two ports, one per domain,
//! that name each other; operations touching both ends take the two
//! domains' channel locks in domain id order.

mod shared;

pub use shared::{MAX_PORTS, SharedInfo, VcpuInfo};

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err, ax_err_type};
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use axpv_types::{DomainId, Port, VcpuId};

use crate::domain::{Domain, RunState};
use crate::hypervisor::Hypervisor;

pub const BUCKET_SIZE: usize = 128;
pub const NR_VIRQS: u32 = 24;
pub const NR_PIRQS: u32 = 256;

pub const VIRQ_TIMER: u32 = 0;
pub const VIRQ_DEBUG: u32 = 1;
pub const VIRQ_CONSOLE: u32 = 2;
pub const VIRQ_DOM_EXC: u32 = 3;

/// Virtual interrupts delivered to vCPU 0 and rebindable to any vCPU.
fn virq_is_global(virq: u32) -> bool {
    !matches!(virq, VIRQ_TIMER | VIRQ_DEBUG)
}

/// Binding key of `virq` raised on `vcpu`. Global VIRQs stay keyed on
/// vCPU 0 wherever their port notifies.
fn virq_key(vcpu: VcpuId, virq: u32) -> (VcpuId, u32) {
    if virq_is_global(virq) {
        (VcpuId::new(0), virq)
    } else {
        (vcpu, virq)
    }
}

/// Host side of physical interrupt delivery.
pub trait PirqController: Send + Sync {
    /// Routes `pirq` to `domain`. Fails if it is already bound exclusively.
    fn bind(&self, pirq: u32, domain: DomainId, shareable: bool) -> AxResult;
    fn unbind(&self, pirq: u32, domain: DomainId);
    /// End of interrupt from the guest.
    fn ack(&self, pirq: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Free,
    /// Never handed out.
    Reserved,
    /// Waiting for `remote` to bind.
    Unbound { remote: DomainId },
    Interdomain { remote: DomainId, remote_port: Port },
    Pirq(u32),
    Virq(u32),
    Ipi,
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    state: ChannelState,
    notify_vcpu: VcpuId,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            state: ChannelState::Free,
            notify_vcpu: VcpuId::new(0),
        }
    }
}

/// Result of `EVTCHNOP_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub vcpu: VcpuId,
}

pub struct PortTable {
    owner: DomainId,
    max: usize,
    buckets: Vec<Option<Box<[Channel]>>>,
    virqs: HashMap<(VcpuId, u32), Port>,
    pirqs: HashMap<u32, Port>,
}

impl PortTable {
    fn channel(&self, port: Port) -> Option<&Channel> {
        self.buckets
            .get(port.index() / BUCKET_SIZE)?
            .as_ref()?
            .get(port.index() % BUCKET_SIZE)
    }

    fn channel_mut(&mut self, port: Port) -> AxResult<&mut Channel> {
        let owner = self.owner;
        self.buckets
            .get_mut(port.index() / BUCKET_SIZE)
            .and_then(|b| b.as_mut())
            .and_then(|b| b.get_mut(port.index() % BUCKET_SIZE))
            .ok_or_else(|| ax_err_type!(InvalidInput, format!("{}: no {}", owner, port)))
    }

    fn state(&self, port: Port) -> ChannelState {
        self.channel(port).map_or(ChannelState::Free, |c| c.state)
    }

    /// A port that exists and is bound to something.
    fn live(&self, port: Port) -> AxResult<Channel> {
        match self.channel(port) {
            Some(c) if !matches!(c.state, ChannelState::Free | ChannelState::Reserved) => Ok(*c),
            _ => ax_err!(InvalidInput, format!("{}: {} is not bound", self.owner, port)),
        }
    }

    fn set(&mut self, port: Port, state: ChannelState, vcpu: VcpuId) -> AxResult {
        let chn = self.channel_mut(port)?;
        chn.state = state;
        chn.notify_vcpu = vcpu;
        Ok(())
    }

    fn free(&mut self, port: Port) -> AxResult {
        self.set(port, ChannelState::Free, VcpuId::new(0))
    }

    /// Lowest free port, allocating a new bucket when all are in use. The
    /// last bucket is cut short at the table limit.
    fn get_free_port(&mut self) -> AxResult<Port> {
        for (b, bucket) in self.buckets.iter().enumerate() {
            if let Some(bucket) = bucket {
                if let Some(i) = bucket.iter().position(|c| c.state == ChannelState::Free) {
                    return Ok(Port::new((b * BUCKET_SIZE + i) as u32));
                }
            }
        }
        let b = self.buckets.len();
        let len = self.max.saturating_sub(b * BUCKET_SIZE).min(BUCKET_SIZE);
        if len == 0 {
            return ax_err!(StorageFull, format!("{}: out of event channels", self.owner));
        }
        self.buckets
            .push(Some(alloc::vec![Channel::default(); len].into_boxed_slice()));
        Ok(Port::new((b * BUCKET_SIZE) as u32))
    }

    fn ports(&self) -> Vec<Port> {
        let mut ports = Vec::new();
        for (b, bucket) in self.buckets.iter().enumerate() {
            for (i, c) in bucket.iter().flat_map(|b| b.iter().enumerate()) {
                if !matches!(c.state, ChannelState::Free | ChannelState::Reserved) {
                    ports.push(Port::new((b * BUCKET_SIZE + i) as u32));
                }
            }
        }
        ports
    }
}

pub struct EventChannels {
    table: Mutex<PortTable>,
}

impl EventChannels {
    pub fn new(owner: DomainId, max: usize) -> AxResult<Self> {
        let mut table = PortTable {
            owner,
            max: max.min(MAX_PORTS),
            buckets: Vec::new(),
            virqs: HashMap::new(),
            pirqs: HashMap::new(),
        };
        // Port 0 stays reserved.
        let port = table.get_free_port()?;
        table.set(port, ChannelState::Reserved, VcpuId::new(0))?;
        Ok(Self {
            table: Mutex::new(table),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, PortTable> {
        self.table.lock()
    }

    pub fn state(&self, port: Port) -> ChannelState {
        self.table.lock().state(port)
    }

    pub fn bound_ports(&self) -> Vec<Port> {
        self.table.lock().ports()
    }
}

/// Locks the channel tables of two different domains in id order.
fn lock_pair<'a>(
    a: &'a Domain,
    b: &'a Domain,
) -> (MutexGuard<'a, PortTable>, MutexGuard<'a, PortTable>) {
    if a.id() < b.id() {
        let ga = a.evtchn.lock();
        let gb = b.evtchn.lock();
        (ga, gb)
    } else {
        let gb = b.evtchn.lock();
        let ga = a.evtchn.lock();
        (ga, gb)
    }
}

impl Hypervisor {
    /// Allocates a port in `dom` that `remote` may later bind to.
    pub fn evtchn_alloc_unbound(
        &self,
        caller: &Arc<Domain>,
        dom: DomainId,
        remote: DomainId,
    ) -> AxResult<Port> {
        if dom != DomainId::SELF && dom != caller.id() && !caller.is_privileged() {
            return ax_err!(PermissionDenied, "allocating ports in another domain");
        }
        let d = self.resolve(caller, dom)?;
        let remote = if remote == DomainId::SELF { caller.id() } else { remote };
        let mut t = d.evtchn.lock();
        let port = t.get_free_port()?;
        t.set(port, ChannelState::Unbound { remote }, VcpuId::new(0))?;
        debug!("{}: {} unbound for {}", d.id(), port, remote);
        Ok(port)
    }

    /// Connects a new local port to `remote_port`, which `remote_dom` must
    /// have left unbound for the caller.
    pub fn evtchn_bind_interdomain(
        &self,
        caller: &Arc<Domain>,
        remote_dom: DomainId,
        remote_port: Port,
    ) -> AxResult<Port> {
        let rd = self.resolve(caller, remote_dom)?;
        let lid = caller.id();
        let bind = |lt: &mut PortTable, rt: Option<&mut PortTable>| -> AxResult<Port> {
            let rstate = match &rt {
                Some(rt) => rt.state(remote_port),
                None => lt.state(remote_port),
            };
            if rstate != (ChannelState::Unbound { remote: lid }) {
                return ax_err!(InvalidInput, format!("{} is not offered to {}", remote_port, lid));
            }
            let lport = lt.get_free_port()?;
            lt.set(
                lport,
                ChannelState::Interdomain {
                    remote: rd.id(),
                    remote_port,
                },
                VcpuId::new(0),
            )?;
            let peer = ChannelState::Interdomain {
                remote: lid,
                remote_port: lport,
            };
            match rt {
                Some(rt) => {
                    let vcpu = rt.live(remote_port)?.notify_vcpu;
                    rt.set(remote_port, peer, vcpu)?;
                }
                None => {
                    let vcpu = lt.live(remote_port)?.notify_vcpu;
                    lt.set(remote_port, peer, vcpu)?;
                }
            }
            Ok(lport)
        };
        let lport = if rd.id() == lid {
            bind(&mut *caller.evtchn.lock(), None)?
        } else {
            let (mut lt, mut rt) = lock_pair(caller, &rd);
            bind(&mut *lt, Some(&mut *rt))?
        };
        debug!("{}: {} bound to {} {}", lid, lport, rd.id(), remote_port);
        Ok(lport)
    }

    pub fn evtchn_bind_virq(&self, caller: &Arc<Domain>, virq: u32, vcpu: VcpuId) -> AxResult<Port> {
        if virq >= NR_VIRQS {
            return ax_err!(InvalidInput, format!("virq {} out of range", virq));
        }
        if virq_is_global(virq) && vcpu.index() != 0 {
            return ax_err!(InvalidInput, "global virqs bind to vcpu 0");
        }
        caller.vcpu(vcpu)?;
        let key = virq_key(vcpu, virq);
        let mut t = caller.evtchn.lock();
        if t.virqs.contains_key(&key) {
            return ax_err!(AlreadyExists, format!("virq {} already bound", virq));
        }
        let port = t.get_free_port()?;
        t.set(port, ChannelState::Virq(virq), vcpu)?;
        t.virqs.insert(key, port);
        Ok(port)
    }

    pub fn evtchn_bind_ipi(&self, caller: &Arc<Domain>, vcpu: VcpuId) -> AxResult<Port> {
        caller.vcpu(vcpu)?;
        let mut t = caller.evtchn.lock();
        let port = t.get_free_port()?;
        t.set(port, ChannelState::Ipi, vcpu)?;
        Ok(port)
    }

    pub fn evtchn_bind_pirq(&self, caller: &Arc<Domain>, pirq: u32, shareable: bool) -> AxResult<Port> {
        if pirq >= NR_PIRQS {
            return ax_err!(InvalidInput, format!("pirq {} out of range", pirq));
        }
        if !caller.is_privileged() {
            return ax_err!(PermissionDenied, "no access to physical interrupts");
        }
        let pic = self.pirq()?;
        let mut t = caller.evtchn.lock();
        if t.pirqs.contains_key(&pirq) {
            return ax_err!(AlreadyExists, format!("pirq {} already bound", pirq));
        }
        let port = t.get_free_port()?;
        pic.bind(pirq, caller.id(), shareable)?;
        t.set(port, ChannelState::Pirq(pirq), VcpuId::new(0))?;
        t.pirqs.insert(pirq, port);
        Ok(port)
    }

    /// Changes the vCPU notified for `port`.
    pub fn evtchn_bind_vcpu(&self, caller: &Arc<Domain>, port: Port, vcpu: VcpuId) -> AxResult {
        caller.vcpu(vcpu)?;
        let mut t = caller.evtchn.lock();
        let chn = t.live(port)?;
        match chn.state {
            ChannelState::Virq(virq) if !virq_is_global(virq) => {
                ax_err!(InvalidInput, "per-vcpu virq cannot move")
            }
            ChannelState::Virq(_)
            | ChannelState::Unbound { .. }
            | ChannelState::Interdomain { .. }
            | ChannelState::Pirq(_) => t.set(port, chn.state, vcpu),
            _ => ax_err!(InvalidInput, format!("{} cannot be rebound", port)),
        }
    }

    /// Closes `port` of `d`. The far end of an interdomain channel returns
    /// to the unbound state, still offered to `d`.
    pub fn evtchn_close(&self, d: &Domain, port: Port) -> AxResult {
        loop {
            let mut t = d.evtchn.lock();
            let chn = t.live(port)?;
            match chn.state {
                ChannelState::Interdomain { remote, remote_port } if remote != d.id() => {
                    drop(t);
                    let rd = self.domain(remote).ok();
                    let Some(rd) = rd else {
                        // Peer is gone; only the local half remains.
                        let mut t = d.evtchn.lock();
                        if t.state(port) == chn.state {
                            t.free(port)?;
                            d.shared.clear_pending(port);
                            return Ok(());
                        }
                        continue;
                    };
                    let (mut lt, mut rt) = lock_pair(d, &rd);
                    if lt.state(port) != chn.state {
                        // Raced with another close; look again.
                        continue;
                    }
                    let peer = rt.state(remote_port);
                    if peer
                        == (ChannelState::Interdomain {
                            remote: d.id(),
                            remote_port: port,
                        })
                    {
                        let vcpu = rt.live(remote_port)?.notify_vcpu;
                        rt.set(remote_port, ChannelState::Unbound { remote: d.id() }, vcpu)?;
                    }
                    lt.free(port)?;
                    break;
                }
                ChannelState::Interdomain { remote_port, .. } => {
                    let vcpu = t.live(remote_port).map(|c| c.notify_vcpu);
                    if let Ok(vcpu) = vcpu {
                        if remote_port != port {
                            t.set(remote_port, ChannelState::Unbound { remote: d.id() }, vcpu)?;
                        }
                    }
                    t.free(port)?;
                    break;
                }
                ChannelState::Pirq(pirq) => {
                    t.pirqs.remove(&pirq);
                    if let Ok(pic) = self.pirq() {
                        pic.unbind(pirq, d.id());
                    }
                    t.free(port)?;
                    break;
                }
                ChannelState::Virq(virq) => {
                    t.virqs.remove(&virq_key(chn.notify_vcpu, virq));
                    t.free(port)?;
                    break;
                }
                _ => {
                    t.free(port)?;
                    break;
                }
            }
        }
        d.shared.clear_pending(port);
        trace!("{}: closed {}", d.id(), port);
        Ok(())
    }

    /// Raises the far end of an interdomain channel, or the local port of
    /// an IPI channel.
    pub fn evtchn_send(&self, caller: &Arc<Domain>, port: Port) -> AxResult {
        let t = caller.evtchn.lock();
        let chn = t.live(port)?;
        drop(t);
        match chn.state {
            ChannelState::Interdomain { remote, remote_port } => {
                let rd = self.resolve(caller, remote)?;
                let vcpu = {
                    let rt = rd.evtchn.lock();
                    match rt.live(remote_port) {
                        Ok(c) => c.notify_vcpu,
                        // Closed under us; the event is lost.
                        Err(_) => return Ok(()),
                    }
                };
                self.evtchn_set_pending(&rd, remote_port, vcpu);
                Ok(())
            }
            ChannelState::Ipi => {
                self.evtchn_set_pending(caller, port, chn.notify_vcpu);
                Ok(())
            }
            // Nobody to notify yet.
            ChannelState::Unbound { .. } => Ok(()),
            _ => ax_err!(InvalidInput, format!("{} cannot be sent on", port)),
        }
    }

    /// Marks `port` pending and wakes the notified vCPU when it blocked.
    pub(crate) fn evtchn_set_pending(&self, d: &Domain, port: Port, vcpu: VcpuId) {
        if d.shared.set_pending(port, vcpu) {
            if let Ok(v) = d.vcpu(vcpu) {
                if v.state() == RunState::Blocked {
                    self.sched.wake(v);
                }
            }
        }
    }

    pub fn evtchn_status(&self, caller: &Arc<Domain>, dom: DomainId, port: Port) -> AxResult<ChannelStatus> {
        if dom != DomainId::SELF && dom != caller.id() && !caller.is_privileged() {
            return ax_err!(PermissionDenied, "status of a foreign port");
        }
        let d = self.resolve(caller, dom)?;
        let t = d.evtchn.lock();
        match t.channel(port) {
            Some(c) => Ok(ChannelStatus {
                state: c.state,
                vcpu: c.notify_vcpu,
            }),
            None => ax_err!(InvalidInput, format!("{}: no {}", d.id(), port)),
        }
    }

    pub fn evtchn_unmask(&self, caller: &Arc<Domain>, port: Port) -> AxResult {
        let vcpu = {
            let t = caller.evtchn.lock();
            match t.channel(port) {
                Some(c) => c.notify_vcpu,
                None => return ax_err!(InvalidInput, format!("no {}", port)),
            }
        };
        if caller.shared.unmask(port, vcpu) {
            if let Ok(v) = caller.vcpu(vcpu) {
                if v.state() == RunState::Blocked {
                    self.sched.wake(v);
                }
            }
        }
        Ok(())
    }

    /// Raises a virtual interrupt. Unbound VIRQs are dropped.
    pub fn send_virq(&self, d: &Domain, vcpu: VcpuId, virq: u32) {
        let target = {
            let t = d.evtchn.lock();
            t.virqs
                .get(&virq_key(vcpu, virq))
                .and_then(|&port| t.channel(port).map(|c| (port, c.notify_vcpu)))
        };
        if let Some((port, notify)) = target {
            self.evtchn_set_pending(d, port, notify);
        }
    }

    /// Delivers a host interrupt routed to `d`.
    pub fn deliver_pirq(&self, d: &Domain, pirq: u32) -> AxResult {
        let (port, vcpu) = {
            let t = d.evtchn.lock();
            let port = *t
                .pirqs
                .get(&pirq)
                .ok_or_else(|| ax_err_type!(NotFound, format!("pirq {} not bound", pirq)))?;
            (port, t.live(port)?.notify_vcpu)
        };
        self.evtchn_set_pending(d, port, vcpu);
        Ok(())
    }

    pub fn pirq_eoi(&self, d: &Domain, pirq: u32) -> AxResult {
        if !d.evtchn.lock().pirqs.contains_key(&pirq) {
            return ax_err!(InvalidInput, format!("pirq {} not bound", pirq));
        }
        self.pirq()?.ack(pirq);
        Ok(())
    }

    /// What the guest's upcall handler would see on `vcpu`.
    pub fn vcpu_poll_pending(&self, d: &Domain, vcpu: VcpuId) -> Vec<Port> {
        d.shared.poll(vcpu)
    }

    pub(crate) fn evtchn_close_all(&self, d: &Domain) {
        for port in d.evtchn.bound_ports() {
            if let Err(e) = self.evtchn_close(d, port) {
                warn!("{}: closing {} failed: {:?}", d.id(), port, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::tests::{dom, machine};
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec as StdVec;

    #[test]
    fn interdomain_send_and_close() {
        let hv = machine(alloc::vec![dom(1), dom(2)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();

        let offered = hv.evtchn_alloc_unbound(&d2, DomainId::SELF, d1.id()).unwrap();
        assert_eq!(offered, Port::new(1));
        let local = hv.evtchn_bind_interdomain(&d1, d2.id(), offered).unwrap();
        assert_eq!(
            d2.evtchn.state(offered),
            ChannelState::Interdomain {
                remote: d1.id(),
                remote_port: local
            }
        );
        // A second bind of the same offer fails.
        assert!(hv.evtchn_bind_interdomain(&d1, d2.id(), offered).is_err());

        hv.evtchn_send(&d1, local).unwrap();
        assert!(d2.shared.is_pending(offered));
        assert_eq!(hv.vcpu_poll_pending(&d2, VcpuId::new(0)), alloc::vec![offered]);

        hv.evtchn_close(&d1, local).unwrap();
        assert_eq!(d1.evtchn.state(local), ChannelState::Free);
        assert_eq!(d2.evtchn.state(offered), ChannelState::Unbound { remote: d1.id() });
        // The offer can be taken again.
        hv.evtchn_bind_interdomain(&d1, d2.id(), offered).unwrap();
    }

    #[test]
    fn send_wakes_blocked_vcpu() {
        let hv = machine(alloc::vec![dom(1)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let v = d1.vcpu(VcpuId::new(0)).unwrap().clone();
        let port = hv.evtchn_bind_ipi(&d1, VcpuId::new(0)).unwrap();
        hv.schedule(v.processor());
        hv.sched().block(&v);
        assert_eq!(v.state(), RunState::Blocked);
        hv.evtchn_send(&d1, port).unwrap();
        assert_eq!(v.state(), RunState::Runnable);
    }

    #[test]
    fn virq_binding_is_unique() {
        let hv = machine(alloc::vec![dom(1)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let port = hv.evtchn_bind_virq(&d1, VIRQ_CONSOLE, VcpuId::new(0)).unwrap();
        assert!(hv.evtchn_bind_virq(&d1, VIRQ_CONSOLE, VcpuId::new(0)).is_err());
        assert!(hv.evtchn_bind_virq(&d1, VIRQ_CONSOLE, VcpuId::new(1)).is_err());
        hv.send_virq(&d1, VcpuId::new(0), VIRQ_CONSOLE);
        assert!(d1.shared.is_pending(port));
        hv.evtchn_close(&d1, port).unwrap();
        assert!(!d1.shared.is_pending(port));
        hv.evtchn_bind_virq(&d1, VIRQ_CONSOLE, VcpuId::new(0)).unwrap();
    }

    #[test]
    fn ports_exhaust_and_recycle() {
        let hv = machine(alloc::vec![dom(1)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let max = hv.config().max_event_channels;
        let ports: StdVec<Port> = (1..max)
            .map(|_| hv.evtchn_bind_ipi(&d1, VcpuId::new(0)).unwrap())
            .collect();
        assert_eq!(
            hv.evtchn_bind_ipi(&d1, VcpuId::new(0)).unwrap_err(),
            axerrno::AxError::StorageFull
        );
        hv.evtchn_close(&d1, ports[10]).unwrap();
        assert_eq!(hv.evtchn_bind_ipi(&d1, VcpuId::new(0)).unwrap(), ports[10]);
    }

    #[test]
    fn rebound_global_virq_follows_its_port() {
        let hv = machine(alloc::vec![crate::config::DomainConfig { vcpus: 2, ..dom(1) }]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let port = hv.evtchn_bind_virq(&d1, VIRQ_CONSOLE, VcpuId::new(0)).unwrap();
        hv.evtchn_bind_vcpu(&d1, port, VcpuId::new(1)).unwrap();
        assert_eq!(
            hv.evtchn_bind_virq(&d1, VIRQ_CONSOLE, VcpuId::new(0)).unwrap_err(),
            axerrno::AxError::AlreadyExists
        );

        hv.send_virq(&d1, VcpuId::new(0), VIRQ_CONSOLE);
        assert!(d1.shared.is_pending(port));
        assert_eq!(hv.vcpu_poll_pending(&d1, VcpuId::new(1)), alloc::vec![port]);
        assert!(hv.vcpu_poll_pending(&d1, VcpuId::new(0)).is_empty());

        hv.evtchn_close(&d1, port).unwrap();
        hv.send_virq(&d1, VcpuId::new(0), VIRQ_CONSOLE);
        assert!(!d1.shared.is_pending(port));
        hv.evtchn_bind_virq(&d1, VIRQ_CONSOLE, VcpuId::new(0)).unwrap();
    }

    #[test]
    fn limits_below_a_bucket_still_hand_out_ports() {
        let mut t = EventChannels::new(DomainId::new(1), 100).unwrap();
        let ports: StdVec<Port> = (1..100).map(|_| {
            let mut g = t.lock();
            let p = g.get_free_port().unwrap();
            g.set(p, ChannelState::Ipi, VcpuId::new(0)).unwrap();
            p
        }).collect();
        assert_eq!(ports.first(), Some(&Port::new(1)));
        assert_eq!(ports.last(), Some(&Port::new(99)));
        assert_eq!(t.lock().get_free_port().unwrap_err(), axerrno::AxError::StorageFull);
        assert_eq!(t.state(Port::new(100)), ChannelState::Free);
        assert!(t.lock().channel_mut(Port::new(100)).is_err());

        // A limit past one bucket keeps the partial tail usable.
        t = EventChannels::new(DomainId::new(1), 130).unwrap();
        let mut g = t.lock();
        for _ in 1..130 {
            let p = g.get_free_port().unwrap();
            g.set(p, ChannelState::Ipi, VcpuId::new(0)).unwrap();
        }
        assert_eq!(g.state(Port::new(129)), ChannelState::Ipi);
        assert!(g.get_free_port().is_err());
        drop(g);
        assert!(EventChannels::new(DomainId::new(1), 0).is_err());
    }

    #[test]
    fn small_configured_limit_binds_channels() {
        let mut cfg = crate::config::PvConfig {
            machine_frames: 1024,
            cpus: 2,
            max_event_channels: 100,
            ..Default::default()
        };
        cfg.domains = alloc::vec![dom(1), dom(2)];
        let hv = Hypervisor::new(cfg).unwrap();
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();
        let offered = hv.evtchn_alloc_unbound(&d1, DomainId::SELF, d2.id()).unwrap();
        let local = hv.evtchn_bind_interdomain(&d2, d1.id(), offered).unwrap();
        hv.evtchn_send(&d2, local).unwrap();
        assert!(d1.shared.is_pending(offered));
    }

    struct RecordingPic(StdMutex<StdVec<(u32, bool)>>);

    impl PirqController for RecordingPic {
        fn bind(&self, pirq: u32, _domain: DomainId, _shareable: bool) -> AxResult {
            self.0.lock().unwrap().push((pirq, true));
            Ok(())
        }

        fn unbind(&self, pirq: u32, _domain: DomainId) {
            self.0.lock().unwrap().push((pirq, false));
        }

        fn ack(&self, _pirq: u32) {}
    }

    #[test]
    fn pirq_needs_privilege_and_controller() {
        let mut d0 = dom(0);
        d0.privileged = true;
        let hv = machine(alloc::vec![d0, dom(1)]);
        let d0 = hv.domain(DomainId::new(0)).unwrap();
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        assert!(hv.evtchn_bind_pirq(&d0, 9, false).is_err());
        assert!(hv.evtchn_bind_pirq(&d1, 9, false).is_err());
        drop((d0, d1));

        let hv = hv.with_pirq_controller(Box::new(RecordingPic(StdMutex::new(StdVec::new()))));
        let d0 = hv.domain(DomainId::new(0)).unwrap();
        let port = hv.evtchn_bind_pirq(&d0, 9, false).unwrap();
        hv.deliver_pirq(&d0, 9).unwrap();
        assert!(d0.shared.is_pending(port));
        hv.pirq_eoi(&d0, 9).unwrap();
        hv.evtchn_close(&d0, port).unwrap();
        assert!(hv.deliver_pirq(&d0, 9).is_err());
    }

    #[test]
    fn concurrent_close_from_both_ends() {
        let hv = Arc::new(machine(alloc::vec![dom(1), dom(2)]));
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();
        for _ in 0..32 {
            let p2 = hv.evtchn_alloc_unbound(&d2, DomainId::SELF, d1.id()).unwrap();
            let p1 = hv.evtchn_bind_interdomain(&d1, d2.id(), p2).unwrap();
            let (hv1, a) = (hv.clone(), d1.clone());
            let (hv2, b) = (hv.clone(), d2.clone());
            let t1 = std::thread::spawn(move || hv1.evtchn_close(&a, p1));
            let t2 = std::thread::spawn(move || hv2.evtchn_close(&b, p2));
            t1.join().unwrap().unwrap();
            t2.join().unwrap().unwrap();
            assert_eq!(d1.evtchn.state(p1), ChannelState::Free);
            assert_eq!(d2.evtchn.state(p2), ChannelState::Free);
        }
    }
}
