//! `event_channel_op`.

use alloc::format;

use axerrno::{AxResult, ax_err_type};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use axpv_types::{DomainId, Port, VcpuId};

use super::abi::{
    BIND_PIRQ_WILL_SHARE, EVTCHNSTAT_CLOSED, EVTCHNSTAT_INTERDOMAIN, EVTCHNSTAT_IPI,
    EVTCHNSTAT_PIRQ, EVTCHNSTAT_UNBOUND, EVTCHNSTAT_VIRQ, EvtchnAllocUnbound, EvtchnBindInterdomain,
    EvtchnBindIpi, EvtchnBindPirq, EvtchnBindVcpu, EvtchnBindVirq, EvtchnOp, EvtchnPort,
    EvtchnStatus,
};
use super::{HyperCall, HyperCallResult, HypercallOutcome};
use crate::event::ChannelState;

impl HyperCall<'_> {
    pub(super) fn event_channel_op(&self, cmd: u32, arg: u64) -> HyperCallResult {
        let op = EvtchnOp::try_from(cmd)
            .map_err(|raw| ax_err_type!(Unsupported, format!("event_channel_op {}", raw)))?;
        let hv = self.hv;
        let d = &self.domain;
        match op {
            EvtchnOp::AllocUnbound => self.evtchn_arg(arg, |a: &mut EvtchnAllocUnbound| {
                let port = hv.evtchn_alloc_unbound(d, DomainId::new(a.dom), DomainId::new(a.remote_dom))?;
                a.port = port.into();
                Ok(())
            }),
            EvtchnOp::BindInterdomain => self.evtchn_arg(arg, |a: &mut EvtchnBindInterdomain| {
                let port = hv.evtchn_bind_interdomain(d, DomainId::new(a.remote_dom), Port::new(a.remote_port))?;
                a.local_port = port.into();
                Ok(())
            }),
            EvtchnOp::BindVirq => self.evtchn_arg(arg, |a: &mut EvtchnBindVirq| {
                a.port = hv.evtchn_bind_virq(d, a.virq, VcpuId::new(a.vcpu))?.into();
                Ok(())
            }),
            EvtchnOp::BindPirq => self.evtchn_arg(arg, |a: &mut EvtchnBindPirq| {
                let share = a.flags & BIND_PIRQ_WILL_SHARE != 0;
                a.port = hv.evtchn_bind_pirq(d, a.pirq, share)?.into();
                Ok(())
            }),
            EvtchnOp::BindIpi => self.evtchn_arg(arg, |a: &mut EvtchnBindIpi| {
                a.port = hv.evtchn_bind_ipi(d, VcpuId::new(a.vcpu))?.into();
                Ok(())
            }),
            EvtchnOp::BindVcpu => {
                let a: EvtchnBindVcpu = hv.read_guest(d, arg)?;
                hv.evtchn_bind_vcpu(d, Port::new(a.port), VcpuId::new(a.vcpu))?;
                Ok(HypercallOutcome::Done(0))
            }
            EvtchnOp::Close | EvtchnOp::Send | EvtchnOp::Unmask => {
                let a: EvtchnPort = hv.read_guest(d, arg)?;
                let port = Port::new(a.port);
                match op {
                    EvtchnOp::Close => hv.evtchn_close(d, port)?,
                    EvtchnOp::Send => hv.evtchn_send(d, port)?,
                    _ => hv.evtchn_unmask(d, port)?,
                }
                Ok(HypercallOutcome::Done(0))
            }
            EvtchnOp::Status => self.evtchn_arg(arg, |a: &mut EvtchnStatus| {
                let s = hv.evtchn_status(d, DomainId::new(a.dom), Port::new(a.port))?;
                let (status, u) = match s.state {
                    ChannelState::Free | ChannelState::Reserved => (EVTCHNSTAT_CLOSED, [0, 0]),
                    ChannelState::Unbound { remote } => (EVTCHNSTAT_UNBOUND, [remote.raw() as u32, 0]),
                    ChannelState::Interdomain { remote, remote_port } => {
                        (EVTCHNSTAT_INTERDOMAIN, [remote.raw() as u32, remote_port.into()])
                    }
                    ChannelState::Pirq(pirq) => (EVTCHNSTAT_PIRQ, [pirq, 0]),
                    ChannelState::Virq(virq) => (EVTCHNSTAT_VIRQ, [virq, 0]),
                    ChannelState::Ipi => (EVTCHNSTAT_IPI, [0, 0]),
                };
                a.status = status;
                a.vcpu = s.vcpu.into();
                a.u = u;
                Ok(())
            }),
        }
    }

    /// Runs an operation whose argument block is also its result.
    fn evtchn_arg<T>(&self, arg: u64, f: impl FnOnce(&mut T) -> AxResult) -> HyperCallResult
    where
        T: FromBytes + IntoBytes + Immutable,
    {
        let mut a: T = self.hv.read_guest(&self.domain, arg)?;
        f(&mut a)?;
        self.hv.write_guest(&self.domain, arg, &a)?;
        Ok(HypercallOutcome::Done(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::guest_errno;
    use crate::hypercall::HyperCallCode;
    use crate::hypercall::tests::{call, scratch};
    use crate::hypervisor::tests::{dom, machine};
    use axerrno::AxError;

    const ARG: u64 = 0x1000;

    fn evtchn(
        hv: &crate::Hypervisor,
        d: &alloc::sync::Arc<crate::domain::Domain>,
        op: EvtchnOp,
        arg: &(impl IntoBytes + Immutable),
    ) -> HypercallOutcome {
        hv.copy_to_guest(d, ARG, arg.as_bytes()).unwrap();
        call(hv, d, HyperCallCode::EventChannelOp, &[op as u64, ARG])
    }

    fn status(hv: &crate::Hypervisor, d: &alloc::sync::Arc<crate::domain::Domain>, port: u32) -> EvtchnStatus {
        let q = EvtchnStatus {
            dom: DomainId::SELF.raw(),
            port,
            ..Default::default()
        };
        assert_eq!(evtchn(hv, d, EvtchnOp::Status, &q), HypercallOutcome::Done(0));
        hv.read_guest(d, ARG).unwrap()
    }

    #[test]
    fn interdomain_channel_lifecycle() {
        let hv = machine(alloc::vec![dom(1), dom(2)]);
        let d1 = hv.domain(DomainId::new(1)).unwrap();
        let d2 = hv.domain(DomainId::new(2)).unwrap();
        scratch(&hv, &d1, 1);
        scratch(&hv, &d2, 1);

        let alloc = EvtchnAllocUnbound {
            dom: DomainId::SELF.raw(),
            remote_dom: 2,
            port: 0,
        };
        assert_eq!(evtchn(&hv, &d1, EvtchnOp::AllocUnbound, &alloc), HypercallOutcome::Done(0));
        let p1 = hv.read_guest::<EvtchnAllocUnbound>(&d1, ARG).unwrap().port;
        assert_ne!(p1, 0);
        let s = status(&hv, &d1, p1);
        assert_eq!((s.status, s.u[0]), (EVTCHNSTAT_UNBOUND, 2));

        let bind = EvtchnBindInterdomain {
            remote_dom: 1,
            remote_port: p1,
            ..Default::default()
        };
        assert_eq!(evtchn(&hv, &d2, EvtchnOp::BindInterdomain, &bind), HypercallOutcome::Done(0));
        let p2 = hv.read_guest::<EvtchnBindInterdomain>(&d2, ARG).unwrap().local_port;
        let s = status(&hv, &d1, p1);
        assert_eq!((s.status, s.u), (EVTCHNSTAT_INTERDOMAIN, [2, p2]));

        assert_eq!(
            evtchn(&hv, &d2, EvtchnOp::Send, &EvtchnPort { port: p2 }),
            HypercallOutcome::Done(0)
        );
        assert!(d1.shared.is_pending(Port::new(p1)));

        assert_eq!(
            evtchn(&hv, &d1, EvtchnOp::Close, &EvtchnPort { port: p1 }),
            HypercallOutcome::Done(0)
        );
        assert_eq!(status(&hv, &d1, p1).status, EVTCHNSTAT_CLOSED);
        let s = status(&hv, &d2, p2);
        assert_eq!((s.status, s.u[0]), (EVTCHNSTAT_UNBOUND, 1));
    }

    #[test]
    fn local_bindings_and_refusals() {
        let hv = machine(alloc::vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        scratch(&hv, &d, 1);

        let virq = EvtchnBindVirq {
            virq: 0,
            vcpu: 0,
            port: 0,
        };
        assert_eq!(evtchn(&hv, &d, EvtchnOp::BindVirq, &virq), HypercallOutcome::Done(0));
        let vp = hv.read_guest::<EvtchnBindVirq>(&d, ARG).unwrap().port;
        let s = status(&hv, &d, vp);
        assert_eq!((s.status, s.u[0], s.vcpu), (EVTCHNSTAT_VIRQ, 0, 0));

        assert_eq!(
            evtchn(&hv, &d, EvtchnOp::BindIpi, &EvtchnBindIpi { vcpu: 0, port: 0 }),
            HypercallOutcome::Done(0)
        );
        let ip = hv.read_guest::<EvtchnBindIpi>(&d, ARG).unwrap().port;
        assert_eq!(status(&hv, &d, ip).status, EVTCHNSTAT_IPI);
        assert_eq!(
            evtchn(&hv, &d, EvtchnOp::Unmask, &EvtchnPort { port: ip }),
            HypercallOutcome::Done(0)
        );

        let pirq = EvtchnBindPirq {
            pirq: 3,
            flags: BIND_PIRQ_WILL_SHARE,
            port: 0,
        };
        assert_eq!(
            evtchn(&hv, &d, EvtchnOp::BindPirq, &pirq),
            HypercallOutcome::Done(guest_errno(AxError::PermissionDenied))
        );
        assert_eq!(
            evtchn(&hv, &d, EvtchnOp::BindVirq, &EvtchnBindVirq { virq: 99, ..virq }),
            HypercallOutcome::Done(guest_errno(AxError::InvalidInput))
        );
        assert_eq!(
            evtchn(&hv, &d, EvtchnOp::BindVcpu, &EvtchnBindVcpu { port: vp, vcpu: 0 }),
            HypercallOutcome::Done(guest_errno(AxError::InvalidInput))
        );
        assert_eq!(
            call(&hv, &d, HyperCallCode::EventChannelOp, &[12, ARG]),
            HypercallOutcome::Done(guest_errno(AxError::Unsupported))
        );
    }
}
