//! Guest hypercall entry.
//!
//! A trapped hypercall becomes a [`HyperCall`], which decodes the code and
//! dispatches to the operation families below. Long operations check for
//! pending preemption every [`PvConfig::preempt_batch`] extents and hand
//! back a [`HypercallOutcome::Continuation`] the guest re-issues as is.
//!
//! [`PvConfig::preempt_batch`]: crate::config::PvConfig::preempt_batch

pub mod abi;
mod compat;
mod evtchn;
mod gnttab;
mod guest;
mod memory;
mod mmu;

use alloc::sync::Arc;

use axerrno::{AxResult, ax_err, ax_err_type};
use numeric_enum_macro::numeric_enum;

use axpv_types::{DomainId, VcpuId};

use self::abi::{SchedOp, SchedShutdown};
use crate::domain::{Domain, Vcpu};
use crate::error::guest_errno;
use crate::hypervisor::Hypervisor;

numeric_enum! {
    #[repr(u32)]
    #[derive(Eq, PartialEq, Copy, Clone)]
    pub enum HyperCallCode {
        MmuUpdate = 1,
        MemoryOp = 12,
        GrantTableOp = 20,
        MmuextOp = 26,
        SchedOp = 29,
        EventChannelOp = 32,
        Sysctl = 35,
        Domctl = 36,
    }
}

impl core::fmt::Debug for HyperCallCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "(")?;
        match self {
            HyperCallCode::MmuUpdate => write!(f, "MmuUpdate {}", *self as u32),
            HyperCallCode::MemoryOp => write!(f, "MemoryOp {}", *self as u32),
            HyperCallCode::GrantTableOp => write!(f, "GrantTableOp {}", *self as u32),
            HyperCallCode::MmuextOp => write!(f, "MmuextOp {}", *self as u32),
            HyperCallCode::SchedOp => write!(f, "SchedOp {}", *self as u32),
            HyperCallCode::EventChannelOp => write!(f, "EventChannelOp {}", *self as u32),
            HyperCallCode::Sysctl => write!(f, "Sysctl {}", *self as u32),
            HyperCallCode::Domctl => write!(f, "Domctl {}", *self as u32),
        }?;
        write!(f, ")")
    }
}

/// What the guest sees when a hypercall returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallOutcome {
    /// Return register value; negative values are error codes.
    Done(i64),
    /// The call was preempted and must be re-issued with these arguments.
    Continuation { code: HyperCallCode, args: [u64; 6] },
}

pub type HyperCallResult = AxResult<HypercallOutcome>;

pub struct HyperCall<'a> {
    hv: &'a Hypervisor,
    domain: Arc<Domain>,
    vcpu: Arc<Vcpu>,
    code: HyperCallCode,
    args: [u64; 6],
}

impl<'a> HyperCall<'a> {
    pub fn new(
        hv: &'a Hypervisor,
        domain: &Arc<Domain>,
        vcpu: VcpuId,
        code: u64,
        args: [u64; 6],
    ) -> AxResult<Self> {
        let code = u32::try_from(code)
            .ok()
            .and_then(|c| HyperCallCode::try_from(c).ok())
            .ok_or_else(|| {
                warn!("{}: invalid hypercall code {}", domain.id(), code);
                ax_err_type!(Unsupported)
            })?;
        Ok(Self {
            hv,
            vcpu: domain.vcpu(vcpu)?.clone(),
            domain: domain.clone(),
            code,
            args,
        })
    }

    pub fn execute(&self) -> HyperCallResult {
        trace!(
            "{}v{}: hypercall {:?} args: {:#x?}",
            self.domain.id(),
            self.vcpu.id().index(),
            self.code,
            self.args
        );
        let [a0, a1, a2, a3, ..] = self.args;
        let compat = self.domain.is_compat();
        match self.code {
            HyperCallCode::MmuUpdate => self.mmu_update(a0, a1, a2, a3 as u16),
            HyperCallCode::MemoryOp if compat => self.compat_memory_op(a0, a1),
            HyperCallCode::MemoryOp => self.memory_op(a0, a1),
            HyperCallCode::GrantTableOp => self.grant_table_op(a0 as u32, a1, a2),
            HyperCallCode::MmuextOp if compat => self.compat_mmuext_op(a0, a1, a2, a3 as u16),
            HyperCallCode::MmuextOp => self.mmuext_op(a0, a1, a2, a3 as u16),
            HyperCallCode::SchedOp => self.sched_op(a0 as u32, a1),
            HyperCallCode::EventChannelOp => self.event_channel_op(a0 as u32, a1),
            HyperCallCode::Sysctl | HyperCallCode::Domctl => self.control_op(),
        }
    }

    /// Whether to stop after `done` items of this invocation.
    fn preempt_check(&self, done: u64) -> bool {
        let batch = self.hv.config.preempt_batch.max(1) as u64;
        done > 0 && done % batch == 0 && self.vcpu.preempt_pending()
    }

    /// Re-issues this call with its leading arguments replaced.
    fn continue_with(&self, leading: &[u64]) -> HyperCallResult {
        let mut args = self.args;
        args[..leading.len()].copy_from_slice(leading);
        debug!(
            "{}v{}: {:?} preempted, continuing with {:#x?}",
            self.domain.id(),
            self.vcpu.id().index(),
            self.code,
            &args[..leading.len()]
        );
        Ok(HypercallOutcome::Continuation {
            code: self.code,
            args,
        })
    }

    /// The domain an operation names, where acting on anyone but the
    /// caller takes privilege.
    fn foreign_target(&self, id: DomainId) -> AxResult<Arc<Domain>> {
        if id == DomainId::SELF || id == self.domain.id() {
            return Ok(self.domain.clone());
        }
        if !self.domain.is_privileged() {
            warn!("{}: unprivileged access to {}", self.domain.id(), id);
            return ax_err!(PermissionDenied);
        }
        self.hv.domain(id)
    }

    fn sched_op(&self, cmd: u32, arg: u64) -> HyperCallResult {
        let op = SchedOp::try_from(cmd).map_err(|_| ax_err_type!(Unsupported))?;
        match op {
            SchedOp::Yield => self.hv.sched.yield_vcpu(&self.vcpu),
            SchedOp::Block => {
                let info = self.domain.shared.vcpu_info(self.vcpu.id());
                if let Some(info) = info {
                    info.set_upcall_mask(false);
                }
                if info.is_some_and(|i| i.upcall_pending()) {
                    trace!("{:?}: block with events pending", self.vcpu);
                } else {
                    self.hv.sched.block(&self.vcpu);
                }
            }
            SchedOp::Shutdown => {
                let s: SchedShutdown = self.hv.read_guest(&self.domain, arg)?;
                let reason = match s.reason {
                    0 => "poweroff",
                    1 => "reboot",
                    2 => "suspend",
                    3 => "crash",
                    _ => "unknown",
                };
                info!("{}: shutdown ({}, {})", self.domain.id(), reason, s.reason);
                self.hv.pause_domain(&self.domain);
            }
        }
        Ok(HypercallOutcome::Done(0))
    }

    fn control_op(&self) -> HyperCallResult {
        if !self.domain.is_privileged() {
            warn!("{}: unprivileged {:?}", self.domain.id(), self.code);
            return ax_err!(PermissionDenied);
        }
        ax_err!(Unsupported)
    }
}

impl Hypervisor {
    /// Runs hypercall `code` for vCPU `vcpu` of `domain`.
    pub fn hypercall(
        &self,
        domain: &Arc<Domain>,
        vcpu: VcpuId,
        code: u64,
        args: [u64; 6],
    ) -> HypercallOutcome {
        match HyperCall::new(self, domain, vcpu, code, args).and_then(|call| call.execute()) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("{}: hypercall {} failed: {:?}", domain.id(), code, e);
                HypercallOutcome::Done(guest_errno(e))
            }
        }
    }
}
