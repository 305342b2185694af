//! Per-CPU round-robin run queues.
//!
//! Each physical CPU owns one queue of runnable vCPUs and at most one
//! running vCPU. A vCPU only ever sits on the queue of its own processor,
//! and its run state changes under that queue's lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::domain::{RunState, Vcpu};

#[derive(Default)]
struct RunQueue {
    runnable: VecDeque<Arc<Vcpu>>,
    current: Option<Arc<Vcpu>>,
}

impl RunQueue {
    fn unqueue(&mut self, vcpu: &Arc<Vcpu>) {
        self.runnable.retain(|v| !Arc::ptr_eq(v, vcpu));
    }

    fn is_current(&self, vcpu: &Arc<Vcpu>) -> bool {
        self.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, vcpu))
    }
}

/// Result of one scheduling decision.
pub struct Switch {
    pub prev: Option<Arc<Vcpu>>,
    pub next: Option<Arc<Vcpu>>,
}

impl Switch {
    /// The running vCPU did not change.
    pub fn is_same(&self) -> bool {
        match (&self.prev, &self.next) {
            (Some(p), Some(n)) => Arc::ptr_eq(p, n),
            (None, None) => true,
            _ => false,
        }
    }
}

pub struct Scheduler {
    queues: Vec<Mutex<RunQueue>>,
}

impl Scheduler {
    pub fn new(cpus: usize) -> Self {
        Self {
            queues: (0..cpus).map(|_| Mutex::new(RunQueue::default())).collect(),
        }
    }

    fn queue(&self, vcpu: &Vcpu) -> &Mutex<RunQueue> {
        &self.queues[vcpu.processor() % self.queues.len()]
    }

    /// Makes a blocked or offline vCPU runnable.
    pub fn wake(&self, vcpu: &Arc<Vcpu>) {
        let mut rq = self.queue(vcpu).lock();
        match vcpu.state() {
            RunState::Blocked | RunState::Offline => {
                vcpu.set_state(RunState::Runnable);
                if !rq.is_current(vcpu) {
                    rq.runnable.push_back(vcpu.clone());
                }
                trace!("wake {:?}", vcpu);
            }
            RunState::Running | RunState::Runnable => {}
        }
    }

    /// Takes a vCPU off the CPU until the next [`Scheduler::wake`].
    pub fn block(&self, vcpu: &Arc<Vcpu>) {
        let mut rq = self.queue(vcpu).lock();
        rq.unqueue(vcpu);
        vcpu.set_state(RunState::Blocked);
        trace!("block {:?}", vcpu);
    }

    /// Asks for the running vCPU to be rescheduled.
    pub fn yield_vcpu(&self, vcpu: &Vcpu) {
        vcpu.set_preempt_pending(true);
    }

    /// Removes a vCPU from its CPU entirely.
    pub fn remove(&self, vcpu: &Arc<Vcpu>) {
        let mut rq = self.queue(vcpu).lock();
        rq.unqueue(vcpu);
        if rq.is_current(vcpu) {
            rq.current = None;
        }
        vcpu.set_state(RunState::Offline);
    }

    /// Stops running a paused vCPU, leaving it queued.
    pub fn deschedule(&self, vcpu: &Arc<Vcpu>) {
        let mut rq = self.queue(vcpu).lock();
        if rq.is_current(vcpu) {
            rq.current = None;
            vcpu.set_state(RunState::Runnable);
            rq.runnable.push_back(vcpu.clone());
        }
    }

    /// Picks the next vCPU for `cpu`, rotating the current one to the back.
    pub fn schedule(&self, cpu: usize) -> Switch {
        let mut rq = self.queues[cpu].lock();
        let prev = rq.current.take();
        if let Some(p) = &prev {
            if p.state() == RunState::Running {
                p.set_state(RunState::Runnable);
                rq.runnable.push_back(p.clone());
            }
        }
        let pos = rq.runnable.iter().position(|v| !v.is_paused());
        let next = pos.and_then(|i| rq.runnable.remove(i));
        if let Some(n) = &next {
            n.set_state(RunState::Running);
            n.set_preempt_pending(false);
        }
        rq.current = next.clone();
        Switch { prev, next }
    }

    /// Timer tick: preempt the running vCPU when someone else is waiting.
    pub fn tick(&self, cpu: usize) {
        let rq = self.queues[cpu].lock();
        if let Some(cur) = &rq.current {
            if rq.runnable.iter().any(|v| !v.is_paused()) {
                cur.set_preempt_pending(true);
            }
        }
    }

    pub fn current(&self, cpu: usize) -> Option<Arc<Vcpu>> {
        self.queues[cpu].lock().current.clone()
    }

    pub fn runnable_len(&self, cpu: usize) -> usize {
        self.queues[cpu].lock().runnable.len()
    }
}
