//! TLB flush clock.
//!
//! TLB flushes are timestamped using a global logical clock which ticks on
//! every flush on any processor. A frame records the clock when it stops
//! being used in some role; a CPU whose last flush happened after that stamp
//! cannot hold a stale translation for the frame.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bit_field::BitField;

/// Set of physical CPUs, one bit per CPU.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn set(&mut self, cpu: usize) {
        self.0.set_bit(cpu, true);
    }

    pub fn clear(&mut self, cpu: usize) {
        self.0.set_bit(cpu, false);
    }

    pub fn test(self, cpu: usize) -> bool {
        self.0.get_bit(cpu)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..64).filter(move |&cpu| self.0.get_bit(cpu))
    }
}

impl core::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

pub struct TlbClock {
    clock: AtomicU64,
    cpu_time: Box<[AtomicU64]>,
    flushes: AtomicU64,
}

impl TlbClock {
    pub fn new(cpus: usize) -> Self {
        Self {
            clock: AtomicU64::new(1),
            cpu_time: (0..cpus).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into(),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn cpus(&self) -> usize {
        self.cpu_time.len()
    }

    /// Current clock value, used as the stamp of a frame.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Time of the last flush performed by `cpu`.
    pub fn cpu_time(&self, cpu: usize) -> u64 {
        self.cpu_time[cpu].load(Ordering::Acquire)
    }

    /// Records a full TLB flush on `cpu`.
    pub fn flush_local(&self, cpu: usize) {
        if cpu >= self.cpu_time.len() {
            warn!("flush on unknown cpu {}", cpu);
            return;
        }
        let mut now = self.clock.load(Ordering::Relaxed);
        let ticked = loop {
            match self.clock.compare_exchange_weak(
                now,
                now + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break now + 1,
                Err(cur) => now = cur,
            }
        };
        self.cpu_time[cpu].store(ticked, Ordering::Release);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        trace!("cpu{} tlb flush at {}", cpu, ticked);
    }

    /// Drops every CPU that has flushed since `stamp` from `mask`.
    pub fn filter(&self, mask: CpuMask, stamp: u64) -> CpuMask {
        let mut out = mask;
        for cpu in mask.iter() {
            if cpu >= self.cpu_time.len() || self.cpu_time(cpu) > stamp {
                out.clear(cpu);
            }
        }
        out
    }

    /// Flushes every CPU in `mask`.
    pub fn flush_mask(&self, mask: CpuMask) {
        for cpu in mask.iter() {
            self.flush_local(cpu);
        }
    }

    /// Flushes whatever subset of `mask` may still cache translations
    /// older than `stamp`. Returns the CPUs flushed.
    pub fn flush_stale(&self, mask: CpuMask, stamp: u64) -> CpuMask {
        let need = self.filter(mask, stamp);
        if !need.is_empty() {
            debug!("stale tlb on {:?} for stamp {}", need, stamp);
            self.flush_mask(need);
        }
        need
    }

    /// Total number of flushes performed.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_skips_cpus_flushed_after_stamp() {
        let clock = TlbClock::new(4);
        let mut mask = CpuMask::empty();
        mask.set(0);
        mask.set(1);
        mask.set(3);

        let stamp = clock.now();
        clock.flush_local(1);
        let need = clock.filter(mask, stamp);
        assert!(need.test(0));
        assert!(!need.test(1));
        assert!(need.test(3));

        let flushed = clock.flush_stale(mask, stamp);
        assert_eq!(flushed, need);
        assert!(clock.filter(mask, stamp).is_empty());
        assert_eq!(clock.flush_count(), 3);
    }

    #[test]
    fn clock_is_monotonic_across_threads() {
        let clock = alloc::sync::Arc::new(TlbClock::new(8));
        let handles: Vec<_> = (0..8)
            .map(|cpu| {
                let clock = clock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        clock.flush_local(cpu);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(clock.now(), 8001);
        assert_eq!(clock.flush_count(), 8000);
    }
}
