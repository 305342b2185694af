//! Free machine-frame pool.
//!
//! Frames are handed out as naturally aligned power-of-two extents. Frame 0
//! is never handed out so that a zero frame number can act as "not yet" in
//! the shared structures.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use axpv_types::{Mfn, PAGE_SHIFT};

/// Largest extent order the pool serves.
pub const MAX_ORDER: u32 = 10;

/// Allocation statistics, in frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub total: usize,
    pub free: usize,
}

pub struct FrameHeap {
    inner: Mutex<HeapInner>,
}

struct HeapInner {
    /// Bit set means the frame is free.
    bitmap: Vec<u64>,
    total: usize,
    free: usize,
}

impl HeapInner {
    fn is_free(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn mark(&mut self, idx: usize, free: bool) {
        if free {
            self.bitmap[idx / 64] |= 1 << (idx % 64);
        } else {
            self.bitmap[idx / 64] &= !(1 << (idx % 64));
        }
    }

    fn range_free(&self, base: usize, count: usize) -> bool {
        (base..base + count).all(|idx| self.is_free(idx))
    }
}

impl FrameHeap {
    /// Creates a pool over frames `[0, total)` with frame 0 reserved.
    pub fn new(total: usize) -> Self {
        let mut inner = HeapInner {
            bitmap: vec![0; total.div_ceil(64)],
            total,
            free: 0,
        };
        for idx in 1..total {
            inner.mark(idx, true);
        }
        inner.free = total.saturating_sub(1);
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Allocates `1 << order` contiguous frames, aligned to their size.
    ///
    /// With `address_bits`, every frame of the extent lies below
    /// `1 << address_bits` bytes.
    pub fn alloc(&self, order: u32, address_bits: Option<u32>) -> Option<Mfn> {
        if order > MAX_ORDER {
            warn!("frame heap: order {} too large", order);
            return None;
        }
        let count = 1usize << order;
        let mut inner = self.inner.lock();
        let mut limit = inner.total;
        if let Some(bits) = address_bits {
            let bits = bits as usize;
            if bits <= PAGE_SHIFT {
                return None;
            }
            if bits - PAGE_SHIFT < usize::BITS as usize {
                limit = limit.min(1 << (bits - PAGE_SHIFT));
            }
        }
        if inner.free < count {
            return None;
        }
        let base = (0..limit)
            .step_by(count)
            .find(|&base| base + count <= limit && inner.range_free(base, count))?;
        for idx in base..base + count {
            inner.mark(idx, false);
        }
        inner.free -= count;
        trace!("frame heap: alloc order {} at {:#x}", order, base);
        Some(Mfn::new(base as u64))
    }

    /// Returns an extent previously obtained from [`FrameHeap::alloc`].
    pub fn free(&self, mfn: Mfn, order: u32) {
        let count = 1usize << order;
        let base = mfn.index();
        let mut inner = self.inner.lock();
        if base == 0 || base + count > inner.total {
            bug!("frame heap: freeing out-of-range extent {}", mfn);
        }
        for idx in base..base + count {
            if inner.is_free(idx) {
                bug!("frame heap: double free of frame {:#x}", idx);
            }
            inner.mark(idx, true);
        }
        inner.free += count;
        trace!("frame heap: free order {} at {}", order, mfn);
    }

    /// Takes one specific free frame out of the pool.
    pub fn claim(&self, mfn: Mfn) -> bool {
        let idx = mfn.index();
        let mut inner = self.inner.lock();
        if idx == 0 || idx >= inner.total || !inner.is_free(idx) {
            return false;
        }
        inner.mark(idx, false);
        inner.free -= 1;
        true
    }

    pub fn usage(&self) -> HeapUsage {
        let inner = self.inner.lock();
        HeapUsage {
            total: inner.total,
            free: inner.free,
        }
    }

    pub fn is_free(&self, mfn: Mfn) -> bool {
        let inner = self.inner.lock();
        mfn.index() < inner.total && inner.is_free(mfn.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extents_are_aligned_and_frame_zero_reserved() {
        let heap = FrameHeap::new(64);
        assert_eq!(heap.usage().free, 63);
        let a = heap.alloc(0, None).unwrap();
        assert_eq!(a.raw(), 1);
        let b = heap.alloc(3, None).unwrap();
        assert_eq!(b.raw() % 8, 0);
        assert_ne!(b.raw(), 0);
        heap.free(b, 3);
        heap.free(a, 0);
        assert_eq!(heap.usage().free, 63);
    }

    #[test]
    fn address_limit_and_exhaustion() {
        let heap = FrameHeap::new(64);
        // 16 frames below 64KiB, frame 0 reserved.
        let low: Vec<_> = (0..15).map(|_| heap.alloc(0, Some(16)).unwrap()).collect();
        assert!(low.iter().all(|m| m.raw() < 16));
        assert!(heap.alloc(0, Some(16)).is_none());
        assert!(heap.alloc(0, None).is_some());
        assert!(heap.alloc(MAX_ORDER + 1, None).is_none());
    }

    #[test]
    fn claim_takes_only_free_frames() {
        let heap = FrameHeap::new(16);
        assert!(!heap.claim(Mfn::new(0)));
        assert!(heap.claim(Mfn::new(5)));
        assert!(!heap.claim(Mfn::new(5)));
        assert!(!heap.claim(Mfn::new(16)));
        assert_eq!(heap.usage().free, 14);
        heap.free(Mfn::new(5), 0);
        assert!(heap.is_free(Mfn::new(5)));
    }

    #[test]
    #[should_panic]
    fn double_free_is_fatal() {
        let heap = FrameHeap::new(16);
        let a = heap.alloc(0, None).unwrap();
        heap.free(a, 0);
        heap.free(a, 0);
    }
}
