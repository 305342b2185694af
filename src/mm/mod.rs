//! Machine memory: the frame pool, frame ownership, and guest-physical
//! translation.

pub mod contig;
pub mod frame;
pub mod heap;
pub mod p2m;
pub mod reservation;
pub mod tlb;
