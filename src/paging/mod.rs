//! Page-table formats, the guest walker and the shadow engine.
//!
//! Every walk in the crate is driven by a [`PagingFormat`], a small table
//! describing each level's index shift, entry count and entry width, so the
//! same code handles 2-level, PAE and 4-level tables.

mod shadow;
mod walk;

pub use shadow::{FaultOutcome, ShadowDomain, ShadowKind, ShadowStats};
pub use walk::{GuestWalk, WalkFault, walk_guest};

use bitflags::bitflags;
use serde::Deserialize;

use axpv_types::{GuestVirtAddr, Mfn};

/// Number of levels of a guest's page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagingLevels {
    Two,
    Three,
    Four,
}

bitflags! {
    /// x86 page-table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Large page in a non-leaf level.
        const PSE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// Software bit: this shadow entry is writable because the guest
        /// table it maps is out of sync.
        const SH_OOS = 1 << 9;
        const NX = 1 << 63;
    }
}

bitflags! {
    /// Page-fault error code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfErrorCode: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RSVD = 1 << 3;
        const FETCH = 1 << 4;
    }
}

/// Flags a non-leaf shadow entry copies from its guest entry, besides NX.
pub const SHADOW_LINK_FLAGS: PteFlags = PteFlags::PRESENT
    .union(PteFlags::RW)
    .union(PteFlags::USER)
    .union(PteFlags::ACCESSED);

/// One page-table entry, of either width.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(u64);

impl Pte {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn new(mfn: Mfn, flags: PteFlags) -> Self {
        Self((mfn.raw() << axpv_types::PAGE_SHIFT) | flags.bits())
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Frame number named by the entry under `format`.
    pub fn mfn(self, format: &PagingFormat) -> Mfn {
        Mfn::new((self.0 & format.addr_mask) >> axpv_types::PAGE_SHIFT)
    }

    /// Same as [`Pte::mfn`], for entries holding guest frame numbers.
    pub fn frame(self, format: &PagingFormat) -> u64 {
        (self.0 & format.addr_mask) >> axpv_types::PAGE_SHIFT
    }

    pub fn with_flags(self, flags: PteFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    pub fn without_flags(self, flags: PteFlags) -> Self {
        Self(self.0 & !flags.bits())
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#x}, {:?})", self.0 & !0xfff & !PteFlags::NX.bits(), self.flags())
    }
}

/// Geometry of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelInfo {
    /// Virtual-address bit where this level's index starts.
    pub shift: u32,
    /// Entries in one table of this level.
    pub entries: usize,
    /// Whether a PSE entry at this level maps a superpage.
    pub large_ok: bool,
}

/// Geometry of a whole page-table format.
#[derive(Debug, PartialEq, Eq)]
pub struct PagingFormat {
    pub levels: usize,
    /// Bytes per entry, 4 or 8.
    pub entry_bytes: usize,
    pub addr_mask: u64,
    /// Index 0 is level 1.
    pub level_info: [LevelInfo; 4],
}

const fn level(shift: u32, entries: usize, large_ok: bool) -> LevelInfo {
    LevelInfo {
        shift,
        entries,
        large_ok,
    }
}

pub const TWO_LEVEL: PagingFormat = PagingFormat {
    levels: 2,
    entry_bytes: 4,
    addr_mask: 0xffff_f000,
    level_info: [level(12, 1024, false), level(22, 1024, true), level(0, 0, false), level(0, 0, false)],
};

pub const PAE: PagingFormat = PagingFormat {
    levels: 3,
    entry_bytes: 8,
    addr_mask: 0x000f_ffff_ffff_f000,
    level_info: [level(12, 512, false), level(21, 512, true), level(30, 4, false), level(0, 0, false)],
};

pub const FOUR_LEVEL: PagingFormat = PagingFormat {
    levels: 4,
    entry_bytes: 8,
    addr_mask: 0x000f_ffff_ffff_f000,
    level_info: [level(12, 512, false), level(21, 512, true), level(30, 512, false), level(39, 512, false)],
};

impl PagingFormat {
    pub fn of(levels: PagingLevels) -> &'static PagingFormat {
        match levels {
            PagingLevels::Two => &TWO_LEVEL,
            PagingLevels::Three => &PAE,
            PagingLevels::Four => &FOUR_LEVEL,
        }
    }

    pub fn info(&self, level: usize) -> &LevelInfo {
        &self.level_info[level - 1]
    }

    pub fn entries(&self, level: usize) -> usize {
        self.info(level).entries
    }

    /// Index of `va` in a table of `level`.
    pub fn index(&self, level: usize, va: GuestVirtAddr) -> usize {
        let info = self.info(level);
        (va.as_usize() >> info.shift) & (info.entries - 1)
    }

    /// Frames covered by a superpage at `level`.
    pub fn superpage_frames(&self, level: usize) -> usize {
        1 << (self.info(level).shift - axpv_types::PAGE_SHIFT as u32)
    }

    /// Flags that are meaningful in this format's entries.
    pub fn flag_mask(&self) -> PteFlags {
        if self.entry_bytes == 4 {
            PteFlags::all().difference(PteFlags::NX)
        } else {
            PteFlags::all()
        }
    }
}
