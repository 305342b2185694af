//! Software walk of a guest's own page tables.

use axpv_types::{GuestVirtAddr, Gpfn, Mfn, PAGE_SHIFT};

use super::{PagingFormat, PfErrorCode, Pte, PteFlags};
use crate::mm::frame::FrameTable;
use crate::mm::p2m::P2mTable;

pub(crate) fn read_entry(frames: &FrameTable, format: &PagingFormat, mfn: Mfn, idx: usize) -> Pte {
    if format.entry_bytes == 4 {
        Pte::from_raw(frames.read_u32(mfn, idx) as u64)
    } else {
        Pte::from_raw(frames.read_word(mfn, idx))
    }
}

pub(crate) fn write_entry(frames: &FrameTable, format: &PagingFormat, mfn: Mfn, idx: usize, pte: Pte) {
    if format.entry_bytes == 4 {
        frames.write_u32(mfn, idx, pte.raw() as u32);
    } else {
        frames.write_word(mfn, idx, pte.raw());
    }
}

/// Swaps an entry if it still holds `old`.
pub(crate) fn cas_entry(
    frames: &FrameTable,
    format: &PagingFormat,
    mfn: Mfn,
    idx: usize,
    old: Pte,
    new: Pte,
) -> bool {
    if format.entry_bytes == 4 {
        frames
            .cmpxchg_u32(mfn, idx, old.raw() as u32, new.raw() as u32)
            .is_ok()
    } else {
        frames.cmpxchg_word(mfn, idx, old.raw(), new.raw()).is_ok()
    }
}

/// PAE page-directory-pointer entries carry no access rights.
pub(crate) fn level_has_rights(format: &PagingFormat, level: usize) -> bool {
    !(format.levels == 3 && level == 3)
}

/// Why a guest walk failed, at which level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkFault {
    NotPresent { level: usize },
    Protection { level: usize },
    Reserved { level: usize },
    /// A table frame is not guest RAM.
    BadTable { level: usize },
}

impl WalkFault {
    /// Error code to reflect to the guest for an access described by
    /// `access`.
    pub fn error_code(self, access: PfErrorCode) -> PfErrorCode {
        let access = access & (PfErrorCode::WRITE | PfErrorCode::USER | PfErrorCode::FETCH);
        match self {
            WalkFault::NotPresent { .. } | WalkFault::BadTable { .. } => access,
            WalkFault::Protection { .. } => access | PfErrorCode::PRESENT,
            WalkFault::Reserved { .. } => access | PfErrorCode::PRESENT | PfErrorCode::RSVD,
        }
    }
}

/// A successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestWalk {
    pub va: GuestVirtAddr,
    /// Guest frame holding the page `va` falls in.
    pub gpfn: Gpfn,
    /// Level of the leaf entry: 1, or the level of a superpage.
    pub leaf_level: usize,
    /// Guest table frame and entry at each level, index 0 being level 1.
    pub tables: [Mfn; 4],
    pub entries: [Pte; 4],
    /// Rights accumulated across the walk.
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
}

impl GuestWalk {
    pub fn leaf(&self) -> Pte {
        self.entries[self.leaf_level - 1]
    }

    /// Byte offset of `va` in its 4K page.
    pub fn page_offset(&self) -> usize {
        self.va.as_usize() & ((1 << PAGE_SHIFT) - 1)
    }

    /// Sets Accessed along the walk and Dirty on the leaf for writes, as the
    /// hardware walker would. Entries changed concurrently are left alone.
    pub fn set_ad_bits(&mut self, frames: &FrameTable, format: &PagingFormat, write: bool) {
        let top = format.levels;
        for level in (self.leaf_level..=top).rev() {
            if !level_has_rights(format, level) {
                continue;
            }
            let i = level - 1;
            let old = self.entries[i];
            let mut new = old.with_flags(PteFlags::ACCESSED);
            if write && level == self.leaf_level {
                new = new.with_flags(PteFlags::DIRTY);
            }
            if new != old {
                let idx = format.index(level, self.va);
                if cas_entry(frames, format, self.tables[i], idx, old, new) {
                    self.entries[i] = new;
                }
            }
        }
    }
}

/// Walks the guest tables rooted at `root` for an access of kind `access`.
pub fn walk_guest(
    frames: &FrameTable,
    p2m: &P2mTable,
    format: &PagingFormat,
    root: Gpfn,
    va: GuestVirtAddr,
    access: PfErrorCode,
) -> Result<GuestWalk, WalkFault> {
    let mut walk = GuestWalk {
        va,
        gpfn: Gpfn::INVALID,
        leaf_level: 1,
        tables: [Mfn::INVALID; 4],
        entries: [Pte::empty(); 4],
        writable: true,
        user: true,
        executable: true,
    };
    let mut table = root;
    for level in (1..=format.levels).rev() {
        let (mfn, ty) = p2m.lookup(table);
        if !ty.is_ram() || !frames.contains(mfn) {
            return Err(WalkFault::BadTable { level });
        }
        let pte = read_entry(frames, format, mfn, format.index(level, va));
        walk.tables[level - 1] = mfn;
        walk.entries[level - 1] = pte;
        if !pte.is_present() {
            return Err(WalkFault::NotPresent { level });
        }
        let flags = pte.flags() & format.flag_mask();
        if level_has_rights(format, level) {
            walk.writable &= flags.contains(PteFlags::RW);
            walk.user &= flags.contains(PteFlags::USER);
            walk.executable &= !flags.contains(PteFlags::NX);
        }
        let frame = pte.frame(format);
        if level > 1 && flags.contains(PteFlags::PSE) && level_has_rights(format, level) {
            if !format.info(level).large_ok {
                return Err(WalkFault::Reserved { level });
            }
            let span = format.superpage_frames(level) as u64;
            let within = ((va.as_usize() >> PAGE_SHIFT) as u64) & (span - 1);
            walk.gpfn = Gpfn::new((frame & !(span - 1)) + within);
            walk.leaf_level = level;
            break;
        }
        if level == 1 {
            walk.gpfn = Gpfn::new(frame);
            walk.leaf_level = 1;
        } else {
            table = Gpfn::new(frame);
        }
    }

    let denied = (access.contains(PfErrorCode::WRITE) && !walk.writable)
        || (access.contains(PfErrorCode::USER) && !walk.user)
        || (access.contains(PfErrorCode::FETCH) && !walk.executable);
    if denied {
        return Err(WalkFault::Protection {
            level: walk.leaf_level,
        });
    }
    Ok(walk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhysmapLayout;
    use crate::mm::p2m::{M2pTable, P2mType};
    use crate::paging::{FOUR_LEVEL, TWO_LEVEL};
    use axpv_types::DomainId;

    struct Guest {
        frames: FrameTable,
        m2p: M2pTable,
        p2m: P2mTable,
    }

    impl Guest {
        fn new() -> Self {
            Self {
                frames: FrameTable::new(64, 1),
                m2p: M2pTable::new(64),
                p2m: P2mTable::new(DomainId::new(1), false, PhysmapLayout::default()),
            }
        }

        /// Backs guest frame `gpfn` with a fresh machine frame.
        fn page(&self, gpfn: u64) -> Mfn {
            let mfn = self.frames.alloc_domain_pages(DomainId::new(1), 0, None).unwrap();
            self.p2m
                .add_to_physmap(&self.m2p, Gpfn::new(gpfn), mfn, P2mType::RamRw)
                .unwrap();
            mfn
        }

        fn set(&self, format: &PagingFormat, table: Mfn, idx: usize, gpfn: u64, flags: PteFlags) {
            write_entry(&self.frames, format, table, idx, Pte::from_raw((gpfn << 12) | flags.bits()));
        }
    }

    const URW: PteFlags = PteFlags::PRESENT.union(PteFlags::RW).union(PteFlags::USER);

    #[test]
    fn four_level_walk_accumulates_rights() {
        let g = Guest::new();
        let (l4, l3, l2, l1) = (g.page(1), g.page(2), g.page(3), g.page(4));
        g.page(9);
        let va = GuestVirtAddr::from(0x0000_0080_4020_3123usize);
        g.set(&FOUR_LEVEL, l4, FOUR_LEVEL.index(4, va), 2, URW);
        g.set(&FOUR_LEVEL, l3, FOUR_LEVEL.index(3, va), 3, URW);
        g.set(&FOUR_LEVEL, l2, FOUR_LEVEL.index(2, va), 4, PteFlags::PRESENT | PteFlags::USER);
        g.set(&FOUR_LEVEL, l1, FOUR_LEVEL.index(1, va), 9, URW);

        let mut walk =
            walk_guest(&g.frames, &g.p2m, &FOUR_LEVEL, Gpfn::new(1), va, PfErrorCode::USER).unwrap();
        assert_eq!(walk.gpfn, Gpfn::new(9));
        assert_eq!(walk.page_offset(), 0x123);
        assert!(!walk.writable);
        walk.set_ad_bits(&g.frames, &FOUR_LEVEL, false);
        assert!(read_entry(&g.frames, &FOUR_LEVEL, l1, FOUR_LEVEL.index(1, va))
            .flags()
            .contains(PteFlags::ACCESSED));

        let err = walk_guest(&g.frames, &g.p2m, &FOUR_LEVEL, Gpfn::new(1), va, PfErrorCode::WRITE)
            .unwrap_err();
        assert_eq!(err, WalkFault::Protection { level: 1 });
        assert_eq!(
            err.error_code(PfErrorCode::WRITE),
            PfErrorCode::WRITE | PfErrorCode::PRESENT
        );
        let other = GuestVirtAddr::from(0x1000usize);
        assert_eq!(
            walk_guest(&g.frames, &g.p2m, &FOUR_LEVEL, Gpfn::new(1), other, PfErrorCode::empty()),
            Err(WalkFault::NotPresent { level: 4 })
        );
    }

    #[test]
    fn two_level_superpage_offsets() {
        let g = Guest::new();
        let l2 = g.page(1);
        // 4MB page at guest frame 0x400.
        let va = GuestVirtAddr::from(0x00c0_5000usize);
        g.set(&TWO_LEVEL, l2, TWO_LEVEL.index(2, va), 0x400, URW | PteFlags::PSE);
        let walk =
            walk_guest(&g.frames, &g.p2m, &TWO_LEVEL, Gpfn::new(1), va, PfErrorCode::WRITE).unwrap();
        assert_eq!(walk.leaf_level, 2);
        assert_eq!(walk.gpfn, Gpfn::new(0x405));
    }

    #[test]
    fn gigabyte_pages_are_reserved() {
        let g = Guest::new();
        let (l4, l3) = (g.page(1), g.page(2));
        let va = GuestVirtAddr::from(0x4000_0000usize);
        g.set(&FOUR_LEVEL, l4, 0, 2, URW);
        g.set(&FOUR_LEVEL, l3, 1, 0x40000, URW | PteFlags::PSE);
        let err = walk_guest(&g.frames, &g.p2m, &FOUR_LEVEL, Gpfn::new(1), va, PfErrorCode::empty())
            .unwrap_err();
        assert_eq!(err, WalkFault::Reserved { level: 3 });
        assert!(err.error_code(PfErrorCode::empty()).contains(PfErrorCode::RSVD));
    }
}
