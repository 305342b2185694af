//! Copying hypercall arguments in and out of guest memory.
//!
//! Guest handles are guest-physical addresses resolved through the calling
//! domain's P2M. Address 0 is the null handle and never resolves.

use alloc::format;

use axerrno::{AxResult, ax_err};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use axpv_types::{Gpfn, PAGE_SHIFT};

use crate::domain::Domain;
use crate::hypervisor::Hypervisor;
use crate::mm::p2m::P2mType;

const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

impl Hypervisor {
    fn guest_pages(
        &self,
        d: &Domain,
        gpa: u64,
        len: usize,
        write: bool,
        mut each: impl FnMut(axpv_types::Mfn, usize, core::ops::Range<usize>),
    ) -> AxResult {
        if gpa == 0 {
            return ax_err!(BadAddress, format!("{}: null guest handle", d.id()));
        }
        if gpa.checked_add(len as u64).is_none() {
            return ax_err!(BadAddress, format!("{}: {:#x}+{} wraps", d.id(), gpa, len));
        }
        let mut done = 0;
        while done < len {
            let at = gpa + done as u64;
            let gpfn = Gpfn::from_addr(at);
            let offset = (at & (PAGE_SIZE - 1)) as usize;
            let n = (PAGE_SIZE as usize - offset).min(len - done);
            let (mfn, ty) = d.p2m.lookup(gpfn);
            if !ty.is_ram() || self.frames.owner(mfn) != Some(d.id()) {
                return ax_err!(BadAddress, format!("{}: {:#x} is not guest RAM", d.id(), at));
            }
            if write {
                if ty == P2mType::RamRo {
                    return ax_err!(BadAddress, format!("{}: {:#x} is read-only", d.id(), at));
                }
                let info = self.frames.info(mfn);
                if info.ty.is_table() && info.type_count > 0 {
                    return ax_err!(BadAddress, format!("{}: {:#x} is a live page table", d.id(), at));
                }
                if d.is_shadowed() {
                    self.with_shadow(d, |s| {
                        s.prepare_write(&self.frames, gpfn, mfn);
                        Ok(())
                    })?;
                }
            }
            each(mfn, offset, done..done + n);
            done += n;
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes from guest-physical `gpa` of `d`.
    pub fn copy_from_guest(&self, d: &Domain, gpa: u64, buf: &mut [u8]) -> AxResult {
        let len = buf.len();
        self.guest_pages(d, gpa, len, false, |mfn, offset, range| {
            self.frames.read_bytes(mfn, offset, &mut buf[range]);
        })
    }

    /// Copies `buf` to guest-physical `gpa` of `d`. Pages already copied
    /// stay written when a later page faults.
    pub fn copy_to_guest(&self, d: &Domain, gpa: u64, buf: &[u8]) -> AxResult {
        self.guest_pages(d, gpa, buf.len(), true, |mfn, offset, range| {
            self.frames.write_bytes(mfn, offset, &buf[range]);
        })
    }

    pub fn read_guest<T: FromBytes + IntoBytes>(&self, d: &Domain, gpa: u64) -> AxResult<T> {
        let mut val = T::new_zeroed();
        self.copy_from_guest(d, gpa, val.as_mut_bytes())?;
        Ok(val)
    }

    pub fn write_guest<T: IntoBytes + Immutable>(&self, d: &Domain, gpa: u64, val: &T) -> AxResult {
        self.copy_to_guest(d, gpa, val.as_bytes())
    }
}

/// A list of frame numbers the memory operations walk. Indices are
/// absolute positions in the guest's list.
pub(crate) trait ExtentList {
    fn get(&mut self, i: u64) -> AxResult<u64>;
    fn put(&mut self, i: u64, val: u64) -> AxResult;

    /// A null list is never read or written.
    fn is_null(&self) -> bool {
        false
    }
}

/// An array of 32- or 64-bit frame numbers in guest memory.
pub(crate) struct GuestList<'a> {
    hv: &'a Hypervisor,
    d: &'a Domain,
    gpa: u64,
    width: usize,
}

impl<'a> GuestList<'a> {
    pub fn native(hv: &'a Hypervisor, d: &'a Domain, gpa: u64) -> Self {
        Self { hv, d, gpa, width: 8 }
    }

    pub fn compat(hv: &'a Hypervisor, d: &'a Domain, gpa: u64) -> Self {
        Self { hv, d, gpa, width: 4 }
    }

    fn slot(&self, i: u64) -> AxResult<u64> {
        i.checked_mul(self.width as u64)
            .and_then(|off| self.gpa.checked_add(off))
            .ok_or_else(|| axerrno::ax_err_type!(BadAddress, "extent index overflows"))
    }
}

impl ExtentList for GuestList<'_> {
    fn is_null(&self) -> bool {
        self.gpa == 0
    }

    fn get(&mut self, i: u64) -> AxResult<u64> {
        let at = self.slot(i)?;
        if self.width == 4 {
            Ok(self.hv.read_guest::<u32>(self.d, at)? as u64)
        } else {
            self.hv.read_guest::<u64>(self.d, at)
        }
    }

    fn put(&mut self, i: u64, val: u64) -> AxResult {
        let at = self.slot(i)?;
        if self.width == 8 {
            return self.hv.write_guest(self.d, at, &val);
        }
        let narrow = match u32::try_from(val) {
            Ok(v) => v,
            Err(_) if val == u64::MAX => u32::MAX,
            Err(_) => {
                return ax_err!(InvalidData, format!("{:#x} does not fit a 32-bit list", val));
            }
        };
        self.hv.write_guest(self.d, at, &narrow)
    }
}

/// Reads from one guest list and writes results to another, as
/// `translate_gpfn_list` does.
pub(crate) struct SplitList<'a> {
    pub src: GuestList<'a>,
    pub dst: GuestList<'a>,
}

impl ExtentList for SplitList<'_> {
    fn get(&mut self, i: u64) -> AxResult<u64> {
        self.src.get(i)
    }

    fn put(&mut self, i: u64, val: u64) -> AxResult {
        self.dst.put(i, val)
    }
}

/// 64-bit extents staged in a vCPU's translation area, holding the list
/// entries from index `first` on.
pub(crate) struct StagedList<'a> {
    buf: &'a mut [u8],
    first: u64,
}

impl<'a> StagedList<'a> {
    pub fn new(buf: &'a mut [u8], first: u64) -> Self {
        Self { buf, first }
    }

    /// Number of extents the area can hold.
    pub fn capacity(&self) -> u64 {
        (self.buf.len() / 8) as u64
    }

    fn offset(&self, i: u64) -> AxResult<usize> {
        match i.checked_sub(self.first) {
            Some(rel) if rel < self.capacity() => Ok(rel as usize * 8),
            _ => ax_err!(
                BadAddress,
                format!("extent {} outside staged window at {}", i, self.first)
            ),
        }
    }
}

impl ExtentList for StagedList<'_> {
    fn get(&mut self, i: u64) -> AxResult<u64> {
        let off = self.offset(i)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[off..off + 8]);
        Ok(u64::from_le_bytes(raw))
    }

    fn put(&mut self, i: u64, val: u64) -> AxResult {
        let off = self.offset(i)?;
        self.buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::tests::{dom, machine, shadow_dom};
    use crate::mm::p2m::P2mType;
    use axerrno::AxError;
    use axpv_types::DomainId;

    #[test]
    fn copies_cross_page_boundaries() {
        let hv = machine(alloc::vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        hv.populate_physmap(&d, Gpfn::new(4), 1).unwrap();
        let gpa = 5 * PAGE_SIZE - 3;
        hv.copy_to_guest(&d, gpa, &[1, 2, 3, 4, 5, 6]).unwrap();
        let mut back = [0u8; 6];
        hv.copy_from_guest(&d, gpa, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4, 5, 6]);

        let hi = d.p2m.gpfn_to_mfn(Gpfn::new(5));
        let mut first = [0u8; 3];
        hv.frames().read_bytes(hi, 0, &mut first);
        assert_eq!(first, [4, 5, 6]);
    }

    #[test]
    fn unmapped_and_readonly_memory_faults() {
        let hv = machine(alloc::vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        hv.populate_physmap(&d, Gpfn::new(1), 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(hv.copy_from_guest(&d, 0, &mut buf), Err(AxError::BadAddress));
        assert_eq!(hv.copy_from_guest(&d, 0x2000, &mut buf), Err(AxError::BadAddress));
        assert_eq!(hv.copy_from_guest(&d, 0x1ffc, &mut buf), Err(AxError::BadAddress));
        assert_eq!(hv.copy_from_guest(&d, u64::MAX - 2, &mut buf), Err(AxError::BadAddress));

        d.p2m.set_type(Gpfn::new(1), P2mType::RamRo).unwrap();
        assert!(hv.copy_from_guest(&d, 0x1000, &mut buf).is_ok());
        assert_eq!(hv.write_guest(&d, 0x1000, &7u64), Err(AxError::BadAddress));
    }

    #[test]
    fn writes_are_logged_for_dirty_tracking() {
        let hv = machine(alloc::vec![shadow_dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        hv.populate_physmap(&d, Gpfn::new(0), 2).unwrap();
        hv.log_dirty_enable(&d).unwrap();
        hv.write_guest(&d, 0x2008, &0xdead_beefu32).unwrap();
        assert_eq!(hv.read_guest::<u32>(&d, 0x2008), Ok(0xdead_beef));
        let dirty = hv.log_dirty_clean(&d).unwrap();
        assert!(dirty.contains(&Gpfn::new(2)));
        assert!(!dirty.contains(&Gpfn::new(1)));
    }

    #[test]
    fn compat_lists_narrow_entries() {
        let hv = machine(alloc::vec![dom(1)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        hv.populate_physmap(&d, Gpfn::new(1), 0).unwrap();
        let mut list = GuestList::compat(&hv, &d, 0x1000);
        list.put(1, 0x55).unwrap();
        list.put(2, u64::MAX).unwrap();
        assert_eq!(list.put(3, 1 << 40), Err(AxError::InvalidData));
        assert_eq!(list.get(1), Ok(0x55));
        assert_eq!(list.get(2), Ok(u32::MAX as u64));
        assert_eq!(hv.read_guest::<u32>(&d, 0x1004), Ok(0x55));
    }

    #[test]
    fn staged_list_uses_absolute_indices() {
        let mut area = [0u8; 32];
        let mut staged = StagedList::new(&mut area, 10);
        assert_eq!(staged.capacity(), 4);
        staged.put(12, 0xabc).unwrap();
        assert_eq!(staged.get(12), Ok(0xabc));
        assert_eq!(staged.get(9), Err(AxError::BadAddress));
        assert_eq!(staged.put(14, 1), Err(AxError::BadAddress));
        assert_eq!(&area[16..24], &0xabcu64.to_le_bytes());
    }
}
