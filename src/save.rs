//! Domain save records.
//!
//! A save image is a sequence of records, each a [`SaveDescriptor`]
//! followed by `length` payload bytes. The first record is the
//! [`SaveHeader`]; an all-zero descriptor ends the image.

use alloc::format;
use alloc::vec::Vec;
use core::mem::size_of;

use axerrno::{AxResult, ax_err, ax_err_type};
use axpv_types::VcpuId;
use numeric_enum_macro::numeric_enum;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::domain::{Domain, GuestRegs, Segment};
use crate::hypervisor::Hypervisor;

pub const SAVE_MAGIC: u32 = 0x5438_1286;
pub const SAVE_VERSION: u32 = 1;

numeric_enum! {
    #[repr(u16)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SaveType {
        End = 0,
        Header = 1,
        Cpu = 2,
        Pic = 3,
        Ioapic = 4,
        Lapic = 5,
        LapicRegs = 6,
        PciIrq = 7,
        IsaIrq = 8,
        PciLink = 9,
        Pit = 10,
        Rtc = 11,
        Hpet = 12,
    }
}

impl SaveType {
    /// Payload size of record types with a fixed layout.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            SaveType::End => Some(0),
            SaveType::Header => Some(size_of::<SaveHeader>()),
            SaveType::Cpu => Some(size_of::<CpuRecord>()),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SaveDescriptor {
    pub typecode: u16,
    pub instance: u16,
    /// Payload bytes, not counting the descriptor.
    pub length: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SaveHeader {
    pub magic: u32,
    pub version: u32,
    /// Build of the hypervisor that produced the image.
    pub changeset: u64,
    /// CPUID leaf 1 `eax` of the saving machine.
    pub cpuid: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentRecord {
    pub base: u64,
    pub limit: u32,
    pub attr: u32,
    pub selector: u16,
    pub _pad: [u8; 6],
}

/// Register file of one vCPU, segments in ES, CS, SS, DS, FS, GS order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CpuRecord {
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub segs: [SegmentRecord; 6],
}

impl From<&GuestRegs> for CpuRecord {
    fn from(r: &GuestRegs) -> Self {
        Self {
            gprs: r.gprs,
            rip: r.rip,
            rflags: r.rflags,
            cr0: r.cr0,
            cr2: r.cr2,
            cr3: r.cr3,
            cr4: r.cr4,
            efer: r.efer,
            segs: r.segs.map(|s| SegmentRecord {
                base: s.base,
                limit: s.limit,
                attr: s.attr,
                selector: s.selector,
                _pad: [0; 6],
            }),
        }
    }
}

impl From<&CpuRecord> for GuestRegs {
    fn from(c: &CpuRecord) -> Self {
        Self {
            gprs: c.gprs,
            rip: c.rip,
            rflags: c.rflags,
            cr0: c.cr0,
            cr2: c.cr2,
            cr3: c.cr3,
            cr4: c.cr4,
            efer: c.efer,
            segs: c.segs.map(|s| Segment {
                selector: s.selector,
                base: s.base,
                limit: s.limit,
                attr: s.attr,
            }),
        }
    }
}

pub struct SaveWriter {
    buf: Vec<u8>,
}

impl SaveWriter {
    /// Starts an image with its header record.
    pub fn new(changeset: u64, cpuid: u32) -> Self {
        let mut w = Self { buf: Vec::new() };
        let header = SaveHeader {
            magic: SAVE_MAGIC,
            version: SAVE_VERSION,
            changeset,
            cpuid,
            _pad: 0,
        };
        w.push(SaveType::Header, 0, header.as_bytes());
        w
    }

    fn push(&mut self, ty: SaveType, instance: u16, payload: &[u8]) {
        let desc = SaveDescriptor {
            typecode: ty as u16,
            instance,
            length: payload.len() as u32,
        };
        self.buf.extend_from_slice(desc.as_bytes());
        self.buf.extend_from_slice(payload);
    }

    /// Appends one record. Fixed-size types must carry exactly their size.
    pub fn record(&mut self, ty: SaveType, instance: u16, payload: &[u8]) -> AxResult {
        if matches!(ty, SaveType::Header | SaveType::End) {
            return ax_err!(InvalidInput, format!("{:?} records are implicit", ty));
        }
        if ty.fixed_len().is_some_and(|len| len != payload.len()) {
            return ax_err!(
                InvalidInput,
                format!("{:?} record of {} bytes", ty, payload.len())
            );
        }
        if u32::try_from(payload.len()).is_err() {
            return ax_err!(InvalidInput, "record too large");
        }
        self.push(ty, instance, payload);
        Ok(())
    }

    pub fn cpu(&mut self, instance: u16, regs: &GuestRegs) -> AxResult {
        self.record(SaveType::Cpu, instance, CpuRecord::from(regs).as_bytes())
    }

    /// Terminates the image.
    pub fn finish(mut self) -> Vec<u8> {
        self.push(SaveType::End, 0, &[]);
        self.buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRecord<'a> {
    pub ty: SaveType,
    pub instance: u16,
    pub payload: &'a [u8],
}

impl SaveRecord<'_> {
    pub fn cpu(&self) -> AxResult<GuestRegs> {
        if self.ty != SaveType::Cpu {
            return ax_err!(InvalidInput, format!("{:?} is not a CPU record", self.ty));
        }
        let rec = CpuRecord::read_from_bytes(self.payload)
            .map_err(|_| ax_err_type!(InvalidData, "short CPU record"))?;
        Ok(GuestRegs::from(&rec))
    }
}

pub struct SaveReader<'a> {
    buf: &'a [u8],
    pos: usize,
    header: SaveHeader,
    done: bool,
}

impl<'a> SaveReader<'a> {
    /// Checks the header of an image.
    pub fn new(buf: &'a [u8]) -> AxResult<Self> {
        let mut r = Self {
            buf,
            pos: 0,
            header: SaveHeader::default(),
            done: false,
        };
        let first = r.raw_next()?;
        if first.ty != SaveType::Header {
            return ax_err!(InvalidData, "image does not start with a header");
        }
        let header = SaveHeader::read_from_bytes(first.payload)
            .map_err(|_| ax_err_type!(InvalidData, "short header"))?;
        if header.magic != SAVE_MAGIC {
            return ax_err!(InvalidData, format!("bad magic {:#x}", header.magic));
        }
        if header.version != SAVE_VERSION {
            return ax_err!(Unsupported, format!("image version {}", header.version));
        }
        r.header = header;
        Ok(r)
    }

    pub fn header(&self) -> &SaveHeader {
        &self.header
    }

    fn raw_next(&mut self) -> AxResult<SaveRecord<'a>> {
        let rest = &self.buf[self.pos..];
        let (desc, rest) = SaveDescriptor::read_from_prefix(rest)
            .map_err(|_| ax_err_type!(InvalidData, format!("truncated descriptor at {}", self.pos)))?;
        let ty = SaveType::try_from(desc.typecode)
            .map_err(|code| ax_err_type!(InvalidData, format!("unknown record type {}", code)))?;
        let len = desc.length as usize;
        if ty.fixed_len().is_some_and(|fixed| fixed != len) {
            return ax_err!(InvalidData, format!("{:?} record of {} bytes", ty, len));
        }
        if rest.len() < len {
            return ax_err!(InvalidData, format!("{:?} record runs past the image", ty));
        }
        self.pos += size_of::<SaveDescriptor>() + len;
        Ok(SaveRecord {
            ty,
            instance: desc.instance,
            payload: &rest[..len],
        })
    }

    /// The next record, or `None` at the end marker.
    pub fn next_record(&mut self) -> AxResult<Option<SaveRecord<'a>>> {
        if self.done {
            return Ok(None);
        }
        let rec = self.raw_next()?;
        match rec.ty {
            SaveType::End => {
                self.done = true;
                Ok(None)
            }
            SaveType::Header => ax_err!(InvalidData, "second header record"),
            _ => Ok(Some(rec)),
        }
    }
}

impl Hypervisor {
    /// Quiesces `d` so its state can be recorded: vCPUs are paused,
    /// out-of-sync shadows resynchronised and nested VMX state written
    /// back into the guest's vVMCS.
    pub fn prepare_snapshot(&self, d: &Domain) -> AxResult {
        self.pause_domain(d);
        if d.is_shadowed() {
            self.shadow_sync(d)?;
        }
        for v in d.vcpus() {
            self.nvmx_flush(v);
        }
        debug!("{}: ready for snapshot", d.id());
        Ok(())
    }

    /// Records the register files of a paused domain.
    pub fn save_domain(&self, d: &Domain, changeset: u64, cpuid: u32) -> AxResult<Vec<u8>> {
        self.prepare_snapshot(d)?;
        let mut w = SaveWriter::new(changeset, cpuid);
        for v in d.vcpus() {
            let instance = u16::try_from(v.id().index())
                .map_err(|_| ax_err_type!(InvalidInput, "vcpu index exceeds the record instance"))?;
            w.cpu(instance, &v.regs.lock())?;
        }
        let image = w.finish();
        info!("{}: saved {} vcpus, {} bytes", d.id(), d.vcpus().len(), image.len());
        Ok(image)
    }

    /// Loads the CPU records of `image` into the vCPUs of `d`. Records of
    /// device models are skipped.
    pub fn restore_domain(&self, d: &Domain, image: &[u8]) -> AxResult {
        let mut r = SaveReader::new(image)?;
        let mut restored = Vec::new();
        while let Some(rec) = r.next_record()? {
            if rec.ty != SaveType::Cpu {
                trace!("{}: skipping {:?} record {}", d.id(), rec.ty, rec.instance);
                continue;
            }
            let v = d.vcpu(VcpuId::new(rec.instance as u32))?;
            restored.push((v.clone(), rec.cpu()?));
        }
        // Nothing is applied unless the whole image parsed.
        for (v, regs) in restored {
            *v.regs.lock() = regs;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainConfig;
    use crate::domain::SegReg;
    use crate::hypervisor::tests::{dom, machine, shadow_dom};
    use axerrno::AxError;
    use axpv_types::DomainId;

    #[test]
    fn record_layouts() {
        assert_eq!(size_of::<SaveDescriptor>(), 8);
        assert_eq!(size_of::<SaveHeader>(), 24);
        assert_eq!(size_of::<SegmentRecord>(), 24);
        assert_eq!(size_of::<CpuRecord>(), 16 * 8 + 7 * 8 + 6 * 24);
    }

    #[test]
    fn image_structure() {
        let mut w = SaveWriter::new(7, 0x906ea);
        w.record(SaveType::Pit, 0, &[1, 2, 3]).unwrap();
        assert_eq!(w.record(SaveType::Header, 0, &[0; 24]), Err(AxError::InvalidInput));
        assert_eq!(w.record(SaveType::Cpu, 0, &[0; 8]), Err(AxError::InvalidInput));
        let image = w.finish();
        assert_eq!(&image[..8], &[1, 0, 0, 0, 24, 0, 0, 0]);
        assert_eq!(&image[image.len() - 8..], &[0; 8]);

        let mut r = SaveReader::new(&image).unwrap();
        assert_eq!(r.header().changeset, 7);
        assert_eq!(r.header().cpuid, 0x906ea);
        let pit = r.next_record().unwrap().unwrap();
        assert_eq!((pit.ty, pit.payload), (SaveType::Pit, &[1u8, 2, 3][..]));
        assert_eq!(r.next_record(), Ok(None));
        assert_eq!(r.next_record(), Ok(None));
    }

    #[test]
    fn malformed_images_are_rejected() {
        let image = SaveWriter::new(0, 0).finish();
        let mut bad = image.clone();
        bad[8] ^= 1;
        assert_eq!(SaveReader::new(&bad).err(), Some(AxError::InvalidData));
        let mut newer = image.clone();
        newer[12] = 2;
        assert_eq!(SaveReader::new(&newer).err(), Some(AxError::Unsupported));
        assert_eq!(SaveReader::new(&image[..20]).err(), Some(AxError::InvalidData));

        // A CPU descriptor with the wrong length.
        let mut wrong = image[..32].to_vec();
        wrong.extend_from_slice(SaveDescriptor { typecode: 2, instance: 0, length: 4 }.as_bytes());
        wrong.extend_from_slice(&[0; 4]);
        let mut r = SaveReader::new(&wrong).unwrap();
        assert_eq!(r.next_record(), Err(AxError::InvalidData));

        // No end marker.
        let mut r = SaveReader::new(&image[..32]).unwrap();
        assert_eq!(r.next_record(), Err(AxError::InvalidData));
    }

    #[test]
    fn domain_registers_survive_save_and_restore() {
        let hv = machine(alloc::vec![DomainConfig { vcpus: 2, ..dom(1) }, shadow_dom(2)]);
        let d = hv.domain(DomainId::new(1)).unwrap();
        {
            let v1 = d.vcpu(VcpuId::new(1)).unwrap();
            let mut regs = v1.regs.lock();
            regs.rip = 0xffff_8000_0010_0000;
            regs.gprs[3] = 42;
            regs.seg_mut(SegReg::Cs).selector = 0x10;
            regs.seg_mut(SegReg::Cs).attr = 0xa09b;
        }
        let saved = d.vcpu(VcpuId::new(1)).unwrap().regs.lock().clone();
        let image = hv.save_domain(&d, 1, 0).unwrap();
        assert!(d.vcpus().iter().all(|v| v.is_paused()));

        *d.vcpu(VcpuId::new(1)).unwrap().regs.lock() = GuestRegs::default();
        hv.restore_domain(&d, &image).unwrap();
        assert_eq!(*d.vcpu(VcpuId::new(1)).unwrap().regs.lock(), saved);

        // The second domain has one vCPU: the image names one it lacks.
        let other = hv.domain(DomainId::new(2)).unwrap();
        hv.prepare_snapshot(&other).unwrap();
        assert_eq!(hv.restore_domain(&other, &image), Err(AxError::NotFound));
        assert_eq!(*other.vcpu(VcpuId::new(0)).unwrap().regs.lock(), GuestRegs::default());
    }
}
