//! Domains, their virtual CPUs, and the domain arena.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use axerrno::{AxResult, ax_err, ax_err_type};
use bit_field::BitField;
use numeric_enum_macro::numeric_enum;
use spin::{Mutex, RwLock};

use axpv_types::{DomainId, Gpfn, Mfn, VcpuId};

use crate::config::{DomainConfig, PagingKind, PvConfig};
use crate::event::{EventChannels, SharedInfo};
use crate::grant::GrantTable;
use crate::mm::frame::{FrameOwner, FrameTable};
use crate::mm::p2m::P2mTable;
use crate::mm::tlb::CpuMask;
use crate::paging::{PagingLevels, ShadowDomain};
use crate::vmx::NestedVmx;

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RunState {
        Running = 0,
        Runnable = 1,
        Blocked = 2,
        /// Not on any run queue.
        Offline = 3,
    }
}

/// Segment registers, in x86 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub fn from_index(idx: u64) -> Option<Self> {
        Some(match idx {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            3 => SegReg::Ds,
            4 => SegReg::Fs,
            5 => SegReg::Gs,
            _ => return None,
        })
    }
}

/// Cached segment descriptor, access rights in VMX layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attr: u32,
}

impl Segment {
    /// 64-bit code segment.
    pub fn is_long(&self) -> bool {
        self.attr.get_bit(13)
    }

    pub fn dpl(&self) -> u8 {
        self.attr.get_bits(5..7) as u8
    }
}

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_PG: u64 = 1 << 31;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_VMXE: u64 = 1 << 13;
pub const EFER_LMA: u64 = 1 << 10;
pub const RFLAGS_VM: u64 = 1 << 17;

/// Architectural register file of a vCPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRegs {
    /// rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15.
    pub gprs: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub segs: [Segment; 6],
}

impl Default for GuestRegs {
    fn default() -> Self {
        Self {
            gprs: [0; 16],
            rip: 0,
            rflags: 0x2,
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
            segs: [Segment::default(); 6],
        }
    }
}

impl GuestRegs {
    pub fn seg(&self, reg: SegReg) -> &Segment {
        &self.segs[reg as usize]
    }

    pub fn seg_mut(&mut self, reg: SegReg) -> &mut Segment {
        &mut self.segs[reg as usize]
    }

    pub fn cpl(&self) -> u8 {
        self.seg(SegReg::Ss).dpl()
    }

    pub fn long_mode(&self) -> bool {
        self.efer & EFER_LMA != 0
    }
}

pub struct Vcpu {
    domain: DomainId,
    id: VcpuId,
    state: AtomicU8,
    processor: AtomicUsize,
    pause_count: AtomicU32,
    preempt_pending: AtomicBool,
    /// Base page table installed by a paravirtual guest, holding a typed
    /// reference.
    guest_table: AtomicU64,
    pub regs: Mutex<GuestRegs>,
    pub nested: Mutex<NestedVmx>,
    /// Argument translation area for 32-bit hypercalls.
    pub xlat: Mutex<Box<[u8]>>,
}

impl Vcpu {
    fn new(domain: DomainId, id: VcpuId, processor: usize, xlat_size: usize) -> Self {
        Self {
            domain,
            id,
            state: AtomicU8::new(RunState::Offline as u8),
            processor: AtomicUsize::new(processor),
            pause_count: AtomicU32::new(0),
            preempt_pending: AtomicBool::new(false),
            guest_table: AtomicU64::new(Mfn::INVALID.raw()),
            regs: Mutex::new(GuestRegs::default()),
            nested: Mutex::new(NestedVmx::default()),
            xlat: Mutex::new(vec![0u8; xlat_size].into_boxed_slice()),
        }
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn state(&self) -> RunState {
        RunState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(RunState::Offline)
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn processor(&self) -> usize {
        self.processor.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn pause(&self) {
        self.pause_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns whether the vCPU is now unpaused.
    pub(crate) fn unpause(&self) -> bool {
        let prev = self.pause_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            bug!("{}v{}: unpause without pause", self.domain, self.id.index());
        }
        prev == 1
    }

    pub fn preempt_pending(&self) -> bool {
        self.preempt_pending.load(Ordering::Acquire)
    }

    pub fn set_preempt_pending(&self, pending: bool) {
        self.preempt_pending.store(pending, Ordering::Release);
    }

    pub fn guest_table(&self) -> Option<Mfn> {
        let raw = Mfn::new(self.guest_table.load(Ordering::Acquire));
        (!raw.is_invalid()).then_some(raw)
    }

    /// Installs a new base table, returning the previous one.
    pub(crate) fn swap_guest_table(&self, mfn: Option<Mfn>) -> Option<Mfn> {
        let old = Mfn::new(
            self.guest_table
                .swap(mfn.unwrap_or(Mfn::INVALID).raw(), Ordering::AcqRel),
        );
        (!old.is_invalid()).then_some(old)
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("domain", &self.domain)
            .field("id", &self.id.index())
            .field("state", &self.state())
            .field("processor", &self.processor())
            .finish()
    }
}

pub struct Domain {
    id: DomainId,
    privileged: bool,
    paging: PagingKind,
    levels: PagingLevels,
    compat: bool,
    max_pages: AtomicUsize,
    tot_pages: AtomicUsize,
    dying: AtomicBool,
    dirty_cpus: AtomicU64,
    pub p2m: P2mTable,
    pub grants: GrantTable,
    pub evtchn: EventChannels,
    pub shared: SharedInfo,
    vcpus: Vec<Arc<Vcpu>>,
    /// Shadow state. Its lock is the domain's big lock for every shadow
    /// table update.
    pub shadow: Mutex<Option<ShadowDomain>>,
    /// Serializes reservation reshaping.
    pub balloon_lock: Mutex<()>,
    /// One bit per RAM frame that belongs to a contiguous region.
    contig: Mutex<Vec<u64>>,
}

impl Domain {
    pub(crate) fn new(
        machine: &PvConfig,
        config: &DomainConfig,
        frames: &Arc<FrameTable>,
    ) -> AxResult<Self> {
        let id = DomainId::new(config.id);
        if id.is_reserved() {
            return ax_err!(InvalidInput, format!("{} is a reserved domain id", id));
        }
        let grants = GrantTable::new(id, frames.clone(), machine)?;
        let p2m = P2mTable::new(id, config.privileged, config.layout);
        p2m.set_grant_frames(grants.frames().to_vec());
        let shadow = match config.paging {
            PagingKind::Paravirt => None,
            PagingKind::Shadow => Some(ShadowDomain::new(config.levels)),
        };
        let vcpus = (0..config.vcpus)
            .map(|i| {
                let cpu = config
                    .cpu_affinity
                    .get(i)
                    .copied()
                    .unwrap_or(i % machine.cpus);
                Arc::new(Vcpu::new(
                    id,
                    VcpuId::new(i as u32),
                    cpu,
                    machine.compat_xlat_size,
                ))
            })
            .collect();
        let ram_words = (config.layout.ram_pages as usize).div_ceil(64);
        Ok(Self {
            id,
            privileged: config.privileged,
            paging: config.paging,
            levels: config.levels,
            compat: config.compat,
            max_pages: AtomicUsize::new(config.max_pages),
            tot_pages: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
            dirty_cpus: AtomicU64::new(0),
            p2m,
            grants,
            evtchn: EventChannels::new(id, machine.max_event_channels)?,
            shared: SharedInfo::new(machine.max_event_channels, config.vcpus),
            vcpus,
            shadow: Mutex::new(shadow),
            balloon_lock: Mutex::new(()),
            contig: Mutex::new(vec![0; ram_words]),
        })
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn paging(&self) -> PagingKind {
        self.paging
    }

    pub fn levels(&self) -> PagingLevels {
        self.levels
    }

    pub fn is_compat(&self) -> bool {
        self.compat
    }

    pub fn vcpus(&self) -> &[Arc<Vcpu>] {
        &self.vcpus
    }

    pub fn vcpu(&self, id: VcpuId) -> AxResult<&Arc<Vcpu>> {
        self.vcpus
            .get(id.index())
            .ok_or_else(|| ax_err_type!(NotFound, format!("{} has no vcpu {}", self.id, id.index())))
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages.load(Ordering::Acquire)
    }

    pub fn set_max_pages(&self, pages: usize) {
        self.max_pages.store(pages, Ordering::Release);
    }

    pub fn tot_pages(&self) -> usize {
        self.tot_pages.load(Ordering::Acquire)
    }

    /// Charges `n` frames against the allocation limit.
    pub(crate) fn charge_pages(&self, n: usize) -> AxResult {
        let max = self.max_pages();
        self.tot_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tot| {
                (tot + n <= max).then_some(tot + n)
            })
            .map(|_| ())
            .map_err(|tot| {
                warn!("{}: over allocation ({} + {} > {})", self.id, tot, n, max);
                ax_err_type!(NoMemory, "domain allocation limit reached")
            })
    }

    pub(crate) fn uncharge_pages(&self, n: usize) {
        let prev = self.tot_pages.fetch_sub(n, Ordering::AcqRel);
        if prev < n {
            bug!("{}: page accounting underflow", self.id);
        }
    }

    pub(crate) fn set_dying(&self) -> bool {
        self.dying.swap(true, Ordering::AcqRel)
    }

    pub fn mark_dirty_cpu(&self, cpu: usize) {
        self.dirty_cpus.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    pub fn is_shadowed(&self) -> bool {
        self.paging == PagingKind::Shadow
    }

    pub fn is_contiguous(&self, gpfn: Gpfn) -> bool {
        let map = self.contig.lock();
        map.get(gpfn.index() / 64)
            .is_some_and(|w| w.get_bit(gpfn.index() % 64))
    }

    pub(crate) fn set_contiguous(&self, base: Gpfn, count: u64, on: bool) {
        let mut map = self.contig.lock();
        for gpfn in base.raw()..base.raw() + count {
            let idx = gpfn as usize;
            if let Some(w) = map.get_mut(idx / 64) {
                w.set_bit(idx % 64, on);
            }
        }
    }
}

impl FrameOwner for Domain {
    fn owner_id(&self) -> DomainId {
        self.id
    }

    fn dirty_cpus(&self) -> CpuMask {
        CpuMask::from_bits(self.dirty_cpus.load(Ordering::Acquire))
    }

    fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    fn validates_tables(&self) -> bool {
        self.paging == PagingKind::Paravirt
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("privileged", &self.privileged)
            .field("paging", &self.paging)
            .field("tot_pages", &self.tot_pages())
            .field("max_pages", &self.max_pages())
            .field("vcpus", &self.vcpus.len())
            .finish()
    }
}

/// Arena of live domains, indexed by domain id.
#[derive(Default)]
pub struct DomainList {
    slots: RwLock<Vec<Option<Arc<Domain>>>>,
}

impl DomainList {
    pub fn insert(&self, domain: Arc<Domain>) -> AxResult {
        let idx = domain.id().raw() as usize;
        let mut slots = self.slots.write();
        if slots.len() <= idx {
            slots.resize(idx + 1, None);
        }
        if slots[idx].is_some() {
            return ax_err!(AlreadyExists, format!("{} already exists", domain.id()));
        }
        slots[idx] = Some(domain);
        Ok(())
    }

    pub fn get(&self, id: DomainId) -> AxResult<Arc<Domain>> {
        self.slots
            .read()
            .get(id.raw() as usize)
            .and_then(|d| d.clone())
            .ok_or_else(|| ax_err_type!(NotFound, format!("no domain {}", id)))
    }

    pub fn remove(&self, id: DomainId) -> Option<Arc<Domain>> {
        self.slots
            .write()
            .get_mut(id.raw() as usize)
            .and_then(|d| d.take())
    }

    /// Snapshot of all live domains.
    pub fn all(&self) -> Vec<Arc<Domain>> {
        self.slots.read().iter().flatten().cloned().collect()
    }
}
