//! Guest-visible argument layouts.
//!
//! Every structure is little-endian and has a native (64-bit) form; those
//! holding guest handles or frame numbers also have a compat (32-bit) form.
//! Padding is spelled out so the layouts can be copied as bytes.

use numeric_enum_macro::numeric_enum;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MemoryOp {
        IncreaseReservation = 0,
        DecreaseReservation = 1,
        MaximumRamPage = 2,
        CurrentReservation = 3,
        MaximumReservation = 4,
        PopulatePhysmap = 6,
        TranslateGpfnList = 8,
        Exchange = 11,
    }
}

/// `memory_op` keeps the extent to resume from above the command.
pub const MEMOP_EXTENT_SHIFT: u32 = 6;
pub const MEMOP_CMD_MASK: u64 = (1 << MEMOP_EXTENT_SHIFT) - 1;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MmuextCmd {
        PinL1Table = 0,
        PinL2Table = 1,
        PinL3Table = 2,
        PinL4Table = 3,
        UnpinTable = 4,
        NewBaseptr = 5,
        TlbFlushLocal = 6,
        InvlpgLocal = 7,
        TlbFlushMulti = 8,
        InvlpgMulti = 9,
        TlbFlushAll = 10,
        InvlpgAll = 11,
        FlushCache = 12,
    }
}

/// Low bits of `MmuUpdate::ptr`.
pub const MMU_NORMAL_PT_UPDATE: u64 = 0;
pub const MMU_MACHPHYS_UPDATE: u64 = 1;
/// Set in the count of a resumed `mmu_update`/`mmuext_op`.
pub const MMU_UPDATE_PREEMPTED: u64 = 1 << 31;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SchedOp {
        Yield = 0,
        Block = 1,
        Shutdown = 2,
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EvtchnOp {
        BindInterdomain = 0,
        BindVirq = 1,
        BindPirq = 2,
        Close = 3,
        Send = 4,
        Status = 5,
        AllocUnbound = 6,
        BindIpi = 7,
        BindVcpu = 8,
        Unmask = 9,
    }
}

/// `EvtchnStatus::status` values.
pub const EVTCHNSTAT_CLOSED: u32 = 0;
pub const EVTCHNSTAT_UNBOUND: u32 = 1;
pub const EVTCHNSTAT_INTERDOMAIN: u32 = 2;
pub const EVTCHNSTAT_PIRQ: u32 = 3;
pub const EVTCHNSTAT_VIRQ: u32 = 4;
pub const EVTCHNSTAT_IPI: u32 = 5;

pub const BIND_PIRQ_WILL_SHARE: u32 = 1;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GnttabOp {
        MapGrantRef = 0,
        UnmapGrantRef = 1,
        SetupTable = 2,
        DumpTable = 3,
        Transfer = 4,
        QuerySize = 6,
    }
}

/// Per-operation grant status codes.
pub const GNTST_OKAY: i16 = 0;
pub const GNTST_GENERAL_ERROR: i16 = -1;
pub const GNTST_BAD_DOMAIN: i16 = -2;
pub const GNTST_BAD_GNTREF: i16 = -3;
pub const GNTST_BAD_HANDLE: i16 = -4;
pub const GNTST_BAD_VIRT_ADDR: i16 = -5;
pub const GNTST_NO_DEVICE_SPACE: i16 = -7;
pub const GNTST_PERMISSION_DENIED: i16 = -8;
pub const GNTST_BAD_PAGE: i16 = -9;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MemoryReservation {
    pub extent_start: u64,
    pub nr_extents: u64,
    pub extent_order: u32,
    pub address_bits: u32,
    pub domid: u16,
    pub _pad: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompatMemoryReservation {
    pub extent_start: u32,
    pub nr_extents: u32,
    pub extent_order: u32,
    pub address_bits: u32,
    pub domid: u16,
    pub _pad: u16,
}

impl From<&CompatMemoryReservation> for MemoryReservation {
    fn from(c: &CompatMemoryReservation) -> Self {
        Self {
            extent_start: c.extent_start as u64,
            nr_extents: c.nr_extents as u64,
            extent_order: c.extent_order,
            address_bits: c.address_bits,
            domid: c.domid,
            _pad: [0; 6],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MemoryExchange {
    pub input: MemoryReservation,
    pub output: MemoryReservation,
    /// Input extents done so far; where a resumed call picks up.
    pub nr_exchanged: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompatMemoryExchange {
    pub input: CompatMemoryReservation,
    pub output: CompatMemoryReservation,
    pub nr_exchanged: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TranslateGpfnList {
    pub domid: u16,
    pub _pad: [u8; 6],
    pub nr_gpfns: u64,
    pub gpfn_list: u64,
    pub mfn_list: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompatTranslateGpfnList {
    pub domid: u16,
    pub _pad: u16,
    pub nr_gpfns: u32,
    pub gpfn_list: u32,
    pub mfn_list: u32,
}

/// One `mmu_update` request; the same in both layouts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MmuUpdate {
    pub ptr: u64,
    pub val: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MmuextOp {
    pub cmd: u32,
    pub _pad: u32,
    /// Frame or linear address.
    pub arg1: u64,
    /// Entry count or vCPU mask address.
    pub arg2: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompatMmuextOp {
    pub cmd: u32,
    pub arg1: u32,
    pub arg2: u32,
}

impl From<&CompatMmuextOp> for MmuextOp {
    fn from(c: &CompatMmuextOp) -> Self {
        Self {
            cmd: c.cmd,
            _pad: 0,
            arg1: c.arg1 as u64,
            arg2: c.arg2 as u64,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SchedShutdown {
    pub reason: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnAllocUnbound {
    pub dom: u16,
    pub remote_dom: u16,
    pub port: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnBindInterdomain {
    pub remote_dom: u16,
    pub _pad: u16,
    pub remote_port: u32,
    pub local_port: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnBindVirq {
    pub virq: u32,
    pub vcpu: u32,
    pub port: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnBindPirq {
    pub pirq: u32,
    pub flags: u32,
    pub port: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnBindIpi {
    pub vcpu: u32,
    pub port: u32,
}

/// Argument of close, send and unmask.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnPort {
    pub port: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnBindVcpu {
    pub port: u32,
    pub vcpu: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtchnStatus {
    pub dom: u16,
    pub _pad: u16,
    pub port: u32,
    pub status: u32,
    pub vcpu: u32,
    /// Remote domain and port, or the PIRQ/VIRQ number.
    pub u: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GnttabMapGrantRef {
    pub host_addr: u64,
    pub flags: u32,
    pub gref: u32,
    pub dom: u16,
    pub status: i16,
    pub handle: u32,
    pub dev_bus_addr: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GnttabUnmapGrantRef {
    pub host_addr: u64,
    pub dev_bus_addr: u64,
    pub handle: u32,
    pub status: i16,
    pub _pad: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GnttabSetupTable {
    pub dom: u16,
    pub _pad: u16,
    pub nr_frames: u32,
    pub status: i16,
    pub _pad2: [u8; 6],
    pub frame_list: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompatGnttabSetupTable {
    pub dom: u16,
    pub _pad: u16,
    pub nr_frames: u32,
    pub status: i16,
    pub _pad2: u16,
    pub frame_list: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GnttabTransfer {
    /// Guest frame given away.
    pub mfn: u64,
    pub domid: u16,
    pub _pad: u16,
    pub gref: u32,
    pub status: i16,
    pub _pad2: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompatGnttabTransfer {
    pub mfn: u32,
    pub domid: u16,
    pub _pad: u16,
    pub gref: u32,
    pub status: i16,
    pub _pad2: u16,
}

impl From<&CompatGnttabTransfer> for GnttabTransfer {
    fn from(c: &CompatGnttabTransfer) -> Self {
        Self {
            mfn: c.mfn as u64,
            domid: c.domid,
            gref: c.gref,
            status: c.status,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GnttabQuerySize {
    pub dom: u16,
    pub _pad: u16,
    pub nr_frames: u32,
    pub max_nr_frames: u32,
    pub status: i16,
    pub _pad2: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GnttabDumpTable {
    pub dom: u16,
    pub status: i16,
}
