//! Machine and domain configuration.
//!
//! The configuration is normally written in TOML, in the same spirit as the
//! VM configuration files of the hypervisor shell:
//!
//! ```toml
//! machine_frames = 4096
//! cpus = 2
//!
//! [[domains]]
//! id = 0
//! privileged = true
//! max_pages = 512
//! vcpus = 1
//! ```

use alloc::format;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};
use serde::Deserialize;

use crate::paging::PagingLevels;

/// Machine-wide limits and tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PvConfig {
    /// Number of 4K machine frames.
    pub machine_frames: usize,
    /// Number of physical CPUs.
    pub cpus: usize,
    /// Grant-table frames per domain, 512 entries each.
    pub grant_frames: usize,
    /// Upper bound on event-channel ports per domain.
    pub max_event_channels: usize,
    /// Polls of an in-use grant entry before `end_foreign_access` gives up.
    pub grant_end_retries: usize,
    /// CAS attempts on a grant entry header while mapping it.
    pub grant_map_retries: usize,
    /// Size in bytes of the per-vCPU compat argument translation area.
    pub compat_xlat_size: usize,
    /// Extents a hypercall processes between preemption checks.
    pub preempt_batch: usize,
    /// Domains created at boot.
    pub domains: Vec<DomainConfig>,
}

impl Default for PvConfig {
    fn default() -> Self {
        Self {
            machine_frames: 2048,
            cpus: 2,
            grant_frames: 1,
            max_event_channels: 1024,
            grant_end_retries: 1024,
            grant_map_retries: 5,
            compat_xlat_size: 4096,
            preempt_batch: 64,
            domains: Vec::new(),
        }
    }
}

/// How a domain's memory is virtualized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagingKind {
    /// Guest page tables hold machine frames and are validated by the frame
    /// ownership table.
    Paravirt,
    /// Guest page tables hold guest frames and are shadowed.
    Shadow,
}

/// Guest-physical layout of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PhysmapLayout {
    /// RAM frames `[0, ram_pages)` are backed by the P2M array.
    pub ram_pages: u64,
    /// First frame of the grant-table window.
    pub grant_base: u64,
    /// First frame of the I/O window.
    pub mmio_base: u64,
    /// Frames in the I/O window.
    pub mmio_pages: u64,
    /// First frame of the 1:1 passthrough window, privileged domains only.
    pub passthrough_base: u64,
    /// Frames in the passthrough window.
    pub passthrough_pages: u64,
}

impl Default for PhysmapLayout {
    fn default() -> Self {
        Self {
            ram_pages: 0x2000,
            grant_base: 0xf_0000,
            mmio_base: 0xf_1000,
            mmio_pages: 0x1000,
            passthrough_base: 0x10_0000,
            passthrough_pages: 0x10_0000,
        }
    }
}

/// A domain to create.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub id: u16,
    pub privileged: bool,
    /// Allocation limit in frames.
    pub max_pages: usize,
    pub vcpus: usize,
    pub paging: PagingKind,
    /// Guest paging levels for shadowed domains.
    pub levels: PagingLevels,
    /// Hypercall arguments use 32-bit layouts.
    pub compat: bool,
    pub layout: PhysmapLayout,
    /// Physical CPU each vCPU starts on, by index.
    pub cpu_affinity: Vec<usize>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            id: 0,
            privileged: false,
            max_pages: 256,
            vcpus: 1,
            paging: PagingKind::Paravirt,
            levels: PagingLevels::Four,
            compat: false,
            layout: PhysmapLayout::default(),
            cpu_affinity: Vec::new(),
        }
    }
}

impl PvConfig {
    /// Parses and validates a TOML configuration.
    pub fn from_toml(raw: &str) -> AxResult<Self> {
        let config: PvConfig = toml::from_str(raw).or_else(|e| {
            ax_err!(InvalidInput, format!("malformed configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AxResult {
        if self.machine_frames < 16 {
            return ax_err!(InvalidInput, "too few machine frames");
        }
        if self.cpus == 0 || self.cpus > 64 {
            return ax_err!(InvalidInput, "cpus must be within 1..=64");
        }
        if self.grant_frames == 0 {
            return ax_err!(InvalidInput, "grant table needs at least one frame");
        }
        if self.max_event_channels < 2 || self.max_event_channels > 4096 {
            return ax_err!(InvalidInput, "event channel limit must be within 2..=4096");
        }
        if self.compat_xlat_size < 64 {
            return ax_err!(InvalidInput, "compat translation area too small");
        }
        if self.preempt_batch == 0 {
            return ax_err!(InvalidInput, "preemption batch must be positive");
        }
        for dom in &self.domains {
            dom.validate(self)?;
        }
        Ok(())
    }
}

impl DomainConfig {
    fn validate(&self, machine: &PvConfig) -> AxResult {
        let name = format!("domain {}", self.id);
        if self.vcpus == 0 {
            return ax_err!(InvalidInput, format!("{name}: no vcpus"));
        }
        if self.cpu_affinity.iter().any(|&cpu| cpu >= machine.cpus) {
            return ax_err!(InvalidInput, format!("{name}: affinity names a missing cpu"));
        }
        let l = &self.layout;
        let windows = [
            (l.grant_base, machine.grant_frames as u64),
            (l.mmio_base, l.mmio_pages),
            (l.passthrough_base, l.passthrough_pages),
        ];
        if windows.iter().any(|&(base, _)| base < l.ram_pages) {
            return ax_err!(InvalidInput, format!("{name}: window overlaps RAM"));
        }
        for (i, a) in windows.iter().enumerate() {
            for b in &windows[i + 1..] {
                if a.0 < b.0 + b.1 && b.0 < a.0 + a.1 {
                    return ax_err!(InvalidInput, format!("{name}: physmap windows overlap"));
                }
            }
        }
        Ok(())
    }
}
