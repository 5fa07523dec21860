#![deny(missing_docs)]

//! # Static VM declaration format
//!
//! Machines are partitioned ahead of time: the boot loader hands the
//! hypervisor a JSON document declaring every VM, memory region and
//! pass-through interrupt. Nothing in here can change at runtime.

use crate::error::Result;
use alloc::string::String;
use alloc::vec::Vec;
use serde::Deserialize;

/// A description of a single virtual machine
#[derive(Deserialize, Debug)]
pub struct VmEntry {
    /// The identifier of this VM (must be unique, and not the
    /// hypervisor-owner sentinel)
    pub vmid: u32,

    /// Human readable name of the VM
    pub name: String,

    /// Number of vCPUs, capped at the per-VM maximum
    pub vcpus: u32,

    /// Guest-physical entry point of the VM image
    pub entry_point: u64,

    /// Preferred physical core for each vCPU; missing entries fall back to
    /// the placement policy
    #[serde(default)]
    pub affinity: Vec<u32>,

    /// Guest-physical address of the setup data (the guest DTB), if any
    #[serde(default)]
    pub setup_data: Option<u64>,
}

/// The declared type of a memory region
#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemRegionKind {
    /// Ordinary cacheable RAM
    Normal,
    /// Device memory
    Io,
    /// RAM visible to every VM (hung off the global shared list)
    Shared,
}

/// A description of a physical memory region granted to a VM (or shared)
#[derive(Deserialize, Debug)]
pub struct MemRegionEntry {
    /// Physical base address
    pub base: u64,

    /// Size in bytes
    pub size: u64,

    /// Region type
    pub kind: MemRegionKind,

    /// Owning VM; ignored for shared regions
    #[serde(default)]
    pub vmid: Option<u32>,

    /// Human readable name of the region
    pub name: String,
}

/// The trigger mode of a declared interrupt
#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IrqTrigger {
    /// Leave the trigger mode untouched
    None,
    /// Edge triggered
    Edge,
    /// Level triggered
    Level,
}

impl Default for IrqTrigger {
    fn default() -> Self {
        IrqTrigger::None
    }
}

/// A description of a physical interrupt and its routing
#[derive(Deserialize, Debug)]
pub struct IrqEntry {
    /// The hardware interrupt number
    pub hno: u32,

    /// The virtual interrupt number the owning guest sees (pass-through
    /// interrupts only)
    #[serde(default)]
    pub vno: u32,

    /// The owning VM, or `interrupt::VMM_VMID` for hypervisor-owned
    /// interrupts
    pub vmid: u32,

    /// The target vCPU inside the owning VM
    #[serde(default)]
    pub vcpu: u32,

    /// The trigger mode to program into the interrupt controller
    #[serde(default)]
    pub trigger: IrqTrigger,

    /// Human readable name of the interrupt source
    pub name: String,
}

/// The top level configuration handed over by the boot loader
#[derive(Deserialize, Debug)]
pub struct UserConfig {
    /// Version number for this configuration
    pub version: u64,

    /// A list of virtual machine declarations
    pub vms: Vec<VmEntry>,

    /// A list of memory region declarations
    #[serde(default)]
    pub memory: Vec<MemRegionEntry>,

    /// A list of interrupt declarations
    #[serde(default)]
    pub irqs: Vec<IrqEntry>,
}

/// Parse the boot configuration document
pub fn parse(data: &[u8]) -> Result<UserConfig> {
    Ok(serde_json::from_slice(data)?)
}
