//! Trapped-MMIO device model.
//!
//! A guest access that faults in stage-2 is decoded by the exception layer
//! and routed through the owning VM's [`DeviceMap`] to an
//! [`EmulatedDevice`]. ARM guests have no port I/O, so devices claim
//! guest-physical ranges only.

use crate::error::{Error, Result};
use crate::memory::GuestPhysAddr;
use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::convert::TryFrom;
use core::fmt;
use core::ops::RangeInclusive;
use spin::RwLock;

/// A guest access forwarded to an emulated device
#[derive(Debug)]
pub enum DeviceEvent<'a> {
    /// A read of the given guest-physical address
    MemRead(GuestPhysAddr, MemReadRequest<'a>),
    /// A write of the given guest-physical address
    MemWrite(GuestPhysAddr, MemWriteRequest<'a>),
}

// Ranges compare as equal when they overlap at all, so a BTreeMap keyed by
// region doubles as an interval lookup for single addresses.
#[derive(Eq, PartialEq)]
struct MemIoRegion(RangeInclusive<GuestPhysAddr>);

impl PartialOrd for MemIoRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemIoRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.end() < other.0.start() {
            Ordering::Less
        } else if other.0.end() < self.0.start() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// A guest-physical range an emulated device claims
pub enum DeviceRegion {
    /// Trapped memory-mapped IO
    MemIo(RangeInclusive<GuestPhysAddr>),
}

/// A structure for looking up `EmulatedDevice`s by guest-physical address
#[derive(Default)]
pub struct DeviceMap {
    memio_map: BTreeMap<MemIoRegion, Arc<RwLock<dyn EmulatedDevice>>>,
}

impl DeviceMap {
    /// Find the device that claims the given address
    pub fn find_device(
        &self,
        addr: GuestPhysAddr,
    ) -> Option<&Arc<RwLock<dyn EmulatedDevice>>> {
        let key = MemIoRegion(RangeInclusive::new(addr, addr));
        self.memio_map.get(&key)
    }

    /// Register a device for every region it services. Overlapping claims
    /// are a configuration bug and are rejected.
    pub fn register_device(
        &mut self,
        dev: Arc<RwLock<dyn EmulatedDevice>>,
    ) -> Result<()> {
        let services = dev.read().services();
        for region in services.into_iter() {
            match region {
                DeviceRegion::MemIo(range) => {
                    let key = MemIoRegion(range);
                    if self.memio_map.contains_key(&key) {
                        let conflict = self
                            .memio_map
                            .get_key_value(&key)
                            .expect("Could not get conflicting device")
                            .0;
                        return Err(Error::InvalidDevice(format!(
                            "Memory region already registered: 0x{:x}-0x{:x} conflicts with existing map of 0x{:x}-0x{:x}",
                            key.0.start().as_u64(),
                            key.0.end().as_u64(),
                            conflict.0.start().as_u64(),
                            conflict.0.end().as_u64()
                        )));
                    }
                    self.memio_map.insert(key, dev.clone());
                }
            }
        }
        Ok(())
    }
}

/// A device emulated by the hypervisor
pub trait EmulatedDevice: Send + Sync {
    /// The guest-physical regions this device claims
    fn services(&self) -> Vec<DeviceRegion>;

    /// Handle one trapped access
    fn on_event(&mut self, _event: DeviceEvent) -> Result<()> {
        Ok(())
    }
}

/// The buffer a trapped read must fill
#[derive(Debug)]
pub struct MemReadRequest<'a> {
    data: &'a mut [u8],
}

impl<'a> MemReadRequest<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data
    }
}

impl<'a> fmt::Display for MemReadRequest<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemReadRequest({:?})", self.data)
    }
}

/// The bytes a guest wrote, in guest (little-endian) order
pub struct MemWriteRequest<'a> {
    data: &'a [u8],
}

impl fmt::Debug for MemWriteRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemWriteRequest")
            .field("data", &format_args!("{:02x?}", self.data))
            .finish()
    }
}

impl<'a> MemWriteRequest<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// The written value as a register-sized quantity. Accesses narrower
    /// than 32 bits are zero extended.
    pub fn as_u32(&self) -> Result<u32> {
        let mut arr = [0u8; 4];
        match self.data.len() {
            1 => arr[0] = self.data[0],
            2 => arr[..2].copy_from_slice(self.data),
            4 => arr.copy_from_slice(self.data),
            len => {
                return Err(Error::InvalidValue(format!(
                    "Invalid access width: {}",
                    len
                )))
            }
        }
        Ok(u32::from_le_bytes(arr))
    }
}

impl<'a> fmt::Display for MemWriteRequest<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemWriteRequest({:02x?})", self.data)
    }
}

impl<'a> TryFrom<MemWriteRequest<'a>> for u8 {
    type Error = Error;

    fn try_from(value: MemWriteRequest<'a>) -> Result<Self> {
        if value.data.len() == 1 {
            Ok(value.data[0])
        } else {
            Err(Error::InvalidValue(format!(
                "Value {} cannot be converted to u8",
                value
            )))
        }
    }
}
