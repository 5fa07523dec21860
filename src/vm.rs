#![deny(missing_docs)]

//! Static virtual machine table and per-VM resources.
//!
//! Machines exist exactly as declared in the boot configuration: the
//! builder places every vCPU on a physical core, wires the declared memory
//! regions, and the finalized [`VirtualMachineSet`] never changes again.

use crate::config;
use crate::error::{Error, Result};
use crate::interrupt::VMM_VMID;
use crate::lock::ro_after_init::RoAfterInit;
use crate::memory::{GuestAddressSpace, GuestPhysAddr};
use crate::vcpu::{self, Vcpu, VcpuState};
use crate::virtdev::{DeviceEvent, DeviceMap, MemReadRequest, MemWriteRequest};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

/// The maximum number of vCPUs a single VM may declare
pub const MAX_VCPUS_PER_VM: usize = 8;

/// First virtual interrupt number handed out by the per-VM allocator.
/// Declared pass-through virqs live below this.
const GUEST_VIRQ_ALLOC_BASE: u32 = 256;

/// One past the last allocatable virtual interrupt number
const GUEST_VIRQ_ALLOC_END: u32 = 512;

static VIRTUAL_MACHINES: RoAfterInit<Arc<VirtualMachineSet>> =
    RoAfterInit::uninitialized();

/// Initialize the global VirtualMachineSet
///
/// This method must be called before calling 'virtual_machines'
pub unsafe fn init_virtual_machines(machines: Arc<VirtualMachineSet>) {
    RoAfterInit::init(&VIRTUAL_MACHINES, machines);
}

/// Get the global VirtualMachineSet
pub fn virtual_machines() -> &'static Arc<VirtualMachineSet> {
    &*VIRTUAL_MACHINES
}

/// Hardware attribute of a memory region granted to a VM
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemRegionType {
    /// Ordinary cacheable RAM
    Normal,
    /// Device memory
    Io,
}

/// A physical memory region granted to one VM, or shared between all
#[derive(Clone, Debug)]
pub struct MemRegion {
    /// Physical base address
    pub base: u64,
    /// Size in bytes
    pub size: u64,
    /// Mapping attribute
    pub region_type: MemRegionType,
    /// Human readable name
    pub name: String,
}

impl MemRegion {
    fn from_entry(entry: &config::MemRegionEntry) -> Self {
        let region_type = match entry.kind {
            config::MemRegionKind::Io => MemRegionType::Io,
            // shared regions are plain RAM used for inter-VM transports
            _ => MemRegionType::Normal,
        };
        MemRegion {
            base: entry.base,
            size: entry.size,
            region_type,
            name: entry.name.clone(),
        }
    }
}

/// A guest virtual machine
pub struct VirtualMachine {
    /// The declared identifier of the machine
    pub vmid: u32,
    /// Human readable name of the machine
    pub name: String,
    /// Guest-physical entry point
    pub entry_point: u64,
    /// Guest-physical address of the setup data (guest DTB), if declared
    pub setup_data: Option<GuestPhysAddr>,
    /// The stage-2 address space of the machine
    pub mm: Arc<dyn GuestAddressSpace>,
    /// The trapped MMIO devices of the machine
    pub devices: RwLock<DeviceMap>,
    vcpus: Vec<Arc<Vcpu>>,
    mem_regions: RwLock<Vec<MemRegion>>,
    next_virq: Mutex<u32>,
}

impl VirtualMachine {
    /// Create a machine from its declaration, with one vCPU per entry of
    /// `pins`. The boot vCPU comes up READY; the others wait in STOP for a
    /// guest power-on call.
    pub fn new(
        entry: &config::VmEntry,
        pins: &[crate::percore::CoreId],
        mm: Arc<dyn GuestAddressSpace>,
    ) -> Result<Arc<Self>> {
        if entry.vmid == VMM_VMID {
            return Err(Error::InvalidValue(format!(
                "vmid 0x{:x} is reserved",
                VMM_VMID
            )));
        }

        let vm = Arc::new_cyclic(|weak| {
            let vcpus = pins
                .iter()
                .enumerate()
                .map(|(id, pcpu)| {
                    Arc::new(Vcpu::new(
                        id as u32,
                        weak.clone(),
                        *pcpu,
                        entry.entry_point,
                    ))
                })
                .collect();
            VirtualMachine {
                vmid: entry.vmid,
                name: entry.name.clone(),
                entry_point: entry.entry_point,
                setup_data: entry.setup_data.map(GuestPhysAddr::new),
                mm,
                devices: RwLock::new(DeviceMap::default()),
                vcpus,
                mem_regions: RwLock::new(Vec::new()),
                next_virq: Mutex::new(GUEST_VIRQ_ALLOC_BASE),
            }
        });

        for vcpu in vm.vcpus.iter() {
            if vcpu.is_boot_vcpu() {
                vcpu.set_state(VcpuState::Ready);
            } else {
                vcpu.set_state(VcpuState::Stop);
            }
        }

        Ok(vm)
    }

    /// The number of vCPUs of the machine
    pub fn vcpu_count(&self) -> u32 {
        self.vcpus.len() as u32
    }

    /// Look up a vCPU by its VM-local id
    pub fn vcpu(&self, vcpu_id: u32) -> Option<&Arc<Vcpu>> {
        self.vcpus.get(vcpu_id as usize)
    }

    /// The vCPU that boots the machine
    pub fn boot_vcpu(&self) -> &Arc<Vcpu> {
        &self.vcpus[0]
    }

    /// All vCPUs of the machine
    pub fn vcpus(&self) -> &[Arc<Vcpu>] {
        &self.vcpus
    }

    /// Hand out a fresh virtual interrupt number for a paravirtual device
    pub fn alloc_virq(&self) -> Option<u32> {
        let mut next = self.next_virq.lock();
        if *next >= GUEST_VIRQ_ALLOC_END {
            return None;
        }
        let vno = *next;
        *next += 1;
        Some(vno)
    }

    /// Attach a declared memory region to the machine
    pub fn add_mem_region(&self, region: MemRegion) {
        self.mem_regions.write().push(region);
    }

    /// The declared memory regions of the machine
    pub fn mem_regions(&self) -> Vec<MemRegion> {
        self.mem_regions.read().clone()
    }

    /// Route a trapped MMIO write to the owning emulated device
    pub fn handle_mmio_write(
        &self,
        addr: GuestPhysAddr,
        bytes: &[u8],
    ) -> Result<()> {
        let device = self
            .devices
            .read()
            .find_device(addr)
            .cloned()
            .ok_or_else(|| {
                Error::MissingDevice(format!(
                    "no device at 0x{:x} in vm {}",
                    addr.as_u64(),
                    self.vmid
                ))
            })?;
        let result = device
            .write()
            .on_event(DeviceEvent::MemWrite(addr, MemWriteRequest::new(bytes)));
        result
    }

    /// Route a trapped MMIO read to the owning emulated device
    pub fn handle_mmio_read(
        &self,
        addr: GuestPhysAddr,
        bytes: &mut [u8],
    ) -> Result<()> {
        let device = self
            .devices
            .read()
            .find_device(addr)
            .cloned()
            .ok_or_else(|| {
                Error::MissingDevice(format!(
                    "no device at 0x{:x} in vm {}",
                    addr.as_u64(),
                    self.vmid
                ))
            })?;
        let result = device
            .write()
            .on_event(DeviceEvent::MemRead(addr, MemReadRequest::new(bytes)));
        result
    }
}

/// The set of configured virtual machines.
///
/// Built once at boot and read-only afterwards; this is the root from
/// which every VM, vCPU and shared memory region is reachable.
pub struct VirtualMachineSet {
    map: BTreeMap<u32, Arc<VirtualMachine>>,
    shared_regions: Vec<MemRegion>,
}

impl VirtualMachineSet {
    /// Returns the number of VMs
    pub fn count(&self) -> u32 {
        self.map.len() as u32
    }

    /// Get a VirtualMachine by its vmid
    pub fn get_by_vm_id(&self, vmid: u32) -> Option<Arc<VirtualMachine>> {
        self.map.get(&vmid).cloned()
    }

    /// Get a vCPU by `(vmid, vcpu_id)`
    pub fn get_vcpu(&self, vmid: u32, vcpu_id: u32) -> Option<Arc<Vcpu>> {
        self.map
            .get(&vmid)
            .and_then(|vm| vm.vcpu(vcpu_id))
            .cloned()
    }

    /// Iterate over every machine, in vmid order
    pub fn machines(&self) -> impl Iterator<Item = &Arc<VirtualMachine>> {
        self.map.values()
    }

    /// The memory regions every VM may map (the inter-VM pool)
    pub fn shared_regions(&self) -> &[MemRegion] {
        &self.shared_regions
    }
}

/// A structure to build up the set of VirtualMachines
pub struct VirtualMachineSetBuilder {
    occupancy: Vec<u32>,
    map: BTreeMap<u32, Arc<VirtualMachine>>,
    shared_regions: Vec<MemRegion>,
}

impl VirtualMachineSetBuilder {
    /// Returns a new builder for a machine with `nr_cores` physical cores
    pub fn new(nr_cores: usize) -> Self {
        VirtualMachineSetBuilder {
            occupancy: vec![0; nr_cores],
            map: BTreeMap::new(),
            shared_regions: Vec::new(),
        }
    }

    /// Add an already constructed VirtualMachine to the set
    pub fn insert_machine(&mut self, vm: Arc<VirtualMachine>) -> Result<()> {
        if self.map.contains_key(&vm.vmid) {
            return Err(Error::Exists);
        }
        self.map.insert(vm.vmid, vm);
        Ok(())
    }

    /// Place and construct a machine from its declaration.
    ///
    /// Placement failure is a boot-time misconfiguration and surfaces as
    /// an error the caller is expected to treat as fatal.
    pub fn build_machine(
        &mut self,
        entry: &config::VmEntry,
        mm: Arc<dyn GuestAddressSpace>,
    ) -> Result<Arc<VirtualMachine>> {
        let mut nr_vcpus = entry.vcpus as usize;
        if nr_vcpus > MAX_VCPUS_PER_VM {
            warn!(
                "vm {} declares {} vcpus, capping at {}",
                entry.name, entry.vcpus, MAX_VCPUS_PER_VM
            );
            nr_vcpus = MAX_VCPUS_PER_VM;
        }
        if nr_vcpus == 0 {
            return Err(Error::InvalidValue(format!(
                "vm {} declares no vcpus",
                entry.name
            )));
        }

        let mut pins = Vec::with_capacity(nr_vcpus);
        for id in 0..nr_vcpus {
            let hint = entry.affinity.get(id).copied();
            let pcpu = vcpu::pcpu_affinity(&mut self.occupancy, hint)
                .ok_or_else(|| {
                    Error::Exhausted
                })?;
            info!(
                "placed vcpu {} of {} on core {}",
                id, entry.name, pcpu
            );
            pins.push(pcpu);
        }

        let vm = VirtualMachine::new(entry, &pins, mm)?;
        self.insert_machine(vm.clone())?;
        Ok(vm)
    }

    /// Route a declared memory region to its VM, or to the shared pool
    pub fn add_memory_region(
        &mut self,
        entry: &config::MemRegionEntry,
    ) -> Result<()> {
        if entry.kind == config::MemRegionKind::Shared {
            self.shared_regions.push(MemRegion::from_entry(entry));
            return Ok(());
        }

        let vmid = entry.vmid.ok_or_else(|| {
            Error::InvalidValue(format!(
                "region {} declares no owning vm",
                entry.name
            ))
        })?;
        let vm = self.map.get(&vmid).ok_or_else(|| {
            error!("no vm {} for memory region {}", vmid, entry.name);
            Error::NotFound
        })?;
        vm.add_mem_region(MemRegion::from_entry(entry));
        Ok(())
    }

    /// Build every machine and region the configuration declares.
    ///
    /// A region naming an unknown VM is logged and skipped, matching the
    /// tolerance of the table parser this replaces; a VM that cannot be
    /// placed is fatal.
    pub fn from_config(
        cfg: &config::UserConfig,
        nr_cores: usize,
        mm_factory: &mut dyn FnMut(&config::VmEntry) -> Arc<dyn GuestAddressSpace>,
    ) -> Result<Self> {
        let mut builder = VirtualMachineSetBuilder::new(nr_cores);
        for entry in cfg.vms.iter() {
            let mm = mm_factory(entry);
            builder.build_machine(entry, mm)?;
        }
        for region in cfg.memory.iter() {
            if let Err(err) = builder.add_memory_region(region) {
                error!("skipping memory region {}: {:?}", region.name, err);
            }
        }
        Ok(builder)
    }

    /// Finish the set
    pub fn finalize(self) -> VirtualMachineSet {
        VirtualMachineSet {
            map: self.map,
            shared_regions: self.shared_regions,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A small machine population shared by the interrupt and vmbox tests:
    //! four cores, vm 1 ("dom0") with vcpus on cores 0 and 1, and vm 2
    //! ("rtos") with its single vcpu on core 3.

    use super::*;
    use crate::memory::LinearAddressSpace;

    pub fn test_mm() -> Arc<dyn GuestAddressSpace> {
        Arc::new(LinearAddressSpace::new(
            GuestPhysAddr::new(0x8000_0000),
            0x1000_0000,
        ))
    }

    pub fn sample_vm_set() -> VirtualMachineSet {
        let mut builder = VirtualMachineSetBuilder::new(4);
        builder
            .build_machine(
                &config::VmEntry {
                    vmid: 1,
                    name: "dom0".into(),
                    vcpus: 2,
                    entry_point: 0x4008_0000,
                    affinity: vec![0, 1],
                    setup_data: None,
                },
                test_mm(),
            )
            .unwrap();
        builder
            .build_machine(
                &config::VmEntry {
                    vmid: 2,
                    name: "rtos".into(),
                    vcpus: 1,
                    entry_point: 0x6000_0000,
                    affinity: vec![3],
                    setup_data: None,
                },
                test_mm(),
            )
            .unwrap();
        builder.finalize()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::percore::CoreId;
    use crate::virtdev::{DeviceRegion, EmulatedDevice};
    use test_support::{sample_vm_set, test_mm};

    #[test]
    fn test_boot_vcpu_state_split() {
        let vms = sample_vm_set();
        let vm = vms.get_by_vm_id(1).unwrap();

        assert_eq!(vm.vcpu_count(), 2);
        assert_eq!(vm.boot_vcpu().state(), VcpuState::Ready);
        assert_eq!(vm.vcpu(1).unwrap().state(), VcpuState::Stop);
        assert!(vm.vcpu(2).is_none());
    }

    #[test]
    fn test_vcpus_are_pinned_as_declared() {
        let vms = sample_vm_set();
        assert_eq!(vms.get_vcpu(1, 0).unwrap().pcpu, CoreId::from(0));
        assert_eq!(vms.get_vcpu(1, 1).unwrap().pcpu, CoreId::from(1));
        assert_eq!(vms.get_vcpu(2, 0).unwrap().pcpu, CoreId::from(3));
        assert!(vms.get_vcpu(1, 2).is_none());
        assert!(vms.get_vcpu(9, 0).is_none());
    }

    #[test]
    fn test_vcpu_back_reference() {
        let vms = sample_vm_set();
        let vcpu = vms.get_vcpu(2, 0).unwrap();
        assert_eq!(vcpu.vm().unwrap().vmid, 2);
    }

    #[test]
    fn test_duplicate_vmid_is_rejected() {
        let mut builder = VirtualMachineSetBuilder::new(4);
        let entry = config::VmEntry {
            vmid: 1,
            name: "a".into(),
            vcpus: 1,
            entry_point: 0,
            affinity: vec![],
            setup_data: None,
        };
        builder.build_machine(&entry, test_mm()).unwrap();
        assert!(builder.build_machine(&entry, test_mm()).is_err());
    }

    #[test]
    fn test_reserved_vmid_is_rejected() {
        let entry = config::VmEntry {
            vmid: VMM_VMID,
            name: "bad".into(),
            vcpus: 1,
            entry_point: 0,
            affinity: vec![],
            setup_data: None,
        };
        assert!(
            VirtualMachine::new(&entry, &[CoreId::from(0)], test_mm()).is_err()
        );
    }

    #[test]
    fn test_shared_and_owned_region_routing() {
        let cfg = config::UserConfig {
            version: 1,
            vms: vec![config::VmEntry {
                vmid: 1,
                name: "dom0".into(),
                vcpus: 1,
                entry_point: 0,
                affinity: vec![],
                setup_data: None,
            }],
            memory: vec![
                config::MemRegionEntry {
                    base: 0x4000_0000,
                    size: 0x1000_0000,
                    kind: config::MemRegionKind::Normal,
                    vmid: Some(1),
                    name: "ram".into(),
                },
                config::MemRegionEntry {
                    base: 0x9000_0000,
                    size: 0x1000,
                    kind: config::MemRegionKind::Io,
                    vmid: Some(1),
                    name: "uart".into(),
                },
                config::MemRegionEntry {
                    base: 0x0900_0000,
                    size: 0x20_0000,
                    kind: config::MemRegionKind::Shared,
                    vmid: None,
                    name: "ipc".into(),
                },
                config::MemRegionEntry {
                    base: 0x1000,
                    size: 0x1000,
                    kind: config::MemRegionKind::Normal,
                    vmid: Some(42),
                    name: "orphan".into(),
                },
            ],
            irqs: vec![],
        };

        let set = VirtualMachineSetBuilder::from_config(
            &cfg,
            4,
            &mut |_| test_mm(),
        )
        .unwrap()
        .finalize();

        let vm = set.get_by_vm_id(1).unwrap();
        let regions = vm.mem_regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].region_type, MemRegionType::Normal);
        assert_eq!(regions[1].region_type, MemRegionType::Io);

        // the shared region is global, the orphan one was dropped
        assert_eq!(set.shared_regions().len(), 1);
        assert_eq!(set.shared_regions()[0].name, "ipc");
    }

    #[test]
    fn test_virq_allocator_is_monotonic_and_bounded() {
        let vms = sample_vm_set();
        let vm = vms.get_by_vm_id(1).unwrap();

        let first = vm.alloc_virq().unwrap();
        let second = vm.alloc_virq().unwrap();
        assert_eq!(second, first + 1);

        while vm.alloc_virq().is_some() {}
        assert!(vm.alloc_virq().is_none());
    }

    struct RecordingDevice {
        base: GuestPhysAddr,
        last_write: Option<(u64, u32)>,
    }

    impl EmulatedDevice for RecordingDevice {
        fn services(&self) -> Vec<DeviceRegion> {
            vec![DeviceRegion::MemIo(self.base..=self.base + 0xfff)]
        }

        fn on_event(&mut self, event: DeviceEvent) -> Result<()> {
            if let DeviceEvent::MemWrite(addr, request) = event {
                self.last_write =
                    Some((addr.as_u64(), request.as_u32()?));
            }
            Ok(())
        }
    }

    #[test]
    fn test_mmio_write_routes_to_device() {
        let vms = sample_vm_set();
        let vm = vms.get_by_vm_id(1).unwrap();
        let base = GuestPhysAddr::new(0x8000_0000);
        let device = Arc::new(spin::RwLock::new(RecordingDevice {
            base,
            last_write: None,
        }));
        vm.devices.write().register_device(device.clone()).unwrap();

        vm.handle_mmio_write(base + 8, &0xabcd_1234u32.to_le_bytes())
            .unwrap();
        assert_eq!(
            device.read().last_write,
            Some((0x8000_0008, 0xabcd_1234))
        );

        let err = vm.handle_mmio_write(
            GuestPhysAddr::new(0x9999_0000),
            &[0, 0, 0, 0],
        );
        assert!(err.is_err());
    }
}
