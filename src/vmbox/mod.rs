//! Inter-VM mailbox transport.
//!
//! A vmbox pairs a back-end device in one VM with a front-end device in
//! another, both backed by the same block of shared pages laid out as
//! virtio-style rings. Each VM sees its devices through a per-VM
//! controller page ([`controller::VmboxController`]); the hypervisor only
//! moves doorbells, never data.

pub mod controller;

use crate::error::{Error, Result};
use crate::interrupt::IrqCore;
use crate::lock::ro_after_init::RoAfterInit;
use crate::memory::{self, GuestPhysAddr, SharedPages, PAGE_SIZE};
use crate::sched::Scheduler;
use crate::vm::{VirtualMachine, VirtualMachineSet};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use self::controller::VmboxController;
use spin::{Mutex, RwLock};

/// Maximum number of vmbox pairings in the system
pub const VMBOX_MAX_COUNT: usize = 16;

/// Maximum number of virtqueues per vmbox
pub const VMBOX_MAX_VQS: u32 = 4;

/// Index of the back-end device of a pairing
pub const BE_IDX: usize = 0;

/// Index of the front-end device of a pairing
pub const FE_IDX: usize = 1;

/// Alignment of the vring pieces inside the shared block
pub const VMBOX_VRING_ALIGN: u64 = 64;

/// Reserved IPC area at the head of an auto-sized shared block
pub const VMBOX_DEV_VIRTQ_HEADER_SIZE: u64 = 0x100;

/// How many times an IPC publish polls the peer before giving up. The
/// yield inside the poll loop can otherwise spin forever when the peer is
/// never scheduled.
pub const VMBOX_IPC_MAX_RETRY: u32 = 64;

const VRING_DESC_SIZE: u64 = 16;
const VRING_USED_ELEM_SIZE: u64 = 8;

static VMBOX_SET: RoAfterInit<Arc<VmboxSet>> = RoAfterInit::uninitialized();

bitflags! {
    /// Behavior switches of a vmbox pairing
    pub struct VmboxFlags: u32 {
        /// Advertise the devices as platform devices in the guest DTB
        /// instead of (only) controller slots
        const PLATFORM_DEV = 1 << 0;
    }
}

/// A declared vmbox pairing, as parsed from the device tree
#[derive(Debug, Clone)]
pub struct VmboxInfo {
    /// Owning vmids, back-end first
    pub owner: [u32; 2],
    /// Device id and vendor id
    pub id: [u32; 2],
    /// Number of virtqueues
    pub vqs: u32,
    /// Number of descriptors per vring
    pub vring_num: u32,
    /// Buffer bytes per vring entry
    pub vring_size: u32,
    /// Explicit shared-memory size; 0 means "derive from the geometry"
    pub shmem_size: u64,
    /// Behavior switches
    pub flags: VmboxFlags,
    /// Transport type, also the hook key (e.g. "vnet")
    pub type_name: String,
}

fn vring_desc_bytes(qsz: u64, align: u64) -> u64 {
    memory::align_up(VRING_DESC_SIZE * qsz, align)
}

fn vring_avail_bytes(qsz: u64, align: u64) -> u64 {
    memory::align_up(2 * (3 + qsz), align)
}

fn vring_used_bytes(qsz: u64, align: u64) -> u64 {
    memory::align_up(2 * 2 + VRING_USED_ELEM_SIZE * (qsz + 1), align)
}

fn vring_bytes(qsz: u64, align: u64) -> u64 {
    vring_desc_bytes(qsz, align)
        + vring_avail_bytes(qsz, align)
        + vring_used_bytes(qsz, align)
}

fn iomem_header_bytes(info: &VmboxInfo) -> u64 {
    VMBOX_DEV_VIRTQ_HEADER_SIZE
        + vring_bytes(info.vring_num as u64, VMBOX_VRING_ALIGN)
            * info.vqs as u64
}

fn iomem_buf_bytes(info: &VmboxInfo) -> u64 {
    info.vqs as u64 * info.vring_num as u64 * info.vring_size as u64
}

/// The shared-memory size of a pairing: an explicit size wins, otherwise
/// the vring geometry dictates it. Always whole pages.
pub fn shmem_bytes(info: &VmboxInfo) -> u64 {
    let raw = if info.shmem_size != 0 {
        info.shmem_size
    } else {
        iomem_header_bytes(info) + iomem_buf_bytes(info)
    };
    memory::align_up(raw, PAGE_SIZE as u64)
}

/// Online state of one side of a pairing
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmboxDevState {
    /// Not yet attached to its VM's controller
    Offline,
    /// Attached; the descriptor slot is valid
    Online,
}

pub(crate) struct VmboxDeviceState {
    pub(crate) bro: Weak<VmboxDevice>,
    pub(crate) vc: Weak<VmboxController>,
    pub(crate) devid: usize,
    pub(crate) reg_base: usize,
    pub(crate) iomem: Option<GuestPhysAddr>,
    pub(crate) iomem_size: u64,
    pub(crate) vring_virq: u32,
    pub(crate) ipc_virq: u32,
    pub(crate) state: VmboxDevState,
}

/// One side of a vmbox pairing, owned by a single VM
pub struct VmboxDevice {
    vmbox_id: usize,
    is_backend: bool,
    vm: Arc<VirtualMachine>,
    pub(crate) inner: Mutex<VmboxDeviceState>,
}

impl VmboxDevice {
    fn new(vmbox_id: usize, is_backend: bool, vm: Arc<VirtualMachine>) -> Self {
        VmboxDevice {
            vmbox_id,
            is_backend,
            vm,
            inner: Mutex::new(VmboxDeviceState {
                bro: Weak::new(),
                vc: Weak::new(),
                devid: 0,
                reg_base: 0,
                iomem: None,
                iomem_size: 0,
                vring_virq: 0,
                ipc_virq: 0,
                state: VmboxDevState::Offline,
            }),
        }
    }

    /// Index of the pairing this device belongs to
    pub fn vmbox_id(&self) -> usize {
        self.vmbox_id
    }

    /// Whether this is the back-end side
    pub fn is_backend(&self) -> bool {
        self.is_backend
    }

    /// The VM owning this device
    pub fn vm(&self) -> &Arc<VirtualMachine> {
        &self.vm
    }

    /// The paired device on the other side
    pub fn bro(&self) -> Option<Arc<VmboxDevice>> {
        self.inner.lock().bro.upgrade()
    }

    pub fn state(&self) -> VmboxDevState {
        self.inner.lock().state
    }

    /// Controller slot of the device, once attached
    pub fn devid(&self) -> usize {
        self.inner.lock().devid
    }

    /// Guest-physical window of the shared block, once attached
    pub fn iomem(&self) -> Option<GuestPhysAddr> {
        self.inner.lock().iomem
    }

    pub fn vring_virq(&self) -> u32 {
        self.inner.lock().vring_virq
    }

    pub fn ipc_virq(&self) -> u32 {
        self.inner.lock().ipc_virq
    }

    /// The coordinates needed to poke this device's register window:
    /// its controller, the window offset, the two virqs and the owner.
    pub(crate) fn link(
        &self,
    ) -> Result<(Arc<VmboxController>, usize, u32, u32, u32)> {
        let inner = self.inner.lock();
        if inner.state != VmboxDevState::Online {
            return Err(Error::NotFound);
        }
        let vc = inner.vc.upgrade().ok_or(Error::NotFound)?;
        Ok((
            vc,
            inner.reg_base,
            inner.vring_virq,
            inner.ipc_virq,
            self.vm.vmid,
        ))
    }
}

/// A guest DTB node description handed to the (external) DTB builder
#[derive(Debug, Clone, PartialEq)]
pub struct DtNodeDesc {
    /// Node name, e.g. `vmbox-vnet@80000000`
    pub name: String,
    /// Compatible string, e.g. `minos,vmbox`
    pub compatible: String,
    /// `reg` tuple: guest-physical base and size
    pub reg: (u64, u64),
    /// Controller virq, where applicable
    pub interrupts: Option<u32>,
}

/// A back-end/front-end pairing and its shared pages
pub struct Vmbox {
    /// Assignment-order identifier
    pub id: usize,
    /// Owning vmids, back-end first
    pub owner: [u32; 2],
    /// Device id and vendor id advertised to the guests
    pub devid: [u32; 2],
    /// Transport type, also the hook key
    pub name: String,
    /// Number of virtqueues
    pub vqs: u32,
    /// Number of descriptors per vring
    pub vring_num: u32,
    /// Buffer bytes per vring entry
    pub vring_size: u32,
    /// Behavior switches
    pub flags: VmboxFlags,
    /// Size of the shared block in bytes (whole pages)
    pub shmem_size: u64,
    shmem: SharedPages,
    devices: [Arc<VmboxDevice>; 2],
}

impl Vmbox {
    fn new(id: usize, info: &VmboxInfo, vms: &VirtualMachineSet) -> Result<Arc<Self>> {
        let vm_be = vms.get_by_vm_id(info.owner[BE_IDX]);
        let vm_fe = vms.get_by_vm_id(info.owner[FE_IDX]);
        let (vm_be, vm_fe) = match (vm_be, vm_fe) {
            (Some(be), Some(fe)) => (be, fe),
            _ => {
                warn!(
                    "no such VM {} or {} for vmbox {}",
                    info.owner[0], info.owner[1], info.type_name
                );
                return Err(Error::NotFound);
            }
        };

        let shmem_size = shmem_bytes(info);
        let shmem = SharedPages::new(memory::page_count(shmem_size))?;

        let be = Arc::new(VmboxDevice::new(id, true, vm_be));
        let fe = Arc::new(VmboxDevice::new(id, false, vm_fe));
        be.inner.lock().bro = Arc::downgrade(&fe);
        fe.inner.lock().bro = Arc::downgrade(&be);

        Ok(Arc::new(Vmbox {
            id,
            owner: info.owner,
            devid: info.id,
            name: info.type_name.clone(),
            vqs: info.vqs,
            vring_num: info.vring_num,
            vring_size: info.vring_size,
            flags: info.flags,
            shmem_size,
            shmem,
            devices: [be, fe],
        }))
    }

    /// One side of the pairing
    pub fn device(&self, idx: usize) -> &Arc<VmboxDevice> {
        &self.devices[idx]
    }

    /// The back-end side
    pub fn backend(&self) -> &Arc<VmboxDevice> {
        &self.devices[BE_IDX]
    }

    /// The front-end side
    pub fn frontend(&self) -> &Arc<VmboxDevice> {
        &self.devices[FE_IDX]
    }

    pub(crate) fn shmem(&self) -> &SharedPages {
        &self.shmem
    }
}

/// Per-type callbacks a service module may hang onto vmbox creation and
/// attachment
pub trait VmboxHookOps: Send + Sync {
    /// Called once when the pairing is created
    fn vmbox_init(&self, _vmbox: &Vmbox) -> Result<()> {
        Ok(())
    }

    /// Called when `vm` (the back-end owner) gets its controller
    fn vmbox_be_init(
        &self,
        _vm: &Arc<VirtualMachine>,
        _vmbox: &Vmbox,
        _dev: &Arc<VmboxDevice>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when `vm` (the front-end owner) gets its controller
    fn vmbox_fe_init(
        &self,
        _vm: &Arc<VirtualMachine>,
        _vmbox: &Vmbox,
        _dev: &Arc<VmboxDevice>,
    ) -> Result<()> {
        Ok(())
    }
}

struct VmboxHook {
    name: String,
    ops: Arc<dyn VmboxHookOps>,
}

/// The global vmbox registry: every pairing, every per-VM controller and
/// the type hooks.
pub struct VmboxSet {
    myself: Weak<VmboxSet>,
    irq: Arc<IrqCore>,
    sched: Arc<dyn Scheduler>,
    vms: Arc<VirtualMachineSet>,
    vmboxs: RwLock<ArrayVec<[Arc<Vmbox>; VMBOX_MAX_COUNT]>>,
    controllers: RwLock<Vec<Arc<VmboxController>>>,
    hooks: RwLock<Vec<VmboxHook>>,
}

impl VmboxSet {
    pub fn new(
        irq: Arc<IrqCore>,
        sched: Arc<dyn Scheduler>,
        vms: Arc<VirtualMachineSet>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|myself| VmboxSet {
            myself: myself.clone(),
            irq,
            sched,
            vms,
            vmboxs: RwLock::new(ArrayVec::new()),
            controllers: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn irq(&self) -> &Arc<IrqCore> {
        &self.irq
    }

    pub(crate) fn sched(&self) -> &Arc<dyn Scheduler> {
        &self.sched
    }

    /// Register callbacks for a vmbox type. At most one hook per name.
    pub fn register_hook(
        &self,
        name: &str,
        ops: Arc<dyn VmboxHookOps>,
    ) -> Result<()> {
        let mut hooks = self.hooks.write();
        if hooks.iter().any(|hook| hook.name == name) {
            warn!("vmbox hook [{}] already registered", name);
            return Err(Error::Exists);
        }
        hooks.push(VmboxHook {
            name: name.chars().take(31).collect(),
            ops,
        });
        Ok(())
    }

    fn find_hook(&self, name: &str) -> Option<Arc<dyn VmboxHookOps>> {
        self.hooks
            .read()
            .iter()
            .find(|hook| hook.name == name)
            .map(|hook| hook.ops.clone())
    }

    /// Number of pairings created so far
    pub fn count(&self) -> usize {
        self.vmboxs.read().len()
    }

    /// Look up a pairing by id
    pub fn vmbox(&self, id: usize) -> Option<Arc<Vmbox>> {
        self.vmboxs.read().get(id).cloned()
    }

    /// The controller of a VM, if one was created
    pub fn controller_for(&self, vmid: u32) -> Option<Arc<VmboxController>> {
        self.controllers
            .read()
            .iter()
            .find(|vc| vc.vm().vmid == vmid)
            .cloned()
    }

    /// Create a pairing from its declaration
    pub fn create_vmbox(&self, info: &VmboxInfo) -> Result<()> {
        let mut vmboxs = self.vmboxs.write();
        if vmboxs.is_full() {
            error!("vmbox count beyond the max size");
            return Err(Error::Exhausted);
        }
        let vmbox = Vmbox::new(vmboxs.len(), info, &self.vms)?;
        vmboxs.push(vmbox.clone());
        drop(vmboxs);

        if let Some(ops) = self.find_hook(&vmbox.name) {
            ops.vmbox_init(&vmbox)?;
        }
        Ok(())
    }

    /// Parse every vmbox declaration in the device tree and create the
    /// pairings. Returns how many were created.
    pub fn parse_dtb(&self, dtb: &[u8]) -> Result<usize> {
        let fdt = fdt::Fdt::new(dtb).map_err(|err| {
            Error::InvalidValue(format!("bad device tree: {:?}", err))
        })?;

        let mut created = 0;
        for node in fdt.all_nodes() {
            if node.property("vmbox-owner").is_none() {
                continue;
            }
            let info = vmbox_info_from_node(&node)?;
            self.create_vmbox(&info)?;
            created += 1;
        }
        Ok(created)
    }

    /// Give `vm` its controller and run the per-VM hooks. Called once per
    /// VM during boot.
    pub fn setup_vm(&self, vm: &Arc<VirtualMachine>) -> Result<()> {
        let vc = VmboxController::new(self.myself.clone(), vm)?;
        self.controllers.write().push(vc);

        for vmbox in self.vmboxs.read().iter() {
            if let Some(ops) = self.find_hook(&vmbox.name) {
                if vmbox.owner[BE_IDX] == vm.vmid {
                    ops.vmbox_be_init(vm, vmbox, vmbox.backend())?;
                }
                if vmbox.owner[FE_IDX] == vm.vmid {
                    ops.vmbox_fe_init(vm, vmbox, vmbox.frontend())?;
                }
            }
        }
        Ok(())
    }

    /// A VM's controller driver came up: attach every back-end device the
    /// VM owns. Front-ends follow once their back-end reports ready.
    pub(crate) fn controller_online(&self, vmid: u32) {
        let vmboxs: Vec<Arc<Vmbox>> =
            self.vmboxs.read().iter().cloned().collect();
        for vmbox in vmboxs {
            if vmbox.owner[BE_IDX] == vmid {
                if let Err(err) = self.attach_device(&vmbox, BE_IDX) {
                    error!(
                        "attach of vmbox {} backend failed: {:?}",
                        vmbox.name, err
                    );
                }
            }
        }
    }

    /// Attach one side of a pairing to its VM's controller: allocate the
    /// descriptor slot and virqs, map the shared block, publish the
    /// descriptor and flag the slot present.
    pub(crate) fn attach_device(
        &self,
        vmbox: &Arc<Vmbox>,
        idx: usize,
    ) -> Result<()> {
        let vdev = vmbox.device(idx);
        let vm = vdev.vm().clone();

        let vc = self.controller_for(vm.vmid).ok_or_else(|| {
            error!("no vmbox controller for vm {}", vm.vmid);
            Error::NotFound
        })?;

        let vring_virq = vm.alloc_virq().ok_or(Error::Exhausted)?;
        let ipc_virq = vm.alloc_virq().ok_or(Error::Exhausted)?;

        let devid = VmboxController::attach_slot(
            &vc, vmbox, vdev, vring_virq, ipc_virq,
        )?;

        if vc.is_online() {
            vc.raise_interrupt(controller::VMBOX_CON_INT_TYPE_DEV_ONLINE);
            self.irq.send_virq(vm.vmid, vc.virq)?;
        }

        debug!(
            "vmbox {} {} attached to vm {} slot {}",
            vmbox.name,
            if idx == BE_IDX { "backend" } else { "frontend" },
            vm.vmid,
            devid
        );
        Ok(())
    }

    /// Platform-device DTB nodes for every attached device of `vmid`
    /// carrying the `PLATFORM_DEV` flag
    pub fn platform_device_nodes(&self, vmid: u32) -> Vec<DtNodeDesc> {
        let mut nodes = Vec::new();
        for vmbox in self.vmboxs.read().iter() {
            if !vmbox.flags.contains(VmboxFlags::PLATFORM_DEV) {
                continue;
            }
            for idx in &[BE_IDX, FE_IDX] {
                let vdev = vmbox.device(*idx);
                if vdev.vm().vmid != vmid {
                    continue;
                }
                let inner = vdev.inner.lock();
                if let Some(iomem) = inner.iomem {
                    nodes.push(DtNodeDesc {
                        name: format!(
                            "vmbox-{}@{:x}",
                            vmbox.name,
                            iomem.as_u64()
                        ),
                        compatible: format!("minos,{}", vmbox.name),
                        reg: (iomem.as_u64(), inner.iomem_size),
                        interrupts: None,
                    });
                }
            }
        }
        nodes
    }
}

fn node_u32_array(
    node: &fdt::node::FdtNode,
    name: &str,
    out: &mut [u32],
) -> usize {
    let prop = match node.property(name) {
        Some(prop) => prop,
        None => return 0,
    };
    let mut read = 0;
    for (slot, chunk) in out.iter_mut().zip(prop.value.chunks_exact(4)) {
        *slot = BigEndian::read_u32(chunk);
        read += 1;
    }
    read
}

fn node_string(node: &fdt::node::FdtNode, name: &str) -> Option<String> {
    let prop = node.property(name)?;
    let raw = prop.value;
    // property strings carry a trailing NUL
    let raw = match raw.last() {
        Some(0) => &raw[..raw.len() - 1],
        _ => raw,
    };
    core::str::from_utf8(raw).ok().map(|s| s.into())
}

/// Decode one `vmbox-*` device-tree node.
///
/// `vmbox-owner` and the vring geometry are mandatory unless an explicit
/// `vmbox-shmem-size` makes the rings unnecessary.
fn vmbox_info_from_node(node: &fdt::node::FdtNode) -> Result<VmboxInfo> {
    let mut info = VmboxInfo {
        owner: [0; 2],
        id: [0; 2],
        vqs: 0,
        vring_num: 0,
        vring_size: 0,
        shmem_size: 0,
        flags: VmboxFlags::empty(),
        type_name: String::new(),
    };

    if node_u32_array(node, "vmbox-owner", &mut info.owner) < 2 {
        return Err(Error::InvalidValue(format!(
            "vmbox node {} declares no owners",
            node.name
        )));
    }

    match node_string(node, "vmbox-type") {
        Some(name) => info.type_name = name.chars().take(31).collect(),
        None => warn!("vmbox node {} has no type", node.name),
    }

    if node_u32_array(node, "vmbox-id", &mut info.id) == 0 {
        warn!("unknown vmbox id for {}", info.type_name);
    }

    if node.property("platform-device").is_some() {
        info.flags |= VmboxFlags::PLATFORM_DEV;
    }

    let mut shmem = [0u32; 1];
    if node_u32_array(node, "vmbox-shmem-size", &mut shmem) == 1
        && shmem[0] > 0
    {
        // a raw shared block, no rings at all
        info.shmem_size = shmem[0] as u64;
        return Ok(info);
    }

    let mut vqs = [0u32; 1];
    if node_u32_array(node, "vmbox-vqs", &mut vqs) == 0 {
        return Err(Error::InvalidValue(format!(
            "vmbox {} declares neither rings nor shared memory",
            info.type_name
        )));
    }
    info.vqs = vqs[0].min(VMBOX_MAX_VQS);
    if info.vqs != vqs[0] {
        warn!(
            "vmbox {} asked for {} virtqueues, capping at {}",
            info.type_name, vqs[0], VMBOX_MAX_VQS
        );
    }

    let mut value = [0u32; 1];
    if node_u32_array(node, "vmbox-vrings", &mut value) == 1 {
        info.vring_num = value[0];
    }
    if node_u32_array(node, "vmbox-vring-size", &mut value) == 1 {
        info.vring_size = value[0];
    }

    Ok(info)
}

/// Install the global vmbox registry
///
/// This method must be called before calling 'vmboxes'
pub unsafe fn init_vmboxes(set: Arc<VmboxSet>) {
    RoAfterInit::init(&VMBOX_SET, set);
}

/// Get the global vmbox registry
pub fn vmboxes() -> &'static Arc<VmboxSet> {
    &*VMBOX_SET
}
