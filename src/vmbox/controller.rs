//! The per-VM vmbox controller: one trapped page of registers through
//! which a guest discovers and rings its vmbox devices.
//!
//! The hypervisor pre-populates device descriptors in the backing page and
//! maps the page read-only into the guest, so discovery reads never trap;
//! only writes (doorbells and handshakes) reach the handlers here.

use super::{
    Vmbox, VmboxDevState, VmboxDevice, VmboxSet, DtNodeDesc, FE_IDX,
    VMBOX_IPC_MAX_RETRY,
};
use crate::error::{Error, Result};
use crate::memory::{GuestPhysAddr, SharedPages, PAGE_SIZE};
use crate::virtdev::{DeviceEvent, DeviceRegion, EmulatedDevice};
use crate::vm::VirtualMachine;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::sync::atomic::{fence, Ordering};
use spin::{Mutex, RwLock};

/// Guest writes 1 to report its controller driver is up
pub const VMBOX_CON_ONLINE: usize = 0x00;
/// Bitmap of present device slots, hypervisor-written
pub const VMBOX_CON_DEV_STAT: usize = 0x04;
/// Interrupt cause bitmap; the guest writes 1-bits to clear
pub const VMBOX_CON_INT_STATUS: usize = 0x08;
/// First device slot window
pub const VMBOX_CON_DEV_BASE: usize = 0x100;
/// Size of one device slot window
pub const VMBOX_CON_DEV_SIZE: usize = 0x100;
/// Device slots that fit in the controller page
pub const VMBOX_CON_MAX_DEV: usize =
    (PAGE_SIZE - VMBOX_CON_DEV_BASE) / VMBOX_CON_DEV_SIZE;

/// `INT_STATUS` cause: a device slot came online
pub const VMBOX_CON_INT_TYPE_DEV_ONLINE: u32 = 1 << 0;

/// Slot index plus magic, so a guest can tell a live slot from zeroes
pub const VMBOX_DEV_ID: usize = 0x00;
pub const VMBOX_DEV_VQS: usize = 0x04;
pub const VMBOX_DEV_VRING_NUM: usize = 0x08;
pub const VMBOX_DEV_VRING_SIZE: usize = 0x0c;
pub const VMBOX_DEV_VRING_BASE_HI: usize = 0x10;
pub const VMBOX_DEV_VRING_BASE_LOW: usize = 0x14;
pub const VMBOX_DEV_MEM_SIZE: usize = 0x18;
pub const VMBOX_DEV_DEVICE_ID: usize = 0x1c;
pub const VMBOX_DEV_VENDOR_ID: usize = 0x20;
pub const VMBOX_DEV_VRING_IRQ: usize = 0x24;
pub const VMBOX_DEV_IPC_IRQ: usize = 0x28;
/// Write-only: ring the peer's vring doorbell
pub const VMBOX_DEV_VRING_EVENT: usize = 0x2c;
/// Write-only: publish a typed IPC event to the peer
pub const VMBOX_DEV_IPC_EVENT: usize = 0x30;
/// Write-only: release the last IPC event received on this device
pub const VMBOX_DEV_IPC_ACK: usize = 0x34;
/// The pending IPC type of this device, peer-written
pub const VMBOX_DEV_IPC_TYPE: usize = 0x38;
/// Write-only, back-end only: report the service ready so the peer
/// front-end can be attached
pub const VMBOX_DEV_BACKEND_ONLINE: usize = 0x3c;

/// Magic ored into `VMBOX_DEV_ID`
pub const VMBOX_DEVICE_MAGIC: u32 = 0x5642_0000;

struct ControllerState {
    devices: ArrayVec<[Arc<VmboxDevice>; VMBOX_CON_MAX_DEV]>,
    online: bool,
}

/// The vmbox controller of a single VM
pub struct VmboxController {
    vm: Arc<VirtualMachine>,
    set: Weak<VmboxSet>,
    page: SharedPages,
    base: GuestPhysAddr,
    /// The control-plane interrupt into the owning VM
    pub virq: u32,
    state: Mutex<ControllerState>,
}

impl VmboxController {
    /// Create the controller for `vm`: allocate and map the register
    /// page, take a control virq and claim the trap window.
    pub(crate) fn new(
        set: Weak<VmboxSet>,
        vm: &Arc<VirtualMachine>,
    ) -> Result<Arc<Self>> {
        let page = SharedPages::new(1)?;
        let base = vm.mm.alloc_io_region(PAGE_SIZE as u64)?;
        // mapped read-only for the guest; only writes trap
        vm.mm.map_io_region(base, page.host_addr(), PAGE_SIZE as u64)?;
        let virq = vm.alloc_virq().ok_or(Error::Exhausted)?;

        let vc = Arc::new(VmboxController {
            vm: vm.clone(),
            set,
            page,
            base,
            virq,
            state: Mutex::new(ControllerState {
                devices: ArrayVec::new(),
                online: false,
            }),
        });

        vm.devices
            .write()
            .register_device(Arc::new(RwLock::new(VmboxControllerMmio(
                vc.clone(),
            ))))?;

        info!(
            "vmbox controller for vm {} at 0x{:x}, virq {}",
            vm.vmid,
            base.as_u64(),
            virq
        );
        Ok(vc)
    }

    /// The VM owning this controller
    pub fn vm(&self) -> &Arc<VirtualMachine> {
        &self.vm
    }

    /// Guest-physical base of the register page
    pub fn guest_base(&self) -> GuestPhysAddr {
        self.base
    }

    /// Whether the guest's controller driver reported in
    pub fn is_online(&self) -> bool {
        self.state.lock().online
    }

    /// Number of attached device slots
    pub fn dev_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Read a register from the backing page
    pub fn read_reg(&self, offset: usize) -> u32 {
        self.page.read_u32(offset)
    }

    pub(crate) fn write_reg(&self, offset: usize, value: u32) {
        self.page.write_u32(offset, value);
    }

    /// The guest DTB node describing this controller
    pub fn node_desc(&self) -> DtNodeDesc {
        DtNodeDesc {
            name: format!("vmbox-controller@{:x}", self.base.as_u64()),
            compatible: "minos,vmbox".into(),
            reg: (self.base.as_u64(), PAGE_SIZE as u64),
            interrupts: Some(self.virq),
        }
    }

    /// Raise an interrupt cause in `INT_STATUS`
    pub(crate) fn raise_interrupt(&self, cause: u32) {
        let status = self.page.read_u32(VMBOX_CON_INT_STATUS);
        self.page.write_u32(VMBOX_CON_INT_STATUS, status | cause);
    }

    /// Claim the next free device slot for `vdev` and publish its
    /// descriptor.
    ///
    /// The descriptor and the device state are fully written before the
    /// `DEV_STAT` bit becomes visible; a guest observing the bit therefore
    /// observes a consistent descriptor.
    pub(crate) fn attach_slot(
        vc: &Arc<Self>,
        vmbox: &Vmbox,
        vdev: &Arc<VmboxDevice>,
        vring_virq: u32,
        ipc_virq: u32,
    ) -> Result<usize> {
        let mut state = vc.state.lock();
        if state.devices.is_full() {
            return Err(Error::Exhausted);
        }
        let devid = state.devices.len();
        let reg_base = VMBOX_CON_DEV_BASE + devid * VMBOX_CON_DEV_SIZE;

        {
            let mut dev = vdev.inner.lock();

            // both sides map the same physical pages; this window IS the
            // channel
            if dev.iomem.is_none() {
                let gpa = vc.vm.mm.alloc_io_region(vmbox.shmem_size)?;
                vc.vm.mm.map_io_region(
                    gpa,
                    vmbox.shmem().host_addr(),
                    vmbox.shmem_size,
                )?;
                dev.iomem = Some(gpa);
                dev.iomem_size = vmbox.shmem_size;
            }
            let iomem = dev.iomem.expect("iomem mapped above").as_u64();

            let page = &vc.page;
            page.zero_range(reg_base, VMBOX_CON_DEV_SIZE);
            page.write_u32(
                reg_base + VMBOX_DEV_ID,
                devid as u32 | VMBOX_DEVICE_MAGIC,
            );
            page.write_u32(reg_base + VMBOX_DEV_VQS, vmbox.vqs);
            page.write_u32(reg_base + VMBOX_DEV_VRING_NUM, vmbox.vring_num);
            page.write_u32(reg_base + VMBOX_DEV_VRING_SIZE, vmbox.vring_size);
            page.write_u32(
                reg_base + VMBOX_DEV_VRING_BASE_HI,
                (iomem >> 32) as u32,
            );
            page.write_u32(
                reg_base + VMBOX_DEV_VRING_BASE_LOW,
                (iomem & 0xffff_ffff) as u32,
            );
            page.write_u32(
                reg_base + VMBOX_DEV_MEM_SIZE,
                dev.iomem_size as u32,
            );
            // the two sides advertise adjacent device ids
            let device_id = if vdev.is_backend() {
                vmbox.devid[0]
            } else {
                vmbox.devid[0] + 1
            };
            page.write_u32(reg_base + VMBOX_DEV_DEVICE_ID, device_id);
            page.write_u32(reg_base + VMBOX_DEV_VENDOR_ID, vmbox.devid[1]);
            page.write_u32(reg_base + VMBOX_DEV_VRING_IRQ, vring_virq);
            page.write_u32(reg_base + VMBOX_DEV_IPC_IRQ, ipc_virq);

            dev.devid = devid;
            dev.reg_base = reg_base;
            dev.vc = Arc::downgrade(vc);
            dev.vring_virq = vring_virq;
            dev.ipc_virq = ipc_virq;
            dev.state = VmboxDevState::Online;
        }

        // descriptor before status bit
        fence(Ordering::SeqCst);

        state.devices.push(vdev.clone());
        let stat = vc.page.read_u32(VMBOX_CON_DEV_STAT) | (1 << devid);
        vc.page.write_u32(VMBOX_CON_DEV_STAT, stat);

        Ok(devid)
    }

    fn handle_write(&self, offset: usize, value: u32) -> Result<()> {
        if offset < VMBOX_CON_DEV_BASE {
            self.handle_con_request(offset, value)
        } else {
            self.handle_dev_request(offset - VMBOX_CON_DEV_BASE, value)
        }
    }

    fn handle_con_request(&self, offset: usize, value: u32) -> Result<()> {
        match offset {
            VMBOX_CON_ONLINE => {
                self.state.lock().online = true;
                let set = self.set.upgrade().ok_or(Error::NotFound)?;
                set.controller_online(self.vm.vmid);
                Ok(())
            }
            VMBOX_CON_INT_STATUS => {
                let status = self.page.read_u32(VMBOX_CON_INT_STATUS);
                self.page.write_u32(VMBOX_CON_INT_STATUS, status & !value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_dev_request(&self, offset: usize, value: u32) -> Result<()> {
        let devid = offset / VMBOX_CON_DEV_SIZE;
        let reg = offset % VMBOX_CON_DEV_SIZE;

        if devid >= VMBOX_CON_MAX_DEV {
            error!("vmbox devid invalid {}", devid);
            return Err(Error::InvalidValue(format!(
                "vmbox devid invalid {}",
                devid
            )));
        }
        let vdev = self
            .state
            .lock()
            .devices
            .get(devid)
            .cloned()
            .ok_or_else(|| {
                error!("no such vmbox device {}", devid);
                Error::NotFound
            })?;
        let set = self.set.upgrade().ok_or(Error::NotFound)?;

        match reg {
            VMBOX_DEV_VRING_EVENT => {
                let bro = vdev.bro().ok_or(Error::NotFound)?;
                let (_vc, _reg_base, vring_virq, _ipc_virq, peer_vmid) =
                    bro.link()?;
                set.irq().send_virq(peer_vmid, vring_virq)
            }
            VMBOX_DEV_IPC_EVENT => self.handle_ipc_event(&set, &vdev, value),
            VMBOX_DEV_IPC_ACK => {
                // consumer-side release of this device's own doorbell slot
                let reg_base = vdev.inner.lock().reg_base;
                self.page
                    .write_u32(reg_base + VMBOX_DEV_IPC_TYPE, 0);
                Ok(())
            }
            VMBOX_DEV_BACKEND_ONLINE => {
                // only the service side may report readiness; the peer
                // front-end becomes visible to its VM in response
                if !vdev.is_backend() {
                    return Ok(());
                }
                let vmbox = set
                    .vmbox(vdev.vmbox_id())
                    .ok_or(Error::NotFound)?;
                set.attach_device(&vmbox, FE_IDX)
            }
            _ => {
                error!("unsupported vmbox register 0x{:x}", reg);
                Ok(())
            }
        }
    }

    /// Publish a typed IPC event to the peer.
    ///
    /// The peer's `IPC_TYPE` slot holds at most one outstanding event:
    /// an empty slot takes the new type, the same type is absorbed
    /// (deduplicated doorbell), and a different outstanding type makes us
    /// yield and retry until the peer acks. The retry count is bounded so
    /// a never-scheduled peer surfaces as a protocol error instead of a
    /// hung core.
    fn handle_ipc_event(
        &self,
        set: &Arc<VmboxSet>,
        vdev: &Arc<VmboxDevice>,
        value: u32,
    ) -> Result<()> {
        // a device reachable through the slot table is always online;
        // only the peer side may still be unattached, which link() reports
        let bro = vdev.bro().ok_or(Error::NotFound)?;
        let (peer_vc, peer_reg, _vring_virq, ipc_virq, peer_vmid) =
            bro.link()?;

        for _ in 0..VMBOX_IPC_MAX_RETRY {
            let outstanding =
                peer_vc.read_reg(peer_reg + VMBOX_DEV_IPC_TYPE);
            if outstanding == value {
                return Ok(());
            }
            if outstanding == 0 {
                peer_vc.write_reg(peer_reg + VMBOX_DEV_IPC_TYPE, value);
                return set.irq().send_virq(peer_vmid, ipc_virq);
            }
            set.sched().yield_now();
        }

        Err(Error::DeviceError(format!(
            "ipc event 0x{:x} stuck behind an event the peer never acked",
            value
        )))
    }
}

/// The trap-window face of a controller, registered in the owning VM's
/// device map
struct VmboxControllerMmio(Arc<VmboxController>);

impl EmulatedDevice for VmboxControllerMmio {
    fn services(&self) -> Vec<DeviceRegion> {
        vec![DeviceRegion::MemIo(
            self.0.base..=self.0.base + (PAGE_SIZE as u64 - 1),
        )]
    }

    fn on_event(&mut self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::MemRead(addr, _) => {
                // the page is guest-readable; a read trap means the guest
                // driver is broken in a way we cannot paper over
                panic!(
                    "trapped read of vmbox controller at 0x{:x}; \
                     reads must go through the shared page",
                    addr.as_u64()
                );
            }
            DeviceEvent::MemWrite(addr, request) => {
                let offset =
                    (addr.as_u64() - self.0.base.as_u64()) as usize;
                self.0.handle_write(offset, request.as_u32()?)
            }
        }
    }
}
