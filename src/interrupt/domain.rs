//! Physical interrupt descriptors and the domains that own them.
//!
//! A domain owns a contiguous range of hardware interrupt numbers and
//! knows how to register, look up and dispatch them. The SPI domain keeps
//! one global descriptor table; the LOCAL domain (SGIs and PPIs) keeps one
//! table per physical core, because the same interrupt number names a
//! different source on every core.

use crate::error::{Error, Result};
use crate::interrupt::{IrqChip, IrqCore, TriggerType, VMM_VMID};
use crate::percore::{CoreId, PerCore};
use crate::vm::VirtualMachineSet;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, RwLock};

/// Longest interrupt name that is stored (longer names are truncated)
pub const MAX_IRQ_NAME_LEN: usize = 31;

bitflags! {
    /// Routing and status bits of a physical interrupt descriptor
    pub struct IrqFlags: u32 {
        /// The hypervisor owns and handles this interrupt itself
        const OWNER_VMM = 1 << 0;
        /// Edge triggered
        const TRIGGER_EDGE = 1 << 1;
        /// Level triggered
        const TRIGGER_LEVEL = 1 << 2;
        /// The interrupt is currently masked at the chip
        const MASKED = 1 << 3;
        /// The descriptor routes to a known vCPU
        const AFFINITY_VCPU = 1 << 4;
    }
}

/// A hypervisor-side handler for a VMM-owned interrupt
pub type IrqHandler = Arc<dyn Fn(u32) -> Result<()> + Send + Sync>;

/// Everything needed to register one physical interrupt
pub struct IrqResource {
    pub hno: u32,
    pub vno: u32,
    /// Owning VM, or [`VMM_VMID`] for hypervisor-owned interrupts
    pub vmid: u32,
    /// Target vCPU inside the owning VM
    pub affinity: u32,
    pub trigger: TriggerType,
    pub name: String,
}

struct IrqDescState {
    vno: u32,
    vmid: u32,
    affinity_vcpu: u32,
    affinity_pcpu: CoreId,
    flags: IrqFlags,
    name: String,
    handler: Option<IrqHandler>,
}

/// A physical interrupt descriptor. Created at registration, never freed.
pub struct IrqDesc {
    hno: u32,
    state: Mutex<IrqDescState>,
}

impl IrqDesc {
    /// Build a descriptor from a declared resource.
    ///
    /// Guest-owned interrupts must name an existing vCPU; the descriptor
    /// records the physical core that vCPU is pinned to so the chip
    /// affinity can be programmed later.
    fn from_resource(
        res: &IrqResource,
        vms: &VirtualMachineSet,
    ) -> Result<IrqDesc> {
        let name: String = res.name.chars().take(MAX_IRQ_NAME_LEN).collect();

        if res.vmid == VMM_VMID {
            info!("irq {} is owned by the hypervisor", res.hno);
            return Ok(IrqDesc {
                hno: res.hno,
                state: Mutex::new(IrqDescState {
                    vno: 0,
                    vmid: VMM_VMID,
                    affinity_vcpu: 0,
                    affinity_pcpu: CoreId::from(0),
                    flags: IrqFlags::OWNER_VMM | IrqFlags::MASKED,
                    name,
                    handler: None,
                }),
            });
        }

        let vcpu = vms.get_vcpu(res.vmid, res.affinity).ok_or_else(|| {
            error!(
                "no vcpu {} in vm {} for irq {}",
                res.affinity, res.vmid, res.hno
            );
            Error::InvalidValue(format!(
                "vcpu {} does not exist in vm {}",
                res.affinity, res.vmid
            ))
        })?;

        let mut flags = IrqFlags::MASKED | IrqFlags::AFFINITY_VCPU;
        match res.trigger {
            TriggerType::Edge => flags |= IrqFlags::TRIGGER_EDGE,
            TriggerType::Level => flags |= IrqFlags::TRIGGER_LEVEL,
            TriggerType::None => (),
        }

        Ok(IrqDesc {
            hno: res.hno,
            state: Mutex::new(IrqDescState {
                vno: res.vno,
                vmid: res.vmid,
                affinity_vcpu: res.affinity,
                affinity_pcpu: vcpu.pcpu,
                flags,
                name,
                handler: None,
            }),
        })
    }

    pub fn hno(&self) -> u32 {
        self.hno
    }

    pub fn vno(&self) -> u32 {
        self.state.lock().vno
    }

    pub fn vmid(&self) -> u32 {
        self.state.lock().vmid
    }

    pub fn affinity_vcpu(&self) -> u32 {
        self.state.lock().affinity_vcpu
    }

    pub fn affinity_pcpu(&self) -> CoreId {
        self.state.lock().affinity_pcpu
    }

    pub fn is_vmm_owned(&self) -> bool {
        self.state.lock().flags.contains(IrqFlags::OWNER_VMM)
    }

    pub fn has_vcpu_affinity(&self) -> bool {
        self.state.lock().flags.contains(IrqFlags::AFFINITY_VCPU)
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn trigger_type(&self) -> TriggerType {
        let flags = self.state.lock().flags;
        if flags.contains(IrqFlags::TRIGGER_EDGE) {
            TriggerType::Edge
        } else if flags.contains(IrqFlags::TRIGGER_LEVEL) {
            TriggerType::Level
        } else {
            TriggerType::None
        }
    }

    fn set_affinity_pcpu(&self, core: CoreId) {
        self.state.lock().affinity_pcpu = core;
    }

    pub(crate) fn set_handler(&self, handler: IrqHandler) {
        self.state.lock().handler = Some(handler);
    }

    /// The registered handler, if any. Cloned out so the descriptor lock
    /// is not held across the call.
    pub(crate) fn handler(&self) -> Option<IrqHandler> {
        self.state.lock().handler.clone()
    }

    /// Mask or unmask the interrupt at the chip. Transitions to the state
    /// the descriptor is already in are no-ops and do not touch the chip.
    pub(crate) fn enable(&self, chip: &dyn IrqChip, enable: bool) {
        let mut state = self.state.lock();

        if enable {
            if !state.flags.contains(IrqFlags::MASKED) {
                return;
            }
            chip.irq_unmask(self.hno);
            state.flags.remove(IrqFlags::MASKED);
        } else {
            if state.flags.contains(IrqFlags::MASKED) {
                return;
            }
            chip.irq_mask(self.hno);
            state.flags.insert(IrqFlags::MASKED);
        }
    }
}

fn check_irq_range(count: u32) -> Result<()> {
    if count == 0 || count >= 1024 {
        error!("invalid irq count {}", count);
        return Err(Error::InvalidValue(format!("invalid irq count {}", count)));
    }
    Ok(())
}

/// The operations a domain of hardware interrupt numbers provides
pub trait IrqDomain: Send + Sync {
    /// First interrupt number of the domain
    fn start(&self) -> u32;

    /// Number of interrupts in the domain
    fn count(&self) -> u32;

    /// Whether `hno` falls inside the domain
    fn contains(&self, hno: u32) -> bool {
        hno >= self.start() && hno < self.start() + self.count()
    }

    /// Create and index a descriptor for the declared resource
    fn register_irq(
        &self,
        res: &IrqResource,
        vms: &VirtualMachineSet,
    ) -> Result<()>;

    /// Look up the descriptor for `hno`
    fn descriptor(&self, hno: u32) -> Option<Arc<IrqDesc>>;

    /// Reverse-map a virtual interrupt number to the backing `hno`.
    /// Returns `None` for domains whose interrupts are never pass-through.
    fn virq_to_irq(&self, vno: u32) -> Option<u32>;

    /// Program per-interrupt chip state (trigger mode, affinity) for every
    /// registered descriptor
    fn setup_irqs(&self, chip: &dyn IrqChip);

    /// Dispatch a fired interrupt described by `desc`
    fn handle(&self, desc: &Arc<IrqDesc>, core: &IrqCore) -> Result<()>;
}

/// The domain of shared peripheral interrupts: one global descriptor table
pub struct SpiDomain {
    start: u32,
    count: u32,
    descs: RwLock<Vec<Option<Arc<IrqDesc>>>>,
}

impl SpiDomain {
    pub fn new(start: u32, count: u32) -> Result<Self> {
        check_irq_range(count)?;
        let mut descs = Vec::with_capacity(count as usize);
        descs.resize_with(count as usize, || None);
        Ok(SpiDomain {
            start,
            count,
            descs: RwLock::new(descs),
        })
    }
}

impl IrqDomain for SpiDomain {
    fn start(&self) -> u32 {
        self.start
    }

    fn count(&self) -> u32 {
        self.count
    }

    fn register_irq(
        &self,
        res: &IrqResource,
        vms: &VirtualMachineSet,
    ) -> Result<()> {
        if !self.contains(res.hno) {
            return Err(Error::InvalidValue(format!(
                "irq {} outside spi domain",
                res.hno
            )));
        }
        let desc = Arc::new(IrqDesc::from_resource(res, vms)?);
        self.descs.write()[(res.hno - self.start) as usize] = Some(desc);
        Ok(())
    }

    fn descriptor(&self, hno: u32) -> Option<Arc<IrqDesc>> {
        if !self.contains(hno) {
            return None;
        }
        self.descs.read()[(hno - self.start) as usize].clone()
    }

    fn virq_to_irq(&self, vno: u32) -> Option<u32> {
        // slow path, only used when enabling/disabling pass-through irqs
        self.descs
            .read()
            .iter()
            .flatten()
            .find(|desc| desc.vno() == vno)
            .map(|desc| desc.hno())
    }

    fn setup_irqs(&self, chip: &dyn IrqChip) {
        for desc in self.descs.read().iter().flatten() {
            if desc.has_vcpu_affinity() {
                chip.irq_set_type(desc.hno(), desc.trigger_type());
                chip.irq_set_affinity(desc.hno(), desc.affinity_pcpu());
            }
        }
    }

    fn handle(&self, desc: &Arc<IrqDesc>, core: &IrqCore) -> Result<()> {
        if desc.is_vmm_owned() {
            core.do_vmm_irq(desc)
        } else {
            core.do_guest_irq(desc)
        }
    }
}

/// The domain of core-private interrupts (SGIs and PPIs): one descriptor
/// table per physical core, each slice only touched through the
/// current-core accessor.
pub struct LocalDomain {
    start: u32,
    count: u32,
    percpu: PerCore<RwLock<Vec<Option<Arc<IrqDesc>>>>>,
}

impl LocalDomain {
    pub fn new(start: u32, count: u32, nr_cores: usize) -> Result<Self> {
        check_irq_range(count)?;
        let percpu = PerCore::new_with(nr_cores, |_| {
            let mut descs = Vec::with_capacity(count as usize);
            descs.resize_with(count as usize, || None);
            RwLock::new(descs)
        });
        Ok(LocalDomain {
            start,
            count,
            percpu,
        })
    }
}

impl IrqDomain for LocalDomain {
    fn start(&self) -> u32 {
        self.start
    }

    fn count(&self) -> u32 {
        self.count
    }

    fn register_irq(
        &self,
        res: &IrqResource,
        vms: &VirtualMachineSet,
    ) -> Result<()> {
        if !self.contains(res.hno) {
            return Err(Error::InvalidValue(format!(
                "irq {} outside local domain",
                res.hno
            )));
        }

        // The same interrupt number is a distinct source on every core;
        // replicate the descriptor and pin each copy to its core.
        for core in 0..self.percpu.len() {
            let desc = IrqDesc::from_resource(res, vms)?;
            desc.set_affinity_pcpu(CoreId::from(core as u32));
            let slice = self
                .percpu
                .get(CoreId::from(core as u32))
                .expect("local domain slice missing");
            slice.write()[(res.hno - self.start) as usize] =
                Some(Arc::new(desc));
        }
        Ok(())
    }

    fn descriptor(&self, hno: u32) -> Option<Arc<IrqDesc>> {
        if !self.contains(hno) {
            return None;
        }
        self.percpu.current().read()[(hno - self.start) as usize].clone()
    }

    fn virq_to_irq(&self, _vno: u32) -> Option<u32> {
        // SGI and PPI virqs never attach to a physical interrupt
        None
    }

    fn setup_irqs(&self, _chip: &dyn IrqChip) {
        // trigger modes for banked interrupts are fixed by the chip driver
        // during its own init
    }

    fn handle(&self, desc: &Arc<IrqDesc>, core: &IrqCore) -> Result<()> {
        // the hypervisor owns all SGIs and PPIs
        core.do_vmm_irq(desc)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interrupt::mock::{ChipOp, MockChip};
    use crate::percore;
    use crate::vm::test_support::sample_vm_set;

    fn guest_resource(hno: u32, vno: u32) -> IrqResource {
        IrqResource {
            hno,
            vno,
            vmid: 1,
            affinity: 0,
            trigger: TriggerType::Edge,
            name: "test-dev".into(),
        }
    }

    fn vmm_resource(hno: u32) -> IrqResource {
        IrqResource {
            hno,
            vno: 0,
            vmid: VMM_VMID,
            affinity: 0,
            trigger: TriggerType::None,
            name: "vmm-timer".into(),
        }
    }

    #[test]
    fn test_register_then_lookup_returns_descriptor() {
        let vms = sample_vm_set();
        let domain = SpiDomain::new(32, 96).unwrap();
        domain.register_irq(&guest_resource(42, 32), &vms).unwrap();

        let desc = domain.descriptor(42).expect("descriptor missing");
        assert_eq!(desc.hno(), 42);
        assert_eq!(desc.vno(), 32);
        assert_eq!(desc.vmid(), 1);
        assert!(!desc.is_vmm_owned());
        assert!(desc.has_vcpu_affinity());

        assert!(domain.descriptor(43).is_none());
        assert!(domain.descriptor(10).is_none());
    }

    #[test]
    fn test_register_unknown_vcpu_fails() {
        let vms = sample_vm_set();
        let domain = SpiDomain::new(32, 96).unwrap();
        let mut res = guest_resource(42, 32);
        res.affinity = 9;
        assert!(domain.register_irq(&res, &vms).is_err());
    }

    #[test]
    fn test_vmm_resource_skips_routing_fields() {
        let vms = sample_vm_set();
        let domain = SpiDomain::new(32, 96).unwrap();
        domain.register_irq(&vmm_resource(50), &vms).unwrap();

        let desc = domain.descriptor(50).unwrap();
        assert!(desc.is_vmm_owned());
        assert!(!desc.has_vcpu_affinity());
        assert_eq!(desc.vmid(), VMM_VMID);
    }

    #[test]
    fn test_spi_virq_reverse_lookup() {
        let vms = sample_vm_set();
        let domain = SpiDomain::new(32, 96).unwrap();
        domain.register_irq(&guest_resource(42, 77), &vms).unwrap();

        assert_eq!(domain.virq_to_irq(77), Some(42));
        assert_eq!(domain.virq_to_irq(78), None);
    }

    #[test]
    fn test_setup_programs_trigger_and_affinity() {
        let vms = sample_vm_set();
        let chip = MockChip::new();
        let domain = SpiDomain::new(32, 96).unwrap();
        domain.register_irq(&guest_resource(42, 32), &vms).unwrap();
        domain.register_irq(&vmm_resource(50), &vms).unwrap();

        domain.setup_irqs(&*chip);

        let ops = chip.take_ops();
        // only the descriptor with vcpu affinity is programmed; vcpu 0 of
        // vm 1 is pinned to core 0 in the sample set
        assert_eq!(
            ops,
            vec![
                ChipOp::SetType(42, TriggerType::Edge),
                ChipOp::SetAffinity(42, 0),
            ]
        );
    }

    #[test]
    fn test_enable_same_state_is_idempotent() {
        let vms = sample_vm_set();
        let chip = MockChip::new();
        let domain = SpiDomain::new(32, 96).unwrap();
        domain.register_irq(&guest_resource(42, 32), &vms).unwrap();
        let desc = domain.descriptor(42).unwrap();

        desc.enable(&*chip, true);
        desc.enable(&*chip, true);
        desc.enable(&*chip, false);
        desc.enable(&*chip, false);
        desc.enable(&*chip, true);

        // repeated same-state transitions reach the chip exactly once
        assert_eq!(
            chip.take_ops(),
            vec![
                ChipOp::Unmask(42),
                ChipOp::Mask(42),
                ChipOp::Unmask(42),
            ]
        );
    }

    #[test]
    fn test_local_domain_replicates_per_core() {
        percore::testing::install(4);
        let vms = sample_vm_set();
        let domain = LocalDomain::new(0, 32, 4).unwrap();
        domain.register_irq(&vmm_resource(27), &vms).unwrap();

        percore::testing::set_core_id(0);
        let on_zero = domain.descriptor(27).unwrap();
        percore::testing::set_core_id(2);
        let on_two = domain.descriptor(27).unwrap();

        assert!(!Arc::ptr_eq(&on_zero, &on_two));
        assert_eq!(on_zero.affinity_pcpu(), CoreId::from(0));
        assert_eq!(on_two.affinity_pcpu(), CoreId::from(2));
        assert_eq!(domain.virq_to_irq(27), None);
        percore::testing::set_core_id(0);
    }

    #[test]
    fn test_irq_range_validation() {
        assert!(SpiDomain::new(32, 0).is_err());
        assert!(SpiDomain::new(32, 1024).is_err());
        assert!(LocalDomain::new(0, 0, 4).is_err());
    }
}
