//! Interrupt routing and virtualization.
//!
//! Physical interrupts are acknowledged here, resolved through a domain to
//! a descriptor, and either handled by the hypervisor (VMM-owned) or
//! injected into the owning guest as a virtual interrupt. Software virqs
//! and virtual SGIs take the same injection path without a backing
//! physical interrupt.

pub mod domain;
pub mod virq;

use crate::error::{Error, Result};
use crate::lock::ro_after_init::RoAfterInit;
use crate::percore::{self, CoreId};
use crate::sched::{SchedReason, Scheduler};
use crate::vcpu::Vcpu;
use crate::vm::VirtualMachineSet;
use self::domain::{IrqDesc, IrqDomain, IrqHandler, IrqResource};
use self::virq::{Virq, VirqState};
use alloc::sync::Arc;
use num_enum::TryFromPrimitive;
use spin::RwLock;

/// The SGI used to kick a remote core into its scheduler before it
/// returns to a guest
pub const RESCHED_SGI: u32 = 7;

/// Number of software generated interrupts per core
pub const NR_SGI: u32 = 16;

/// First shared peripheral interrupt number
pub const SPI_BASE: u32 = 32;

/// The `vmid` naming the hypervisor itself as the owner of an interrupt
pub const VMM_VMID: u32 = 0xffff;

/// Maximum number of interrupt domains
pub const IRQ_DOMAIN_MAX: usize = 4;

static IRQ_CORE: RoAfterInit<Arc<IrqCore>> = RoAfterInit::uninitialized();

/// Trigger mode of a physical interrupt
#[derive(TryFromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TriggerType {
    /// Keep whatever the chip reset to
    None = 0,
    Edge = 1,
    Level = 2,
}

impl From<crate::config::IrqTrigger> for TriggerType {
    fn from(value: crate::config::IrqTrigger) -> Self {
        match value {
            crate::config::IrqTrigger::None => TriggerType::None,
            crate::config::IrqTrigger::Edge => TriggerType::Edge,
            crate::config::IrqTrigger::Level => TriggerType::Level,
        }
    }
}

/// Recipient selection for a software generated interrupt
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SgiTarget {
    /// The cores named by the bitmap
    List(u32),
    /// Every core but the sender
    Others,
}

/// The slot a domain occupies in the registry
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum IrqDomainKind {
    /// Shared peripheral interrupts
    Spi = 0,
    /// Core-private interrupts (SGI + PPI)
    Local = 1,
}

/// The contract of the physical interrupt controller driver.
///
/// The implementation lives in the platform layer (a GICv3-style driver);
/// this crate only calls into it and never touches controller registers
/// itself.
pub trait IrqChip: Send + Sync {
    /// One-time controller init on the bootstrap core
    fn init(&self) -> Result<()>;

    /// Per-core init on every secondary core
    fn secondary_init(&self) -> Result<()> {
        Ok(())
    }

    /// Acknowledge and return the highest-priority pending interrupt
    fn get_pending_irq(&self) -> u32;

    /// Drop the running priority of `hno` (EOI)
    fn irq_eoi(&self, hno: u32);

    /// Deactivate `hno`
    fn irq_dir(&self, hno: u32);

    fn irq_mask(&self, hno: u32);

    fn irq_unmask(&self, hno: u32);

    fn irq_set_type(&self, hno: u32, trigger: TriggerType);

    fn irq_set_affinity(&self, hno: u32, core: CoreId);

    /// Raise a software generated interrupt on other cores
    fn send_sgi(&self, sgi: u32, target: SgiTarget);

    /// Load a virtual interrupt into a free list register
    fn send_virq(&self, virq: &Virq);

    /// Report the current list-register state of a virtual interrupt
    fn get_virq_state(&self, virq: &Virq) -> VirqState;
}

/// The interrupt subsystem handle: the chip, the scheduler, the VM set and
/// the domain registry. Constructed once at boot; every piece of the
/// hypervisor that signals interrupts holds a reference.
pub struct IrqCore {
    chip: Arc<dyn IrqChip>,
    sched: Arc<dyn Scheduler>,
    vms: Arc<VirtualMachineSet>,
    nr_cores: usize,
    domains: RwLock<[Option<Arc<dyn IrqDomain>>; IRQ_DOMAIN_MAX]>,
}

impl IrqCore {
    /// Create the subsystem and run the chip's one-time init
    pub fn new(
        chip: Arc<dyn IrqChip>,
        sched: Arc<dyn Scheduler>,
        vms: Arc<VirtualMachineSet>,
        nr_cores: usize,
    ) -> Result<Arc<Self>> {
        chip.init()?;
        Ok(Arc::new(IrqCore {
            chip,
            sched,
            vms,
            nr_cores,
            domains: RwLock::new([None, None, None, None]),
        }))
    }

    /// The chip driver
    pub fn chip(&self) -> &Arc<dyn IrqChip> {
        &self.chip
    }

    /// Place a domain into its registry slot
    pub fn add_domain(
        &self,
        kind: IrqDomainKind,
        domain: Arc<dyn IrqDomain>,
    ) -> Result<()> {
        let mut domains = self.domains.write();
        let slot = &mut domains[kind as usize];
        if slot.is_some() {
            return Err(Error::Exists);
        }
        *slot = Some(domain);
        Ok(())
    }

    /// Per-core chip init for secondary cores
    pub fn secondary_init(&self) -> Result<()> {
        self.chip.secondary_init()
    }

    fn domain_for(&self, hno: u32) -> Option<Arc<dyn IrqDomain>> {
        self.domains
            .read()
            .iter()
            .flatten()
            .find(|domain| domain.contains(hno))
            .cloned()
    }

    /// Look up the descriptor owning `hno`
    pub fn descriptor(&self, hno: u32) -> Option<Arc<IrqDesc>> {
        self.domain_for(hno)?.descriptor(hno)
    }

    fn virq_to_irq(&self, vno: u32) -> Option<u32> {
        self.domains
            .read()
            .iter()
            .flatten()
            .find_map(|domain| domain.virq_to_irq(vno))
    }

    /// Register one declared interrupt with the domain that owns its
    /// number
    pub fn register_irq(&self, res: &IrqResource) -> Result<()> {
        let domain = self.domain_for(res.hno).ok_or_else(|| {
            error!("irq {} is not covered by any domain", res.hno);
            Error::InvalidValue(format!("irq {} not supported", res.hno))
        })?;
        domain.register_irq(res, &self.vms)
    }

    /// Register every interrupt declared in the boot configuration
    pub fn register_irq_entries(
        &self,
        entries: &[crate::config::IrqEntry],
    ) -> Result<()> {
        for entry in entries.iter() {
            self.register_irq(&IrqResource {
                hno: entry.hno,
                vno: entry.vno,
                vmid: entry.vmid,
                affinity: entry.vcpu,
                trigger: entry.trigger.into(),
                name: entry.name.clone(),
            })?;
        }
        Ok(())
    }

    /// Program trigger modes and affinities for every registered
    /// descriptor, in every domain
    pub fn setup_irqs(&self) {
        for domain in self.domains.read().iter().flatten() {
            domain.setup_irqs(&*self.chip);
        }
    }

    /// Install a hypervisor-side handler for a VMM-owned interrupt and
    /// unmask it
    pub fn request_irq(&self, hno: u32, handler: IrqHandler) -> Result<()> {
        let desc = self.descriptor(hno).ok_or(Error::NotFound)?;
        if !desc.is_vmm_owned() {
            return Err(Error::NotFound);
        }
        desc.set_handler(handler);
        self.irq_enable(hno, true);
        Ok(())
    }

    /// Mask or unmask a physical interrupt. Unknown numbers are ignored.
    pub fn irq_enable(&self, hno: u32, enable: bool) {
        if let Some(desc) = self.descriptor(hno) {
            desc.enable(&*self.chip, enable);
        }
    }

    /// Mask or unmask the physical interrupt backing a pass-through virq.
    /// A no-op for software-only virqs.
    pub fn virq_enable(&self, vno: u32, enable: bool) {
        if let Some(hno) = self.virq_to_irq(vno) {
            self.irq_enable(hno, enable);
        }
    }

    /// Top half: acknowledge the pending interrupt and dispatch it
    pub fn handle_irq(&self) -> Result<()> {
        let hno = self.chip.get_pending_irq();

        // drop the priority right away; deactivation is the handler's
        // business (guest-owned interrupts stay active until the guest
        // EOIs them)
        self.chip.irq_eoi(hno);

        let domain = match self.domain_for(hno) {
            Some(domain) => domain,
            None => {
                self.do_bad_irq(hno);
                return Err(Error::NotFound);
            }
        };
        let desc = match domain.descriptor(hno) {
            Some(desc) => desc,
            None => {
                error!("irq {} fired but was never registered", hno);
                self.do_bad_irq(hno);
                return Err(Error::InvalidValue(format!(
                    "irq {} not registered",
                    hno
                )));
            }
        };

        domain.handle(&desc, self)
    }

    fn do_bad_irq(&self, hno: u32) {
        error!("nothing to do for irq {}, deactivating", hno);
        self.chip.irq_dir(hno);
    }

    /// Handle an interrupt the hypervisor owns. The interrupt is always
    /// deactivated, whether or not the handler succeeds.
    pub(crate) fn do_vmm_irq(&self, desc: &Arc<IrqDesc>) -> Result<()> {
        let core = percore::read_core_id();

        let result = if core != desc.affinity_pcpu() {
            info!("irq {} does not belong to core {}", desc.hno(), core);
            Err(Error::InvalidValue(format!(
                "irq {} not routed to core {}",
                desc.hno(),
                core
            )))
        } else if let Some(handler) = desc.handler() {
            let ret = (*handler)(desc.hno());
            if ret.is_err() {
                error!("handler for irq {} failed", desc.hno());
            }
            ret
        } else {
            error!("no handler registered for irq {}", desc.hno());
            Err(Error::NotFound)
        };

        self.chip.irq_dir(desc.hno());
        result
    }

    /// Forward a guest-owned interrupt into the owning vCPU.
    ///
    /// No deactivation here: the interrupt stays active until the guest
    /// EOIs it and the exit hook reclaims the list register.
    pub(crate) fn do_guest_irq(&self, desc: &Arc<IrqDesc>) -> Result<()> {
        let vcpu = self
            .vms
            .get_vcpu(desc.vmid(), desc.affinity_vcpu())
            .ok_or_else(|| {
                error!("no vcpu to take irq {}", desc.hno());
                Error::InvalidValue(format!(
                    "vcpu {} of vm {} does not exist",
                    desc.affinity_vcpu(),
                    desc.vmid()
                ))
            })?;
        self.send_virq_to(&vcpu, desc.vno(), desc.hno(), true)
    }

    /// Queue a virq on the target vCPU and wake whoever needs to notice:
    /// a remote core gets the resched SGI, a local non-running vCPU gets a
    /// scheduler wakeup, and the running vCPU will see the pending state
    /// on its next guest entry anyway.
    fn send_virq_to(
        &self,
        vcpu: &Arc<Vcpu>,
        vno: u32,
        hno: u32,
        hw: bool,
    ) -> Result<()> {
        vcpu.irq_state.queue(vno, hno, hw)?;

        let current = percore::read_core_id();
        if vcpu.pcpu != current {
            self.send_sgi(RESCHED_SGI, vcpu.pcpu);
        } else {
            let is_running = self
                .sched
                .current_vcpu()
                .map(|current| Arc::ptr_eq(&current, vcpu))
                .unwrap_or(false);
            if !is_running {
                self.sched.sched_vcpu(vcpu, SchedReason::IrqPending);
            }
        }
        Ok(())
    }

    /// Raise an SGI on a single core. Out-of-range arguments are dropped.
    pub fn send_sgi(&self, sgi: u32, core: CoreId) {
        if core.raw as usize >= self.nr_cores {
            return;
        }
        if sgi >= NR_SGI {
            return;
        }
        self.chip.send_sgi(sgi, SgiTarget::List(1 << core.raw));
    }

    /// Inject a software virq into a VM. Virqs without a backing physical
    /// interrupt are routed to vCPU 0 of the target.
    pub fn send_virq(&self, vmid: u32, vno: u32) -> Result<()> {
        let vcpu = self.vms.get_vcpu(vmid, 0).ok_or(Error::NotFound)?;
        self.send_virq_to(&vcpu, vno, 0, false)
    }

    /// Inject a virq bound to a pass-through physical interrupt. The
    /// descriptor of `hirq` must name `vmid` as its owner; the target vCPU
    /// is the descriptor's affinity.
    pub fn send_virq_hw(&self, vmid: u32, vno: u32, hirq: u32) -> Result<()> {
        let desc = self.descriptor(hirq).ok_or(Error::NotFound)?;
        if desc.vmid() != vmid {
            return Err(Error::InvalidValue(format!(
                "irq {} is not owned by vm {}",
                hirq, vmid
            )));
        }
        let vcpu = self
            .vms
            .get_vcpu(vmid, desc.affinity_vcpu())
            .ok_or(Error::NotFound)?;
        self.send_virq_to(&vcpu, vno, hirq, true)
    }

    /// Deliver a virtual SGI from `sender` to every sibling vCPU named in
    /// `mask`. Bits beyond the VM's vCPU count are ignored. All targets
    /// are attempted; the first failure is reported.
    pub fn send_vsgi(
        &self,
        sender: &Vcpu,
        sgi: u32,
        mask: u32,
    ) -> Result<()> {
        let vm = sender.vm().ok_or(Error::NotFound)?;
        let mut result = Ok(());
        for id in 0..vm.vcpu_count() {
            if mask & (1 << id) == 0 {
                continue;
            }
            if let Some(vcpu) = vm.vcpu(id) {
                if let Err(err) = self.send_virq_to(vcpu, sgi, 0, false) {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }

    /// Called right before the world switch into `vcpu`, with interrupts
    /// off: move queued virqs into list registers
    pub fn on_guest_entry(&self, vcpu: &Vcpu) {
        vcpu.irq_state.flush_pending(&*self.chip);
    }

    /// Called right after the world switch out of `vcpu`: reclaim list
    /// registers the guest has finished with
    pub fn on_guest_exit(&self, vcpu: &Vcpu) {
        vcpu.irq_state.retire_inactive(&*self.chip);
    }
}

/// Install the global interrupt subsystem
///
/// This method must be called before calling 'irq_core'
pub unsafe fn init_irq_core(core: Arc<IrqCore>) {
    RoAfterInit::init(&IRQ_CORE, core);
}

/// Get the global interrupt subsystem
pub fn irq_core() -> &'static Arc<IrqCore> {
    &*IRQ_CORE
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording chip and scheduler doubles shared by the interrupt and
    //! vmbox tests.

    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use spin::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum ChipOp {
        Eoi(u32),
        Dir(u32),
        Mask(u32),
        Unmask(u32),
        SetType(u32, TriggerType),
        SetAffinity(u32, u32),
        SendSgi { sgi: u32, mask: u32 },
        SendVirq { vno: u32, hno: u32, hw: bool },
    }

    #[derive(Default)]
    pub struct MockChip {
        ops: Mutex<Vec<ChipOp>>,
        pending: Mutex<Vec<u32>>,
        virq_states: Mutex<BTreeMap<u32, VirqState>>,
    }

    impl MockChip {
        pub fn new() -> Arc<Self> {
            Arc::new(MockChip::default())
        }

        pub fn push_pending(&self, hno: u32) {
            self.pending.lock().push(hno);
        }

        pub fn set_virq_state(&self, vno: u32, state: VirqState) {
            self.virq_states.lock().insert(vno, state);
        }

        pub fn take_ops(&self) -> Vec<ChipOp> {
            core::mem::replace(&mut *self.ops.lock(), Vec::new())
        }

        fn record(&self, op: ChipOp) {
            self.ops.lock().push(op);
        }
    }

    impl IrqChip for MockChip {
        fn init(&self) -> Result<()> {
            Ok(())
        }

        fn get_pending_irq(&self) -> u32 {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                // GIC spurious id
                1023
            } else {
                pending.remove(0)
            }
        }

        fn irq_eoi(&self, hno: u32) {
            self.record(ChipOp::Eoi(hno));
        }

        fn irq_dir(&self, hno: u32) {
            self.record(ChipOp::Dir(hno));
        }

        fn irq_mask(&self, hno: u32) {
            self.record(ChipOp::Mask(hno));
        }

        fn irq_unmask(&self, hno: u32) {
            self.record(ChipOp::Unmask(hno));
        }

        fn irq_set_type(&self, hno: u32, trigger: TriggerType) {
            self.record(ChipOp::SetType(hno, trigger));
        }

        fn irq_set_affinity(&self, hno: u32, core: CoreId) {
            self.record(ChipOp::SetAffinity(hno, core.raw));
        }

        fn send_sgi(&self, sgi: u32, target: SgiTarget) {
            let mask = match target {
                SgiTarget::List(mask) => mask,
                SgiTarget::Others => u32::max_value(),
            };
            self.record(ChipOp::SendSgi { sgi, mask });
        }

        fn send_virq(&self, virq: &Virq) {
            self.record(ChipOp::SendVirq {
                vno: virq.v_intno,
                hno: virq.h_intno,
                hw: virq.hw,
            });
        }

        fn get_virq_state(&self, virq: &Virq) -> VirqState {
            self.virq_states
                .lock()
                .get(&virq.v_intno)
                .copied()
                .unwrap_or(VirqState::Pending)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum SchedOp {
        Wake { vmid: u32, vcpu_id: u32 },
        Yield,
    }

    #[derive(Default)]
    pub struct MockScheduler {
        current: Mutex<Option<Arc<Vcpu>>>,
        ops: Mutex<Vec<SchedOp>>,
    }

    impl MockScheduler {
        pub fn new() -> Arc<Self> {
            Arc::new(MockScheduler::default())
        }

        pub fn set_current(&self, vcpu: Option<Arc<Vcpu>>) {
            *self.current.lock() = vcpu;
        }

        pub fn take_ops(&self) -> Vec<SchedOp> {
            core::mem::replace(&mut *self.ops.lock(), Vec::new())
        }

        pub fn yield_count(&self) -> usize {
            self.ops
                .lock()
                .iter()
                .filter(|op| **op == SchedOp::Yield)
                .count()
        }
    }

    impl Scheduler for MockScheduler {
        fn current_vcpu(&self) -> Option<Arc<Vcpu>> {
            self.current.lock().clone()
        }

        fn sched_vcpu(&self, vcpu: &Arc<Vcpu>, _reason: SchedReason) {
            let vmid = vcpu.vm().map(|vm| vm.vmid).unwrap_or(0);
            self.ops.lock().push(SchedOp::Wake {
                vmid,
                vcpu_id: vcpu.vcpu_id,
            });
        }

        fn yield_now(&self) {
            self.ops.lock().push(SchedOp::Yield);
        }
    }
}

#[cfg(test)]
mod test {
    use super::domain::{LocalDomain, SpiDomain};
    use super::mock::{ChipOp, MockChip, MockScheduler, SchedOp};
    use super::*;
    use crate::vm::test_support::sample_vm_set;

    fn test_core(
    ) -> (Arc<IrqCore>, Arc<MockChip>, Arc<MockScheduler>, Arc<VirtualMachineSet>)
    {
        crate::percore::testing::install(4);
        crate::percore::testing::set_core_id(0);

        let chip = MockChip::new();
        let sched = MockScheduler::new();
        let vms = Arc::new(sample_vm_set());
        let core = IrqCore::new(
            chip.clone() as Arc<dyn IrqChip>,
            sched.clone() as Arc<dyn Scheduler>,
            vms.clone(),
            4,
        )
        .unwrap();
        core.add_domain(
            IrqDomainKind::Spi,
            Arc::new(SpiDomain::new(SPI_BASE, 96).unwrap()),
        )
        .unwrap();
        core.add_domain(
            IrqDomainKind::Local,
            Arc::new(LocalDomain::new(0, 32, 4).unwrap()),
        )
        .unwrap();
        (core, chip, sched, vms)
    }

    fn register_uart(core: &IrqCore, vmid: u32, vcpu: u32) {
        core.register_irq(&IrqResource {
            hno: 42,
            vno: 32,
            vmid,
            affinity: vcpu,
            trigger: TriggerType::Edge,
            name: "uart".into(),
        })
        .unwrap();
    }

    #[test]
    fn test_spi_pass_through_dispatch() {
        let (core, chip, _sched, vms) = test_core();
        // vm 1 vcpu 1 is pinned to core 1 in the sample set
        register_uart(&core, 1, 1);

        core.setup_irqs();
        assert_eq!(
            chip.take_ops(),
            vec![
                ChipOp::SetType(42, TriggerType::Edge),
                ChipOp::SetAffinity(42, 1),
            ]
        );

        chip.push_pending(42);
        core.handle_irq().unwrap();

        // eoi at acknowledge time, one list-register injection targeting
        // the affinity vcpu, a resched kick for its remote core, and
        // crucially no deactivation
        let ops = chip.take_ops();
        assert_eq!(ops[0], ChipOp::Eoi(42));
        assert!(ops.contains(&ChipOp::SendSgi {
            sgi: RESCHED_SGI,
            mask: 1 << 1
        }));
        assert!(!ops.iter().any(|op| matches!(op, ChipOp::Dir(_))));

        let vcpu = vms.get_vcpu(1, 1).unwrap();
        assert_eq!(vcpu.irq_state.pending_count(), 1);
        let slot = vcpu.irq_state.slots()[0];
        assert_eq!(
            (slot.h_intno, slot.v_intno, slot.hw),
            (42, 32, true)
        );

        // entry hook loads the list register
        core.on_guest_entry(&vcpu);
        assert!(chip.take_ops().contains(&ChipOp::SendVirq {
            vno: 32,
            hno: 42,
            hw: true
        }));

        // guest EOIs; exit hook frees the slot
        chip.set_virq_state(32, VirqState::Inactive);
        core.on_guest_exit(&vcpu);
        assert_eq!(vcpu.irq_state.in_flight(), 0);
    }

    #[test]
    fn test_unregistered_irq_is_deactivated() {
        let (core, chip, _sched, _vms) = test_core();

        chip.push_pending(60);
        assert!(core.handle_irq().is_err());

        let ops = chip.take_ops();
        assert_eq!(ops, vec![ChipOp::Eoi(60), ChipOp::Dir(60)]);
    }

    #[test]
    fn test_vmm_irq_requires_matching_core() {
        let (core, chip, _sched, _vms) = test_core();
        core.register_irq(&IrqResource {
            hno: 50,
            vno: 0,
            vmid: VMM_VMID,
            affinity: 0,
            trigger: TriggerType::None,
            name: "maintenance".into(),
        })
        .unwrap();
        core.request_irq(50, Arc::new(|_| Ok(()))).unwrap();
        chip.take_ops();

        // VMM-owned descriptors default to core 0; dispatch on core 2
        // must fail but still deactivate
        crate::percore::testing::set_core_id(2);
        chip.push_pending(50);
        assert!(core.handle_irq().is_err());
        crate::percore::testing::set_core_id(0);

        let ops = chip.take_ops();
        assert!(ops.contains(&ChipOp::Dir(50)));
    }

    #[test]
    fn test_request_irq_runs_handler_and_always_deactivates() {
        let (core, chip, _sched, _vms) = test_core();
        core.register_irq(&IrqResource {
            hno: 50,
            vno: 0,
            vmid: VMM_VMID,
            affinity: 0,
            trigger: TriggerType::None,
            name: "maintenance".into(),
        })
        .unwrap();

        let fired = Arc::new(spin::Mutex::new(0u32));
        let seen = fired.clone();
        core.request_irq(
            50,
            Arc::new(move |hno| {
                *seen.lock() += hno;
                Ok(())
            }),
        )
        .unwrap();

        // request_irq unmasks the line
        assert!(chip.take_ops().contains(&ChipOp::Unmask(50)));

        chip.push_pending(50);
        core.handle_irq().unwrap();
        assert_eq!(*fired.lock(), 50);
        assert!(chip.take_ops().contains(&ChipOp::Dir(50)));
    }

    #[test]
    fn test_request_irq_rejects_guest_owned() {
        let (core, _chip, _sched, _vms) = test_core();
        register_uart(&core, 1, 0);

        assert_eq!(
            core.request_irq(42, Arc::new(|_| Ok(()))),
            Err(Error::NotFound)
        );
        assert_eq!(
            core.request_irq(99, Arc::new(|_| Ok(()))),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_cross_core_injection_kicks_remote() {
        let (core, chip, sched, _vms) = test_core();
        register_uart(&core, 2, 0);

        // sender runs on core 0; vm 2 vcpu 0 is pinned to core 3
        core.send_virq_hw(2, 32, 42).unwrap();

        assert_eq!(
            chip.take_ops(),
            vec![ChipOp::SendSgi {
                sgi: RESCHED_SGI,
                mask: 1 << 3
            }]
        );
        assert_eq!(sched.take_ops(), vec![]);
    }

    #[test]
    fn test_local_injection_wakes_scheduler() {
        let (core, chip, sched, _vms) = test_core();

        // vm 1 vcpu 0 is pinned to core 0, where the sender runs
        core.send_virq(1, 40).unwrap();

        assert_eq!(chip.take_ops(), vec![]);
        assert_eq!(
            sched.take_ops(),
            vec![SchedOp::Wake { vmid: 1, vcpu_id: 0 }]
        );
    }

    #[test]
    fn test_injection_into_running_vcpu_needs_no_kick() {
        let (core, chip, sched, vms) = test_core();

        let vcpu = vms.get_vcpu(1, 0).unwrap();
        sched.set_current(Some(vcpu.clone()));
        core.send_virq(1, 40).unwrap();

        assert_eq!(chip.take_ops(), vec![]);
        assert_eq!(sched.take_ops(), vec![]);
        assert_eq!(vcpu.irq_state.pending_count(), 1);
    }

    #[test]
    fn test_send_virq_hw_checks_owner() {
        let (core, _chip, _sched, _vms) = test_core();
        register_uart(&core, 1, 0);

        assert!(core.send_virq_hw(2, 32, 42).is_err());
        assert_eq!(core.send_virq_hw(1, 32, 99), Err(Error::NotFound));
    }

    #[test]
    fn test_vsgi_fans_out_over_mask() {
        let (core, _chip, sched, vms) = test_core();

        let sender = vms.get_vcpu(1, 0).unwrap();
        // bit 2 is beyond the VM's two vcpus and must be ignored
        core.send_vsgi(&sender, 5, 0b101).unwrap();

        assert_eq!(vms.get_vcpu(1, 0).unwrap().irq_state.pending_count(), 1);
        assert_eq!(vms.get_vcpu(1, 1).unwrap().irq_state.pending_count(), 0);
        // vcpu 0 is local to the sending core and idle, so it went
        // through the scheduler
        assert_eq!(
            sched.take_ops(),
            vec![SchedOp::Wake { vmid: 1, vcpu_id: 0 }]
        );
    }

    #[test]
    fn test_virq_enable_translates_or_ignores() {
        let (core, chip, _sched, _vms) = test_core();
        register_uart(&core, 1, 0);

        core.virq_enable(32, true);
        assert_eq!(chip.take_ops(), vec![ChipOp::Unmask(42)]);

        // software-only virq: nothing to program
        core.virq_enable(200, true);
        assert_eq!(chip.take_ops(), vec![]);
    }

    #[test]
    fn test_bad_irq_is_logged() {
        testing_logger::setup();
        let (core, chip, _sched, _vms) = test_core();

        // nothing pending: the chip reports the spurious id
        assert!(core.handle_irq().is_err());
        assert!(chip.take_ops().contains(&ChipOp::Dir(1023)));

        testing_logger::validate(|captured| {
            assert!(captured
                .iter()
                .any(|record| record.level == log::Level::Error
                    && record.body.contains("deactivating")));
        });
    }

    #[test]
    fn test_sgi_bounds() {
        let (core, chip, _sched, _vms) = test_core();

        core.send_sgi(RESCHED_SGI, CoreId::from(9));
        core.send_sgi(16, CoreId::from(1));
        assert_eq!(chip.take_ops(), vec![]);

        core.send_sgi(RESCHED_SGI, CoreId::from(1));
        assert_eq!(
            chip.take_ops(),
            vec![ChipOp::SendSgi {
                sgi: RESCHED_SGI,
                mask: 0b10
            }]
        );
    }
}
