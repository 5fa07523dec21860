//! Boot-time composition of the subsystems.
//!
//! The platform layer parses nothing itself: it hands over the declaration
//! document, the vmbox device tree, the chip driver and the scheduler, and
//! this module builds the machine partitioning in dependency order. Per
//! the error-handling policy, a misdeclared system does not come up: every
//! failure in here is fatal.

use crate::config;
use crate::interrupt::domain::{LocalDomain, SpiDomain};
use crate::interrupt::{self, IrqChip, IrqCore, IrqDomainKind};
use crate::memory::GuestAddressSpace;
use crate::percore::{self, CoreId};
use crate::sched::Scheduler;
use crate::vm::{self, VirtualMachineSetBuilder};
use crate::vmbox::{self, VmboxSet};
use alloc::sync::Arc;

/// Everything the platform layer supplies to bring the hypervisor up
pub struct BootInfo<'a> {
    /// The JSON declaration document (VMs, memory regions, interrupts)
    pub config: &'a [u8],
    /// Device tree carrying the vmbox declarations, if any
    pub vmbox_dtb: Option<&'a [u8]>,
    /// First SPI number and how many the chip exposes
    pub spi_range: (u32, u32),
    /// Number of core-private interrupts (SGIs + PPIs)
    pub local_count: u32,
    /// Number of physical cores
    pub nr_cores: usize,
}

/// Bring every subsystem up on the bootstrap core.
///
/// Must be called exactly once, before any secondary core is released and
/// before the first guest entry. Panics on misconfiguration.
pub unsafe fn init(
    info: &BootInfo,
    core_id_reader: fn() -> CoreId,
    chip: Arc<dyn IrqChip>,
    sched: Arc<dyn Scheduler>,
    mm_factory: &mut dyn FnMut(&config::VmEntry) -> Arc<dyn GuestAddressSpace>,
) {
    percore::init_cores(info.nr_cores, core_id_reader);

    let cfg = config::parse(info.config)
        .expect("failed to parse the VM declaration document");
    if cfg.vms.is_empty() {
        panic!("no VM is declared");
    }

    let vms = Arc::new(
        VirtualMachineSetBuilder::from_config(&cfg, info.nr_cores, mm_factory)
            .expect("failed to build the declared VMs")
            .finalize(),
    );
    vm::init_virtual_machines(vms.clone());

    let irq = IrqCore::new(chip, sched.clone(), vms.clone(), info.nr_cores)
        .expect("interrupt controller init failed");
    irq.add_domain(
        IrqDomainKind::Local,
        Arc::new(
            LocalDomain::new(0, info.local_count, info.nr_cores)
                .expect("invalid local irq range"),
        ),
    )
    .expect("local irq domain already registered");
    irq.add_domain(
        IrqDomainKind::Spi,
        Arc::new(
            SpiDomain::new(info.spi_range.0, info.spi_range.1)
                .expect("invalid spi irq range"),
        ),
    )
    .expect("spi irq domain already registered");

    irq.register_irq_entries(&cfg.irqs)
        .expect("failed to register a declared interrupt");
    irq.setup_irqs();
    interrupt::init_irq_core(irq.clone());

    let vmboxes = VmboxSet::new(irq, sched, vms.clone());
    if let Some(dtb) = info.vmbox_dtb {
        let count = vmboxes
            .parse_dtb(dtb)
            .expect("failed to parse the vmbox declarations");
        info!("created {} vmbox pairings", count);
    }
    for machine in vms.machines() {
        vmboxes
            .setup_vm(machine)
            .expect("failed to create a vmbox controller");
    }
    vmbox::init_vmboxes(vmboxes);
}

/// Per-core init on every secondary core, after `init` has finished
pub unsafe fn secondary_init() {
    interrupt::irq_core()
        .secondary_init()
        .expect("secondary interrupt controller init failed");
}
