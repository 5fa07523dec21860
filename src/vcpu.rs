use crate::interrupt::virq::VcpuIrqState;
use crate::percore::CoreId;
use crate::vm::VirtualMachine;
use alloc::sync::{Arc, Weak};
use num_enum::TryFromPrimitive;
use spin::Mutex;

/// Run state of a virtual CPU
#[derive(TryFromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum VcpuState {
    /// Waiting to be started by a guest power-on call
    Stop = 0,
    /// Runnable
    Ready = 1,
    /// Currently executing on its physical core
    Running = 2,
}

/// A virtual CPU.
///
/// Each `Vcpu` is created once at boot, pinned to a physical core for its
/// whole lifetime and owned by exactly one [`VirtualMachine`]. The
/// embedded [`VcpuIrqState`] carries every virtual interrupt in flight for
/// this vCPU.
pub struct Vcpu {
    /// VM-local identifier (vCPU 0 is the boot vCPU)
    pub vcpu_id: u32,
    vm: Weak<VirtualMachine>,
    /// The physical core this vCPU is pinned to
    pub pcpu: CoreId,
    /// Guest-physical address the vCPU starts executing at
    pub entry_point: u64,
    state: Mutex<VcpuState>,
    /// Virtual interrupt table
    pub irq_state: VcpuIrqState,
}

impl Vcpu {
    pub(crate) fn new(
        vcpu_id: u32,
        vm: Weak<VirtualMachine>,
        pcpu: CoreId,
        entry_point: u64,
    ) -> Self {
        Vcpu {
            vcpu_id,
            vm,
            pcpu,
            entry_point,
            state: Mutex::new(VcpuState::Stop),
            irq_state: VcpuIrqState::new(),
        }
    }

    /// The owning VM. `None` can only be observed while the VM itself is
    /// being torn down, which never happens after boot.
    pub fn vm(&self) -> Option<Arc<VirtualMachine>> {
        self.vm.upgrade()
    }

    pub fn state(&self) -> VcpuState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: VcpuState) {
        *self.state.lock() = state;
    }

    /// Whether this is the vCPU that boots the VM
    pub fn is_boot_vcpu(&self) -> bool {
        self.vcpu_id == 0
    }

    /// Fast query used by the scheduler before entering the guest
    pub fn has_irq_pending(&self) -> bool {
        self.irq_state.has_pending()
    }
}

/// The placement policy: turn a declared affinity hint into a concrete
/// physical core.
///
/// A valid hint wins unconditionally; without one the least loaded core is
/// chosen. `occupancy` counts vCPUs already placed per core and is updated
/// on success. `None` means placement is impossible, which is fatal for
/// the boot sequence.
pub fn pcpu_affinity(
    occupancy: &mut [u32],
    hint: Option<u32>,
) -> Option<CoreId> {
    if occupancy.is_empty() {
        return None;
    }

    if let Some(hint) = hint {
        if (hint as usize) < occupancy.len() {
            occupancy[hint as usize] += 1;
            return Some(CoreId::from(hint));
        }
        warn!("affinity hint {} names a core that does not exist", hint);
    }

    let (core, _) = occupancy
        .iter()
        .enumerate()
        .min_by_key(|(_, count)| **count)?;
    occupancy[core] += 1;
    Some(CoreId::from(core as u32))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_placement_honors_hint() {
        let mut occupancy = [3, 0, 0, 0];
        assert_eq!(
            pcpu_affinity(&mut occupancy, Some(0)),
            Some(CoreId::from(0))
        );
        assert_eq!(occupancy[0], 4);
    }

    #[test]
    fn test_placement_falls_back_to_least_loaded() {
        let mut occupancy = [2, 1, 3, 1];
        assert_eq!(
            pcpu_affinity(&mut occupancy, None),
            Some(CoreId::from(1))
        );
        assert_eq!(
            pcpu_affinity(&mut occupancy, Some(17)),
            Some(CoreId::from(3))
        );
        assert_eq!(occupancy, [2, 2, 3, 2]);
    }

    #[test]
    fn test_placement_fails_without_cores() {
        assert_eq!(pcpu_affinity(&mut [], Some(0)), None);
    }
}
