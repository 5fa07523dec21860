//! Per-vCPU virtual interrupt state.
//!
//! Every vCPU carries a fixed pool of [`Virq`] slots. A slot is claimed
//! when somebody injects an interrupt, walks OFFLINE → PENDING when the
//! interrupt is loaded into a list register on guest entry, and is
//! reclaimed once the guest has EOIed it (observed as INACTIVE on guest
//! exit).

use crate::error::{Error, Result};
use crate::interrupt::IrqChip;
use arraydeque::ArrayDeque;
use num_enum::TryFromPrimitive;
use spin::Mutex;

/// Upper bound of simultaneously in-flight virqs per vCPU, matching the
/// number of list registers the chip can expose.
pub const MAX_ACTIVE_IRQS: usize = 16;

/// Lifecycle state of a virq slot
#[derive(TryFromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum VirqState {
    /// The slot is free (or the guest finished handling the interrupt)
    Inactive = 0,
    /// Queued on the pending list, not yet visible to the guest
    Offline = 1,
    /// Loaded into a list register, visible to the guest
    Pending = 2,
    /// The guest acknowledged the interrupt and is handling it
    Active = 3,
}

/// A single virtual interrupt slot
#[derive(Copy, Clone, Debug)]
pub struct Virq {
    /// Backing hardware interrupt number, 0 for pure software virqs
    pub h_intno: u32,
    /// The interrupt number the guest sees
    pub v_intno: u32,
    /// Whether the slot is backed by a physical interrupt (list register
    /// `HW` bit)
    pub hw: bool,
    /// Slot index, fixed for the lifetime of the vCPU
    pub id: usize,
    /// Current lifecycle state
    pub state: VirqState,
}

impl Virq {
    fn empty(id: usize) -> Self {
        Virq {
            h_intno: 0,
            v_intno: 0,
            hw: false,
            id,
            state: VirqState::Inactive,
        }
    }
}

struct VirqTable {
    slots: [Virq; MAX_ACTIVE_IRQS],
    /// Bit `i` set iff slot `i` is claimed
    bitmap: u32,
    /// Slot ids awaiting injection, in arrival order
    pending: ArrayDeque<[usize; MAX_ACTIVE_IRQS]>,
    /// Number of OFFLINE slots (length of `pending`)
    irq_pending: u32,
    /// Number of claimed slots not yet reclaimed
    count: i32,
}

/// The virtual interrupt table embedded in each vCPU
pub struct VcpuIrqState {
    inner: Mutex<VirqTable>,
}

impl VcpuIrqState {
    pub fn new() -> Self {
        let mut slots = [Virq::empty(0); MAX_ACTIVE_IRQS];
        for (id, slot) in slots.iter_mut().enumerate() {
            slot.id = id;
        }
        VcpuIrqState {
            inner: Mutex::new(VirqTable {
                slots,
                bitmap: 0,
                pending: ArrayDeque::new(),
                irq_pending: 0,
                count: 0,
            }),
        }
    }

    /// Claim a slot for a new virtual interrupt and queue it for injection.
    ///
    /// Fails with `TryAgain` when the table is full, or when `hw` is set
    /// and the vCPU already has a slot for the same physical interrupt
    /// (two list registers with the same pINTID are UNPREDICTABLE per the
    /// GIC architecture). The injection is simply dropped in both cases;
    /// the caller may retry later.
    pub fn queue(&self, v_intno: u32, h_intno: u32, hw: bool) -> Result<()> {
        let mut table = self.inner.lock();

        if hw {
            for id in 0..MAX_ACTIVE_IRQS {
                if table.bitmap & (1 << id) != 0
                    && table.slots[id].h_intno == h_intno
                {
                    error!(
                        "vcpu already has pINTID {} in pending/active state",
                        h_intno
                    );
                    return Err(Error::TryAgain);
                }
            }
        }

        let id = match (0..MAX_ACTIVE_IRQS)
            .find(|id| table.bitmap & (1 << id) == 0)
        {
            Some(id) => id,
            None => {
                error!("no free virq slot, dropping virq {}", v_intno);
                return Err(Error::TryAgain);
            }
        };

        let slot = &mut table.slots[id];
        slot.h_intno = h_intno;
        slot.v_intno = v_intno;
        slot.hw = hw;
        slot.state = VirqState::Offline;
        table.bitmap |= 1 << id;
        table
            .pending
            .push_back(id)
            .expect("pending queue smaller than slot table");
        table.irq_pending += 1;
        table.count += 1;

        Ok(())
    }

    /// Guest-entry hook: hand every queued virq to the chip, in arrival
    /// order, so the list registers reflect the injection order.
    pub fn flush_pending(&self, chip: &dyn IrqChip) {
        let mut table = self.inner.lock();

        while let Some(id) = table.pending.pop_front() {
            if table.slots[id].state != VirqState::Offline {
                debug!(
                    "virq slot {} queued in unexpected state {:?}",
                    id, table.slots[id].state
                );
            }
            table.slots[id].state = VirqState::Pending;
            let snapshot = table.slots[id];
            chip.send_virq(&snapshot);
            table.irq_pending -= 1;
        }
    }

    /// Guest-exit hook: reclaim every slot whose list register went back
    /// to INACTIVE, meaning the guest EOIed the interrupt.
    pub fn retire_inactive(&self, chip: &dyn IrqChip) {
        let mut table = self.inner.lock();

        for id in 0..MAX_ACTIVE_IRQS {
            if table.bitmap & (1 << id) == 0 {
                continue;
            }
            // Not yet injected; nothing for the chip to report
            if table.slots[id].state == VirqState::Offline {
                continue;
            }

            let snapshot = table.slots[id];
            if chip.get_virq_state(&snapshot) != VirqState::Inactive {
                continue;
            }

            table.count -= 1;
            if table.count < 0 {
                error!("virq accounting underflow on slot {}", id);
                break;
            }
            let slot = &mut table.slots[id];
            slot.h_intno = 0;
            slot.v_intno = 0;
            slot.hw = false;
            slot.state = VirqState::Inactive;
            table.bitmap &= !(1 << id);
        }
    }

    /// Whether any virq is queued but not yet visible to the guest
    pub fn has_pending(&self) -> bool {
        self.inner.lock().irq_pending != 0
    }

    /// Number of virqs queued but not yet visible to the guest
    pub fn pending_count(&self) -> u32 {
        self.inner.lock().irq_pending
    }

    /// Number of claimed slots not yet reclaimed
    pub fn in_flight(&self) -> i32 {
        self.inner.lock().count
    }

    #[cfg(test)]
    pub(crate) fn slots(&self) -> alloc::vec::Vec<Virq> {
        self.inner.lock().slots.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn bitmap(&self) -> u32 {
        self.inner.lock().bitmap
    }
}
