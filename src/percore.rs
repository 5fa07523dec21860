#![deny(missing_docs)]

//! # Per-core data support
//!
//! The hypervisor runs one scheduling context per physical core. This
//! module defines the core identifier, the boot-installed accessor for the
//! current core, and [`PerCore`], a container holding one independent value
//! per core.
//!
//! The current-core accessor is supplied by the platform layer at boot
//! (on AArch64 it typically derives the index from `MPIDR_EL1`); nothing in
//! this crate may call [`read_core_id`] before [`init_cores`] has run.

use crate::lock::ro_after_init::RoAfterInit;
use alloc::vec::Vec;
use core::fmt;

static CORE_COUNT: RoAfterInit<usize> = RoAfterInit::uninitialized();
static CORE_ID_READER: RoAfterInit<fn() -> CoreId> = RoAfterInit::uninitialized();

/// Sequential index of a physical core
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CoreId {
    /// The raw index
    pub raw: u32,
}

impl CoreId {
    /// Whether this core is the bootstrap core
    pub fn is_bsp(self) -> bool {
        self.raw == 0
    }
}

impl From<u32> for CoreId {
    fn from(value: u32) -> Self {
        CoreId { raw: value }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Install the core count and the current-core accessor.
///
/// Must be called by the bootstrap core before any other module is
/// initialized.
pub unsafe fn init_cores(count: usize, reader: fn() -> CoreId) {
    RoAfterInit::init(&CORE_COUNT, count);
    RoAfterInit::init(&CORE_ID_READER, reader);
}

/// The number of physical cores in the system
pub fn nr_cores() -> usize {
    *CORE_COUNT
}

/// Get the current core's sequential index
pub fn read_core_id() -> CoreId {
    (*CORE_ID_READER)()
}

/// One independent value per physical core.
///
/// `current` selects the slot of the calling core and is only meaningful
/// while preemption is off (the hypervisor never migrates between cores
/// mid-operation). Cross-core access through `get` is reserved for
/// single-threaded bootstrap.
pub struct PerCore<T> {
    slots: Vec<T>,
}

impl<T> PerCore<T> {
    /// Build one slot per core using the given constructor
    pub fn new_with(count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let mut slots = Vec::with_capacity(count);
        for core in 0..count {
            slots.push(init(core));
        }
        PerCore { slots }
    }

    /// The slot belonging to the calling core
    pub fn current(&self) -> &T {
        &self.slots[read_core_id().raw as usize]
    }

    /// The slot belonging to an arbitrary core
    pub fn get(&self, core: CoreId) -> Option<&T> {
        self.slots.get(core.raw as usize)
    }

    /// The number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
pub mod testing {
    //! Host-test stand-in for the platform's current-core accessor: the
    //! "current core" is a thread-local the test sets explicitly.

    use super::*;
    use core::cell::Cell;
    use std::sync::Once;

    std::thread_local! {
        static CURRENT_CORE: Cell<u32> = Cell::new(0);
    }

    static INSTALL: Once = Once::new();

    /// The reader `install` registers; tests that drive `boot::init`
    /// directly pass this same function so the registration stays stable
    pub fn read_thread_core_id() -> CoreId {
        CoreId::from(CURRENT_CORE.with(|c| c.get()))
    }

    /// Install the thread-local reader (idempotent, any test may call it)
    pub fn install(nr_cores: usize) {
        INSTALL.call_once(|| unsafe {
            init_cores(nr_cores, read_thread_core_id);
        });
    }

    /// Make the calling test thread run "on" the given core
    pub fn set_core_id(raw: u32) {
        CURRENT_CORE.with(|c| c.set(raw));
    }
}
