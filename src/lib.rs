#![cfg_attr(not(test), no_std)]

//! Core of a type-1 hypervisor for ARM-class machines.
//!
//! The crate partitions a physical machine into statically declared guest
//! virtual machines, routes physical interrupts to the owning vCPU and
//! provides the vmbox shared-memory transport for inter-VM communication.
//! The platform layer supplies the interrupt controller driver
//! ([`interrupt::IrqChip`]), the stage-2 mapping routines
//! ([`memory::GuestAddressSpace`]) and the scheduler
//! ([`sched::Scheduler`]); everything behind those traits is out of scope
//! here.

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate log;

pub mod boot;
/// Static VM declaration format
pub mod config;
pub mod error;
pub mod interrupt;
pub mod lock;
pub mod memory;
pub mod percore;
pub mod sched;
pub mod vcpu;
pub mod virtdev;
/// Top level virtual machine definition
pub mod vm;
pub mod vmbox;
