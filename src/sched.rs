//! Interface to the external per-core scheduler.
//!
//! The scheduler owns the run queues and the world switch; this crate only
//! tells it when a vCPU acquired work (`sched_vcpu`) or politely gives up
//! the processor (`yield_now`, used by the vmbox IPC doorbell). The
//! platform hands its scheduler to `boot::init`, which injects it into the
//! subsystems that signal.

use crate::vcpu::Vcpu;
use alloc::sync::Arc;

/// Why a vCPU is being woken
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedReason {
    /// A virtual interrupt became pending for the vCPU
    IrqPending,
}

pub trait Scheduler: Send + Sync {
    /// The vCPU the calling core is currently running, if any
    fn current_vcpu(&self) -> Option<Arc<Vcpu>>;

    /// Ask the scheduler to reevaluate because `vcpu` has pending work.
    /// Only called for vCPUs pinned to the calling core.
    fn sched_vcpu(&self, vcpu: &Arc<Vcpu>, reason: SchedReason);

    /// Cooperatively yield the calling core
    fn yield_now(&self);
}
