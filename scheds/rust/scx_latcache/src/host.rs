// SPDX-License-Identifier: GPL-2.0

//! What the policy needs from the scheduler core it is plugged into.

use bitflags::bitflags;

use crate::cpumask::CpuMask;
use crate::patterns::Comm;
use crate::task::Task;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct KickFlags: u32 {
        /// Wake an idle core.
        const IDLE = 1 << 0;
        /// Expire the running task's slice so the core reschedules.
        const PREEMPT = 1 << 1;
    }
}

/// Identity of another process, as returned by a parent lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskIdent {
    pub pid: u32,
    pub comm: Comm,
}

/// Platform operations. Every method must be non-blocking and bounded; they
/// are called from inside scheduling hooks on any core.
pub trait SchedHost: Send + Sync {
    /// Monotonic nanoseconds.
    fn now_ns(&self) -> u64;

    /// Cores that are idle right now.
    fn idle_mask(&self) -> CpuMask;

    /// Cores whose whole physical core (every SMT sibling) is idle.
    fn idle_smt_mask(&self) -> CpuMask;

    /// Atomically claim an idle core. At most one caller wins per idle
    /// period of the core.
    fn test_and_clear_cpu_idle(&self, cpu: usize) -> bool;

    /// Built-in idle selection. Returns the chosen core and whether it was
    /// idle (and claimed).
    fn select_cpu_dfl(&self, task: &Task, prev_cpu: usize, wake_flags: u64) -> (usize, bool);

    /// Place the task straight on a core's local run queue.
    fn insert_local(&self, task: &Task, cpu: usize, slice_ns: u64);

    fn kick_cpu(&self, cpu: usize, flags: KickFlags);

    /// Current performance level of the core, 0..=1024.
    fn cpuperf_cur(&self, cpu: usize) -> u32;

    /// Parent process of `pid`, if it is still known.
    fn parent_of(&self, pid: u32) -> Option<TaskIdent>;
}
