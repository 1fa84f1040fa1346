// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-task state and its store.
//!
//! A task's state is only written from that task's own scheduling
//! transitions, but the transitions can run on any core, so every field is
//! atomic. The store is a fixed open-addressing table: creation claims a slot
//! with a compare-and-swap, exit leaves a tombstone that later creations
//! reuse. Nothing here allocates after construction.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::cpumask::CpuMask;
use crate::hints::WorkloadClass;
use crate::patterns::Comm;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Effective gaming flag, gated by gaming mode.
        const GAMING = 1 << 0;
        const INTERACTIVE = 1 << 1;
        const PROTON = 1 << 2;
        const GPU_FEEDER = 1 << 3;
        const WANTS_LOW_LAT = 1 << 4;
        /// Classification result, independent of gaming mode.
        const CLASS_GAMING = 1 << 5;
        const CLASSIFIED = 1 << 6;
    }
}

/// What the host passes for a task on every hook.
#[derive(Clone, Copy, Debug)]
pub struct Task {
    /// Thread id.
    pub pid: u32,
    /// Process-group (thread group) id.
    pub tgid: u32,
    pub comm: Comm,
    /// Default-hierarchy cgroup id.
    pub cgroup_id: u64,
    /// Core the task is currently attached to.
    pub cpu: usize,
    pub cpus_allowed: CpuMask,
}

impl Task {
    pub fn new(pid: u32, tgid: u32, comm: &str, cpus_allowed: CpuMask) -> Self {
        Self {
            pid,
            tgid,
            comm: Comm::new(comm),
            cgroup_id: 0,
            cpu: 0,
            cpus_allowed,
        }
    }

    pub fn with_cgroup(mut self, cgroup_id: u64) -> Self {
        self.cgroup_id = cgroup_id;
        self
    }

    pub fn on_cpu(mut self, cpu: usize) -> Self {
        self.cpu = cpu;
        self
    }
}

pub const NO_DOMAIN: u32 = u32::MAX;

#[derive(Debug)]
pub struct TaskCtx {
    pub burst_ns: AtomicU64,
    pub last_run_at: AtomicU64,
    pub enqueue_at: AtomicU64,
    pub classified_at: AtomicU64,
    pub preferred_domain: AtomicU32,
    pub last_domain: AtomicU32,
    workload: AtomicU32,
    flags: AtomicU32,
}

impl Default for TaskCtx {
    fn default() -> Self {
        Self {
            burst_ns: AtomicU64::new(0),
            last_run_at: AtomicU64::new(0),
            enqueue_at: AtomicU64::new(0),
            classified_at: AtomicU64::new(0),
            preferred_domain: AtomicU32::new(NO_DOMAIN),
            last_domain: AtomicU32::new(NO_DOMAIN),
            workload: AtomicU32::new(WorkloadClass::Unknown as u32),
            flags: AtomicU32::new(0),
        }
    }
}

impl TaskCtx {
    fn reset(&self) {
        self.burst_ns.store(0, Ordering::Relaxed);
        self.last_run_at.store(0, Ordering::Relaxed);
        self.enqueue_at.store(0, Ordering::Relaxed);
        self.classified_at.store(0, Ordering::Relaxed);
        self.preferred_domain.store(NO_DOMAIN, Ordering::Relaxed);
        self.last_domain.store(NO_DOMAIN, Ordering::Relaxed);
        self.workload.store(WorkloadClass::Unknown as u32, Ordering::Relaxed);
        self.flags.store(0, Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has(&self, flag: TaskFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline]
    pub fn set_flags(&self, flags: TaskFlags, on: bool) {
        if on {
            self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
    }

    #[inline]
    pub fn is_gaming(&self) -> bool {
        self.has(TaskFlags::GAMING)
    }

    #[inline]
    pub fn is_interactive(&self) -> bool {
        self.has(TaskFlags::INTERACTIVE)
    }

    #[inline]
    pub fn wants_low_latency(&self) -> bool {
        self.has(TaskFlags::WANTS_LOW_LAT)
    }

    pub fn workload(&self) -> WorkloadClass {
        WorkloadClass::from_raw(self.workload.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_workload(&self, class: WorkloadClass) {
        self.workload.store(class as u32, Ordering::Release);
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let domain = |v: u32| (v != NO_DOMAIN).then_some(v as usize);
        TaskSnapshot {
            burst_ns: self.burst_ns.load(Ordering::Relaxed),
            last_run_at: self.last_run_at.load(Ordering::Relaxed),
            enqueue_at: self.enqueue_at.load(Ordering::Relaxed),
            classified_at: self.classified_at.load(Ordering::Relaxed),
            preferred_domain: domain(self.preferred_domain.load(Ordering::Relaxed)),
            last_domain: domain(self.last_domain.load(Ordering::Relaxed)),
            workload: self.workload(),
            flags: self.flags(),
        }
    }
}

/// Plain copy of a task's state for observers and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub burst_ns: u64,
    pub last_run_at: u64,
    pub enqueue_at: u64,
    pub classified_at: u64,
    pub preferred_domain: Option<usize>,
    pub last_domain: Option<usize>,
    pub workload: WorkloadClass,
    pub flags: TaskFlags,
}

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = u64::MAX;
const MAX_PROBE: usize = 64;
/// Largest task table, matching the kernel's pid_max limit.
pub const MAX_TASK_CAPACITY: usize = 1 << 22;

struct Slot {
    /// `pid + 1`, or EMPTY / TOMBSTONE.
    key: AtomicU64,
    ctx: TaskCtx,
}

pub struct TaskStore {
    slots: Box<[Slot]>,
    mask: usize,
    live: AtomicUsize,
}

impl TaskStore {
    /// `capacity` is rounded up to a power of two and capped at
    /// `MAX_TASK_CAPACITY`.
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.clamp(MAX_PROBE, MAX_TASK_CAPACITY).next_power_of_two();
        let slots = (0..cap)
            .map(|_| Slot {
                key: AtomicU64::new(EMPTY),
                ctx: TaskCtx::default(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: cap - 1,
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn home(&self, pid: u32) -> usize {
        ((pid as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & self.mask
    }

    #[inline]
    fn probe(&self, pid: u32) -> impl Iterator<Item = &Slot> {
        let home = self.home(pid);
        (0..MAX_PROBE).map(move |i| &self.slots[(home + i) & self.mask])
    }

    pub fn get(&self, pid: u32) -> Option<&TaskCtx> {
        let key = pid as u64 + 1;
        for slot in self.probe(pid) {
            match slot.key.load(Ordering::Acquire) {
                k if k == key => return Some(&slot.ctx),
                EMPTY => return None,
                _ => {}
            }
        }
        None
    }

    /// Returns the task's state, creating it on first use. `None` when the
    /// probe window is full, in which case callers use defaults.
    ///
    /// Creation for one pid is serialised by the host: a task is only ever
    /// in one scheduling transition at a time.
    pub fn get_or_create(&self, pid: u32) -> Option<&TaskCtx> {
        let key = pid as u64 + 1;
        let mut free = None;
        for (i, slot) in self.probe(pid).enumerate() {
            match slot.key.load(Ordering::Acquire) {
                k if k == key => return Some(&slot.ctx),
                EMPTY => {
                    free.get_or_insert(i);
                    break;
                }
                TOMBSTONE => {
                    free.get_or_insert(i);
                }
                _ => {}
            }
        }

        let home = self.home(pid);
        let start = free?;
        for i in start..MAX_PROBE {
            let slot = &self.slots[(home + i) & self.mask];
            let cur = slot.key.load(Ordering::Acquire);
            if cur != EMPTY && cur != TOMBSTONE {
                continue;
            }
            if slot
                .key
                .compare_exchange(cur, key, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.ctx.reset();
                self.live.fetch_add(1, Ordering::Relaxed);
                return Some(&slot.ctx);
            }
        }
        None
    }

    /// Reclaims the task's slot. Returns whether it existed.
    pub fn remove(&self, pid: u32) -> bool {
        let key = pid as u64 + 1;
        for slot in self.probe(pid) {
            match slot.key.load(Ordering::Acquire) {
                k if k == key => {
                    if slot
                        .key
                        .compare_exchange(key, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.live.fetch_sub(1, Ordering::Relaxed);
                        return true;
                    }
                    return false;
                }
                EMPTY => return false,
                _ => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_on_demand() {
        let store = TaskStore::with_capacity(128);
        assert!(store.get(42).is_none());
        let ctx = store.get_or_create(42).unwrap();
        ctx.burst_ns.store(7, Ordering::Relaxed);
        assert_eq!(store.get(42).unwrap().burst_ns.load(Ordering::Relaxed), 7);
        assert_eq!(store.len(), 1);

        // pid 0 is a valid key
        assert!(store.get_or_create(0).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(TaskStore::with_capacity(100).capacity(), 128);
        assert_eq!(TaskStore::with_capacity(1).capacity(), MAX_PROBE);
        // the cap itself is a power of two, so clamping never overflows
        assert!(MAX_TASK_CAPACITY.is_power_of_two());
    }

    #[test]
    fn exit_reclaims_and_reuse_starts_clean() {
        let store = TaskStore::with_capacity(64);
        let ctx = store.get_or_create(9).unwrap();
        ctx.set_flags(TaskFlags::GAMING | TaskFlags::CLASSIFIED, true);
        ctx.set_workload(WorkloadClass::Gaming);
        assert!(store.remove(9));
        assert!(!store.remove(9));
        assert!(store.get(9).is_none());
        assert!(store.is_empty());

        let ctx = store.get_or_create(9).unwrap();
        assert_eq!(ctx.flags(), TaskFlags::empty());
        assert_eq!(ctx.workload(), WorkloadClass::Unknown);
        assert_eq!(ctx.snapshot().preferred_domain, None);
    }

    #[test]
    fn fills_up_without_panicking() {
        let store = TaskStore::with_capacity(64);
        let created = (0..1000u32).filter(|pid| store.get_or_create(*pid).is_some()).count();
        assert_eq!(created, 64);
        assert_eq!(store.len(), 64);
        assert!(store.get_or_create(5000).is_none());
        // existing entries are still found
        assert!(store.get_or_create(0).is_some());
    }

    #[test]
    fn lookups_survive_tombstones() {
        let store = TaskStore::with_capacity(64);
        for pid in 0..40 {
            store.get_or_create(pid).unwrap();
        }
        for pid in (0..40).step_by(2) {
            store.remove(pid);
        }
        for pid in (1..40).step_by(2) {
            assert!(store.get(pid).is_some(), "{}", pid);
        }
        assert_eq!(store.len(), 20);
    }

    #[test]
    fn flag_updates() {
        let ctx = TaskCtx::default();
        ctx.set_flags(TaskFlags::INTERACTIVE | TaskFlags::WANTS_LOW_LAT, true);
        assert!(ctx.is_interactive());
        assert!(ctx.wants_low_latency());
        ctx.set_flags(TaskFlags::INTERACTIVE, false);
        assert!(!ctx.is_interactive());
        assert!(ctx.wants_low_latency());
    }
}
