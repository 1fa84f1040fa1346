// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared counters and per-domain / per-core runtime state.
//!
//! Everything is updated from every core with plain atomics. Readers get a
//! best-effort view; no reader ever synchronises with a writer.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::topology::Topology;

/// Raise `slot` to `val` if larger.
#[inline]
pub fn atomic_max(slot: &AtomicU64, val: u64) {
    let mut cur = slot.load(Ordering::Relaxed);
    while val > cur {
        match slot.compare_exchange_weak(cur, val, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

/// Lower `slot` to `val` if smaller. Zero in `slot` means unset and is
/// always replaced; a zero `val` is ignored.
#[inline]
pub fn atomic_min_nonzero(slot: &AtomicU64, val: u64) {
    if val == 0 {
        return;
    }
    let mut cur = slot.load(Ordering::Relaxed);
    while cur == 0 || val < cur {
        match slot.compare_exchange_weak(cur, val, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

/// Decrement unless already zero.
#[inline]
pub fn atomic_dec_clamped(slot: &AtomicU64) {
    let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

macro_rules! counter_registry {
    ($($name:ident: $desc:literal,)*) => {
        /// Engine-wide monotonically increasing counters, plus the latency
        /// max/min gauges.
        #[derive(Default)]
        pub struct Counters {
            $(#[doc = $desc] pub $name: AtomicU64,)*
        }

        impl Counters {
            /// `(name, value)` for every counter in declaration order.
            pub fn read_all(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name.load(Ordering::Relaxed)),)*]
            }
        }
    };
}

counter_registry! {
    enqueued: "tasks enqueued",
    dispatched: "tasks moved from a dispatch queue to a core",
    direct_dispatched: "tasks placed straight on a core at wake-up",
    gaming_enqueued: "gaming task enqueues",
    interactive_enqueued: "interactive task enqueues",
    proton_tasks: "tasks classified as running under Wine/Proton",
    gpu_feeder_tasks: "GPU submission threads seen by the classifier",
    hint_detects: "gaming classifications from the process hint table",
    parent_chain_detects: "gaming classifications from an ancestor name",
    cgroup_classifications: "cgroup hint lookups that returned a class",
    cgroup_gaming: "cgroup hint lookups that returned gaming",
    vm_vcpu_tasks: "VM vCPU hint hits",
    gaming_vm_vcpus: "VM vCPU hints marked gaming",
    dev_vm_vcpus: "VM vCPU hints marked development",
    container_tasks: "container hint hits",
    ai_container_tasks: "container hints marked AI",
    low_latency_migrations: "moves into the low-latency domain",
    domain_local: "placements in the previous core's domain",
    domain_cross: "placements in another domain",
    smt_idle_picks: "claims of a fully idle physical core",
    prefcore_placements: "claims of a core with a boost ranking",
    compaction_overflows: "tasks steered out of a gaming-loaded low-latency domain",
    preempt_kicks: "preemption kicks sent for gaming tasks",
    pcore_placements: "performance-core placements",
    ecore_offloads: "efficiency-core offloads",
    freq_domain_placements: "placements in the high-frequency domain",
    imbalance_events: "domain imbalance reports",
    latency_sum_ns: "sum of wake-to-run latency",
    latency_count: "latency samples",
    latency_max_ns: "largest wake-to-run latency",
    latency_min_ns: "smallest wake-to-run latency (0 = unset)",
    gaming_latency_sum_ns: "sum of gaming task latency",
    gaming_latency_count: "gaming latency samples",
    gaming_latency_sum_sq_us: "sum of squared gaming latency in us",
    gaming_late_frames: "gaming wake-ups that waited over 1ms",
    gaming_preempted: "gaming tasks descheduled while still runnable",
}

impl Counters {
    #[inline]
    pub fn inc(slot: &AtomicU64) {
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(slot: &AtomicU64) -> u64 {
        slot.load(Ordering::Relaxed)
    }
}

/// Running-task counts of one domain.
#[derive(Default, Debug)]
pub struct DomainLoad {
    pub nr_tasks: AtomicU64,
    pub nr_gaming: AtomicU64,
}

impl DomainLoad {
    pub fn start(&self, gaming: bool) {
        self.nr_tasks.fetch_add(1, Ordering::AcqRel);
        if gaming {
            self.nr_gaming.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn stop(&self, gaming: bool) {
        atomic_dec_clamped(&self.nr_tasks);
        if gaming {
            atomic_dec_clamped(&self.nr_gaming);
        }
    }

    pub fn tasks(&self) -> u64 {
        self.nr_tasks.load(Ordering::Acquire)
    }

    pub fn gaming(&self) -> u64 {
        self.nr_gaming.load(Ordering::Acquire)
    }
}

/// Priority class of a running task; lower is more urgent.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrioClass {
    Gaming = 0,
    Interactive = 1,
    Batch = 2,
}

impl PrioClass {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => PrioClass::Gaming,
            1 => PrioClass::Interactive,
            _ => PrioClass::Batch,
        }
    }
}

/// What a core is running. Written by that core's running/stopping hooks,
/// read by other cores looking for a preemption victim.
#[derive(Debug)]
pub struct RunState {
    prio: AtomicU32,
    /// `0` when the core runs nothing we track.
    pid: AtomicU32,
    started_at: AtomicU64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            prio: AtomicU32::new(PrioClass::Batch as u32),
            pid: AtomicU32::new(0),
            started_at: AtomicU64::new(0),
        }
    }
}

impl RunState {
    pub fn set(&self, prio: PrioClass, pid: u32, now: u64) {
        self.started_at.store(now, Ordering::Relaxed);
        self.prio.store(prio as u32, Ordering::Relaxed);
        self.pid.store(pid, Ordering::Release);
    }

    /// Clear if still owned by `pid`; returns the run start time.
    pub fn clear_if(&self, pid: u32) -> Option<u64> {
        if self.pid.load(Ordering::Acquire) != pid {
            return None;
        }
        let started = self.started_at.load(Ordering::Relaxed);
        self.prio.store(PrioClass::Batch as u32, Ordering::Relaxed);
        self.pid.store(0, Ordering::Release);
        Some(started)
    }

    /// `(pid, class)` of the running task, if any.
    pub fn current(&self) -> Option<(u32, PrioClass)> {
        let pid = self.pid.load(Ordering::Acquire);
        (pid != 0).then(|| (pid, PrioClass::from_raw(self.prio.load(Ordering::Relaxed))))
    }

    pub fn started_at(&self) -> u64 {
        self.started_at.load(Ordering::Relaxed)
    }
}

/// Per-core accounting.
#[derive(Default, Debug)]
pub struct CoreStats {
    pub enqueued: AtomicU64,
    pub dispatched: AtomicU64,
    pub gaming_tasks: AtomicU64,
    pub latency_sum_ns: AtomicU64,
    pub latency_count: AtomicU64,
    pub latency_max_ns: AtomicU64,
    pub idle_ns: AtomicU64,
    pub busy_ns: AtomicU64,
}

/// Performance-level tracking and idle bookkeeping of a core.
#[derive(Default, Debug)]
pub struct CorePerf {
    pub perf_cur: AtomicU32,
    pub perf_avg: AtomicU32,
    pub last_update_ns: AtomicU64,
    /// When the core last went idle, 0 while busy.
    pub last_idle_at: AtomicU64,
}

impl CorePerf {
    /// Fold a sample into the 7/8 moving average.
    pub fn sample(&self, cur: u32, now: u64) {
        let avg = self.perf_avg.load(Ordering::Relaxed);
        let next = if avg == 0 {
            cur
        } else {
            ((avg as u64 * 7 + cur as u64) / 8) as u32
        };
        self.perf_cur.store(cur, Ordering::Relaxed);
        self.perf_avg.store(next, Ordering::Relaxed);
        self.last_update_ns.store(now, Ordering::Relaxed);
    }
}

#[derive(Default, Debug)]
pub struct CoreState {
    pub run: RunState,
    pub stats: CoreStats,
    pub perf: CorePerf,
}

/// All runtime state that is not per task.
pub struct RuntimeState {
    pub counters: Counters,
    pub domains: Vec<DomainLoad>,
    pub cores: Vec<CoreState>,
}

impl RuntimeState {
    pub fn new(topo: &Topology) -> Self {
        Self {
            counters: Counters::default(),
            domains: (0..topo.nr_domains()).map(|_| DomainLoad::default()).collect(),
            cores: (0..topo.nr_cpus()).map(|_| CoreState::default()).collect(),
        }
    }

    #[inline]
    pub fn domain(&self, domain: usize) -> Option<&DomainLoad> {
        self.domains.get(domain)
    }

    #[inline]
    pub fn core(&self, cpu: usize) -> Option<&CoreState> {
        self.cores.get(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn max_min() {
        let max = AtomicU64::new(0);
        atomic_max(&max, 5);
        atomic_max(&max, 3);
        assert_eq!(max.load(Ordering::Relaxed), 5);

        let min = AtomicU64::new(0);
        atomic_min_nonzero(&min, 0);
        assert_eq!(min.load(Ordering::Relaxed), 0);
        atomic_min_nonzero(&min, 9);
        atomic_min_nonzero(&min, 12);
        atomic_min_nonzero(&min, 4);
        assert_eq!(min.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn concurrent_max() {
        let max = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let max = max.clone();
                std::thread::spawn(move || {
                    for v in 0..1000 {
                        atomic_max(&max, t * 1000 + v);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max.load(Ordering::Relaxed), 3999);
    }

    #[test]
    fn domain_load_never_negative() {
        let load = DomainLoad::default();
        load.stop(true);
        assert_eq!((load.tasks(), load.gaming()), (0, 0));
        load.start(true);
        load.start(false);
        load.stop(true);
        load.stop(true);
        load.stop(false);
        assert_eq!((load.tasks(), load.gaming()), (0, 0));
    }

    #[test]
    fn run_state_clear_only_by_owner() {
        let run = RunState::default();
        assert_eq!(run.current(), None);
        run.set(PrioClass::Interactive, 77, 1000);
        assert_eq!(run.current(), Some((77, PrioClass::Interactive)));
        assert_eq!(run.clear_if(78), None);
        assert_eq!(run.clear_if(77), Some(1000));
        assert_eq!(run.current(), None);
    }

    #[test]
    fn perf_ema() {
        let perf = CorePerf::default();
        perf.sample(800, 1);
        assert_eq!(perf.perf_avg.load(Ordering::Relaxed), 800);
        perf.sample(0, 2);
        assert_eq!(perf.perf_avg.load(Ordering::Relaxed), 700);
        assert_eq!(perf.perf_cur.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn registry_names_line_up() {
        let c = Counters::default();
        Counters::inc(&c.preempt_kicks);
        let all = c.read_all();
        assert_eq!(all[0], ("enqueued", 0));
        assert!(all.contains(&("preempt_kicks", 1)));
        assert_eq!(all.iter().filter(|(_, v)| *v > 0).count(), 1);
    }
}
