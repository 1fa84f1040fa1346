// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduling hooks.
//!
//! `Engine` owns every piece of policy state and is shared by reference
//! across cores. Each hook runs to completion without blocking: shared state
//! is atomics, the per-task store is lock-free and the dispatch queues hold
//! a spinlock only for a heap operation.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use log::info;
use log::warn;

use crate::burst;
use crate::classify::Classifier;
use crate::config::EngineConfig;
use crate::config::Tunables;
use crate::config::TunablesCell;
use crate::counters::atomic_max;
use crate::counters::atomic_min_nonzero;
use crate::counters::Counters;
use crate::counters::PrioClass;
use crate::counters::RuntimeState;
use crate::dsq::drain_order;
use crate::dsq::DispatchQueues;
use crate::dsq::DsqId;
use crate::dsq::Queued;
use crate::error::EngineError;
use crate::events::EventKind;
use crate::events::EventStream;
use crate::events::SchedEvent;
use crate::hints::Hints;
use crate::host::KickFlags;
use crate::host::SchedHost;
use crate::placement::strategy_for;
use crate::placement::PlacementCtx;
use crate::placement::PlacementStrategy;
use crate::preempt::find_victim;
use crate::task::Task;
use crate::task::TaskCtx;
use crate::task::TaskFlags;
use crate::task::TaskSnapshot;
use crate::task::TaskStore;
use crate::task::NO_DOMAIN;
use crate::topology::Topology;
use crate::SCHEDULER_NAME;

/// Gaming wake-ups that waited longer than this count as late frames.
pub const LATE_FRAME_NS: u64 = 1_000_000;
/// Domain load ratio reported as an imbalance.
pub const IMBALANCE_RATIO: u64 = 4;

pub struct Engine<H: SchedHost> {
    host: Arc<H>,
    topo: Arc<Topology>,
    config: EngineConfig,
    tunables: Arc<TunablesCell>,
    hints: Arc<Hints>,
    tasks: TaskStore,
    dsqs: DispatchQueues,
    state: RuntimeState,
    events: Arc<EventStream>,
    placement: Box<dyn PlacementStrategy>,
    exit_reason: OnceLock<String>,
}

impl<H: SchedHost> Engine<H> {
    /// Create the dispatch queues and per-core state. Fails if a queue
    /// cannot be created; nothing is scheduled in that case.
    pub fn init(
        host: Arc<H>,
        topo: Arc<Topology>,
        config: EngineConfig,
        tunables: Arc<TunablesCell>,
        hints: Arc<Hints>,
    ) -> Result<Self, EngineError> {
        let tasks = TaskStore::with_capacity(config.task_capacity);
        // Any one queue can hold every tracked task without growing.
        let dsqs = DispatchQueues::new(topo.nr_domains(), tasks.capacity())?;
        let placement = strategy_for(&topo);

        if config.asymmetric_boost && topo.freq_domain().is_none() {
            warn!("asymmetric boost requested but the topology has no high-frequency domain");
        }
        if config.monitor_cpu >= topo.nr_cpus() {
            warn!(
                "monitor cpu {} is out of range, imbalance checks are off",
                config.monitor_cpu
            );
        }

        info!(
            "{} initialized: {}, {} placement, {} dispatch queues",
            SCHEDULER_NAME,
            topo,
            placement.name(),
            dsqs.nr_domains() + 1
        );

        Ok(Self {
            host,
            state: RuntimeState::new(&topo),
            tasks,
            events: Arc::new(EventStream::with_capacity(config.event_capacity)),
            topo,
            config,
            tunables,
            hints,
            dsqs,
            placement,
            exit_reason: OnceLock::new(),
        })
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tunables(&self) -> &Arc<TunablesCell> {
        &self.tunables
    }

    pub fn hints(&self) -> &Arc<Hints> {
        &self.hints
    }

    pub fn events(&self) -> &Arc<EventStream> {
        &self.events
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }

    pub fn placement_name(&self) -> &'static str {
        self.placement.name()
    }

    pub fn task(&self, pid: u32) -> Option<TaskSnapshot> {
        self.tasks.get(pid).map(TaskCtx::snapshot)
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn queued(&self, id: DsqId) -> usize {
        self.dsqs.len(id)
    }

    pub fn queued_total(&self) -> usize {
        self.dsqs.total()
    }

    fn classifier(&self) -> Classifier<'_> {
        Classifier {
            hints: &self.hints,
            counters: &self.state.counters,
            events: &self.events,
            host: &*self.host,
        }
    }

    /// Classify (cached) and derive the mode-dependent flags.
    fn refresh(&self, task: &Task, ctx: &TaskCtx, tunables: &Tunables, prev_cpu: usize) {
        let class = self.classifier().classify(task, Some(ctx));
        let is_gaming = tunables.gaming_mode && class.is_gaming;
        let is_interactive = burst::is_interactive(
            is_gaming,
            ctx.burst_ns.load(Ordering::Relaxed),
            tunables.burst_threshold_ns,
        );
        let wants = is_gaming || (is_interactive && tunables.gaming_mode);

        ctx.set_flags(TaskFlags::GAMING, is_gaming);
        ctx.set_flags(TaskFlags::INTERACTIVE, is_interactive);
        ctx.set_flags(TaskFlags::WANTS_LOW_LAT, wants);

        let preferred = if wants {
            Some(self.topo.low_latency_domain())
        } else {
            self.topo.domain_of(prev_cpu)
        };
        ctx.preferred_domain
            .store(preferred.map_or(NO_DOMAIN, |d| d as u32), Ordering::Relaxed);
    }

    /// Wake-up: pick a core. A claimed idle core gets the task inserted
    /// directly; otherwise the host's default selection decides.
    pub fn select_cpu(&self, task: &Task, prev_cpu: usize, wake_flags: u64) -> usize {
        let Some(ctx) = self.tasks.get_or_create(task.pid) else {
            return prev_cpu;
        };
        if self.topo.core(prev_cpu).is_none() {
            return prev_cpu;
        }

        let tunables = self.tunables.load();
        self.refresh(task, ctx, &tunables, prev_cpu);

        let pcx = PlacementCtx {
            topo: &self.topo,
            host: &*self.host,
            hints: &self.hints,
            state: &self.state,
            events: &self.events,
            config: &self.config,
            tunables,
        };
        if let Some(cpu) = self.placement.select(&pcx, task, ctx, prev_cpu) {
            self.direct(task, cpu, tunables.slice_ns);
            return cpu;
        }

        let (cpu, is_idle) = self.host.select_cpu_dfl(task, prev_cpu, wake_flags);
        if is_idle {
            self.direct(task, cpu, tunables.slice_ns);
        }
        cpu
    }

    fn direct(&self, task: &Task, cpu: usize, slice_ns: u64) {
        self.host.insert_local(task, cpu, slice_ns);
        Counters::inc(&self.state.counters.direct_dispatched);
    }

    /// Queue a task that was not placed directly.
    pub fn enqueue(&self, task: &Task) {
        let c = &self.state.counters;
        let now = self.host.now_ns();
        Counters::inc(&c.enqueued);
        let core = self.state.core(task.cpu);
        if let Some(core) = core {
            Counters::inc(&core.stats.enqueued);
        }

        let ctx = self.tasks.get_or_create(task.pid);
        let slice_ns = self.tunables.load().slice_ns;

        let Some(ctx) = ctx else {
            let id = self.topo.domain_of(task.cpu).map_or(DsqId::Fallback, DsqId::for_domain);
            self.dsqs.insert(id, task.pid, slice_ns, 0);
            return;
        };
        ctx.enqueue_at.store(now, Ordering::Relaxed);

        let wants = ctx.wants_low_latency();
        let low_lat = self.topo.low_latency_domain();
        let id = match self.topo.domain_of(task.cpu) {
            Some(d) => {
                ctx.last_domain.store(d as u32, Ordering::Relaxed);
                DsqId::for_domain(if wants { low_lat } else { d })
            }
            None => DsqId::Fallback,
        };

        let is_gaming = ctx.is_gaming();
        let is_interactive = ctx.is_interactive();
        let vtime = burst::vtime(is_gaming, is_interactive, ctx.burst_ns.load(Ordering::Relaxed));

        if is_gaming {
            Counters::inc(&c.gaming_enqueued);
            if let Some(core) = core {
                Counters::inc(&core.stats.gaming_tasks);
            }
            if wants {
                self.kick_victim(task, low_lat, now);
            }
        } else if is_interactive {
            Counters::inc(&c.interactive_enqueued);
        }

        self.dsqs.insert(id, task.pid, slice_ns, vtime);
    }

    fn kick_victim(&self, task: &Task, domain: usize, now: u64) {
        let Some(victim) = find_victim(&self.topo, &self.state, domain, PrioClass::Gaming) else {
            return;
        };
        self.host.kick_cpu(victim, KickFlags::PREEMPT);
        Counters::inc(&self.state.counters.preempt_kicks);
        self.events.emit(
            SchedEvent::new(EventKind::PreemptKick, now, task.pid, victim)
                .domain(domain)
                .values(PrioClass::Gaming as u64, 0),
        );
    }

    /// A core has nothing to run: hand it the next queued task.
    pub fn dispatch(&self, cpu: usize) -> Option<Queued> {
        if let Some(core) = self.state.core(cpu) {
            Counters::inc(&core.stats.dispatched);
        }
        let next = drain_order(&self.topo, cpu).find_map(|id| self.dsqs.pop(id))?;
        Counters::inc(&self.state.counters.dispatched);
        Some(next)
    }

    /// Task starts running on `task.cpu`.
    pub fn running(&self, task: &Task) {
        let now = self.host.now_ns();
        let ctx = self.tasks.get(task.pid);
        let core = self.state.core(task.cpu);

        if let Some(ctx) = ctx {
            ctx.last_run_at.store(now, Ordering::Relaxed);
            let enqueued = ctx.enqueue_at.swap(0, Ordering::Relaxed);
            if enqueued > 0 {
                self.account_latency(task, ctx, now.saturating_sub(enqueued), now);
            }
        }

        let Some(core) = core else {
            return;
        };
        let idle_since = core.perf.last_idle_at.swap(0, Ordering::Relaxed);
        if idle_since > 0 && now > idle_since {
            core.stats.idle_ns.fetch_add(now - idle_since, Ordering::Relaxed);
        }

        let is_gaming = ctx.is_some_and(|c| c.is_gaming());
        let prio = match ctx {
            Some(c) if c.is_gaming() => PrioClass::Gaming,
            Some(c) if c.is_interactive() => PrioClass::Interactive,
            _ => PrioClass::Batch,
        };
        if let Some(load) = self.topo.domain_of(task.cpu).and_then(|d| self.state.domain(d)) {
            load.start(is_gaming);
        }
        core.run.set(prio, task.pid, now);
    }

    fn account_latency(&self, task: &Task, ctx: &TaskCtx, latency: u64, now: u64) {
        let c = &self.state.counters;
        c.latency_sum_ns.fetch_add(latency, Ordering::Relaxed);
        Counters::inc(&c.latency_count);
        atomic_max(&c.latency_max_ns, latency);
        atomic_min_nonzero(&c.latency_min_ns, latency);

        if let Some(core) = self.state.core(task.cpu) {
            core.stats.latency_sum_ns.fetch_add(latency, Ordering::Relaxed);
            Counters::inc(&core.stats.latency_count);
            atomic_max(&core.stats.latency_max_ns, latency);
        }

        if !ctx.is_gaming() {
            return;
        }
        let latency_us = latency / 1000;
        c.gaming_latency_sum_ns.fetch_add(latency, Ordering::Relaxed);
        Counters::inc(&c.gaming_latency_count);
        c.gaming_latency_sum_sq_us
            .fetch_add(latency_us.saturating_mul(latency_us), Ordering::Relaxed);
        if latency > LATE_FRAME_NS {
            Counters::inc(&c.gaming_late_frames);
            self.events.emit(
                SchedEvent::new(EventKind::HighLatency, now, task.pid, task.cpu)
                    .values(latency_us, LATE_FRAME_NS / 1000),
            );
        }
    }

    /// Task stops running. `runnable` is false when it blocks.
    pub fn stopping(&self, task: &Task, runnable: bool) {
        let now = self.host.now_ns();
        let ctx = self.tasks.get(task.pid);
        let is_gaming = ctx.is_some_and(|c| c.is_gaming());

        if let Some(ctx) = ctx {
            if is_gaming && runnable {
                Counters::inc(&self.state.counters.gaming_preempted);
            }
            burst::on_stop(ctx, now, runnable);
        }

        if let Some(load) = self.topo.domain_of(task.cpu).and_then(|d| self.state.domain(d)) {
            load.stop(is_gaming);
        }

        let Some(core) = self.state.core(task.cpu) else {
            return;
        };
        if let Some(started) = core.run.clear_if(task.pid) {
            if started > 0 && now > started {
                core.stats.busy_ns.fetch_add(now - started, Ordering::Relaxed);
            }
        }
        core.perf.last_idle_at.store(now, Ordering::Relaxed);
    }

    /// Periodic tick on `cpu`.
    pub fn tick(&self, cpu: usize) {
        let Some(core) = self.state.core(cpu) else {
            return;
        };
        let now = self.host.now_ns();
        core.perf.sample(self.host.cpuperf_cur(cpu), now);

        if cpu == self.config.monitor_cpu && self.topo.nr_domains() >= 2 {
            self.check_imbalance(now);
        }
    }

    fn check_imbalance(&self, now: u64) {
        let low_lat = self.topo.low_latency_domain();
        let other = if low_lat == 0 { 1 } else { 0 };
        let (Some(a), Some(b)) = (self.state.domain(low_lat), self.state.domain(other)) else {
            return;
        };
        let (low_tasks, other_tasks) = (a.tasks(), b.tasks());

        let report = if other_tasks > 0 && low_tasks >= other_tasks.saturating_mul(IMBALANCE_RATIO) {
            Some((low_lat, low_tasks, other, other_tasks))
        } else if low_tasks > 0 && other_tasks >= low_tasks.saturating_mul(IMBALANCE_RATIO) {
            Some((other, other_tasks, low_lat, low_tasks))
        } else {
            None
        };
        if let Some((heavy, heavy_tasks, light, light_tasks)) = report {
            Counters::inc(&self.state.counters.imbalance_events);
            self.events.emit(
                SchedEvent::new(EventKind::DomainImbalance, now, 0, 0)
                    .domain(heavy)
                    .peer_domain(light)
                    .values(heavy_tasks, light_tasks),
            );
        }
    }

    /// Record that a per-game profile was applied because of `task`.
    pub fn note_profile_match(&self, task: &Task) {
        self.events.emit(
            SchedEvent::new(EventKind::ProfileMatch, self.host.now_ns(), task.pid, task.cpu)
                .comm(task.comm),
        );
    }

    /// The task is gone: reclaim its state and drop it from any queue.
    pub fn task_exit(&self, pid: u32) -> bool {
        self.dsqs.remove(pid);
        self.tasks.remove(pid)
    }

    /// Record why the engine stopped. Only the first reason sticks.
    pub fn exit(&self, reason: &str) {
        if self.exit_reason.set(reason.to_string()).is_ok() {
            info!("{} exiting: {}", SCHEDULER_NAME, reason);
        }
    }

    pub fn exit_reason(&self) -> Option<&str> {
        self.exit_reason.get().map(String::as_str)
    }

    pub fn exited(&self) -> bool {
        self.exit_reason.get().is_some()
    }

    /// Human-readable state summary.
    pub fn dump(&self) -> String {
        let c = &self.state.counters;
        let get = Counters::get;
        let mut out = String::new();

        let _ = writeln!(out, "{} v{} scheduler dump", SCHEDULER_NAME, env!("CARGO_PKG_VERSION"));
        let _ = writeln!(
            out,
            "  enqueued: {}, dispatched: {}, direct: {}",
            get(&c.enqueued),
            get(&c.dispatched),
            get(&c.direct_dispatched)
        );
        let _ = writeln!(
            out,
            "  gaming: {}, interactive: {}, proton: {}",
            get(&c.gaming_enqueued),
            get(&c.interactive_enqueued),
            get(&c.proton_tasks)
        );
        let _ = writeln!(
            out,
            "  low_latency_migrations: {}, preempt_kicks: {}",
            get(&c.low_latency_migrations),
            get(&c.preempt_kicks)
        );
        let _ = writeln!(
            out,
            "  domain_local: {}, domain_cross: {}",
            get(&c.domain_local),
            get(&c.domain_cross)
        );

        let count = get(&c.latency_count);
        if count > 0 {
            let _ = writeln!(
                out,
                "  latency: avg={}us, max={}us",
                get(&c.latency_sum_ns) / count / 1000,
                get(&c.latency_max_ns) / 1000
            );
        }

        let low_lat = self.topo.low_latency_domain();
        for (d, load) in self.state.domains.iter().enumerate() {
            let _ = writeln!(
                out,
                "  D{}: {} tasks ({} gaming){}",
                d,
                load.tasks(),
                load.gaming(),
                if d == low_lat { " [low-latency]" } else { "" }
            );
        }
        let nonzero: Vec<String> = c
            .read_all()
            .into_iter()
            .filter(|(_, v)| *v > 0)
            .map(|(name, v)| format!("{}={}", name, v))
            .collect();
        for line in nonzero.chunks(4) {
            let _ = writeln!(out, "  counters: {}", line.join(", "));
        }
        let _ = writeln!(out, "  events dropped: {}", self.events.dropped());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHost;
    use crate::topology::Preset;

    fn engine(preset: Preset) -> Engine<SimHost> {
        let topo = Arc::new(preset.build().unwrap());
        let host = Arc::new(SimHost::new(&topo));
        Engine::init(
            host,
            topo,
            EngineConfig::default(),
            Arc::new(TunablesCell::default()),
            Arc::new(Hints::default()),
        )
        .unwrap()
    }

    fn dual() -> Engine<SimHost> {
        engine(Preset::DualCcdX3d { cores_per_ccd: 4, smt: false, asymmetric_boost: false })
    }

    fn task(e: &Engine<SimHost>, pid: u32, name: &str) -> Task {
        Task::new(pid, pid, name, e.topology().all_cpus())
    }

    #[test]
    fn wake_classifies_and_places_directly() {
        let e = dual();
        let t = task(&e, 10, "wine64");
        let cpu = e.select_cpu(&t, 6, 0);
        assert_eq!(e.topology().domain_of(cpu), Some(0));
        let snap = e.task(10).unwrap();
        assert!(snap.flags.contains(TaskFlags::GAMING | TaskFlags::WANTS_LOW_LAT | TaskFlags::PROTON));
        assert_eq!(snap.preferred_domain, Some(0));
        assert_eq!(Counters::get(&e.counters().direct_dispatched), 1);
        assert_eq!(e.host().take_inserts().len(), 1);
    }

    #[test]
    fn gaming_mode_off_keeps_classification() {
        let e = dual();
        e.tunables().update(|t| t.gaming_mode = false);
        let t = task(&e, 11, "wine64");
        e.select_cpu(&t, 6, 0);
        let snap = e.task(11).unwrap();
        assert!(snap.flags.contains(TaskFlags::CLASS_GAMING));
        assert!(!snap.flags.contains(TaskFlags::GAMING));
        // fresh task, zero burst: interactive but no low-latency wish
        assert!(snap.flags.contains(TaskFlags::INTERACTIVE));
        assert!(!snap.flags.contains(TaskFlags::WANTS_LOW_LAT));
        assert_eq!(snap.preferred_domain, Some(1));
    }

    #[test]
    fn falls_back_to_default_selection() {
        let e = dual();
        for cpu in 0..8 {
            e.host().set_idle(cpu, false);
        }
        let t = task(&e, 12, "make");
        let cpu = e.select_cpu(&t, 3, 0);
        assert_eq!(cpu, 3);
        assert_eq!(Counters::get(&e.counters().direct_dispatched), 0);
    }

    #[test]
    fn unknown_prev_cpu_is_returned() {
        let e = dual();
        let t = task(&e, 13, "make");
        assert_eq!(e.select_cpu(&t, 200, 0), 200);
    }

    #[test]
    fn enqueue_targets_low_latency_queue() {
        let e = dual();
        let t = task(&e, 14, "wine64").on_cpu(6);
        e.select_cpu(&t, 6, 0);
        e.enqueue(&t);
        assert_eq!(e.queued(DsqId::Domain(0)), 1);
        assert_eq!(e.task(14).unwrap().last_domain, Some(1));
        assert_eq!(Counters::get(&e.counters().gaming_enqueued), 1);
        assert_eq!(Counters::get(&e.state().cores[6].stats.gaming_tasks), 1);

        let b = task(&e, 15, "make").on_cpu(6);
        e.enqueue(&b);
        assert_eq!(e.queued(DsqId::Domain(1)), 1);
    }

    #[test]
    fn gaming_enqueue_kicks_one_victim() {
        let e = dual();
        let batch = task(&e, 20, "cc1").on_cpu(2);
        e.enqueue(&batch);
        e.running(&batch);
        let game = task(&e, 21, "wine64").on_cpu(5);
        e.select_cpu(&game, 5, 0);
        e.host().take_kicks();
        e.enqueue(&game);
        assert_eq!(e.host().take_kicks(), vec![(2, KickFlags::PREEMPT)]);
        assert_eq!(Counters::get(&e.counters().preempt_kicks), 1);
        let kick = std::iter::from_fn(|| e.events().pop())
            .find(|ev| ev.kind == EventKind::PreemptKick)
            .unwrap();
        assert_eq!((kick.pid, kick.cpu, kick.domain), (21, 2, 0));
    }

    #[test]
    fn dispatch_counts_only_success() {
        let e = dual();
        assert!(e.dispatch(0).is_none());
        assert_eq!(Counters::get(&e.counters().dispatched), 0);
        assert_eq!(Counters::get(&e.state().cores[0].stats.dispatched), 1);
        let t = task(&e, 30, "make").on_cpu(5);
        e.enqueue(&t);
        // domain-0 core drains domain 1 after its own queue
        assert_eq!(e.dispatch(0).unwrap().pid, 30);
        assert_eq!(Counters::get(&e.counters().dispatched), 1);
    }

    #[test]
    fn running_accounts_latency_and_late_frames() {
        let e = dual();
        let t = task(&e, 40, "wine64").on_cpu(1);
        e.select_cpu(&t, 1, 0);
        e.host().set_now(1_000);
        e.enqueue(&t);
        e.host().set_now(2_501_000);
        e.running(&t);

        let c = e.counters();
        assert_eq!(Counters::get(&c.latency_count), 1);
        assert_eq!(Counters::get(&c.latency_max_ns), 2_500_000);
        assert_eq!(Counters::get(&c.latency_min_ns), 2_500_000);
        assert_eq!(Counters::get(&c.gaming_latency_sum_sq_us), 2500 * 2500);
        assert_eq!(Counters::get(&c.gaming_late_frames), 1);
        let ev = std::iter::from_fn(|| e.events().pop())
            .find(|ev| ev.kind == EventKind::HighLatency)
            .unwrap();
        assert_eq!((ev.value1, ev.value2), (2500, 1000));

        assert_eq!(e.state().domains[0].tasks(), 1);
        assert_eq!(e.state().domains[0].gaming(), 1);
        assert_eq!(e.state().cores[1].run.current(), Some((40, PrioClass::Gaming)));

        // second run without an enqueue adds no sample
        e.stopping(&t, true);
        e.running(&t);
        assert_eq!(Counters::get(&c.latency_count), 1);
    }

    #[test]
    fn stopping_tracks_burst_and_loads() {
        let e = dual();
        let t = task(&e, 50, "make").on_cpu(4);
        e.enqueue(&t);
        e.host().set_now(10_000);
        e.running(&t);
        e.host().set_now(3_010_000);
        e.stopping(&t, true);
        assert_eq!(e.task(50).unwrap().burst_ns, 3_000_000);
        assert_eq!(e.state().domains[1].tasks(), 0);
        assert_eq!(e.state().cores[4].run.current(), None);
        assert_eq!(Counters::get(&e.state().cores[4].stats.busy_ns), 3_000_000);

        // stop without a matching start never goes negative
        e.stopping(&t, false);
        assert_eq!(e.state().domains[1].tasks(), 0);
        assert_eq!(e.task(50).unwrap().burst_ns, 0);

        e.host().set_now(4_010_000);
        e.running(&t);
        assert_eq!(Counters::get(&e.state().cores[4].stats.idle_ns), 1_000_000);
    }

    #[test]
    fn imbalance_only_on_monitor_core() {
        let e = dual();
        for _ in 0..5 {
            e.state().domains[0].start(false);
        }
        for _ in 0..20 {
            e.state().domains[1].start(false);
        }
        e.tick(3);
        assert!(e.events().is_empty());
        e.tick(0);
        let ev = e.events().pop().unwrap();
        assert_eq!(ev.kind, EventKind::DomainImbalance);
        assert_eq!((ev.domain, ev.value1, ev.value2), (1, 20, 5));
        assert_eq!(Counters::get(&e.counters().imbalance_events), 1);
    }

    #[test]
    fn tick_folds_perf_average() {
        let e = dual();
        e.host().set_perf(2, 1024);
        e.tick(2);
        e.host().set_perf(2, 512);
        e.tick(2);
        let perf = &e.state().cores[2].perf;
        assert_eq!(perf.perf_cur.load(Ordering::Relaxed), 512);
        assert_eq!(perf.perf_avg.load(Ordering::Relaxed), (1024 * 7 + 512) / 8);
    }

    #[test]
    fn task_exit_reclaims() {
        let e = dual();
        let t = task(&e, 60, "make").on_cpu(1);
        e.enqueue(&t);
        assert_eq!(e.nr_tasks(), 1);
        assert!(e.task_exit(60));
        assert_eq!(e.nr_tasks(), 0);
        assert_eq!(e.queued_total(), 0);
        assert!(!e.task_exit(60));
    }

    #[test]
    fn exit_reason_recorded_once() {
        let e = dual();
        assert!(!e.exited());
        e.exit("unregistered from user space");
        e.exit("second");
        assert_eq!(e.exit_reason(), Some("unregistered from user space"));
    }

    #[test]
    fn dump_lists_domains() {
        let e = dual();
        let t = task(&e, 70, "wine64").on_cpu(0);
        e.host().set_now(1_000);
        e.enqueue(&t);
        e.host().set_now(2_000_000);
        e.running(&t);
        let dump = e.dump();
        assert!(dump.starts_with("scx_latcache v"));
        assert!(dump.contains("enqueued: 1, dispatched: 0, direct: 0"));
        assert!(dump.contains("latency: avg="));
        assert!(dump.contains("D0: 1 tasks (0 gaming) [low-latency]"));
        assert!(dump.contains("D1: 0 tasks (0 gaming)\n"));
        assert!(dump.contains("  counters: enqueued=1, latency_sum_ns="));
        assert!(!dump.contains("dispatched=0"));
        assert!(dump.contains("events dropped: 0"));
    }

    #[test]
    fn queues_reserve_room_for_every_task() {
        let e = dual();
        assert!(e.dsqs.reserved() >= e.tasks.capacity());
    }

    #[test]
    fn hybrid_engine_uses_hybrid_placement() {
        let e = engine(Preset::Hybrid { pcores: 2, ecores: 4 });
        assert_eq!(e.placement_name(), "hybrid");
        let t = task(&e, 80, "steam");
        let cpu = e.select_cpu(&t, 5, 0);
        assert!(e.topology().pcore_mask().test(cpu));
    }
}
