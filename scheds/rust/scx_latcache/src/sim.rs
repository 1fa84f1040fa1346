// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-process host and a discrete-event driver.
//!
//! `SimHost` implements `SchedHost` with plain atomics so the engine can be
//! exercised without a kernel. `Simulator` replays a synthetic desktop
//! workload against an engine: tasks alternate between running for a random
//! burst and sleeping, cores dispatch from the engine's queues when they run
//! out of work, and preemption kicks cut the victim's run short.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam::queue::SegQueue;
use log::debug;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use crate::cpumask::AtomicCpuMask;
use crate::cpumask::CpuMask;
use crate::engine::Engine;
use crate::hints::WorkloadClass;
use crate::host::KickFlags;
use crate::host::SchedHost;
use crate::host::TaskIdent;
use crate::patterns::Comm;
use crate::profiles::ProfileManager;
use crate::task::Task;
use crate::topology::Topology;

/// Full-speed performance level.
pub const SCHED_CAPACITY: u32 = 1024;
/// Scheduler tick period (HZ=250).
pub const TICK_NS: u64 = 4_000_000;

/// A direct placement made by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Insert {
    pub pid: u32,
    pub cpu: usize,
    pub slice_ns: u64,
}

pub struct SimHost {
    now: AtomicU64,
    idle: AtomicCpuMask,
    siblings: Vec<Option<usize>>,
    perf: Vec<AtomicU32>,
    inserts: SegQueue<Insert>,
    kicks: SegQueue<(usize, KickFlags)>,
    /// pid -> (parent pid, name)
    procs: ArcSwap<FxHashMap<u32, (u32, Comm)>>,
}

impl SimHost {
    /// Every core starts idle at full performance.
    pub fn new(topo: &Topology) -> Self {
        let idle = AtomicCpuMask::new();
        for cpu in 0..topo.nr_cpus() {
            idle.set(cpu);
        }
        Self {
            now: AtomicU64::new(0),
            idle,
            siblings: topo.cores().map(|(_, c)| c.smt_sibling).collect(),
            perf: (0..topo.nr_cpus()).map(|_| AtomicU32::new(SCHED_CAPACITY)).collect(),
            inserts: SegQueue::new(),
            kicks: SegQueue::new(),
            procs: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }

    pub fn set_now(&self, ns: u64) {
        self.now.store(ns, Ordering::Release);
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::AcqRel);
    }

    pub fn set_idle(&self, cpu: usize, idle: bool) {
        if idle {
            self.idle.set(cpu);
        } else {
            self.idle.clear(cpu);
        }
    }

    pub fn is_idle(&self, cpu: usize) -> bool {
        self.idle.test(cpu)
    }

    pub fn set_perf(&self, cpu: usize, level: u32) {
        if let Some(p) = self.perf.get(cpu) {
            p.store(level.min(SCHED_CAPACITY), Ordering::Relaxed);
        }
    }

    pub fn take_inserts(&self) -> Vec<Insert> {
        std::iter::from_fn(|| self.inserts.pop()).collect()
    }

    pub fn take_kicks(&self) -> Vec<(usize, KickFlags)> {
        std::iter::from_fn(|| self.kicks.pop()).collect()
    }

    pub fn add_process(&self, pid: u32, ppid: u32, comm: &str) {
        let comm = Comm::new(comm);
        self.procs.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(pid, (ppid, comm));
            next
        });
    }

    pub fn remove_process(&self, pid: u32) {
        self.procs.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.remove(&pid);
            next
        });
    }
}

impl SchedHost for SimHost {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn idle_mask(&self) -> CpuMask {
        self.idle.snapshot()
    }

    fn idle_smt_mask(&self) -> CpuMask {
        let idle = self.idle.snapshot();
        let mut mask = CpuMask::new();
        for cpu in idle.iter() {
            match self.siblings.get(cpu).copied().flatten() {
                Some(sibling) if !idle.test(sibling) => {}
                _ => mask.set(cpu),
            }
        }
        mask
    }

    fn test_and_clear_cpu_idle(&self, cpu: usize) -> bool {
        self.idle.test_and_clear(cpu)
    }

    fn select_cpu_dfl(&self, task: &Task, prev_cpu: usize, _wake_flags: u64) -> (usize, bool) {
        if task.cpus_allowed.test(prev_cpu) && self.idle.test_and_clear(prev_cpu) {
            return (prev_cpu, true);
        }
        for cpu in self.idle.snapshot().and(&task.cpus_allowed).iter() {
            if self.idle.test_and_clear(cpu) {
                return (cpu, true);
            }
        }
        (prev_cpu, false)
    }

    fn insert_local(&self, task: &Task, cpu: usize, slice_ns: u64) {
        self.inserts.push(Insert { pid: task.pid, cpu, slice_ns });
    }

    fn kick_cpu(&self, cpu: usize, flags: KickFlags) {
        self.kicks.push((cpu, flags));
    }

    fn cpuperf_cur(&self, cpu: usize) -> u32 {
        self.perf.get(cpu).map_or(0, |p| p.load(Ordering::Relaxed))
    }

    fn parent_of(&self, pid: u32) -> Option<TaskIdent> {
        let procs = self.procs.load();
        let (ppid, _) = procs.get(&pid)?;
        let (_, comm) = procs.get(ppid)?;
        Some(TaskIdent { pid: *ppid, comm: *comm })
    }
}

/// One synthetic thread.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub pid: u32,
    pub tgid: u32,
    pub ppid: u32,
    pub comm: String,
    pub cgroup_id: u64,
    /// Run length per wake-up, inclusive range.
    pub run_ns: (u64, u64),
    pub sleep_ns: (u64, u64),
    /// Exit after this long and respawn under a fresh pid.
    pub lifetime_ns: Option<u64>,
}

impl TaskSpec {
    pub fn new(pid: u32, tgid: u32, ppid: u32, comm: &str, run_ns: (u64, u64), sleep_ns: (u64, u64)) -> Self {
        Self {
            pid,
            tgid,
            ppid,
            comm: comm.to_string(),
            cgroup_id: 0,
            run_ns,
            sleep_ns,
            lifetime_ns: None,
        }
    }

    pub fn lifetime(mut self, ns: u64) -> Self {
        self.lifetime_ns = Some(ns);
        self
    }

    pub fn cgroup(mut self, id: u64) -> Self {
        self.cgroup_id = id;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Scenario {
    /// Processes that exist but never run (parents).
    pub processes: Vec<(u32, u32, String)>,
    pub tasks: Vec<TaskSpec>,
    pub process_hints: Vec<(u32, WorkloadClass)>,
    pub container_hints: Vec<(u32, WorkloadClass)>,
    pub cgroup_hints: Vec<(u64, WorkloadClass)>,
}

impl Scenario {
    /// A game under Steam/Proton with a render thread, a compositor, an AI
    /// container and `nr_batch` compiler jobs.
    pub fn gaming_desktop(nr_batch: usize) -> Self {
        const MS: u64 = 1_000_000;
        const US: u64 = 1_000;

        let mut s = Scenario {
            processes: vec![
                (1, 1, "systemd".to_string()),
                (900, 1, "make".to_string()),
            ],
            ..Default::default()
        };
        s.tasks.push(TaskSpec::new(100, 100, 1, "steam", (100 * US, 300 * US), (5 * MS, 15 * MS)));
        s.tasks.push(TaskSpec::new(200, 200, 100, "Game.exe", (2 * MS, 4 * MS), (2 * MS, 6 * MS)));
        s.tasks.push(TaskSpec::new(201, 200, 100, "vkThread0", (500 * US, 1500 * US), (2 * MS, 5 * MS)));
        s.tasks.push(TaskSpec::new(202, 200, 100, "GameWorker", (MS, 3 * MS), (MS, 4 * MS)));
        s.tasks.push(TaskSpec::new(400, 400, 1, "kwin_wayland", (200 * US, 600 * US), (4 * MS, 12 * MS)));
        s.tasks.push(TaskSpec::new(600, 600, 1, "python3", (10 * MS, 30 * MS), (MS, 2 * MS)));
        s.container_hints.push((600, WorkloadClass::Ai));
        for i in 0..nr_batch as u32 {
            s.tasks.push(
                TaskSpec::new(1000 + i, 1000 + i, 900, "cc1plus", (15 * MS, 40 * MS), (200 * US, MS))
                    .lifetime(300 * MS),
            );
        }
        s
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SimEvent {
    Wake(u32),
    Stop { cpu: usize, gen: u64 },
    Tick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskState {
    Sleeping,
    Queued,
    Running,
}

struct SimTask {
    spec: TaskSpec,
    task: Task,
    state: TaskState,
    remaining_ns: u64,
    born_at: u64,
    seen: bool,
}

struct Running {
    pid: u32,
    started: u64,
}

#[derive(Default)]
struct SimCpu {
    running: Option<Running>,
    gen: u64,
    /// Direct placements waiting for this core.
    local: VecDeque<(u32, u64)>,
}

pub struct Simulator {
    engine: Arc<Engine<SimHost>>,
    rng: StdRng,
    now: u64,
    seq: u64,
    pending: BinaryHeap<Reverse<(u64, u64, SimEvent)>>,
    tasks: FxHashMap<u32, SimTask>,
    cpus: Vec<SimCpu>,
    next_pid: u32,
    events_processed: u64,
    profiles: Option<ProfileManager>,
}

impl Simulator {
    pub fn new(engine: Arc<Engine<SimHost>>, scenario: &Scenario, seed: u64) -> Self {
        let nr_cpus = engine.topology().nr_cpus();
        let mut sim = Self {
            rng: StdRng::seed_from_u64(seed),
            now: engine.host().now_ns(),
            seq: 0,
            pending: BinaryHeap::new(),
            tasks: FxHashMap::default(),
            cpus: (0..nr_cpus).map(|_| SimCpu::default()).collect(),
            next_pid: 10_000,
            events_processed: 0,
            profiles: None,
            engine,
        };

        let host = sim.engine.host().clone();
        for (pid, ppid, comm) in &scenario.processes {
            host.add_process(*pid, *ppid, comm);
        }
        let hints = sim.engine.hints().clone();
        hints.processes.replace(scenario.process_hints.iter().copied().collect());
        hints.containers.replace(scenario.container_hints.iter().copied().collect());
        hints.cgroups.replace(scenario.cgroup_hints.iter().copied().collect());
        for spec in &scenario.tasks {
            sim.spawn(spec.clone());
        }
        sim.push(sim.now + TICK_NS, SimEvent::Tick);
        sim
    }

    pub fn with_profiles(mut self, profiles: ProfileManager) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn engine(&self) -> &Arc<Engine<SimHost>> {
        &self.engine
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn push(&mut self, at: u64, ev: SimEvent) {
        self.seq += 1;
        self.pending.push(Reverse((at, self.seq, ev)));
    }

    fn spawn(&mut self, spec: TaskSpec) {
        let host = self.engine.host();
        host.add_process(spec.pid, spec.ppid, &spec.comm);
        let nr_cpus = self.cpus.len().max(1);
        let task = Task::new(spec.pid, spec.tgid, &spec.comm, self.engine.topology().all_cpus())
            .with_cgroup(spec.cgroup_id)
            .on_cpu(spec.pid as usize % nr_cpus);
        let pid = spec.pid;
        let delay = self.rng.gen_range(0..=1_000_000);
        self.tasks.insert(
            pid,
            SimTask {
                spec,
                task,
                state: TaskState::Sleeping,
                remaining_ns: 0,
                born_at: self.now,
                seen: false,
            },
        );
        self.push(self.now + delay, SimEvent::Wake(pid));
    }

    /// Process every event up to `end_ns`.
    pub fn run_until(&mut self, end_ns: u64) {
        while let Some(Reverse((at, _, ev))) = self.pending.peek().copied() {
            if at > end_ns {
                break;
            }
            self.pending.pop();
            self.now = at;
            self.engine.host().set_now(at);
            match ev {
                SimEvent::Wake(pid) => self.wake(pid),
                SimEvent::Stop { cpu, gen } => self.stop(cpu, gen),
                SimEvent::Tick => self.tick(),
            }
            self.handle_kicks();
            self.events_processed += 1;
        }
        self.now = self.now.max(end_ns);
        self.engine.host().set_now(self.now);
    }

    pub fn run_for(&mut self, ns: u64) {
        let end = self.now + ns;
        self.run_until(end);
    }

    fn check_profile(&mut self, pid: u32) {
        let Some(t) = self.tasks.get_mut(&pid) else {
            return;
        };
        if std::mem::replace(&mut t.seen, true) {
            return;
        }
        let task = t.task;
        let Some(profiles) = self.profiles.as_mut() else {
            return;
        };
        let Some(name) = profiles.match_comm(&task.comm.to_string()).map(|p| p.name.clone()) else {
            return;
        };
        if profiles.activate(&name, self.engine.tunables()) {
            self.engine.note_profile_match(&task);
        }
    }

    fn wake(&mut self, pid: u32) {
        self.check_profile(pid);
        let run_ns = match self.tasks.get(&pid) {
            Some(t) if t.state == TaskState::Sleeping => t.spec.run_ns,
            _ => return,
        };
        let burst = self.rng.gen_range(run_ns.0..=run_ns.1.max(run_ns.0));

        let Some(t) = self.tasks.get_mut(&pid) else {
            return;
        };
        t.remaining_ns = burst.max(1);
        t.state = TaskState::Queued;
        let prev = t.task.cpu;
        let cpu = self.engine.select_cpu(&t.task, prev, 0);

        let direct = self.engine.host().take_inserts().into_iter().find(|i| i.pid == pid);
        match direct {
            Some(ins) => {
                t.task.cpu = ins.cpu;
                self.cpus[ins.cpu].local.push_back((pid, ins.slice_ns));
                self.schedule(ins.cpu);
            }
            None => {
                t.task.cpu = cpu;
                let task = t.task;
                self.engine.enqueue(&task);
                self.wake_idle_core(&task);
            }
        }
    }

    /// Let one idle core pull from the queues after an enqueue.
    fn wake_idle_core(&mut self, task: &Task) {
        let host = self.engine.host().clone();
        let idle = host.idle_mask().and(&task.cpus_allowed);
        for cpu in idle.iter() {
            if self.cpus.get(cpu).is_some_and(|c| c.running.is_none()) && host.test_and_clear_cpu_idle(cpu) {
                self.schedule(cpu);
                return;
            }
        }
    }

    /// Start the next task on an empty core, or mark it idle.
    fn schedule(&mut self, cpu: usize) {
        if self.cpus.get(cpu).map_or(true, |c| c.running.is_some()) {
            return;
        }
        loop {
            let next = match self.cpus[cpu].local.pop_front() {
                Some(next) => Some(next),
                None => self.engine.dispatch(cpu).map(|q| (q.pid, q.slice_ns)),
            };
            let Some((pid, slice_ns)) = next else {
                self.engine.host().set_idle(cpu, true);
                return;
            };
            if self.tasks.get(&pid).is_some_and(|t| t.state == TaskState::Queued) {
                self.start(cpu, pid, slice_ns);
                return;
            }
        }
    }

    fn start(&mut self, cpu: usize, pid: u32, slice_ns: u64) {
        let Some(t) = self.tasks.get_mut(&pid) else {
            return;
        };
        self.engine.host().set_idle(cpu, false);
        t.task.cpu = cpu;
        t.state = TaskState::Running;
        self.engine.running(&t.task);
        let run = t.remaining_ns.min(slice_ns.max(1));

        let c = &mut self.cpus[cpu];
        c.gen += 1;
        c.running = Some(Running { pid, started: self.now });
        let gen = c.gen;
        self.push(self.now + run, SimEvent::Stop { cpu, gen });
    }

    fn stop(&mut self, cpu: usize, gen: u64) {
        let c = &mut self.cpus[cpu];
        if c.gen != gen {
            return;
        }
        let Some(run) = c.running.take() else {
            return;
        };

        if let Some(t) = self.tasks.get_mut(&run.pid) {
            let elapsed = self.now.saturating_sub(run.started);
            t.remaining_ns = t.remaining_ns.saturating_sub(elapsed);
            let task = t.task;

            if t.remaining_ns > 0 {
                self.engine.stopping(&task, true);
                t.state = TaskState::Queued;
                self.engine.enqueue(&task);
                self.schedule(cpu);
                self.wake_idle_core(&task);
                return;
            }

            self.engine.stopping(&task, false);
            let expired = t
                .spec
                .lifetime_ns
                .is_some_and(|life| self.now.saturating_sub(t.born_at) >= life);
            if expired {
                self.exit(run.pid);
            } else {
                t.state = TaskState::Sleeping;
                let (lo, hi) = t.spec.sleep_ns;
                let sleep = self.rng.gen_range(lo..=hi.max(lo));
                self.push(self.now + sleep, SimEvent::Wake(run.pid));
            }
        }
        self.schedule(cpu);
    }

    /// Reap a task and start a replacement under a new pid.
    fn exit(&mut self, pid: u32) {
        let Some(t) = self.tasks.remove(&pid) else {
            return;
        };
        self.engine.task_exit(pid);
        self.engine.host().remove_process(pid);

        let mut spec = t.spec;
        let new_pid = self.next_pid;
        self.next_pid += 1;
        debug!("sim: {} ({}) exited, respawning as {}", spec.comm, pid, new_pid);
        if spec.tgid == spec.pid {
            spec.tgid = new_pid;
        }
        spec.pid = new_pid;
        self.spawn(spec);
    }

    fn tick(&mut self) {
        let host = self.engine.host().clone();
        for cpu in 0..self.cpus.len() {
            let level = if self.cpus[cpu].running.is_some() {
                self.rng.gen_range(800..=SCHED_CAPACITY)
            } else {
                self.rng.gen_range(200..=600)
            };
            host.set_perf(cpu, level);
            self.engine.tick(cpu);
        }
        self.push(self.now + TICK_NS, SimEvent::Tick);
    }

    /// A preemption kick ends the victim's run now.
    fn handle_kicks(&mut self) {
        for (cpu, flags) in self.engine.host().take_kicks() {
            if !flags.contains(KickFlags::PREEMPT) {
                continue;
            }
            if let Some(c) = self.cpus.get(cpu) {
                if c.running.is_some() {
                    let gen = c.gen;
                    self.push(self.now, SimEvent::Stop { cpu, gen });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::config::TunablesCell;
    use crate::hints::Hints;
    use crate::topology::Preset;

    fn host() -> SimHost {
        let topo = Preset::DualCcdX3d { cores_per_ccd: 2, smt: true, asymmetric_boost: false }
            .build()
            .unwrap();
        SimHost::new(&topo)
    }

    #[test]
    fn idle_smt_needs_both_siblings() {
        let h = host();
        // cpus 0..4 first threads, 4..8 siblings
        h.set_idle(4, false);
        let m = h.idle_smt_mask();
        assert!(!m.test(0));
        assert!(!m.test(4));
        assert!(m.test(1) && m.test(5));
        assert_eq!(m.weight(), 6);
    }

    #[test]
    fn default_selection_prefers_prev() {
        let h = host();
        let t = Task::new(1, 1, "a", CpuMask::first_n(8));
        assert_eq!(h.select_cpu_dfl(&t, 3, 0), (3, true));
        assert_eq!(h.select_cpu_dfl(&t, 3, 0), (0, true));
        for cpu in 0..8 {
            h.set_idle(cpu, false);
        }
        assert_eq!(h.select_cpu_dfl(&t, 3, 0), (3, false));
    }

    #[test]
    fn parent_lookup() {
        let h = host();
        h.add_process(1, 1, "systemd");
        h.add_process(50, 1, "steam");
        h.add_process(51, 50, "reaper");
        assert_eq!(h.parent_of(51).unwrap().comm, Comm::new("steam"));
        assert_eq!(h.parent_of(1).unwrap().pid, 1);
        assert!(h.parent_of(99).is_none());
        h.remove_process(50);
        assert!(h.parent_of(51).is_none());
    }

    #[test]
    fn simulation_runs_and_balances_loads() {
        let topo = Arc::new(
            Preset::DualCcdX3d { cores_per_ccd: 4, smt: true, asymmetric_boost: false }
                .build()
                .unwrap(),
        );
        let host = Arc::new(SimHost::new(&topo));
        let engine = Arc::new(
            Engine::init(
                host,
                topo.clone(),
                EngineConfig::default(),
                Arc::new(TunablesCell::default()),
                Arc::new(Hints::default()),
            )
            .unwrap(),
        );
        let mut sim = Simulator::new(engine.clone(), &Scenario::gaming_desktop(12), 7);
        assert_eq!(engine.hints().containers.get(&600), Some(WorkloadClass::Ai));
        assert!(engine.hints().processes.is_empty());
        sim.run_for(1_000_000_000);

        assert!(sim.events_processed() > 1000);
        let c = engine.counters();
        assert!(c.enqueued.load(Ordering::Relaxed) > 0);
        assert!(c.direct_dispatched.load(Ordering::Relaxed) > 0);
        assert!(c.proton_tasks.load(Ordering::Relaxed) >= 1);
        assert!(c.gpu_feeder_tasks.load(Ordering::Relaxed) >= 1);
        assert!(c.ai_container_tasks.load(Ordering::Relaxed) >= 1);
        // batch jobs respawned, so their old slots were reclaimed
        assert!(engine.nr_tasks() <= sim.nr_tasks());

        // every running count is backed by a core that is running something
        let running: u64 = engine.state().domains.iter().map(|d| d.tasks()).sum();
        let busy = sim.cpus.iter().filter(|c| c.running.is_some()).count() as u64;
        assert_eq!(running, busy);
    }
}
