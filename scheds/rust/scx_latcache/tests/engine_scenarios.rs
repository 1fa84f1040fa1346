// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use scx_latcache::config::EngineConfig;
use scx_latcache::config::TunablesCell;
use scx_latcache::counters::Counters;
use scx_latcache::cpumask::CpuMask;
use scx_latcache::dsq::DsqId;
use scx_latcache::events::EventKind;
use scx_latcache::hints::Hints;
use scx_latcache::hints::WorkloadClass;
use scx_latcache::host::KickFlags;
use scx_latcache::host::SchedHost;
use scx_latcache::profiles::ProfileManager;
use scx_latcache::sim::Scenario;
use scx_latcache::sim::SimHost;
use scx_latcache::sim::Simulator;
use scx_latcache::task::Task;
use scx_latcache::task::TaskFlags;
use scx_latcache::topology::Preset;
use scx_latcache::Engine;

fn engine_with(preset: Preset, config: EngineConfig) -> Engine<SimHost> {
    let topo = Arc::new(preset.build().unwrap());
    let host = Arc::new(SimHost::new(&topo));
    Engine::init(
        host,
        topo,
        config,
        Arc::new(TunablesCell::default()),
        Arc::new(Hints::default()),
    )
    .unwrap()
}

/// Two 4-core domains without SMT: cpus 0-3 are the cache domain.
fn dual() -> Engine<SimHost> {
    engine_with(
        Preset::DualCcdX3d { cores_per_ccd: 4, smt: false, asymmetric_boost: false },
        EngineConfig::default(),
    )
}

fn task(e: &Engine<SimHost>, pid: u32, name: &str, cpu: usize) -> Task {
    Task::new(pid, pid, name, e.topology().all_cpus()).on_cpu(cpu)
}

fn events_of(e: &Engine<SimHost>, kind: EventKind) -> Vec<scx_latcache::events::SchedEvent> {
    let mut out = Vec::new();
    e.events().drain(|ev| {
        if ev.kind == kind {
            out.push(ev);
        }
    });
    out
}

#[test]
fn wine_is_proton_gaming() {
    let e = dual();
    e.select_cpu(&task(&e, 100, "wine64", 5), 5, 0);
    let snap = e.task(100).unwrap();
    assert!(snap.flags.contains(TaskFlags::CLASS_GAMING | TaskFlags::PROTON));
    assert!(!snap.flags.contains(TaskFlags::GPU_FEEDER));
    assert_eq!(snap.workload, WorkloadClass::Gaming);
    assert_eq!(Counters::get(&e.counters().proton_tasks), 1);
}

#[test]
fn vulkan_thread_is_promoted() {
    let e = dual();
    e.select_cpu(&task(&e, 101, "vkThread0", 5), 5, 0);
    let snap = e.task(101).unwrap();
    assert!(snap.flags.contains(TaskFlags::CLASS_GAMING | TaskFlags::GPU_FEEDER));
    assert!(!snap.flags.contains(TaskFlags::PROTON));
    assert_eq!(Counters::get(&e.counters().gpu_feeder_tasks), 1);
}

#[test]
fn short_bursts_are_interactive() {
    let e = dual();
    let t = task(&e, 102, "kwrite", 5);
    e.select_cpu(&t, 5, 0);
    e.host().set_now(1_000_000);
    e.running(&t);
    e.host().set_now(1_500_000);
    e.stopping(&t, true);
    assert_eq!(e.task(102).unwrap().burst_ns, 500_000);

    e.select_cpu(&t, 5, 0);
    let snap = e.task(102).unwrap();
    assert!(!snap.flags.contains(TaskFlags::GAMING));
    assert!(snap.flags.contains(TaskFlags::INTERACTIVE));
    assert!(snap.flags.contains(TaskFlags::WANTS_LOW_LAT));
}

#[test]
fn low_latency_wish_follows_mode() {
    let e = dual();
    let names = ["wine64", "vkThread0", "bash", "steamwebhelper", "make"];
    for gaming_mode in [true, false] {
        e.tunables().update(|t| t.gaming_mode = gaming_mode);
        for (i, name) in names.iter().enumerate() {
            let pid = 200 + i as u32;
            let t = task(&e, pid, name, 6);
            e.select_cpu(&t, 6, 0);
            let first = e.task(pid).unwrap();
            e.select_cpu(&t, 6, 0);
            let second = e.task(pid).unwrap();
            assert_eq!(first.flags, second.flags);
            assert_eq!(first.workload, second.workload);

            let f = second.flags;
            let is_gaming = f.contains(TaskFlags::GAMING);
            let is_interactive = f.contains(TaskFlags::INTERACTIVE);
            assert_eq!(is_gaming, gaming_mode && f.contains(TaskFlags::CLASS_GAMING));
            assert_eq!(
                f.contains(TaskFlags::WANTS_LOW_LAT),
                is_gaming || (is_interactive && gaming_mode)
            );
            for cpu in 0..8 {
                e.host().set_idle(cpu, true);
            }
            e.host().take_inserts();
        }
    }
}

#[test]
fn full_cache_domain_spills_across() {
    let e = dual();
    for cpu in 0..4 {
        e.host().set_idle(cpu, false);
    }
    let cpu = e.select_cpu(&task(&e, 300, "wine64", 1), 1, 0);
    assert_eq!(e.topology().domain_of(cpu), Some(1));
    assert_eq!(Counters::get(&e.counters().domain_cross), 1);
    assert_eq!(Counters::get(&e.counters().domain_local), 0);
    assert_eq!(Counters::get(&e.counters().direct_dispatched), 1);
}

#[test]
fn idle_pick_respects_affinity() {
    let e = engine_with(
        Preset::DualCcdX3d { cores_per_ccd: 4, smt: true, asymmetric_boost: false },
        EngineConfig::default(),
    );
    let nr_cpus = e.topology().nr_cpus();
    let names = ["wine64", "make", "bash", "vkThread0"];
    let mut rng = StdRng::seed_from_u64(42);

    for pid in 1..400u32 {
        let mut allowed = CpuMask::new();
        while allowed.is_empty() {
            for cpu in 0..nr_cpus {
                if rng.gen_bool(0.3) {
                    allowed.set(cpu);
                }
            }
        }
        for cpu in 0..nr_cpus {
            e.host().set_idle(cpu, rng.gen_bool(0.5));
        }
        let prev = allowed.iter().next().unwrap();
        let name = names[pid as usize % names.len()];
        let mut t = Task::new(pid, pid, name, allowed);
        t.cpu = prev;

        let cpu = e.select_cpu(&t, prev, 0);
        assert!(allowed.test(cpu), "pid {} got cpu {} outside {:?}", pid, cpu, allowed);
        for ins in e.host().take_inserts() {
            assert!(allowed.test(ins.cpu));
            assert!(!e.host().is_idle(ins.cpu));
        }
    }
}

#[test]
fn gaming_dispatches_before_earlier_batch() {
    let e = dual();
    let batch = task(&e, 400, "cc1plus", 2);
    e.select_cpu(&batch, 2, 0);
    e.host().set_now(1_000);
    e.running(&batch);
    e.host().set_now(4_001_000);
    e.stopping(&batch, true);
    e.enqueue(&batch);

    let game = task(&e, 401, "wine64", 3);
    e.select_cpu(&game, 3, 0);
    e.enqueue(&game);
    assert_eq!(e.queued(DsqId::Domain(0)), 2);

    assert_eq!(e.dispatch(0).unwrap().pid, 401);
    assert_eq!(e.dispatch(0).unwrap().pid, 400);
    assert!(e.dispatch(0).is_none());
}

#[test]
fn preemption_only_for_lower_priority_victims() {
    let e = dual();
    // domain 0 fully occupied by gaming work
    for cpu in 0..4 {
        let g = task(&e, 500 + cpu as u32, "wine64", cpu);
        e.select_cpu(&g, cpu, 0);
        e.running(&g);
    }
    e.host().take_kicks();
    let waker = task(&e, 510, "wine64", 6);
    e.select_cpu(&waker, 6, 0);
    e.enqueue(&waker);
    assert!(e.host().take_kicks().is_empty());
    assert_eq!(Counters::get(&e.counters().preempt_kicks), 0);

    // swap one gaming task for batch work
    let g = task(&e, 502, "wine64", 2);
    e.stopping(&g, false);
    let b = task(&e, 520, "cc1plus", 2);
    e.running(&b);

    let waker = task(&e, 511, "wine64", 6);
    e.select_cpu(&waker, 6, 0);
    e.enqueue(&waker);
    assert_eq!(e.host().take_kicks(), vec![(2, KickFlags::PREEMPT)]);
    assert_eq!(Counters::get(&e.counters().preempt_kicks), 1);
    assert_eq!(events_of(&e, EventKind::PreemptKick).len(), 1);
}

#[test]
fn imbalance_names_both_domains() {
    let e = dual();
    for _ in 0..40 {
        e.state().domains[0].start(false);
    }
    for _ in 0..5 {
        e.state().domains[1].start(false);
    }
    e.tick(0);
    let ev = events_of(&e, EventKind::DomainImbalance);
    assert_eq!(ev.len(), 1);
    assert_eq!((ev[0].domain, ev[0].peer_domain), (0, 1));
    assert_eq!((ev[0].value1, ev[0].value2), (40, 5));
    assert_eq!(ev[0].to_string(), "Domain imbalance: D0 has 40 tasks vs 5 on D1");

    // 3x is below the ratio
    for _ in 0..27 {
        e.state().domains[0].stop(false);
    }
    e.tick(0);
    assert!(events_of(&e, EventKind::DomainImbalance).is_empty());

    // 13 vs 52: the frequency domain is now the heavy one
    for _ in 0..47 {
        e.state().domains[1].start(false);
    }
    e.tick(0);
    let ev = events_of(&e, EventKind::DomainImbalance);
    assert_eq!(ev.len(), 1);
    assert_eq!((ev[0].domain, ev[0].peer_domain), (1, 0));
    assert_eq!((ev[0].value1, ev[0].value2), (52, 13));
}

#[test]
fn loads_never_go_negative() {
    let e = dual();
    let mut rng = StdRng::seed_from_u64(9);
    let tasks: Vec<Task> = (0..16u32)
        .map(|i| task(&e, 600 + i, if i % 2 == 0 { "wine64" } else { "make" }, i as usize % 8))
        .collect();
    for t in &tasks {
        e.select_cpu(t, t.cpu, 0);
    }
    for _ in 0..2000 {
        let t = &tasks[rng.gen_range(0..tasks.len())];
        if rng.gen_bool(0.5) {
            e.running(t);
        } else {
            e.stopping(t, rng.gen_bool(0.5));
        }
        for d in &e.state().domains {
            assert!(d.tasks() < 1 << 32);
            assert!(d.gaming() <= 1 << 32);
        }
    }
    while e.state().domains.iter().any(|d| d.tasks() > 0 || d.gaming() > 0) {
        for t in &tasks {
            e.stopping(t, false);
        }
    }
    for d in &e.state().domains {
        assert_eq!(d.tasks(), 0);
        assert_eq!(d.gaming(), 0);
    }
}

#[test]
fn hybrid_offloads_batch_to_ecores() {
    let e = engine_with(Preset::Hybrid { pcores: 2, ecores: 4 }, EngineConfig::default());
    let c = e.counters();

    // a fresh task has no burst yet and counts as interactive
    let t = task(&e, 700, "cc1plus", 0);
    let cpu = e.select_cpu(&t, 0, 0);
    assert!(e.topology().pcore_mask().test(cpu));
    assert_eq!(Counters::get(&c.pcore_placements), 1);

    e.host().set_now(1_000);
    e.running(&t);
    e.host().set_now(10_001_000);
    e.stopping(&t, true);
    for cpu in 0..e.topology().nr_cpus() {
        e.host().set_idle(cpu, true);
    }

    let cpu = e.select_cpu(&t, 0, 0);
    assert!(e.topology().ecore_mask().test(cpu));
    assert_eq!(Counters::get(&c.ecore_offloads), 1);

    let g = task(&e, 701, "wine64", 5);
    let cpu = e.select_cpu(&g, 5, 0);
    assert!(e.topology().pcore_mask().test(cpu));
    assert_eq!(Counters::get(&c.pcore_placements), 2);
}

#[test]
fn simulated_desktop_with_profile() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("game.json"),
        r#"{ "name": "Test Game", "exe_name": "Game.exe", "tunables": { "slice_ns": 2000000 } }"#,
    )
    .unwrap();

    let topo = Arc::new(
        Preset::DualCcdX3d { cores_per_ccd: 4, smt: true, asymmetric_boost: true }
            .build()
            .unwrap(),
    );
    let config = EngineConfig {
        asymmetric_boost: true,
        ..Default::default()
    };
    let host = Arc::new(SimHost::new(&topo));
    let engine = Arc::new(
        Engine::init(
            host,
            topo,
            config,
            Arc::new(TunablesCell::default()),
            Arc::new(Hints::default()),
        )
        .unwrap(),
    );
    let mut sim = Simulator::new(engine.clone(), &Scenario::gaming_desktop(10), 3)
        .with_profiles(ProfileManager::new(dir.path()).unwrap());
    sim.run_for(500_000_000);

    assert_eq!(engine.tunables().load().slice_ns, 2_000_000);
    assert_eq!(events_of(&engine, EventKind::ProfileMatch).len(), 1);
    let c = engine.counters();
    assert!(c.latency_count.load(Ordering::Relaxed) > 0);
    assert!(c.dispatched.load(Ordering::Relaxed) > 0);
    assert!(engine.host().now_ns() >= 500_000_000);

    engine.exit("test done");
    let dump = engine.dump();
    assert!(dump.contains("D0:"));
    assert!(dump.contains("[low-latency]"));
}
