// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Wake-up core selection.
//!
//! Two strategies share one idle search. Which strategy runs is decided once
//! from the topology: multi-domain cache parts get `CacheDomainPlacement`,
//! hybrid parts get `HybridPlacement`. A strategy returns a claimed idle
//! core or `None`, in which case the engine falls back to the host's default
//! selection.

use crate::config::EcoreOffload;
use crate::config::EngineConfig;
use crate::config::Tunables;
use crate::counters::Counters;
use crate::counters::RuntimeState;
use crate::cpumask::CpuMask;
use crate::events::EventKind;
use crate::events::EventStream;
use crate::events::SchedEvent;
use crate::hints::Hints;
use crate::hints::WorkloadClass;
use crate::host::SchedHost;
use crate::task::Task;
use crate::task::TaskCtx;
use crate::topology::Topology;

/// Cores an idle search may return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreSet {
    Domain(usize),
    Performance,
    Efficiency,
}

/// Everything a placement decision reads, borrowed from the engine for one
/// wake-up.
pub struct PlacementCtx<'a> {
    pub topo: &'a Topology,
    pub host: &'a dyn SchedHost,
    pub hints: &'a Hints,
    pub state: &'a RuntimeState,
    pub events: &'a EventStream,
    pub config: &'a EngineConfig,
    pub tunables: Tunables,
}

impl PlacementCtx<'_> {
    fn counters(&self) -> &Counters {
        &self.state.counters
    }

    fn set_mask(&self, set: CoreSet) -> Option<&CpuMask> {
        match set {
            CoreSet::Domain(d) => self.topo.domain_mask(d),
            CoreSet::Performance => Some(self.topo.pcore_mask()),
            CoreSet::Efficiency => Some(self.topo.ecore_mask()),
        }
    }

    /// Highest boost ranking in `pool`, first found on ties. Performance
    /// cores break remaining ties on the preferred-boost flag.
    fn best_ranked(&self, pool: &CpuMask, set: CoreSet) -> Option<(usize, u32)> {
        let mut best: Option<(usize, u32, bool)> = None;
        for cpu in pool.iter() {
            let rank = self.hints.boost_ranks.get(cpu);
            let turbo = set == CoreSet::Performance
                && self.topo.core(cpu).is_some_and(|c| c.preferred_boost);
            let better = match best {
                None => true,
                Some((_, best_rank, best_turbo)) => {
                    rank > best_rank || (rank == best_rank && turbo && !best_turbo)
                }
            };
            if better {
                best = Some((cpu, rank, turbo));
            }
        }
        best.map(|(cpu, rank, _)| (cpu, rank))
    }

    fn count_claim(&self, set: CoreSet, rank: u32, full_idle: bool) {
        let c = self.counters();
        if full_idle {
            Counters::inc(&c.smt_idle_picks);
        }
        match set {
            CoreSet::Domain(_) => {
                if rank > 0 {
                    Counters::inc(&c.prefcore_placements);
                }
            }
            CoreSet::Performance => Counters::inc(&c.pcore_placements),
            CoreSet::Efficiency => Counters::inc(&c.ecore_offloads),
        }
    }

    /// Two-pass idle search restricted to `set` and the task's allowed
    /// cores. The first pass only considers fully idle physical cores and
    /// runs when asked for and SMT is accounted. A lost claim ends the pass.
    pub fn pick_idle(&self, task: &Task, set: CoreSet, prefer_full_idle: bool) -> Option<usize> {
        let allowed = self.set_mask(set)?.and(&task.cpus_allowed);
        if allowed.is_empty() {
            return None;
        }

        if prefer_full_idle && self.topo.smt_enabled() && self.config.prefer_idle_smt {
            let pool = allowed.and(&self.host.idle_smt_mask());
            if let Some((cpu, rank)) = self.best_ranked(&pool, set) {
                if self.host.test_and_clear_cpu_idle(cpu) {
                    self.count_claim(set, rank, true);
                    return Some(cpu);
                }
            }
        }

        let pool = allowed.and(&self.host.idle_mask());
        let (cpu, rank) = self.best_ranked(&pool, set)?;
        if self.host.test_and_clear_cpu_idle(cpu) {
            self.count_claim(set, rank, false);
            return Some(cpu);
        }
        None
    }

    /// Fully idle pass, then any idle pass.
    fn pick_idle_both(&self, task: &Task, set: CoreSet) -> Option<usize> {
        self.pick_idle(task, set, true)
    }
}

pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, pcx: &PlacementCtx<'_>, task: &Task, ctx: &TaskCtx, prev_cpu: usize) -> Option<usize>;
}

/// Pick the strategy for a topology.
pub fn strategy_for(topo: &Topology) -> Box<dyn PlacementStrategy> {
    if topo.is_hybrid() {
        Box::new(HybridPlacement)
    } else {
        Box::new(CacheDomainPlacement)
    }
}

/// Multi-domain cache parts (X3D): gaming and interactive work goes to the
/// low-latency cache domain, other work is kept out of it while it hosts
/// gaming load, and work mode or asymmetric boost pull tasks to the
/// high-frequency domain.
pub struct CacheDomainPlacement;

impl PlacementStrategy for CacheDomainPlacement {
    fn name(&self) -> &'static str {
        "cache-domain"
    }

    fn select(&self, pcx: &PlacementCtx<'_>, task: &Task, ctx: &TaskCtx, prev_cpu: usize) -> Option<usize> {
        let topo = pcx.topo;
        let c = pcx.counters();
        let low_lat = topo.low_latency_domain();
        let prev_domain = topo.domain_of(prev_cpu)?;
        let wants = ctx.wants_low_latency();
        let work_mode = pcx.tunables.work_mode;
        let boost_domain = topo.freq_domain().filter(|_| pcx.config.asymmetric_boost);
        let low_lat_has_gaming = pcx.state.domain(low_lat).is_some_and(|l| l.gaming() > 0);

        if let (true, Some(freq)) = (work_mode, boost_domain) {
            if let Some(cpu) = pcx.pick_idle_both(task, CoreSet::Domain(freq)) {
                Counters::inc(&c.freq_domain_placements);
                return Some(cpu);
            }
        }

        if wants && !work_mode {
            if let Some(cpu) = pcx.pick_idle_both(task, CoreSet::Domain(low_lat)) {
                if prev_domain != low_lat {
                    Counters::inc(&c.low_latency_migrations);
                    pcx.events.emit(
                        SchedEvent::new(EventKind::DomainMigration, pcx.host.now_ns(), task.pid, cpu)
                            .domain(low_lat)
                            .values(prev_domain as u64, ctx.is_gaming() as u64),
                    );
                }
                return Some(cpu);
            }
        }

        if !wants && low_lat_has_gaming && prev_domain == low_lat {
            for d in (0..topo.nr_domains()).filter(|d| *d != low_lat) {
                if let Some(cpu) = pcx.pick_idle(task, CoreSet::Domain(d), false) {
                    Counters::inc(&c.compaction_overflows);
                    return Some(cpu);
                }
            }
        }

        if let Some(freq) = boost_domain {
            if !wants && ctx.workload() == WorkloadClass::Batch {
                if let Some(cpu) = pcx.pick_idle(task, CoreSet::Domain(freq), false) {
                    Counters::inc(&c.freq_domain_placements);
                    return Some(cpu);
                }
            }
        }

        if let Some(cpu) = pcx.pick_idle(task, CoreSet::Domain(prev_domain), wants) {
            Counters::inc(&c.domain_local);
            return Some(cpu);
        }

        for d in (0..topo.nr_domains()).filter(|d| *d != prev_domain) {
            if let Some(cpu) = pcx.pick_idle(task, CoreSet::Domain(d), false) {
                Counters::inc(&c.domain_cross);
                return Some(cpu);
            }
        }
        None
    }
}

/// Hybrid parts: gaming and interactive work on performance cores, batch
/// work offloaded to efficiency cores per the offload policy.
pub struct HybridPlacement;

impl HybridPlacement {
    fn should_offload(mode: EcoreOffload, ctx: &TaskCtx) -> bool {
        if ctx.is_gaming() || ctx.is_interactive() {
            return false;
        }
        match mode {
            EcoreOffload::Disabled => false,
            EcoreOffload::Aggressive => true,
            EcoreOffload::Conservative => {
                matches!(ctx.workload(), WorkloadClass::Batch | WorkloadClass::Container)
            }
        }
    }
}

impl PlacementStrategy for HybridPlacement {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn select(&self, pcx: &PlacementCtx<'_>, task: &Task, ctx: &TaskCtx, _prev_cpu: usize) -> Option<usize> {
        if ctx.wants_low_latency() {
            if let Some(cpu) = pcx.pick_idle_both(task, CoreSet::Performance) {
                return Some(cpu);
            }
        }
        if Self::should_offload(pcx.config.ecore_offload, ctx) {
            return pcx.pick_idle(task, CoreSet::Efficiency, false);
        }
        None
    }
}
