// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Workload classification.
//!
//! Sources are tried from cheapest to most expensive and the first gaming
//! hit wins: task name (and GPU submission name), process hint, cgroup hint,
//! ancestor names, VM vCPU hint. Tasks that are not gaming get a workload
//! class from VM, container or cgroup hints, defaulting to batch.
//!
//! The result is cached in the task's state and never recomputed for the
//! lifetime of the task.

use std::sync::atomic::Ordering;

use crate::counters::Counters;
use crate::events::EventKind;
use crate::events::EventStream;
use crate::events::SchedEvent;
use crate::hints::Hints;
use crate::hints::WorkloadClass;
use crate::host::SchedHost;
use crate::patterns::is_gpu_feeder;
use crate::patterns::match_gaming;
use crate::patterns::GameHit;
use crate::task::Task;
use crate::task::TaskCtx;
use crate::task::TaskFlags;

/// Ancestors inspected by the parent-chain step.
pub const MAX_ANCESTORS: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub is_gaming: bool,
    pub is_proton: bool,
    pub is_gpu_feeder: bool,
    pub workload: WorkloadClass,
}

impl Classification {
    fn gaming(hit: GameHit, gpu_feeder: bool) -> Self {
        Self {
            is_gaming: true,
            is_proton: hit == GameHit::Translated,
            is_gpu_feeder: gpu_feeder,
            workload: WorkloadClass::Gaming,
        }
    }

    fn other(workload: WorkloadClass) -> Self {
        Self {
            workload,
            ..Default::default()
        }
    }

    fn cached(ctx: &TaskCtx) -> Self {
        let flags = ctx.flags();
        Self {
            is_gaming: flags.contains(TaskFlags::CLASS_GAMING),
            is_proton: flags.contains(TaskFlags::PROTON),
            is_gpu_feeder: flags.contains(TaskFlags::GPU_FEEDER),
            workload: ctx.workload(),
        }
    }
}

/// Borrowed view of everything the cascade reads or bumps.
pub struct Classifier<'a> {
    pub hints: &'a Hints,
    pub counters: &'a Counters,
    pub events: &'a EventStream,
    pub host: &'a dyn SchedHost,
}

impl Classifier<'_> {
    /// Classify `task`, using and filling the cache in `ctx`. Without state
    /// the cascade runs every time and nothing is remembered.
    pub fn classify(&self, task: &Task, ctx: Option<&TaskCtx>) -> Classification {
        if let Some(ctx) = ctx {
            if ctx.has(TaskFlags::CLASSIFIED) {
                return Classification::cached(ctx);
            }
        }

        let result = self.cascade(task);

        if let Some(ctx) = ctx {
            ctx.set_flags(TaskFlags::CLASS_GAMING, result.is_gaming);
            ctx.set_flags(TaskFlags::PROTON, result.is_proton);
            ctx.set_flags(TaskFlags::GPU_FEEDER, result.is_gpu_feeder);
            ctx.set_workload(result.workload);
            ctx.classified_at.store(self.host.now_ns(), Ordering::Relaxed);
            ctx.set_flags(TaskFlags::CLASSIFIED, true);

            if result.is_gaming {
                let ev = SchedEvent::new(EventKind::GamingDetected, self.host.now_ns(), task.tgid, task.cpu)
                    .values(if result.is_proton { 2 } else { 1 }, result.is_gpu_feeder as u64)
                    .comm(task.comm);
                self.events.emit(ev);
            }
        }
        if result.is_proton {
            Counters::inc(&self.counters.proton_tasks);
        }
        result
    }

    fn cascade(&self, task: &Task) -> Classification {
        let c = self.counters;
        let name = task.comm.as_bytes();

        let mut hit = match_gaming(name);
        let gpu_feeder = is_gpu_feeder(name);
        if gpu_feeder {
            Counters::inc(&c.gpu_feeder_tasks);
            hit.get_or_insert(GameHit::Native);
        }
        if let Some(hit) = hit {
            return Classification::gaming(hit, gpu_feeder);
        }

        if self.hints.processes.get(&task.tgid) == Some(WorkloadClass::Gaming) {
            Counters::inc(&c.hint_detects);
            return Classification::gaming(GameHit::Native, false);
        }

        let cgroup = self.cgroup_class(task);
        if cgroup == Some(WorkloadClass::Gaming) {
            return Classification::gaming(GameHit::Native, false);
        }

        if let Some(hit) = self.ancestor_hit(task) {
            Counters::inc(&c.parent_chain_detects);
            return Classification::gaming(hit, false);
        }

        let vm = self.vm_class(task);
        if vm == Some(WorkloadClass::VmGaming) {
            return Classification::gaming(GameHit::Native, false);
        }

        let specific = |class: &WorkloadClass| {
            *class != WorkloadClass::Unknown && *class != WorkloadClass::Gaming
        };
        let workload = vm
            .filter(specific)
            .or_else(|| self.container_class(task).filter(|c| *c != WorkloadClass::Unknown))
            .or_else(|| self.cgroup_class(task).filter(specific))
            .unwrap_or(WorkloadClass::Batch);
        Classification::other(workload)
    }

    fn cgroup_class(&self, task: &Task) -> Option<WorkloadClass> {
        if task.cgroup_id == 0 {
            return None;
        }
        let class = self.hints.cgroups.get(&task.cgroup_id)?;
        Counters::inc(&self.counters.cgroup_classifications);
        if class == WorkloadClass::Gaming {
            Counters::inc(&self.counters.cgroup_gaming);
        }
        Some(class)
    }

    fn vm_class(&self, task: &Task) -> Option<WorkloadClass> {
        let class = self.hints.vm_vcpus.get(&task.pid)?;
        Counters::inc(&self.counters.vm_vcpu_tasks);
        match class {
            WorkloadClass::VmGaming => Counters::inc(&self.counters.gaming_vm_vcpus),
            WorkloadClass::VmDev => Counters::inc(&self.counters.dev_vm_vcpus),
            _ => {}
        }
        Some(class)
    }

    fn container_class(&self, task: &Task) -> Option<WorkloadClass> {
        let class = self.hints.containers.get(&task.tgid)?;
        Counters::inc(&self.counters.container_tasks);
        if class == WorkloadClass::Ai {
            Counters::inc(&self.counters.ai_container_tasks);
        }
        Some(class)
    }

    fn ancestor_hit(&self, task: &Task) -> Option<GameHit> {
        let mut parent = self.host.parent_of(task.pid)?;
        for _ in 0..MAX_ANCESTORS {
            if let Some(hit) = match_gaming(parent.comm.as_bytes()) {
                return Some(hit);
            }
            match self.host.parent_of(parent.pid) {
                Some(next) if next.pid != parent.pid => parent = next,
                _ => break,
            }
        }
        None
    }
}
