// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use anyhow::Result;
use chrono::Local;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

use crate::counters::Counters;
use crate::engine::Engine;
use crate::host::SchedHost;

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Tasks enqueued in interval")]
    pub enqueued: u64,
    #[stat(desc = "Tasks dispatched from queues in interval")]
    pub dispatched: u64,
    #[stat(desc = "Direct placements at wake-up in interval")]
    pub direct: u64,
    #[stat(desc = "Gaming enqueues in interval")]
    pub gaming: u64,
    #[stat(desc = "Interactive enqueues in interval")]
    pub interactive: u64,
    #[stat(desc = "Proton/Wine classifications in interval")]
    pub proton: u64,
    #[stat(desc = "GPU submission threads seen in interval")]
    pub gpu_feeders: u64,
    #[stat(desc = "Gaming detections from process hints in interval")]
    pub hint_detects: u64,
    #[stat(desc = "Gaming detections from ancestors in interval")]
    pub parent_chain: u64,
    #[stat(desc = "Cgroup hint hits in interval")]
    pub cgroup_hits: u64,
    #[stat(desc = "VM vCPU hint hits in interval")]
    pub vm_vcpus: u64,
    #[stat(desc = "Container hint hits in interval")]
    pub containers: u64,
    #[stat(desc = "Moves into the low-latency domain in interval")]
    pub ll_migrations: u64,
    #[stat(desc = "Placements in the previous domain in interval")]
    pub domain_local: u64,
    #[stat(desc = "Placements in another domain in interval")]
    pub domain_cross: u64,
    #[stat(desc = "Fully idle physical core picks in interval")]
    pub smt_idle: u64,
    #[stat(desc = "Boost-ranked core picks in interval")]
    pub prefcore: u64,
    #[stat(desc = "Tasks steered out of the low-latency domain in interval")]
    pub compaction: u64,
    #[stat(desc = "Preemption kicks in interval")]
    pub preempt_kicks: u64,
    #[stat(desc = "P-core placements in interval")]
    pub pcore: u64,
    #[stat(desc = "E-core offloads in interval")]
    pub ecore: u64,
    #[stat(desc = "High-frequency domain placements in interval")]
    pub freq_domain: u64,
    #[stat(desc = "Domain imbalance reports in interval")]
    pub imbalance: u64,
    #[stat(desc = "Gaming tasks descheduled while runnable in interval")]
    pub gaming_preempted: u64,
    #[stat(desc = "Gaming wake-ups over 1ms in interval")]
    pub late_frames: u64,
    #[stat(desc = "Average wake-to-run latency (us)")]
    pub latency_avg_us: u64,
    #[stat(desc = "Largest wake-to-run latency since start (us)")]
    pub latency_max_us: u64,
    #[stat(desc = "Smallest wake-to-run latency since start (us)")]
    pub latency_min_us: u64,
    #[stat(desc = "Average gaming latency (us)")]
    pub gaming_latency_avg_us: u64,
    #[stat(desc = "Gaming latency standard deviation (us)")]
    pub gaming_jitter_us: f64,
    #[stat(desc = "Events dropped since start")]
    pub events_dropped: u64,
    #[stat(desc = "Tracked tasks (live)")]
    pub tasks: u64,
    #[stat(desc = "Queued tasks (live)")]
    pub queued: u64,
    #[stat(desc = "Per-domain running/gaming counts (live)")]
    pub domains: String,

    #[stat(desc = "Latency sum (ns, total)")]
    pub latency_sum_ns: u64,
    #[stat(desc = "Latency samples (total)")]
    pub latency_count: u64,
    #[stat(desc = "Gaming latency sum (ns, total)")]
    pub gaming_latency_sum_ns: u64,
    #[stat(desc = "Gaming latency samples (total)")]
    pub gaming_latency_count: u64,
    #[stat(desc = "Gaming latency sum of squares (us^2, total)")]
    pub gaming_latency_sum_sq_us: u64,
}

/// Mean and standard deviation in microseconds from raw sums.
fn latency_moments(sum_ns: u64, sum_sq_us: u64, count: u64) -> (u64, f64) {
    if count == 0 {
        return (0, 0.0);
    }
    let mean_us = (sum_ns as f64) / 1000.0 / count as f64;
    let var = (sum_sq_us as f64) / count as f64 - mean_us * mean_us;
    (mean_us as u64, var.max(0.0).sqrt())
}

impl Metrics {
    /// Snapshot of the engine's cumulative counters.
    pub fn from_engine<H: SchedHost>(engine: &Engine<H>) -> Self {
        let c = engine.counters();
        let get = Counters::get;
        let low_lat = engine.topology().low_latency_domain();
        let domains = engine
            .state()
            .domains
            .iter()
            .enumerate()
            .map(|(d, l)| {
                format!(
                    "D{}{}:{}/{}",
                    d,
                    if d == low_lat { "*" } else { "" },
                    l.tasks(),
                    l.gaming()
                )
            })
            .collect::<Vec<_>>()
            .join(" ");

        let mut m = Self {
            enqueued: get(&c.enqueued),
            dispatched: get(&c.dispatched),
            direct: get(&c.direct_dispatched),
            gaming: get(&c.gaming_enqueued),
            interactive: get(&c.interactive_enqueued),
            proton: get(&c.proton_tasks),
            gpu_feeders: get(&c.gpu_feeder_tasks),
            hint_detects: get(&c.hint_detects),
            parent_chain: get(&c.parent_chain_detects),
            cgroup_hits: get(&c.cgroup_classifications),
            vm_vcpus: get(&c.vm_vcpu_tasks),
            containers: get(&c.container_tasks),
            ll_migrations: get(&c.low_latency_migrations),
            domain_local: get(&c.domain_local),
            domain_cross: get(&c.domain_cross),
            smt_idle: get(&c.smt_idle_picks),
            prefcore: get(&c.prefcore_placements),
            compaction: get(&c.compaction_overflows),
            preempt_kicks: get(&c.preempt_kicks),
            pcore: get(&c.pcore_placements),
            ecore: get(&c.ecore_offloads),
            freq_domain: get(&c.freq_domain_placements),
            imbalance: get(&c.imbalance_events),
            gaming_preempted: get(&c.gaming_preempted),
            late_frames: get(&c.gaming_late_frames),
            latency_max_us: get(&c.latency_max_ns) / 1000,
            latency_min_us: get(&c.latency_min_ns) / 1000,
            events_dropped: engine.events().dropped(),
            tasks: engine.nr_tasks() as u64,
            queued: engine.queued_total() as u64,
            domains,
            latency_sum_ns: get(&c.latency_sum_ns),
            latency_count: get(&c.latency_count),
            gaming_latency_sum_ns: get(&c.gaming_latency_sum_ns),
            gaming_latency_count: get(&c.gaming_latency_count),
            gaming_latency_sum_sq_us: get(&c.gaming_latency_sum_sq_us),
            ..Default::default()
        };
        m.latency_avg_us = latency_moments(m.latency_sum_ns, 0, m.latency_count).0;
        (m.gaming_latency_avg_us, m.gaming_jitter_us) = latency_moments(
            m.gaming_latency_sum_ns,
            m.gaming_latency_sum_sq_us,
            m.gaming_latency_count,
        );
        m
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let direct_pct = if self.enqueued + self.direct > 0 {
            (self.direct as f64) * 100.0 / (self.enqueued + self.direct) as f64
        } else {
            0.0
        };
        let local_pct = if self.domain_local + self.domain_cross > 0 {
            (self.domain_local as f64) * 100.0 / (self.domain_local + self.domain_cross) as f64
        } else {
            0.0
        };

        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::SCHEDULER_NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ q: enq {:>6}  dsp {:>6}  dir {:>6} ({:>4.0}%)  queued {:>4}  tasks {:>5}",
            self.enqueued, self.dispatched, self.direct, direct_pct, self.queued, self.tasks
        )?;
        writeln!(
            w,
            "│ class: game {:>6}  inter {:>6}  proton {:>3}  gpu {:>3}  hint {:>3}  parent {:>3}  cg {:>3}  vm {:>3}  ctr {:>3}",
            self.gaming,
            self.interactive,
            self.proton,
            self.gpu_feeders,
            self.hint_detects,
            self.parent_chain,
            self.cgroup_hits,
            self.vm_vcpus,
            self.containers
        )?;
        writeln!(
            w,
            "│ place: local {:>6} ({:>4.0}%)  cross {:>6}  ll_mig {:>5}  smt {:>5}  pref {:>5}  compact {:>5}",
            self.domain_local,
            local_pct,
            self.domain_cross,
            self.ll_migrations,
            self.smt_idle,
            self.prefcore,
            self.compaction
        )?;
        writeln!(
            w,
            "│ core: pcore {:>5}  ecore {:>5}  freq {:>5}   kicks {:>5}  preempted {:>5}  imbal {:>3}",
            self.pcore, self.ecore, self.freq_domain, self.preempt_kicks, self.gaming_preempted, self.imbalance
        )?;
        writeln!(
            w,
            "│ lat: avg {:>5}us  min {:>5}us  max {:>6}us   game avg {:>5}us  jitter {:>6.1}us  late {:>4}",
            self.latency_avg_us,
            self.latency_min_us,
            self.latency_max_us,
            self.gaming_latency_avg_us,
            self.gaming_jitter_us,
            self.late_frames
        )?;
        writeln!(w, "│ domains: {}  drops {}", self.domains, self.events_dropped)?;
        writeln!(w, "└─")?;
        Ok(())
    }

    pub fn delta(&self, prev: &Self) -> Self {
        let latency_sum_ns = self.latency_sum_ns.saturating_sub(prev.latency_sum_ns);
        let latency_count = self.latency_count.saturating_sub(prev.latency_count);
        let gaming_sum_ns = self.gaming_latency_sum_ns.saturating_sub(prev.gaming_latency_sum_ns);
        let gaming_sum_sq = self
            .gaming_latency_sum_sq_us
            .saturating_sub(prev.gaming_latency_sum_sq_us);
        let gaming_count = self.gaming_latency_count.saturating_sub(prev.gaming_latency_count);
        let (gaming_latency_avg_us, gaming_jitter_us) =
            latency_moments(gaming_sum_ns, gaming_sum_sq, gaming_count);

        Self {
            enqueued: self.enqueued.saturating_sub(prev.enqueued),
            dispatched: self.dispatched.saturating_sub(prev.dispatched),
            direct: self.direct.saturating_sub(prev.direct),
            gaming: self.gaming.saturating_sub(prev.gaming),
            interactive: self.interactive.saturating_sub(prev.interactive),
            proton: self.proton.saturating_sub(prev.proton),
            gpu_feeders: self.gpu_feeders.saturating_sub(prev.gpu_feeders),
            hint_detects: self.hint_detects.saturating_sub(prev.hint_detects),
            parent_chain: self.parent_chain.saturating_sub(prev.parent_chain),
            cgroup_hits: self.cgroup_hits.saturating_sub(prev.cgroup_hits),
            vm_vcpus: self.vm_vcpus.saturating_sub(prev.vm_vcpus),
            containers: self.containers.saturating_sub(prev.containers),
            ll_migrations: self.ll_migrations.saturating_sub(prev.ll_migrations),
            domain_local: self.domain_local.saturating_sub(prev.domain_local),
            domain_cross: self.domain_cross.saturating_sub(prev.domain_cross),
            smt_idle: self.smt_idle.saturating_sub(prev.smt_idle),
            prefcore: self.prefcore.saturating_sub(prev.prefcore),
            compaction: self.compaction.saturating_sub(prev.compaction),
            preempt_kicks: self.preempt_kicks.saturating_sub(prev.preempt_kicks),
            pcore: self.pcore.saturating_sub(prev.pcore),
            ecore: self.ecore.saturating_sub(prev.ecore),
            freq_domain: self.freq_domain.saturating_sub(prev.freq_domain),
            imbalance: self.imbalance.saturating_sub(prev.imbalance),
            gaming_preempted: self.gaming_preempted.saturating_sub(prev.gaming_preempted),
            late_frames: self.late_frames.saturating_sub(prev.late_frames),
            latency_avg_us: latency_moments(latency_sum_ns, 0, latency_count).0,
            latency_max_us: self.latency_max_us,
            latency_min_us: self.latency_min_us,
            gaming_latency_avg_us,
            gaming_jitter_us,
            events_dropped: self.events_dropped,
            tasks: self.tasks,
            queued: self.queued,
            domains: self.domains.clone(),

            // Totals stay cumulative so the next delta can be taken.
            latency_sum_ns: self.latency_sum_ns,
            latency_count: self.latency_count,
            gaming_latency_sum_ns: self.gaming_latency_sum_ns,
            gaming_latency_count: self.gaming_latency_count,
            gaming_latency_sum_sq_us: self.gaming_latency_sum_sq_us,
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}
