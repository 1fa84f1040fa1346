// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::counters::PrioClass;
use crate::counters::RuntimeState;
use crate::topology::Topology;

/// Pick the core in `domain` running the least urgent task that is strictly
/// less urgent than `waker`. Among equals the last core scanned wins. Cores
/// with nothing tracked running are not candidates.
pub fn find_victim(
    topo: &Topology,
    state: &RuntimeState,
    domain: usize,
    waker: PrioClass,
) -> Option<usize> {
    let mask = topo.domain_mask(domain)?;
    let mut victim = None;
    let mut worst = waker;

    for cpu in mask.iter() {
        let Some((_, prio)) = state.core(cpu).and_then(|c| c.run.current()) else {
            continue;
        };
        if prio > waker && prio >= worst {
            worst = prio;
            victim = Some(cpu);
        }
    }
    victim
}
