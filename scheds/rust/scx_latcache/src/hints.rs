// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Workload hints published by out-of-band providers.
//!
//! The engine only reads these. Providers replace whole maps through
//! `ArcSwap`, so a lookup on the scheduling path is a pointer load plus a
//! hash probe and never waits on a writer.

use std::hash::Hash;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    #[default]
    Unknown = 0,
    Gaming = 1,
    Interactive = 2,
    Batch = 3,
    Ai = 4,
    VmDev = 5,
    VmGaming = 6,
    Container = 7,
}

impl WorkloadClass {
    pub fn from_raw(raw: u32) -> Option<Self> {
        let class = match raw {
            0 => WorkloadClass::Unknown,
            1 => WorkloadClass::Gaming,
            2 => WorkloadClass::Interactive,
            3 => WorkloadClass::Batch,
            4 => WorkloadClass::Ai,
            5 => WorkloadClass::VmDev,
            6 => WorkloadClass::VmGaming,
            7 => WorkloadClass::Container,
            _ => return None,
        };
        Some(class)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::Unknown => "unknown",
            WorkloadClass::Gaming => "gaming",
            WorkloadClass::Interactive => "interactive",
            WorkloadClass::Batch => "batch",
            WorkloadClass::Ai => "ai",
            WorkloadClass::VmDev => "vm_dev",
            WorkloadClass::VmGaming => "vm_gaming",
            WorkloadClass::Container => "container",
        }
    }
}

/// Key to class map, replaced wholesale or edited copy-on-write.
pub struct HintTable<K> {
    map: ArcSwap<FxHashMap<K, WorkloadClass>>,
}

impl<K: Eq + Hash + Clone> Default for HintTable<K> {
    fn default() -> Self {
        Self {
            map: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }
}

impl<K: Eq + Hash + Clone> HintTable<K> {
    #[inline]
    pub fn get(&self, key: &K) -> Option<WorkloadClass> {
        self.map.load().get(key).copied()
    }

    pub fn insert(&self, key: K, class: WorkloadClass) {
        self.map.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(key.clone(), class);
            next
        });
    }

    pub fn remove(&self, key: &K) {
        self.map.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.remove(key);
            next
        });
    }

    pub fn replace(&self, entries: FxHashMap<K, WorkloadClass>) {
        self.map.store(Arc::new(entries));
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-core boost preference from firmware/driver (amd-pstate prefcore,
/// ITMT). Unknown cores rank 0.
#[derive(Default)]
pub struct BoostRankings {
    ranks: ArcSwap<Vec<u32>>,
}

impl BoostRankings {
    #[inline]
    pub fn get(&self, cpu: usize) -> u32 {
        self.ranks.load().get(cpu).copied().unwrap_or(0)
    }

    pub fn set_all(&self, ranks: Vec<u32>) {
        self.ranks.store(Arc::new(ranks));
    }
}

/// All hint sources the classifier and placement read.
#[derive(Default)]
pub struct Hints {
    /// Process-group id to class, from the process scanner.
    pub processes: HintTable<u32>,
    /// Thread id of a vCPU thread to class.
    pub vm_vcpus: HintTable<u32>,
    /// Process-group id to class, from the container detector.
    pub containers: HintTable<u32>,
    /// Default-hierarchy cgroup id to class.
    pub cgroups: HintTable<u64>,
    pub boost_ranks: BoostRankings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_raw_values() {
        for raw in 0..8 {
            assert_eq!(WorkloadClass::from_raw(raw).unwrap() as u32, raw);
        }
        assert!(WorkloadClass::from_raw(8).is_none());
        assert_eq!(WorkloadClass::VmGaming.as_str(), "vm_gaming");
    }

    #[test]
    fn table_edits() {
        let table: HintTable<u32> = HintTable::default();
        assert!(table.is_empty());
        table.insert(100, WorkloadClass::Gaming);
        table.insert(200, WorkloadClass::Ai);
        assert_eq!(table.get(&100), Some(WorkloadClass::Gaming));
        table.remove(&100);
        assert_eq!(table.get(&100), None);
        assert_eq!(table.len(), 1);

        let mut fresh = FxHashMap::default();
        fresh.insert(7, WorkloadClass::Container);
        table.replace(fresh);
        assert_eq!(table.get(&200), None);
        assert_eq!(table.get(&7), Some(WorkloadClass::Container));
    }

    #[test]
    fn rankings_default_zero() {
        let ranks = BoostRankings::default();
        assert_eq!(ranks.get(3), 0);
        ranks.set_all(vec![10, 20, 30, 40]);
        assert_eq!(ranks.get(3), 40);
        assert_eq!(ranks.get(4), 0);
    }
}
