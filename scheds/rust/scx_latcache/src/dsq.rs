// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dispatch queues.
//!
//! One virtual-time ordered queue per domain plus a shared fallback queue.
//! Equal keys keep insertion order. Each queue sits behind its own spinlock,
//! held only for a heap push or pop, like the host's own queue locks.

use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use spin::Mutex;

use crate::error::EngineError;
use crate::topology::Topology;
use crate::topology::MAX_DOMAINS;

pub const FALLBACK_DSQ: u64 = 0;
pub const DOMAIN_DSQ_BASE: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DsqId {
    Fallback,
    Domain(usize),
}

impl DsqId {
    /// Domains beyond the supported range share the fallback queue.
    pub fn for_domain(domain: usize) -> Self {
        if domain >= MAX_DOMAINS {
            DsqId::Fallback
        } else {
            DsqId::Domain(domain)
        }
    }

    pub fn raw(&self) -> u64 {
        match *self {
            DsqId::Fallback => FALLBACK_DSQ,
            DsqId::Domain(d) => DOMAIN_DSQ_BASE + d as u64,
        }
    }
}

impl fmt::Display for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsqId::Fallback => write!(f, "fallback"),
            DsqId::Domain(d) => write!(f, "D{}", d),
        }
    }
}

/// A queued task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Queued {
    pub pid: u32,
    pub vtime: u64,
    pub slice_ns: u64,
    seq: u64,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.vtime
            .cmp(&other.vtime)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct DispatchQueue {
    heap: Mutex<BinaryHeap<Reverse<Queued>>>,
    nr: AtomicUsize,
}

impl DispatchQueue {
    fn with_capacity(cap: usize) -> Result<Self, String> {
        let mut heap = BinaryHeap::new();
        heap.try_reserve(cap).map_err(|e| e.to_string())?;
        Ok(Self {
            heap: Mutex::new(heap),
            nr: AtomicUsize::new(0),
        })
    }

    // `nr` mirrors the heap length and is only written under the lock.
    fn push(&self, item: Queued) {
        let mut heap = self.heap.lock();
        heap.push(Reverse(item));
        self.nr.store(heap.len(), Ordering::Release);
    }

    fn pop(&self) -> Option<Queued> {
        // Skip the lock for the common empty case.
        if self.nr.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut heap = self.heap.lock();
        let item = heap.pop().map(|Reverse(q)| q);
        self.nr.store(heap.len(), Ordering::Release);
        item
    }

    fn remove(&self, pid: u32) -> bool {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|Reverse(q)| q.pid != pid);
        self.nr.store(heap.len(), Ordering::Release);
        heap.len() < before
    }

    fn capacity(&self) -> usize {
        self.heap.lock().capacity()
    }

    fn len(&self) -> usize {
        self.nr.load(Ordering::Acquire)
    }
}

pub struct DispatchQueues {
    domains: Vec<DispatchQueue>,
    fallback: DispatchQueue,
    seq: AtomicU64,
}

impl DispatchQueues {
    /// Create the fallback queue and one queue per domain. `reserve` is the
    /// capacity of each queue; a queue holding no more than that many tasks
    /// never allocates on insert.
    pub fn new(nr_domains: usize, reserve: usize) -> Result<Self, EngineError> {
        let fallback = DispatchQueue::with_capacity(reserve).map_err(|reason| EngineError::QueueCreate {
            dsq: FALLBACK_DSQ,
            reason,
        })?;
        let domains = (0..nr_domains.min(MAX_DOMAINS))
            .map(|d| {
                DispatchQueue::with_capacity(reserve).map_err(|reason| EngineError::QueueCreate {
                    dsq: DsqId::Domain(d).raw(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            domains,
            fallback,
            seq: AtomicU64::new(0),
        })
    }

    fn queue(&self, id: DsqId) -> &DispatchQueue {
        match id {
            DsqId::Domain(d) => self.domains.get(d).unwrap_or(&self.fallback),
            DsqId::Fallback => &self.fallback,
        }
    }

    pub fn insert(&self, id: DsqId, pid: u32, slice_ns: u64, vtime: u64) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queue(id).push(Queued { pid, vtime, slice_ns, seq });
    }

    pub fn pop(&self, id: DsqId) -> Option<Queued> {
        self.queue(id).pop()
    }

    /// Drop a task from every queue, e.g. when it exits while queued.
    pub fn remove(&self, pid: u32) -> bool {
        let mut found = self.fallback.remove(pid);
        for q in &self.domains {
            found |= q.remove(pid);
        }
        found
    }

    pub fn len(&self, id: DsqId) -> usize {
        self.queue(id).len()
    }

    pub fn total(&self) -> usize {
        self.fallback.len() + self.domains.iter().map(|q| q.len()).sum::<usize>()
    }

    pub fn nr_domains(&self) -> usize {
        self.domains.len()
    }

    /// Smallest reserved capacity across all queues.
    pub fn reserved(&self) -> usize {
        self.domains
            .iter()
            .map(DispatchQueue::capacity)
            .fold(self.fallback.capacity(), usize::min)
    }
}

/// Queues a core drains, in order: its own domain, the low-latency domain if
/// the core has that cache and it is a different queue, every other domain
/// by index, then the fallback queue. Unknown cores only see the fallback.
pub fn drain_order(topo: &Topology, cpu: usize) -> impl Iterator<Item = DsqId> {
    let mut order: [Option<DsqId>; MAX_DOMAINS + 2] = [None; MAX_DOMAINS + 2];
    let mut n = 0;
    let mut push = |id: DsqId| {
        if !order[..n].contains(&Some(id)) {
            order[n] = Some(id);
            n += 1;
        }
    };

    if let Some(core) = topo.core(cpu) {
        let local = DsqId::for_domain(core.domain);
        push(local);
        if core.low_latency_cache {
            push(DsqId::for_domain(topo.low_latency_domain()));
        }
        for d in 0..topo.nr_domains().min(MAX_DOMAINS) {
            push(DsqId::Domain(d));
        }
    }
    push(DsqId::Fallback);
    order.into_iter().flatten()
}
