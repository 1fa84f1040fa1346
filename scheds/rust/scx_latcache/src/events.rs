// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduling event stream.
//!
//! Producers are the scheduling hooks, so `emit` must never wait: the stream
//! is a bounded lock-free queue and a full queue drops the event. Consumers
//! drain at their own pace.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crossbeam::queue::ArrayQueue;
use log::debug;
use log::info;
use serde::Serialize;

use crate::patterns::Comm;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GamingDetected = 1,
    DomainMigration = 2,
    PreemptKick = 3,
    HighLatency = 4,
    DomainImbalance = 5,
    ProfileMatch = 6,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::GamingDetected => "GamingDetected",
            EventKind::DomainMigration => "DomainMigration",
            EventKind::PreemptKick => "PreemptKick",
            EventKind::HighLatency => "HighLatency",
            EventKind::DomainImbalance => "DomainImbalance",
            EventKind::ProfileMatch => "ProfileMatch",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SchedEvent {
    pub timestamp_ns: u64,
    pub kind: EventKind,
    pub pid: u32,
    pub cpu: u32,
    pub domain: u32,
    /// Second domain involved, e.g. the light side of an imbalance.
    pub peer_domain: u32,
    pub value1: u64,
    pub value2: u64,
    pub comm: Comm,
}

impl SchedEvent {
    pub fn new(kind: EventKind, timestamp_ns: u64, pid: u32, cpu: usize) -> Self {
        Self {
            timestamp_ns,
            kind,
            pid,
            cpu: cpu as u32,
            domain: 0,
            peer_domain: 0,
            value1: 0,
            value2: 0,
            comm: Comm::default(),
        }
    }

    pub fn domain(mut self, domain: usize) -> Self {
        self.domain = domain as u32;
        self
    }

    pub fn peer_domain(mut self, domain: usize) -> Self {
        self.peer_domain = domain as u32;
        self
    }

    pub fn values(mut self, value1: u64, value2: u64) -> Self {
        self.value1 = value1;
        self.value2 = value2;
        self
    }

    pub fn comm(mut self, comm: Comm) -> Self {
        self.comm = comm;
        self
    }
}

impl fmt::Display for SchedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::GamingDetected => write!(
                f,
                "{} task detected: {} (PID {}) on CPU {}{}",
                if self.value1 == 2 { "Proton" } else { "Gaming" },
                self.comm,
                self.pid,
                self.cpu,
                if self.value2 == 1 { " (GPU)" } else { "" }
            ),
            EventKind::DomainMigration => write!(
                f,
                "Low-latency migration: PID {} CPU {} (D{} -> D{})",
                self.pid, self.cpu, self.value1, self.domain
            ),
            EventKind::PreemptKick => write!(
                f,
                "Preempt kick: PID {} kicked CPU {} on D{}",
                self.pid, self.cpu, self.domain
            ),
            EventKind::HighLatency => write!(
                f,
                "High latency: PID {} on CPU {} - {}us (threshold {}us)",
                self.pid, self.cpu, self.value1, self.value2
            ),
            EventKind::DomainImbalance => write!(
                f,
                "Domain imbalance: D{} has {} tasks vs {} on D{}",
                self.domain, self.value1, self.value2, self.peer_domain
            ),
            EventKind::ProfileMatch => write!(
                f,
                "Profile matched: {} (PID {}) on CPU {}",
                self.comm, self.pid, self.cpu
            ),
        }
    }
}

pub struct EventStream {
    queue: ArrayQueue<SchedEvent>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl EventStream {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event; drops it if the stream is full.
    #[inline]
    pub fn emit(&self, event: SchedEvent) -> bool {
        match self.queue.push(event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<SchedEvent> {
        self.queue.pop()
    }

    /// Hand every queued event to `f`; returns how many were drained.
    pub fn drain<F: FnMut(SchedEvent)>(&self, mut f: F) -> usize {
        let mut n = 0;
        while let Some(ev) = self.queue.pop() {
            f(ev);
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer-side tallies.
#[derive(Default)]
pub struct EventCounters {
    pub gaming_detected: AtomicU64,
    pub migrations: AtomicU64,
    pub preempt_kicks: AtomicU64,
    pub high_latency: AtomicU64,
    pub imbalance: AtomicU64,
    pub profile_matches: AtomicU64,
}

impl EventCounters {
    pub fn record(&self, event: &SchedEvent) {
        let slot = match event.kind {
            EventKind::GamingDetected => &self.gaming_detected,
            EventKind::DomainMigration => &self.migrations,
            EventKind::PreemptKick => &self.preempt_kicks,
            EventKind::HighLatency => &self.high_latency,
            EventKind::DomainImbalance => &self.imbalance,
            EventKind::ProfileMatch => &self.profile_matches,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> String {
        format!(
            "Events: gaming={}, migrations={}, kicks={}, latency={}, imbalance={}, profiles={}",
            self.gaming_detected.load(Ordering::Relaxed),
            self.migrations.load(Ordering::Relaxed),
            self.preempt_kicks.load(Ordering::Relaxed),
            self.high_latency.load(Ordering::Relaxed),
            self.imbalance.load(Ordering::Relaxed),
            self.profile_matches.load(Ordering::Relaxed),
        )
    }
}

/// Counts and logs consumed events.
pub struct EventHandler {
    pub counters: EventCounters,
    verbose: bool,
}

impl EventHandler {
    pub fn new(verbose: bool) -> Self {
        Self {
            counters: EventCounters::default(),
            verbose,
        }
    }

    pub fn handle(&self, event: &SchedEvent) {
        self.counters.record(event);
        if self.verbose {
            info!("[EVENT] {}", event);
        } else {
            debug!("[EVENT] {}", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_stream_drops() {
        let stream = EventStream::with_capacity(2);
        let ev = SchedEvent::new(EventKind::PreemptKick, 1, 10, 3);
        assert!(stream.emit(ev));
        assert!(stream.emit(ev));
        assert!(!stream.emit(ev));
        assert_eq!(stream.emitted(), 2);
        assert_eq!(stream.dropped(), 1);
        assert_eq!(stream.drain(|_| {}), 2);
        assert!(stream.is_empty());
        assert!(stream.emit(ev));
    }

    #[test]
    fn display() {
        let ev = SchedEvent::new(EventKind::GamingDetected, 0, 1234, 2)
            .values(2, 1)
            .comm(Comm::new("wine64"));
        assert_eq!(ev.to_string(), "Proton task detected: wine64 (PID 1234) on CPU 2 (GPU)");

        let ev = SchedEvent::new(EventKind::DomainImbalance, 0, 0, 0)
            .domain(1)
            .peer_domain(0)
            .values(40, 5);
        assert_eq!(ev.to_string(), "Domain imbalance: D1 has 40 tasks vs 5 on D0");
    }

    #[test]
    fn handler_counts() {
        let handler = EventHandler::new(false);
        handler.handle(&SchedEvent::new(EventKind::HighLatency, 0, 1, 0).values(1500, 1000));
        handler.handle(&SchedEvent::new(EventKind::HighLatency, 0, 1, 0).values(1200, 1000));
        assert_eq!(handler.counters.high_latency.load(Ordering::Relaxed), 2);
        assert!(handler.counters.summary().contains("latency=2"));
    }
}
