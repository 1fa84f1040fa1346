// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use thiserror::Error;

use crate::cpumask::MAX_CPUS;
use crate::topology::MAX_DOMAINS;

/// Failures that stop the engine from starting. Nothing on the per-event path
/// returns these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("topology has no cores")]
    EmptyTopology,
    #[error("topology has {0} cores, at most {MAX_CPUS} are supported")]
    TooManyCpus(usize),
    #[error("core {cpu} names domain {domain}, at most {MAX_DOMAINS} domains are supported")]
    InvalidDomain { cpu: usize, domain: usize },
    #[error("core {cpu} names SMT sibling {sibling} which does not exist")]
    InvalidSibling { cpu: usize, sibling: usize },
    #[error("low-latency domain {0} has no cores")]
    InvalidLowLatencyDomain(usize),
    #[error("frequency domain {0} has no cores")]
    InvalidFreqDomain(usize),
    #[error("failed to create dispatch queue {dsq}: {reason}")]
    QueueCreate { dsq: u64, reason: String },
}
