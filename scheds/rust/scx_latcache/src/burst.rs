// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Burst tracking (BORE-style) and the queue priority key derived from it.

use std::sync::atomic::Ordering;

use crate::task::TaskCtx;

/// Account a finished run. A task that stays runnable keeps accumulating;
/// one that blocks starts over. Each run is counted at most once.
pub fn on_stop(ctx: &TaskCtx, now: u64, runnable: bool) {
    let last = ctx.last_run_at.swap(0, Ordering::Relaxed);
    if runnable {
        if last > 0 && now > last {
            ctx.burst_ns.fetch_add(now - last, Ordering::Relaxed);
        }
    } else {
        ctx.burst_ns.store(0, Ordering::Relaxed);
    }
}

/// Interactive means short bursts. Gaming tasks are never tested.
#[inline]
pub fn is_interactive(is_gaming: bool, burst_ns: u64, threshold_ns: u64) -> bool {
    !is_gaming && burst_ns < threshold_ns
}

/// Dispatch-queue key: lower runs sooner. Batch is penalised ten times
/// harder than interactive.
#[inline]
pub fn vtime(is_gaming: bool, is_interactive: bool, burst_ns: u64) -> u64 {
    if is_gaming {
        0
    } else if is_interactive {
        burst_ns / 1000
    } else {
        burst_ns / 100
    }
}
