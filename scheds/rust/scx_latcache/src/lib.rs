// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduling policy for parts with an asymmetric cache or core layout.
//!
//! Latency-sensitive work (games, their GPU submission threads, short-burst
//! interactive tasks) is kept on the domain with the larger last-level cache
//! on AMD X3D parts, or on performance cores on Intel hybrid parts, while
//! long-running batch work is steered elsewhere. The policy is expressed as
//! a set of hooks on [`engine::Engine`]; the platform beneath it is the
//! [`host::SchedHost`] trait, with [`sim::SimHost`] as an in-process
//! implementation.

pub mod burst;
pub mod classify;
pub mod config;
pub mod counters;
pub mod cpumask;
pub mod dsq;
pub mod engine;
pub mod error;
pub mod events;
pub mod hints;
pub mod host;
pub mod patterns;
pub mod placement;
pub mod preempt;
pub mod profiles;
pub mod sim;
pub mod stats;
pub mod task;
pub mod topology;

pub const SCHEDULER_NAME: &str = "scx_latcache";

pub use engine::Engine;
pub use error::EngineError;
