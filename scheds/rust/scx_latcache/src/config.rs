// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Tunables and static engine settings.
//!
//! `Tunables` may be swapped at any time by a profile or control surface and
//! is re-read on every decision. `EngineConfig` is fixed once the engine is
//! initialised. Both can come from a JSON file.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use arc_swap::ArcSwapOption;
use serde::Deserialize;
use serde::Serialize;

use crate::task::MAX_TASK_CAPACITY;

pub const DEFAULT_BURST_THRESHOLD_NS: u64 = 2_000_000;
pub const DEFAULT_SLICE_NS: u64 = 3_000_000;
pub const DEFAULT_TASK_CAPACITY: usize = 65536;
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Continuous runtime below which a waking task counts as interactive.
    pub burst_threshold_ns: u64,
    pub slice_ns: u64,
    pub gaming_mode: bool,
    /// Favour the high-frequency domain for everything.
    pub work_mode: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            burst_threshold_ns: DEFAULT_BURST_THRESHOLD_NS,
            slice_ns: DEFAULT_SLICE_NS,
            gaming_mode: true,
            work_mode: false,
        }
    }
}

/// Shared, hot-swappable tunables. An empty cell reads as the defaults.
#[derive(Default)]
pub struct TunablesCell {
    inner: ArcSwapOption<Tunables>,
}

impl TunablesCell {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: ArcSwapOption::from_pointee(tunables),
        }
    }

    #[inline]
    pub fn load(&self) -> Tunables {
        self.inner
            .load()
            .as_deref()
            .copied()
            .unwrap_or_default()
    }

    pub fn store(&self, tunables: Tunables) {
        self.inner.store(Some(Arc::new(tunables)));
    }

    pub fn clear(&self) {
        self.inner.store(None);
    }

    /// Read-modify-write against concurrent writers.
    pub fn update<F: Fn(&mut Tunables)>(&self, f: F) {
        self.inner.rcu(|cur| {
            let mut next = cur.as_deref().copied().unwrap_or_default();
            f(&mut next);
            Some(Arc::new(next))
        });
    }
}

/// E-core offload policy on hybrid parts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcoreOffload {
    Disabled,
    /// Only tasks classified batch or container.
    #[default]
    Conservative,
    /// Anything that is neither gaming nor interactive.
    Aggressive,
}

impl FromStr for EcoreOffload {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disabled" | "0" => Ok(EcoreOffload::Disabled),
            "conservative" | "1" => Ok(EcoreOffload::Conservative),
            "aggressive" | "2" => Ok(EcoreOffload::Aggressive),
            _ => bail!("invalid e-core offload mode {:?}", s),
        }
    }
}

impl fmt::Display for EcoreOffload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EcoreOffload::Disabled => "disabled",
            EcoreOffload::Conservative => "conservative",
            EcoreOffload::Aggressive => "aggressive",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ecore_offload: EcoreOffload,
    /// The part boosts one domain higher than the others.
    pub asymmetric_boost: bool,
    /// Try fully idle physical cores before any idle core.
    pub prefer_idle_smt: bool,
    /// Core that runs the domain imbalance check on its tick.
    pub monitor_cpu: usize,
    pub task_capacity: usize,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ecore_offload: EcoreOffload::default(),
            asymmetric_boost: false,
            prefer_idle_smt: true,
            monitor_cpu: 0,
            task_capacity: DEFAULT_TASK_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// On-disk configuration. Missing sections and fields take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tunables: Tunables,
    pub engine: EngineConfig,
    pub profiles_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tunables.slice_ns == 0 {
            bail!("slice_ns must be non-zero");
        }
        if self.engine.task_capacity == 0 || self.engine.event_capacity == 0 {
            bail!("task_capacity and event_capacity must be non-zero");
        }
        if self.engine.task_capacity > MAX_TASK_CAPACITY {
            bail!(
                "task_capacity {} exceeds the maximum of {}",
                self.engine.task_capacity,
                MAX_TASK_CAPACITY
            );
        }
        Ok(())
    }
}
