// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Static core table.
//!
//! Discovery from sysfs/CPUID happens elsewhere; this module only holds the
//! result, validates it once, and precomputes the masks the placement code
//! scans. A handful of presets describe common parts for the simulator.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

use crate::cpumask::CpuMask;
use crate::cpumask::MAX_CPUS;
use crate::error::EngineError;

pub const MAX_DOMAINS: usize = 8;

/// Per-core attributes, immutable after load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDesc {
    /// Cache or frequency group (CCD on AMD, core type cluster on Intel).
    pub domain: usize,
    /// CCX within the domain.
    pub subdomain: usize,
    pub node: usize,
    pub smt_sibling: Option<usize>,
    pub low_latency_cache: bool,
    pub performance: bool,
    pub preferred_boost: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    /// Symmetric cores split into cache domains (multi-CCD X3D).
    CacheDomains,
    /// Performance and efficiency core types (Intel hybrid).
    Hybrid,
}

#[derive(Clone, Debug)]
pub struct Topology {
    cores: Vec<CoreDesc>,
    nr_domains: usize,
    low_latency_domain: usize,
    freq_domain: Option<usize>,
    kind: PlatformKind,
    smt_enabled: bool,
    domain_masks: Vec<CpuMask>,
    pcore_mask: CpuMask,
    ecore_mask: CpuMask,
}

impl Topology {
    pub fn builder(kind: PlatformKind) -> TopologyBuilder {
        TopologyBuilder {
            kind,
            cores: Vec::new(),
            low_latency_domain: 0,
            freq_domain: None,
            smt: None,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cores.len()
    }

    pub fn nr_domains(&self) -> usize {
        self.nr_domains
    }

    #[inline]
    pub fn core(&self, cpu: usize) -> Option<&CoreDesc> {
        self.cores.get(cpu)
    }

    #[inline]
    pub fn domain_of(&self, cpu: usize) -> Option<usize> {
        self.cores.get(cpu).map(|c| c.domain)
    }

    pub fn cores(&self) -> impl Iterator<Item = (usize, &CoreDesc)> {
        self.cores.iter().enumerate()
    }

    pub fn low_latency_domain(&self) -> usize {
        self.low_latency_domain
    }

    /// Domain with the highest boost clocks on parts with asymmetric
    /// per-domain boost.
    pub fn freq_domain(&self) -> Option<usize> {
        self.freq_domain
    }

    pub fn kind(&self) -> PlatformKind {
        self.kind
    }

    pub fn is_hybrid(&self) -> bool {
        self.kind == PlatformKind::Hybrid
    }

    pub fn smt_enabled(&self) -> bool {
        self.smt_enabled
    }

    pub fn domain_mask(&self, domain: usize) -> Option<&CpuMask> {
        self.domain_masks.get(domain)
    }

    pub fn pcore_mask(&self) -> &CpuMask {
        &self.pcore_mask
    }

    pub fn ecore_mask(&self) -> &CpuMask {
        &self.ecore_mask
    }

    pub fn all_cpus(&self) -> CpuMask {
        CpuMask::first_n(self.cores.len())
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cpus, {} domains ({:?}), low-latency domain {}, smt {}",
            self.nr_cpus(),
            self.nr_domains,
            self.kind,
            self.low_latency_domain,
            if self.smt_enabled { "on" } else { "off" }
        )?;
        if let Some(freq) = self.freq_domain {
            write!(f, ", freq domain {}", freq)?;
        }
        for (domain, mask) in self.domain_masks.iter().enumerate() {
            write!(f, "\n  D{}: {:?}", domain, mask)?;
        }
        Ok(())
    }
}

pub struct TopologyBuilder {
    kind: PlatformKind,
    cores: Vec<CoreDesc>,
    low_latency_domain: usize,
    freq_domain: Option<usize>,
    smt: Option<bool>,
}

impl TopologyBuilder {
    pub fn core(mut self, desc: CoreDesc) -> Self {
        self.cores.push(desc);
        self
    }

    pub fn low_latency_domain(mut self, domain: usize) -> Self {
        self.low_latency_domain = domain;
        self
    }

    pub fn freq_domain(mut self, domain: Option<usize>) -> Self {
        self.freq_domain = domain;
        self
    }

    /// Override SMT accounting. Defaults to on when any core has a sibling.
    pub fn smt(mut self, enabled: bool) -> Self {
        self.smt = Some(enabled);
        self
    }

    pub fn build(self) -> Result<Topology, EngineError> {
        let nr = self.cores.len();
        if nr == 0 {
            return Err(EngineError::EmptyTopology);
        }
        if nr > MAX_CPUS {
            return Err(EngineError::TooManyCpus(nr));
        }

        let mut domain_masks = vec![CpuMask::new(); MAX_DOMAINS];
        let mut pcore_mask = CpuMask::new();
        let mut ecore_mask = CpuMask::new();
        let mut nr_domains = 0;

        for (cpu, core) in self.cores.iter().enumerate() {
            if core.domain >= MAX_DOMAINS {
                return Err(EngineError::InvalidDomain { cpu, domain: core.domain });
            }
            if let Some(sibling) = core.smt_sibling {
                if sibling >= nr || sibling == cpu {
                    return Err(EngineError::InvalidSibling { cpu, sibling });
                }
            }
            domain_masks[core.domain].set(cpu);
            nr_domains = nr_domains.max(core.domain + 1);
            if core.performance {
                pcore_mask.set(cpu);
            } else {
                ecore_mask.set(cpu);
            }
        }
        domain_masks.truncate(nr_domains);

        if domain_masks
            .get(self.low_latency_domain)
            .map_or(true, |m| m.is_empty())
        {
            return Err(EngineError::InvalidLowLatencyDomain(self.low_latency_domain));
        }
        if let Some(freq) = self.freq_domain {
            if domain_masks.get(freq).map_or(true, |m| m.is_empty()) {
                return Err(EngineError::InvalidFreqDomain(freq));
            }
        }

        let smt_enabled = self
            .smt
            .unwrap_or_else(|| self.cores.iter().any(|c| c.smt_sibling.is_some()));

        Ok(Topology {
            cores: self.cores,
            nr_domains,
            low_latency_domain: self.low_latency_domain,
            freq_domain: self.freq_domain,
            kind: self.kind,
            smt_enabled,
            domain_masks,
            pcore_mask,
            ecore_mask,
        })
    }
}

/// Shapes of common parts. Logical cpu numbering follows Linux: on SMT
/// parts the second hardware thread of every physical core comes after all
/// first threads (AMD), or sits next to it (Intel P-cores).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    DualCcdX3d {
        cores_per_ccd: usize,
        smt: bool,
        asymmetric_boost: bool,
    },
    SingleCcdX3d { cores: usize, smt: bool },
    Hybrid { pcores: usize, ecores: usize },
    Uniform { cores: usize, smt: bool },
}

impl FromStr for Preset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let preset = match s.to_ascii_lowercase().as_str() {
            "7900x3d" => Preset::DualCcdX3d { cores_per_ccd: 6, smt: true, asymmetric_boost: false },
            "7950x3d" => Preset::DualCcdX3d { cores_per_ccd: 8, smt: true, asymmetric_boost: false },
            "9900x3d" => Preset::DualCcdX3d { cores_per_ccd: 6, smt: true, asymmetric_boost: true },
            "9950x3d" => Preset::DualCcdX3d { cores_per_ccd: 8, smt: true, asymmetric_boost: true },
            "7800x3d" | "9800x3d" => Preset::SingleCcdX3d { cores: 8, smt: true },
            "12600k" => Preset::Hybrid { pcores: 6, ecores: 4 },
            "13900k" | "14900k" => Preset::Hybrid { pcores: 8, ecores: 16 },
            "generic" => Preset::Uniform { cores: 8, smt: true },
            _ => bail!("unknown topology preset {:?}", s),
        };
        Ok(preset)
    }
}

impl Preset {
    pub const NAMES: &'static [&'static str] = &[
        "7900x3d", "7950x3d", "9900x3d", "9950x3d", "7800x3d", "9800x3d", "12600k", "13900k",
        "14900k", "generic",
    ];

    pub fn build(self) -> Result<Topology, EngineError> {
        match self {
            Preset::DualCcdX3d { cores_per_ccd, smt, asymmetric_boost } => {
                let freq = if asymmetric_boost { Some(1) } else { None };
                ccd_cores(2, cores_per_ccd, smt, asymmetric_boost)
                    .into_iter()
                    .fold(Topology::builder(PlatformKind::CacheDomains), |b, c| b.core(c))
                    .low_latency_domain(0)
                    .freq_domain(freq)
                    .build()
            }
            Preset::SingleCcdX3d { cores, smt } => ccd_cores(1, cores, smt, false)
                .into_iter()
                .fold(Topology::builder(PlatformKind::CacheDomains), |b, c| b.core(c))
                .build(),
            Preset::Uniform { cores, smt } => ccd_cores(1, cores, smt, false)
                .into_iter()
                .map(|c| CoreDesc { low_latency_cache: false, ..c })
                .fold(Topology::builder(PlatformKind::CacheDomains), |b, c| b.core(c))
                .build(),
            Preset::Hybrid { pcores, ecores } => {
                let mut b = Topology::builder(PlatformKind::Hybrid).low_latency_domain(0);
                for cpu in 0..pcores * 2 {
                    let phys = cpu / 2;
                    b = b.core(CoreDesc {
                        domain: 0,
                        subdomain: 0,
                        node: 0,
                        smt_sibling: Some(cpu ^ 1),
                        low_latency_cache: true,
                        performance: true,
                        // Turbo Max 3.0 favours two of the P-cores.
                        preferred_boost: phys == 2 || phys == 3,
                    });
                }
                for e in 0..ecores {
                    b = b.core(CoreDesc {
                        domain: 1,
                        subdomain: e / 4,
                        node: 0,
                        smt_sibling: None,
                        low_latency_cache: false,
                        performance: false,
                        preferred_boost: false,
                    });
                }
                b.build()
            }
        }
    }
}

fn ccd_cores(nr_ccds: usize, per_ccd: usize, smt: bool, boost_second: bool) -> Vec<CoreDesc> {
    let nr_phys = nr_ccds * per_ccd;
    let threads = if smt { 2 } else { 1 };
    (0..nr_phys * threads)
        .map(|cpu| {
            let phys = cpu % nr_phys;
            let domain = phys / per_ccd;
            CoreDesc {
                domain,
                subdomain: 0,
                node: 0,
                smt_sibling: smt.then(|| if cpu < nr_phys { cpu + nr_phys } else { cpu - nr_phys }),
                low_latency_cache: domain == 0,
                performance: true,
                preferred_boost: boost_second && domain == 1,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_ccd_layout() {
        let topo: Topology = "7950x3d".parse::<Preset>().unwrap().build().unwrap();
        assert_eq!(topo.nr_cpus(), 32);
        assert_eq!(topo.nr_domains(), 2);
        assert!(topo.smt_enabled());
        assert!(!topo.is_hybrid());
        assert_eq!(topo.domain_of(7), Some(0));
        assert_eq!(topo.domain_of(8), Some(1));
        assert_eq!(topo.domain_of(16), Some(0));
        assert_eq!(topo.core(3).unwrap().smt_sibling, Some(19));
        assert_eq!(topo.core(19).unwrap().smt_sibling, Some(3));
        assert!(topo.core(16).unwrap().low_latency_cache);
        assert!(!topo.core(24).unwrap().low_latency_cache);
        assert_eq!(topo.domain_mask(0).unwrap().weight(), 16);
        assert_eq!(topo.freq_domain(), None);
    }

    #[test]
    fn asymmetric_boost_has_freq_domain() {
        let topo = "9950x3d".parse::<Preset>().unwrap().build().unwrap();
        assert_eq!(topo.freq_domain(), Some(1));
        assert!(topo.core(9).unwrap().preferred_boost);
    }

    #[test]
    fn hybrid_masks() {
        let topo = "12600k".parse::<Preset>().unwrap().build().unwrap();
        assert!(topo.is_hybrid());
        assert_eq!(topo.nr_cpus(), 16);
        assert_eq!(topo.pcore_mask().weight(), 12);
        assert_eq!(topo.ecore_mask().weight(), 4);
        assert_eq!(topo.core(4).unwrap().smt_sibling, Some(5));
        assert!(topo.core(5).unwrap().preferred_boost);
        assert_eq!(topo.domain_of(12), Some(1));
    }

    #[test]
    fn every_named_preset_builds() {
        for name in Preset::NAMES {
            let preset: Preset = name.parse().unwrap();
            assert!(preset.build().is_ok(), "{}", name);
        }
        assert!("486dx".parse::<Preset>().is_err());
    }

    #[test]
    fn validation() {
        assert_eq!(
            Topology::builder(PlatformKind::CacheDomains).build().unwrap_err(),
            EngineError::EmptyTopology
        );
        let err = Topology::builder(PlatformKind::CacheDomains)
            .core(CoreDesc { domain: MAX_DOMAINS, ..Default::default() })
            .build()
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidDomain { cpu: 0, domain: MAX_DOMAINS });

        let err = Topology::builder(PlatformKind::CacheDomains)
            .core(CoreDesc { smt_sibling: Some(4), ..Default::default() })
            .build()
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidSibling { cpu: 0, sibling: 4 });

        let err = Topology::builder(PlatformKind::CacheDomains)
            .core(CoreDesc::default())
            .low_latency_domain(1)
            .build()
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidLowLatencyDomain(1));

        let err = Topology::builder(PlatformKind::CacheDomains)
            .core(CoreDesc::default())
            .freq_domain(Some(3))
            .build()
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidFreqDomain(3));
    }
}
