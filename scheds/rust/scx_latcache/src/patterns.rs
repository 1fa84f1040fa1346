// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task-name matching.
//!
//! Rules are ordered tables so the evaluation order is data, not control
//! flow. The first rule that matches decides.

use std::fmt;

use serde::Serialize;
use serde::Serializer;

pub const TASK_COMM_LEN: usize = 16;

/// Bounded task name, NUL padded, at most 15 significant bytes.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Comm([u8; TASK_COMM_LEN]);

impl Comm {
    pub fn new(name: &str) -> Self {
        let mut buf = [0u8; TASK_COMM_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_COMM_LEN - 1);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(buf)
    }

    pub fn from_raw(raw: [u8; TASK_COMM_LEN]) -> Self {
        Self(raw)
    }

    /// Significant bytes, without the padding.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&c| c == 0).unwrap_or(TASK_COMM_LEN);
        &self.0[..len]
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl Serialize for Comm {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameMatch {
    Prefix(&'static str),
    Suffix(&'static str),
    Exact(&'static str),
}

impl NameMatch {
    #[inline]
    pub fn matches(&self, name: &[u8]) -> bool {
        match *self {
            NameMatch::Prefix(p) => name.starts_with(p.as_bytes()),
            NameMatch::Suffix(s) => name.ends_with(s.as_bytes()),
            NameMatch::Exact(e) => name == e.as_bytes(),
        }
    }
}

/// What a gaming name rule identifies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameHit {
    /// Launcher, sandbox or game binary.
    Native,
    /// Windows translation layer (Wine/Proton).
    Translated,
}

#[derive(Clone, Copy, Debug)]
pub struct GameRule {
    pub matcher: NameMatch,
    pub hit: GameHit,
}

const fn rule(matcher: NameMatch, hit: GameHit) -> GameRule {
    GameRule { matcher, hit }
}

pub static GAMING_RULES: &[GameRule] = &[
    rule(NameMatch::Prefix("wine"), GameHit::Translated),
    rule(NameMatch::Prefix("proton"), GameHit::Translated),
    rule(NameMatch::Prefix("steam"), GameHit::Native),
    rule(NameMatch::Prefix("bwrap"), GameHit::Native),
    rule(NameMatch::Prefix("pressure-vessel"), GameHit::Native),
    rule(NameMatch::Prefix("game"), GameHit::Native),
    rule(NameMatch::Prefix("lutris"), GameHit::Native),
    rule(NameMatch::Prefix("heroic"), GameHit::Native),
    rule(NameMatch::Suffix(".exe"), GameHit::Translated),
];

/// Threads that submit GPU command buffers: Vulkan/GL loaders, DXVK and
/// VKD3D workers, NVIDIA driver threads.
pub static GPU_FEEDER_RULES: &[NameMatch] = &[
    NameMatch::Prefix("vk"),
    NameMatch::Prefix("Vk"),
    NameMatch::Prefix("vulkan"),
    NameMatch::Prefix("gl"),
    NameMatch::Prefix("GL"),
    NameMatch::Prefix("opengl"),
    NameMatch::Prefix("dxvk"),
    NameMatch::Prefix("vkd3d"),
    NameMatch::Prefix("nv_"),
    NameMatch::Prefix("nvidia"),
    NameMatch::Prefix("threaded_gl"),
];

pub fn match_gaming(name: &[u8]) -> Option<GameHit> {
    GAMING_RULES
        .iter()
        .find(|r| r.matcher.matches(name))
        .map(|r| r.hit)
}

pub fn is_gpu_feeder(name: &[u8]) -> bool {
    GPU_FEEDER_RULES.iter().any(|m| m.matches(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(name: &str) -> Option<GameHit> {
        match_gaming(Comm::new(name).as_bytes())
    }

    #[test]
    fn comm_truncates() {
        let c = Comm::new("a-very-long-thread-name");
        assert_eq!(c.as_bytes().len(), 15);
        assert_eq!(c.to_string(), "a-very-long-thr");
        assert!(Comm::default().is_empty());
    }

    #[test]
    fn gaming_names() {
        assert_eq!(hit("wine64"), Some(GameHit::Translated));
        assert_eq!(hit("wineserver"), Some(GameHit::Translated));
        assert_eq!(hit("proton"), Some(GameHit::Translated));
        assert_eq!(hit("Cyberpunk.exe"), Some(GameHit::Translated));
        assert_eq!(hit("steamwebhelper"), Some(GameHit::Native));
        assert_eq!(hit("pressure-vessel-wrap"), Some(GameHit::Native));
        assert_eq!(hit("gamescope"), Some(GameHit::Native));
        assert_eq!(hit("lutris"), Some(GameHit::Native));
        assert_eq!(hit("heroic"), Some(GameHit::Native));
        assert_eq!(hit("cc1plus"), None);
        assert_eq!(hit("kworker/0:1"), None);
    }

    #[test]
    fn rule_order_decides() {
        // Prefix rules run before the suffix rule.
        assert_eq!(hit("steam.exe"), Some(GameHit::Native));
        assert_eq!(hit("winecfg.exe"), Some(GameHit::Translated));
    }

    #[test]
    fn gpu_feeders() {
        for name in ["vkThread0", "VkQueue", "glthread", "GLWorker", "dxvk-submit", "nv_queue", "threaded_gl"] {
            assert!(is_gpu_feeder(Comm::new(name).as_bytes()), "{}", name);
        }
        assert!(!is_gpu_feeder(b"wine64"));
        assert!(!is_gpu_feeder(b"Xwayland"));
    }

    #[test]
    fn exact_match() {
        let m = NameMatch::Exact("bwrap");
        assert!(m.matches(b"bwrap"));
        assert!(!m.matches(b"bwrap2"));
    }
}
