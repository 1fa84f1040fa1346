// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Per-Game Profiles
// Copyright (c) 2025 RitzDaCat
//
// Per-game tunable overrides loaded from JSON files. When a matching game
// shows up its overrides are layered on the base tunables.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Tunables;
use crate::config::TunablesCell;

/// Per-game profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProfile {
    pub name: String,
    /// Executable name, matched case-insensitively, exactly or partially.
    #[serde(default)]
    pub exe_name: Option<String>,
    #[serde(default)]
    pub steam_appid: Option<u32>,
    /// Task name prefix.
    #[serde(default)]
    pub comm_pattern: Option<String>,
    #[serde(default)]
    pub tunables: ProfileTunables,
}

/// Overrides; unset fields keep the base value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTunables {
    #[serde(default)]
    pub burst_threshold_ns: Option<u64>,
    #[serde(default)]
    pub slice_ns: Option<u64>,
    #[serde(default)]
    pub gaming_mode: Option<bool>,
    #[serde(default)]
    pub work_mode: Option<bool>,
}

impl ProfileTunables {
    pub fn apply(&self, base: Tunables) -> Tunables {
        Tunables {
            burst_threshold_ns: self.burst_threshold_ns.unwrap_or(base.burst_threshold_ns),
            slice_ns: self.slice_ns.filter(|s| *s > 0).unwrap_or(base.slice_ns),
            gaming_mode: self.gaming_mode.unwrap_or(base.gaming_mode),
            work_mode: self.work_mode.unwrap_or(base.work_mode),
        }
    }
}

pub struct ProfileManager {
    profiles_dir: PathBuf,
    profiles: FxHashMap<String, GameProfile>,
    /// Lowercase exe name to profile name; ordered so partial matches are
    /// deterministic.
    by_exe: BTreeMap<String, String>,
    by_appid: FxHashMap<u32, String>,
    active: Option<String>,
    /// Tunables in effect before the first profile was applied.
    base: Option<Tunables>,
}

impl ProfileManager {
    /// Load every `*.json` profile in `profiles_dir`, creating the directory
    /// if needed. Unparsable files are skipped with a warning.
    pub fn new(profiles_dir: impl AsRef<Path>) -> Result<Self> {
        let profiles_dir = profiles_dir.as_ref().to_path_buf();
        fs::create_dir_all(&profiles_dir)
            .with_context(|| format!("Failed to create {}", profiles_dir.display()))?;

        let mut manager = Self {
            profiles_dir,
            profiles: FxHashMap::default(),
            by_exe: BTreeMap::new(),
            by_appid: FxHashMap::default(),
            active: None,
            base: None,
        };
        manager.load_all()?;
        Ok(manager)
    }

    fn load_all(&mut self) -> Result<()> {
        let dir = self.profiles_dir.clone();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match Self::load_profile_file(&path) {
                Ok(profile) => self.add_profile(profile),
                Err(e) => warn!("Failed to load profile {}: {:#}", path.display(), e),
            }
        }

        info!("Profile: Loaded {} game profiles", self.profiles.len());
        Ok(())
    }

    fn load_profile_file(path: &Path) -> Result<GameProfile> {
        let content = fs::read_to_string(path)?;
        let profile: GameProfile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        debug!("Loaded profile {} from {}", profile.name, path.display());
        Ok(profile)
    }

    fn add_profile(&mut self, profile: GameProfile) {
        let name = profile.name.clone();
        if let Some(exe) = &profile.exe_name {
            self.by_exe.insert(exe.to_lowercase(), name.clone());
        }
        if let Some(appid) = profile.steam_appid {
            self.by_appid.insert(appid, name.clone());
        }
        self.profiles.insert(name, profile);
    }

    pub fn get_profile(&self, name: &str) -> Option<&GameProfile> {
        self.profiles.get(name)
    }

    pub fn list_games(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.profiles.len()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Steam app id, then exact exe name, then either name containing the
    /// other.
    pub fn match_process(&self, exe_name: &str, steam_appid: Option<u32>) -> Option<&GameProfile> {
        if let Some(name) = steam_appid.and_then(|id| self.by_appid.get(&id)) {
            return self.profiles.get(name);
        }

        let exe = exe_name.to_lowercase();
        if exe.is_empty() {
            return None;
        }
        if let Some(name) = self.by_exe.get(&exe) {
            return self.profiles.get(name);
        }
        self.by_exe
            .iter()
            .find(|(pattern, _)| exe.contains(pattern.as_str()) || pattern.contains(&exe))
            .and_then(|(_, name)| self.profiles.get(name))
    }

    /// Match a task name: executable rules first, then comm prefixes.
    pub fn match_comm(&self, comm: &str) -> Option<&GameProfile> {
        if let Some(profile) = self.match_process(comm, None) {
            return Some(profile);
        }
        let mut candidates: Vec<&GameProfile> = self
            .profiles
            .values()
            .filter(|p| p.comm_pattern.as_deref().is_some_and(|pat| !pat.is_empty() && comm.starts_with(pat)))
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        candidates.first().copied()
    }

    /// Layer `name`'s overrides on the base tunables. Returns false if the
    /// profile is unknown or already active.
    pub fn activate(&mut self, name: &str, cell: &TunablesCell) -> bool {
        if self.active.as_deref() == Some(name) {
            return false;
        }
        let Some(profile) = self.profiles.get(name) else {
            return false;
        };
        let base = *self.base.get_or_insert_with(|| cell.load());
        let tunables = profile.tunables.apply(base);
        cell.store(tunables);
        info!(
            "Profile: Applied '{}' (burst {}us, slice {}us, gaming {}, work {})",
            name,
            tunables.burst_threshold_ns / 1000,
            tunables.slice_ns / 1000,
            tunables.gaming_mode,
            tunables.work_mode
        );
        self.active = Some(name.to_string());
        true
    }

    /// Restore the tunables that were in effect before any profile.
    pub fn deactivate(&mut self, cell: &TunablesCell) {
        if let (Some(name), Some(base)) = (self.active.take(), self.base) {
            cell.store(base);
            info!("Profile: Restored base tunables after '{}'", name);
        }
    }

    #[cfg(test)]
    fn save_profile(&mut self, profile: GameProfile) -> Result<()> {
        let safe_name = profile.name.replace(['/', '\\', ' ', ':', '.'], "_");
        let path = self.profiles_dir.join(format!("{}.json", safe_name));
        fs::write(&path, serde_json::to_string_pretty(&profile)?)?;
        self.add_profile(profile);
        Ok(())
    }
}
