// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Fixed-width core masks.
//!
//! `CpuMask` is a plain value used for allowed-core sets and snapshots of the
//! idle state. `AtomicCpuMask` is the shared form: its `test_and_clear` is the
//! claim primitive that guarantees at most one task per idle core.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub const MAX_CPUS: usize = 256;
const WORDS: usize = MAX_CPUS / 64;

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuMask {
    bits: [u64; WORDS],
}

impl CpuMask {
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    /// Mask with cores `0..nr` set.
    pub fn first_n(nr: usize) -> Self {
        let mut mask = Self::new();
        for cpu in 0..nr.min(MAX_CPUS) {
            mask.set(cpu);
        }
        mask
    }

    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        let mut mask = Self::new();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    #[inline]
    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    #[inline]
    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] &= !(1 << (cpu % 64));
        }
    }

    #[inline]
    pub fn test(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn and(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (w, o) in out.bits.iter_mut().zip(other.bits.iter()) {
            *w &= *o;
        }
        out
    }

    pub fn weight(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Set cores in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPUS).filter(move |cpu| self.test(*cpu))
    }
}

impl fmt::Debug for CpuMask {
    /// Range list form, e.g. `0-3,8,10-11`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.iter().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct AtomicCpuMask {
    bits: [AtomicU64; WORDS],
}

impl AtomicCpuMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64].fetch_or(1 << (cpu % 64), Ordering::AcqRel);
        }
    }

    pub fn clear(&self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64].fetch_and(!(1 << (cpu % 64)), Ordering::AcqRel);
        }
    }

    pub fn test(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / 64].load(Ordering::Acquire) & (1 << (cpu % 64)) != 0
    }

    /// Clear the bit and report whether it was set. Exactly one of any number
    /// of concurrent callers observes `true` for a set bit.
    pub fn test_and_clear(&self, cpu: usize) -> bool {
        if cpu >= MAX_CPUS {
            return false;
        }
        let bit = 1 << (cpu % 64);
        self.bits[cpu / 64].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn snapshot(&self) -> CpuMask {
        let mut mask = CpuMask::new();
        for (w, a) in mask.bits.iter_mut().zip(self.bits.iter()) {
            *w = a.load(Ordering::Acquire);
        }
        mask
    }
}
