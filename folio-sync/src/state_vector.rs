//! Per-origin logical clocks.
//!
//! A state vector maps each origin (client id) to the highest update clock
//! seen from it. Merging takes the pointwise maximum, so clocks never go
//! backwards.

use std::collections::BTreeMap;

/// Origin id → highest clock seen.
///
/// Backed by a `BTreeMap` so encoding order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector {
    clocks: BTreeMap<u64, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock recorded for `origin`, 0 if unseen.
    pub fn get(&self, origin: u64) -> u64 {
        self.clocks.get(&origin).copied().unwrap_or(0)
    }

    /// Whether `origin` has an entry.
    pub fn contains(&self, origin: u64) -> bool {
        self.clocks.contains_key(&origin)
    }

    /// Overwrite the clock for `origin`.
    pub fn set(&mut self, origin: u64, clock: u64) {
        self.clocks.insert(origin, clock);
    }

    /// Raise `origin` to `clock` if it is higher. Returns whether it changed.
    pub fn observe(&mut self, origin: u64, clock: u64) -> bool {
        let entry = self.clocks.entry(origin).or_insert(0);
        if clock > *entry {
            *entry = clock;
            true
        } else {
            false
        }
    }

    /// Pointwise maximum with `other`. Returns whether any clock advanced.
    pub fn merge(&mut self, other: &StateVector) -> bool {
        let mut changed = false;
        for (&origin, &clock) in &other.clocks {
            // `|` so every entry is visited
            changed |= self.observe(origin, clock);
        }
        changed
    }

    /// Merged copy of `self` and `other`.
    pub fn merged(&self, other: &StateVector) -> StateVector {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Iterate `(origin, clock)` in ascending origin order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.clocks.iter().map(|(&o, &c)| (o, c))
    }
}

impl FromIterator<(u64, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        Self {
            clocks: iter.into_iter().collect(),
        }
    }
}
