//! Site identifiers and vector clocks.
//!
//! Every connected replica owns a [`SiteId`]. A [`VectorClock`] maps sites to
//! the number of operations that site has originated and that this replica
//! has observed. Clocks are the only primitive used to decide whether two
//! operations need conflict handling at all.
//!
//! Complexity:
//! - tick: O(log n)
//! - merge: O(n) where n is the number of sites
//! - compare: O(n)
//!
//! Reference: Kleppmann, Chapter 5, Detecting Concurrent Writes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable identifier of one connected replica.
///
/// Sites are totally ordered; that order is the tie-break for concurrent
/// inserts at the same position and must be identical on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub Uuid);

impl SiteId {
    /// Reserved site that owns the initial content of a shared document.
    ///
    /// It never appears in a vector clock and never originates operations.
    pub const INITIAL: SiteId = SiteId(Uuid::nil());

    /// Generate a fresh random site id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a site id from a fixed value (tests, deterministic fixtures).
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn is_initial(&self) -> bool {
        *self == Self::INITIAL
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SiteId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps logs readable.
        let s = self.0.to_string();
        f.write_str(&s[..8])
    }
}

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Left happened before right.
    Before,
    /// Left happened after right.
    After,
    /// Neither dominates the other.
    Concurrent,
    /// Identical in every coordinate.
    Equal,
}

/// Per-site causal counters.
///
/// Missing sites read as zero. Backed by a `BTreeMap` so that serialization
/// and iteration are deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<SiteId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `site` (zero if never seen).
    #[inline]
    pub fn get(&self, site: &SiteId) -> u64 {
        self.counters.get(site).copied().unwrap_or(0)
    }

    /// Increment `site`'s own counter and return the new value.
    ///
    /// Called exactly once per locally originated operation.
    pub fn tick(&mut self, site: SiteId) -> u64 {
        let counter = self.counters.entry(site).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Raise `site` to at least `value`.
    pub fn observe(&mut self, site: SiteId, value: u64) {
        if value == 0 {
            return;
        }
        let counter = self.counters.entry(site).or_insert(0);
        *counter = (*counter).max(value);
    }

    /// Pointwise maximum, in place.
    pub fn merge(&mut self, other: &VectorClock) {
        for (site, &value) in &other.counters {
            self.observe(*site, value);
        }
    }

    /// Pointwise maximum of two clocks.
    pub fn merged(a: &VectorClock, b: &VectorClock) -> VectorClock {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    /// Pointwise minimum. Sites missing from either side drop to zero.
    pub fn meet(&self, other: &VectorClock) -> VectorClock {
        let counters = self
            .counters
            .iter()
            .filter_map(|(site, &value)| {
                let min = value.min(other.get(site));
                (min > 0).then_some((*site, min))
            })
            .collect();
        VectorClock { counters }
    }

    /// Causal relation between `self` and `other`.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut less = false;
        let mut greater = false;

        for site in self.counters.keys().chain(other.counters.keys()) {
            let a = self.get(site);
            let b = other.get(site);
            if a < b {
                less = true;
            }
            if a > b {
                greater = true;
            }
            if less && greater {
                return Causality::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True iff `self >= other` in every coordinate.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Causality::After | Causality::Equal)
    }

    /// True iff the `counter`-th operation of `site` is covered by this clock.
    #[inline]
    pub fn covers(&self, site: &SiteId, counter: u64) -> bool {
        counter <= self.get(site)
    }

    /// Sum of all counters.
    ///
    /// Strictly increases along causality (if `a` happened before `b` then
    /// `a.sum() < b.sum()`), which makes it usable as a Lamport rank.
    pub fn sum(&self) -> u64 {
        self.counters.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.counters.iter()
    }

    pub fn sites(&self) -> impl Iterator<Item = &SiteId> {
        self.counters.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }
}

impl FromIterator<(SiteId, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (SiteId, u64)>>(iter: T) -> Self {
        let mut clock = VectorClock::new();
        for (site, value) in iter {
            clock.observe(site, value);
        }
        clock
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (site, value)) in self.counters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{site}:{value}")?;
        }
        f.write_str("}")
    }
}
