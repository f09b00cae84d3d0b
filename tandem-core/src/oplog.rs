//! Append-only causal operation history.
//!
//! Every accepted operation (local or remote) is appended exactly once,
//! keyed by its [`OpId`]. The log answers three questions:
//!
//! - what happened since a given clock (for late joiners and diagnostics),
//! - which logged operations are concurrent with an incoming one,
//! - what the causal frontier is, so replicas can agree on a safe point
//!   below which tombstones and history can be dropped.
//!
//! Reference: Kleppmann, Chapter 5, Detecting Concurrent Writes

use std::collections::HashMap;

use crate::clock::{Causality, VectorClock};
use crate::op::{OpId, Operation};

/// True iff neither operation causally precedes the other.
pub fn is_concurrent(a: &Operation, b: &Operation) -> bool {
    a.clock.compare(&b.clock) == Causality::Concurrent
}

/// Pointwise minimum of every participant's clock.
///
/// Everything at or below the result has been observed by all of them.
/// An empty input yields the empty clock (nothing is safe).
pub fn safe_point<'a, I>(clocks: I) -> VectorClock
where
    I: IntoIterator<Item = &'a VectorClock>,
{
    let mut clocks = clocks.into_iter();
    let Some(first) = clocks.next() else {
        return VectorClock::new();
    };
    clocks.fold(first.clone(), |acc, clock| acc.meet(clock))
}

/// Operations in the order they were accepted by this replica.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    ops: Vec<Operation>,
    index: HashMap<OpId, usize>,
    /// Pointwise max of every appended clock.
    frontier: VectorClock,
    /// Everything at or below this clock has been truncated.
    floor: VectorClock,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `op`. Returns `false` (and does nothing) for a known id.
    pub fn append(&mut self, op: Operation) -> bool {
        if self.contains(&op.id) {
            return false;
        }
        self.frontier.merge(&op.clock);
        self.index.insert(op.id, self.ops.len());
        self.ops.push(op);
        true
    }

    /// Known id, including ids already truncated away.
    pub fn contains(&self, id: &OpId) -> bool {
        self.index.contains_key(id) || self.floor.covers(&id.site, id.counter)
    }

    pub fn get(&self, id: &OpId) -> Option<&Operation> {
        self.index.get(id).map(|&i| &self.ops[i])
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    pub fn frontier(&self) -> &VectorClock {
        &self.frontier
    }

    pub fn floor(&self) -> &VectorClock {
        &self.floor
    }

    /// Operations not yet covered by `clock`, in log order.
    ///
    /// Returns `None` when part of that history has already been truncated;
    /// the caller has to fall back to a full-state sync.
    pub fn since(&self, clock: &VectorClock) -> Option<Vec<&Operation>> {
        if !clock.dominates(&self.floor) {
            return None;
        }
        Some(
            self.ops
                .iter()
                .filter(|op| !clock.covers(&op.id.site, op.id.counter))
                .collect(),
        )
    }

    /// Logged operations concurrent with `op`.
    pub fn concurrent_with<'a>(&'a self, op: &'a Operation) -> impl Iterator<Item = &'a Operation> {
        self.ops
            .iter()
            .filter(move |logged| logged.id != op.id && is_concurrent(logged, op))
    }

    /// Drop every operation covered by `safe_point`. Returns how many.
    pub fn truncate_covered(&mut self, safe_point: &VectorClock) -> usize {
        let before = self.ops.len();
        self.ops
            .retain(|op| !safe_point.covers(&op.id.site, op.id.counter));
        let dropped = before - self.ops.len();
        if dropped > 0 {
            self.index = self
                .ops
                .iter()
                .enumerate()
                .map(|(i, op)| (op.id, i))
                .collect();
        }
        self.floor.merge(safe_point);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SiteId;
    use crate::op::OpKind;

    fn site(n: u128) -> SiteId {
        SiteId::from_u128(n)
    }

    fn op(s: u128, counter: u64, clock: &[(u128, u64)]) -> Operation {
        Operation::new(
            OpId::new(site(s), counter),
            OpKind::Retain { count: 0 },
            clock.iter().map(|(s, c)| (site(*s), *c)).collect(),
        )
    }

    #[test]
    fn test_append_is_keyed_by_id() {
        let mut log = OperationLog::new();
        assert!(log.append(op(1, 1, &[(1, 1)])));
        assert!(!log.append(op(1, 1, &[(1, 1)])));
        assert_eq!(log.len(), 1);
        assert!(log.contains(&OpId::new(site(1), 1)));
    }

    #[test]
    fn test_is_concurrent() {
        let a = op(1, 1, &[(1, 1)]);
        let b = op(2, 1, &[(2, 1)]);
        let c = op(2, 2, &[(1, 1), (2, 2)]);

        assert!(is_concurrent(&a, &b));
        assert!(!is_concurrent(&a, &c));
        assert!(!is_concurrent(&c, &a));
    }

    #[test]
    fn test_concurrent_with() {
        let mut log = OperationLog::new();
        log.append(op(1, 1, &[(1, 1)]));
        log.append(op(1, 2, &[(1, 2)]));
        log.append(op(2, 1, &[(1, 1), (2, 1)]));

        let incoming = op(3, 1, &[(1, 1), (3, 1)]);
        let ids: Vec<OpId> = log.concurrent_with(&incoming).map(|o| o.id).collect();
        assert_eq!(ids, vec![OpId::new(site(1), 2), OpId::new(site(2), 1)]);
    }

    #[test]
    fn test_since() {
        let mut log = OperationLog::new();
        log.append(op(1, 1, &[(1, 1)]));
        log.append(op(1, 2, &[(1, 2)]));
        log.append(op(2, 1, &[(2, 1)]));

        let seen: VectorClock = [(site(1), 1)].into_iter().collect();
        let missing = log.since(&seen).unwrap();
        assert_eq!(missing.len(), 2);
        assert_eq!(log.frontier().get(&site(1)), 2);
        assert_eq!(log.frontier().get(&site(2)), 1);
    }

    #[test]
    fn test_truncate_covered() {
        let mut log = OperationLog::new();
        log.append(op(1, 1, &[(1, 1)]));
        log.append(op(1, 2, &[(1, 2)]));
        log.append(op(2, 1, &[(2, 1)]));

        let safe: VectorClock = [(site(1), 1), (site(2), 1)].into_iter().collect();
        assert_eq!(log.truncate_covered(&safe), 2);
        assert_eq!(log.len(), 1);
        assert!(log.get(&OpId::new(site(1), 2)).is_some());

        // Truncated ids are still recognised as seen.
        assert!(log.contains(&OpId::new(site(1), 1)));
        assert!(!log.append(op(1, 1, &[(1, 1)])));

        // A replica behind the floor cannot be served from the log.
        assert!(log.since(&VectorClock::new()).is_none());
        assert_eq!(log.since(&safe).map(|ops| ops.len()), Some(1));
    }

    #[test]
    fn test_safe_point() {
        let a: VectorClock = [(site(1), 4), (site(2), 2)].into_iter().collect();
        let b: VectorClock = [(site(1), 3), (site(2), 5)].into_iter().collect();
        let c: VectorClock = [(site(1), 6), (site(2), 2), (site(3), 1)].into_iter().collect();

        let safe = safe_point([&a, &b, &c]);
        assert_eq!(safe.get(&site(1)), 3);
        assert_eq!(safe.get(&site(2)), 2);
        assert_eq!(safe.get(&site(3)), 0);

        assert!(safe_point(std::iter::empty()).is_empty());
    }
}
