//! Operations: the unit of replication.
//!
//! An operation is created locally on edit, appended to the operation log,
//! transmitted, and applied exactly once on every replica. Its id doubles as
//! the id of the character it inserts, so anchors and delete targets are
//! plain [`OpId`]s.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::clock::{SiteId, VectorClock};
use crate::error::CoreError;

/// Globally unique operation id: `(site, counter)`.
///
/// `counter` is the origin site's own vector-clock coordinate right after
/// the tick that created the operation, so ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub site: SiteId,
    pub counter: u64,
}

impl OpId {
    pub fn new(site: SiteId, counter: u64) -> Self {
        Self { site, counter }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.site)
    }
}

/// Wire-level operation type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpType {
    Insert = 1,
    Delete = 2,
    Retain = 3,
    Format = 4,
}

/// Payload of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert one character immediately after `anchor` (`None` = document start).
    Insert { anchor: Option<OpId>, value: char },
    /// Tombstone the character inserted by `target`.
    Delete { target: OpId },
    /// Advance without changing content. Carried for OT-style clients; the
    /// text store treats it as a no-op.
    Retain { count: usize },
    /// Merge `attributes` into the formatting of every target character.
    Format {
        targets: Vec<OpId>,
        attributes: BTreeMap<String, String>,
    },
}

impl OpKind {
    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::Insert { .. } => OpType::Insert,
            OpKind::Delete { .. } => OpType::Delete,
            OpKind::Retain { .. } => OpType::Retain,
            OpKind::Format { .. } => OpType::Format,
        }
    }

    /// Entries this operation refers to (anchor, delete target, format targets).
    pub fn references(&self) -> Vec<OpId> {
        match self {
            OpKind::Insert { anchor, .. } => anchor.iter().copied().collect(),
            OpKind::Delete { target } => vec![*target],
            OpKind::Retain { .. } => Vec::new(),
            OpKind::Format { targets, .. } => targets.clone(),
        }
    }
}

/// A replicated operation stamped with its origin's vector clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
    /// Origin's clock right after ticking for this operation.
    pub clock: VectorClock,
}

impl Operation {
    pub fn new(id: OpId, kind: OpKind, clock: VectorClock) -> Self {
        Self { id, kind, clock }
    }

    #[inline]
    pub fn site(&self) -> SiteId {
        self.id.site
    }

    #[inline]
    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    /// Lamport rank used to order concurrent siblings and formatting writes.
    #[inline]
    pub fn rank(&self) -> u64 {
        self.clock.sum()
    }

    /// Structural validation of a remote payload.
    ///
    /// Checks that the id matches the clock snapshot, that the origin is not
    /// the reserved initial site, and that every referenced entry was known
    /// to the origin when the operation was created.
    pub fn validate(&self) -> Result<(), CoreError> {
        let malformed = |reason: &str| CoreError::Malformed {
            id: self.id,
            reason: reason.to_string(),
        };

        if self.id.site.is_initial() {
            return Err(malformed("initial site cannot originate operations"));
        }
        if self.id.counter == 0 {
            return Err(malformed("counter must be positive"));
        }
        if self.clock.get(&self.id.site) != self.id.counter {
            return Err(malformed("id does not match clock snapshot"));
        }
        for target in self.kind.references() {
            if target.site.is_initial() {
                continue;
            }
            if target == self.id || !self.clock.covers(&target.site, target.counter) {
                return Err(CoreError::UnknownEntry {
                    op: self.id,
                    target,
                });
            }
        }
        if let OpKind::Format { targets, .. } = &self.kind {
            if targets.is_empty() {
                return Err(malformed("format without targets"));
            }
        }
        Ok(())
    }
}
