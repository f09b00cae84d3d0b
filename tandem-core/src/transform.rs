//! Offset transforms for positional metadata.
//!
//! Text content is ordered by the CRDT alone. Everything that refers to the
//! text by *offset* (cursors, selections, comment anchors, lock ranges) is
//! not part of the CRDT and has to be shifted as the text changes underneath
//! it. The store reports each applied operation as a [`TextEffect`]; this
//! module turns that into a [`TextEdit`] and shifts offsets accordingly.
//!
//! ```text
//!   "ab|cd"   cursor at 2
//!   remote insert "X" at 1  ──►  "aXb|cd"  cursor at 3
//!   remote delete at 0       ──►  "Xb|cd"   cursor at 2
//! ```
//!
//! When an insert lands exactly on an offset, the offset moves past it iff
//! the editing site sorts before the offset's owner. Every replica applies
//! the same rule, so derived views converge too.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::clock::{Causality, SiteId, VectorClock};
use crate::op::Operation;
use crate::text::{AppliedOp, TextEffect};

/// Shape of a text change in rendered coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    Insert { len: usize },
    Delete { len: usize },
    Retain,
}

/// One text change, as seen by positional metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub site: SiteId,
    pub clock: VectorClock,
    pub index: usize,
    pub kind: EditKind,
}

impl TextEdit {
    /// Edit produced by applying `op`. `None` when nothing visible moved.
    pub fn from_effect(op: &Operation, effect: TextEffect) -> Option<Self> {
        let (index, kind) = match effect {
            TextEffect::Inserted { index } => (index, EditKind::Insert { len: 1 }),
            TextEffect::Deleted { index } => (index, EditKind::Delete { len: 1 }),
            TextEffect::Formatted { .. } | TextEffect::Noop => return None,
        };
        Some(Self {
            site: op.site(),
            clock: op.clock.clone(),
            index,
            kind,
        })
    }

    pub fn from_applied(applied: &AppliedOp) -> Option<Self> {
        Self::from_effect(&applied.op, applied.effect)
    }

    /// Net change in visible length.
    pub fn delta(&self) -> isize {
        match self.kind {
            EditKind::Insert { len } => len as isize,
            EditKind::Delete { len } => -(len as isize),
            EditKind::Retain => 0,
        }
    }
}

/// Something that holds text offsets.
pub trait Shift {
    /// Move offsets across `edit`. `edit_first` decides ties: an insert at
    /// exactly this offset lands before it.
    fn shift(&mut self, edit: &TextEdit, edit_first: bool);
}

impl Shift for usize {
    fn shift(&mut self, edit: &TextEdit, edit_first: bool) {
        let p = *self;
        let i = edit.index;
        *self = match edit.kind {
            EditKind::Insert { len } if i < p || (i == p && edit_first) => p + len,
            EditKind::Insert { .. } | EditKind::Retain => p,
            EditKind::Delete { .. } if i >= p => p,
            EditKind::Delete { len } if i + len <= p => p - len,
            // Offset was inside the deleted span.
            EditKind::Delete { .. } => i,
        };
    }
}

impl Shift for Range<usize> {
    fn shift(&mut self, edit: &TextEdit, edit_first: bool) {
        let empty = self.start == self.end;
        self.start.shift(edit, edit_first);
        if empty {
            self.end = self.start;
        } else {
            // Inserts at the end of a non-empty range stay outside it.
            self.end.shift(edit, false);
            self.end = self.end.max(self.start);
        }
    }
}

impl<T: Shift> Shift for Option<T> {
    fn shift(&mut self, edit: &TextEdit, edit_first: bool) {
        if let Some(inner) = self {
            inner.shift(edit, edit_first);
        }
    }
}

/// Positional state owned by `site`, valid as of `clock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Positioned<T> {
    pub site: SiteId,
    pub clock: VectorClock,
    pub value: T,
}

impl<T> Positioned<T> {
    pub fn new(site: SiteId, clock: VectorClock, value: T) -> Self {
        Self { site, clock, value }
    }
}

/// Rebase `local` over `incoming`.
///
/// An edit that causally precedes `local` is already reflected in its
/// offsets and is skipped. Otherwise offsets are shifted, with ties at the
/// same insertion offset broken by ascending site id. Returns whether the
/// edit was applied.
pub fn transform<T: Shift>(local: &mut Positioned<T>, incoming: &TextEdit) -> bool {
    let apply = match incoming.clock.compare(&local.clock) {
        Causality::Before | Causality::Equal => false,
        Causality::After | Causality::Concurrent => true,
    };
    if apply {
        let edit_first = incoming.site < local.site;
        local.value.shift(incoming, edit_first);
    }
    local.clock.merge(&incoming.clock);
    apply
}
