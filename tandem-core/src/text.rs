//! Tombstone-based CRDT text store (RGA).
//!
//! Every character is an [`Entry`] tagged with the id of the operation that
//! inserted it and the id of its left neighbour at insert time (its origin).
//! The document order is the pre-order walk of the origin tree, with
//! siblings ordered by descending rank and ascending site id. That order
//! depends only on the *set* of entries, never on delivery order.
//!
//! ```text
//!  origin tree                 document order
//!
//!   ∅ ── a ── b ─┬─ X (P1)      a b X Y c d
//!                ├─ Y (P2)
//!                └─ c ── d
//! ```
//!
//! Remote operations are applied in causal order: an operation whose clock
//! is not yet satisfied is parked in a bounded buffer and released once its
//! dependencies arrive. Deletes only flip a tombstone; entries are physically
//! dropped by [`TextStore::compact`] once every replica has observed the
//! deletion.
//!
//! Reference: Roh et al., Replicated Abstract Data Types (RGA), 2011

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use crate::clock::{SiteId, VectorClock};
use crate::error::CoreError;
use crate::op::{OpId, OpKind, Operation};

/// Default bound on operations parked while waiting for their dependencies.
pub const DEFAULT_MAX_DEFERRED: usize = 4096;

/// One formatting attribute value with its last-writer-wins stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatValue {
    pub value: String,
    pub rank: u64,
    pub site: SiteId,
}

impl FormatValue {
    fn wins_over(&self, other: &FormatValue) -> bool {
        (self.rank, self.site) > (other.rank, other.site)
    }
}

/// Per-character formatting attributes (LWW per attribute).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formatting {
    attributes: BTreeMap<String, FormatValue>,
}

impl Formatting {
    /// Write `attributes` stamped with `(rank, site)`; older stamps lose.
    fn apply(&mut self, attributes: &BTreeMap<String, String>, rank: u64, site: SiteId) {
        for (key, value) in attributes {
            let candidate = FormatValue {
                value: value.clone(),
                rank,
                site,
            };
            self.put(key.clone(), candidate);
        }
    }

    fn put(&mut self, key: String, candidate: FormatValue) {
        match self.attributes.get(&key) {
            Some(current) if !candidate.wins_over(current) => {}
            _ => {
                self.attributes.insert(key, candidate);
            }
        }
    }

    fn merge(&mut self, other: &Formatting) {
        for (key, value) in &other.attributes {
            self.put(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.value.as_str()))
    }
}

/// A single character of the replicated sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: OpId,
    /// Left neighbour at insert time (`None` = document start).
    pub origin: Option<OpId>,
    pub value: char,
    /// Lamport rank of the inserting operation.
    pub rank: u64,
    /// Delete that tombstoned this entry. Concurrent deletes keep the
    /// smallest id so replicas agree.
    pub deleted_by: Option<OpId>,
    pub formatting: Formatting,
}

impl Entry {
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted_by.is_some()
    }
}

/// Visible effect of applying one operation, in rendered-text coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEffect {
    /// A character appeared at `index`.
    Inserted { index: usize },
    /// The character previously at `index` disappeared.
    Deleted { index: usize },
    /// `count` visible characters changed formatting.
    Formatted { count: usize },
    /// Accepted, but nothing visible changed.
    Noop,
}

/// An operation together with what it did to the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub op: Operation,
    pub effect: TextEffect,
}

/// Outcome of [`TextStore::apply_remote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedResult {
    /// The operation and every buffered operation it unblocked, in apply order.
    Applied(Vec<AppliedOp>),
    /// The id was already covered by the local clock.
    AlreadyApplied,
    /// Waiting for causal dependencies.
    Deferred,
}

/// Full CRDT state for resync: entries in document order plus the clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSnapshot {
    pub clock: VectorClock,
    pub entries: Vec<Entry>,
}

impl TextSnapshot {
    /// Rendered text of the snapshot.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .filter(|e| !e.is_deleted())
            .map(|e| e.value)
            .collect()
    }
}

/// Single-writer replica of one document's text.
#[derive(Debug, Clone)]
pub struct TextStore {
    site: SiteId,
    clock: VectorClock,
    /// Arena of entries; all cross references are ids.
    entries: Vec<Entry>,
    index: HashMap<OpId, usize>,
    /// Arena slots in document order.
    order: Vec<usize>,
    /// Number of entries whose origin is the given slot.
    children: Vec<u32>,
    visible: usize,
    deferred: Vec<Operation>,
    max_deferred: usize,
}

impl TextStore {
    /// Empty store for the given local site.
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            clock: VectorClock::new(),
            entries: Vec::new(),
            index: HashMap::new(),
            order: Vec::new(),
            children: Vec::new(),
            visible: 0,
            deferred: Vec::new(),
            max_deferred: DEFAULT_MAX_DEFERRED,
        }
    }

    /// Store seeded with `content` owned by [`SiteId::INITIAL`].
    ///
    /// Seeding is deterministic, so every replica seeded with the same
    /// content agrees on ids and order.
    pub fn with_content(site: SiteId, content: &str) -> Self {
        let mut store = Self::new(site);
        let mut anchor = None;
        for (i, value) in content.chars().enumerate() {
            let id = OpId::new(SiteId::INITIAL, i as u64 + 1);
            store.integrate(Entry {
                id,
                origin: anchor,
                value,
                rank: 0,
                deleted_by: None,
                formatting: Formatting::default(),
            });
            anchor = Some(id);
        }
        store
    }

    /// Rebuild a replica from a snapshot taken on another replica.
    pub fn from_snapshot(site: SiteId, snapshot: TextSnapshot) -> Self {
        let mut store = Self::new(site);
        store.clock = snapshot.clock;
        for entry in snapshot.entries {
            let slot = store.entries.len();
            if let Some(origin) = entry.origin {
                match store.index.get(&origin) {
                    Some(&o) => store.children[o] += 1,
                    None => log::warn!("snapshot entry {} has unknown origin {origin}", entry.id),
                }
            }
            if !entry.is_deleted() {
                store.visible += 1;
            }
            store.index.insert(entry.id, slot);
            store.entries.push(entry);
            store.children.push(0);
            store.order.push(slot);
        }
        store
    }

    /// Override the bound on parked remote operations.
    pub fn with_max_deferred(mut self, max: usize) -> Self {
        self.max_deferred = max.max(1);
        self
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Entries physically present, tombstones included.
    pub fn entry_count(&self) -> usize {
        self.order.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.order.len() - self.visible
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Forget a parked operation. Returns false if it was not parked.
    pub fn discard_deferred(&mut self, id: &OpId) -> bool {
        let before = self.deferred.len();
        self.deferred.retain(|op| op.id != *id);
        self.deferred.len() != before
    }

    pub fn entry(&self, id: &OpId) -> Option<&Entry> {
        self.index.get(id).map(|&slot| &self.entries[slot])
    }

    /// All entries in document order, tombstones included.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.order.iter().map(move |&slot| &self.entries[slot])
    }

    /// Linearize the visible characters.
    pub fn render(&self) -> String {
        self.visible_entries().map(|e| e.value).collect()
    }

    /// Id of the visible character at `index`.
    pub fn id_at(&self, index: usize) -> Option<OpId> {
        self.visible_entries().nth(index).map(|e| e.id)
    }

    /// Visible index of `id`, or `None` if unknown or deleted.
    pub fn index_of(&self, id: &OpId) -> Option<usize> {
        let slot = *self.index.get(id)?;
        if self.entries[slot].is_deleted() {
            return None;
        }
        self.visible_entries().position(|e| e.id == *id)
    }

    fn visible_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries().filter(|e| !e.is_deleted())
    }

    // ───────────────────────────────────────────────────────────────
    // Local edits
    // ───────────────────────────────────────────────────────────────

    /// Insert `value` immediately after `after` (`None` = document start).
    ///
    /// `after` must be a visible entry: tombstones never anchor new text.
    pub fn local_insert(&mut self, after: Option<OpId>, value: char) -> Result<AppliedOp, CoreError> {
        if let Some(anchor) = after {
            let entry = self.entry(&anchor).ok_or(CoreError::EntryNotFound(anchor))?;
            if entry.is_deleted() {
                return Err(CoreError::AnchorDeleted(anchor));
            }
        }

        let op = self.next_op(|_| OpKind::Insert {
            anchor: after,
            value,
        });
        let effect = self.integrate(Entry {
            id: op.id,
            origin: after,
            value,
            rank: op.rank(),
            deleted_by: None,
            formatting: Formatting::default(),
        });
        Ok(AppliedOp { op, effect })
    }

    /// Tombstone the entry `id`. The entry is never physically removed here.
    pub fn local_delete(&mut self, id: OpId) -> Result<AppliedOp, CoreError> {
        let slot = *self.index.get(&id).ok_or(CoreError::EntryNotFound(id))?;
        if self.entries[slot].is_deleted() {
            return Err(CoreError::AlreadyDeleted(id));
        }

        let op = self.next_op(|_| OpKind::Delete { target: id });
        let effect = self.tombstone(slot, op.id);
        Ok(AppliedOp { op, effect })
    }

    /// Merge `attributes` into the formatting of `targets`.
    pub fn local_format(
        &mut self,
        targets: Vec<OpId>,
        attributes: BTreeMap<String, String>,
    ) -> Result<AppliedOp, CoreError> {
        if targets.is_empty() {
            return Err(CoreError::OutOfBounds { index: 0, len: self.visible });
        }
        for target in &targets {
            if !self.index.contains_key(target) {
                return Err(CoreError::EntryNotFound(*target));
            }
        }

        let op = self.next_op(|_| OpKind::Format {
            targets: targets.clone(),
            attributes: attributes.clone(),
        });
        let effect = self.format(&targets, &attributes, op.rank(), op.id.site);
        Ok(AppliedOp { op, effect })
    }

    /// Insert `text` so that it starts at visible `index`.
    ///
    /// Produces one operation per character, each anchored on the previous.
    pub fn insert_at(&mut self, index: usize, text: &str) -> Result<Vec<AppliedOp>, CoreError> {
        if index > self.visible {
            return Err(CoreError::OutOfBounds { index, len: self.visible });
        }
        let mut anchor = match index {
            0 => None,
            i => self.id_at(i - 1),
        };
        let mut applied = Vec::with_capacity(text.len());
        for value in text.chars() {
            let op = self.local_insert(anchor, value)?;
            anchor = Some(op.op.id);
            applied.push(op);
        }
        Ok(applied)
    }

    /// Delete the visible characters in `range`.
    pub fn delete_range(&mut self, range: Range<usize>) -> Result<Vec<AppliedOp>, CoreError> {
        let ids = self.ids_in(range)?;
        ids.into_iter().map(|id| self.local_delete(id)).collect()
    }

    /// Format the visible characters in `range` with one operation.
    pub fn format_range(
        &mut self,
        range: Range<usize>,
        attributes: BTreeMap<String, String>,
    ) -> Result<AppliedOp, CoreError> {
        let ids = self.ids_in(range)?;
        self.local_format(ids, attributes)
    }

    fn ids_in(&self, range: Range<usize>) -> Result<Vec<OpId>, CoreError> {
        if range.end > self.visible || range.start > range.end {
            return Err(CoreError::OutOfBounds {
                index: range.end,
                len: self.visible,
            });
        }
        Ok(self
            .visible_entries()
            .skip(range.start)
            .take(range.end - range.start)
            .map(|e| e.id)
            .collect())
    }

    fn next_op(&mut self, kind: impl FnOnce(OpId) -> OpKind) -> Operation {
        let counter = self.clock.tick(self.site);
        let id = OpId::new(self.site, counter);
        Operation::new(id, kind(id), self.clock.clone())
    }

    // ───────────────────────────────────────────────────────────────
    // Remote operations
    // ───────────────────────────────────────────────────────────────

    /// Apply an operation received from another replica.
    ///
    /// Idempotent by id, tolerant of reordering (parks operations until
    /// their causal dependencies are present) and all-or-nothing: an `Err`
    /// leaves the store untouched.
    pub fn apply_remote(&mut self, op: Operation) -> Result<AppliedResult, CoreError> {
        if self.clock.covers(&op.id.site, op.id.counter) {
            return Ok(AppliedResult::AlreadyApplied);
        }
        if self.deferred.iter().any(|d| d.id == op.id) {
            return Ok(AppliedResult::Deferred);
        }
        op.validate()?;

        if !self.is_ready(&op) {
            self.defer(op);
            return Ok(AppliedResult::Deferred);
        }

        let mut applied = vec![self.apply_ready(op)?];
        self.drain_deferred(&mut applied);
        Ok(AppliedResult::Applied(applied))
    }

    /// Causal delivery check: the next op from its origin, and everything
    /// else it depends on already applied here.
    fn is_ready(&self, op: &Operation) -> bool {
        op.clock.iter().all(|(site, &counter)| {
            if *site == op.id.site {
                counter == self.clock.get(site) + 1
            } else {
                counter <= self.clock.get(site)
            }
        })
    }

    fn defer(&mut self, op: Operation) {
        if self.deferred.len() >= self.max_deferred {
            let dropped = self.deferred.remove(0);
            log::warn!(
                "deferred buffer full ({}), dropping {}; a resync will recover it",
                self.max_deferred,
                dropped.id
            );
        }
        log::trace!("deferring {} until {} is satisfied", op.id, op.clock);
        self.deferred.push(op);
    }

    fn drain_deferred(&mut self, applied: &mut Vec<AppliedOp>) {
        loop {
            self.deferred
                .retain(|op| !self.clock.covers(&op.id.site, op.id.counter));
            let Some(pos) = self.deferred.iter().position(|op| self.is_ready(op)) else {
                break;
            };
            let op = self.deferred.remove(pos);
            let id = op.id;
            match self.apply_ready(op) {
                Ok(done) => applied.push(done),
                Err(e) => log::warn!("dropping deferred operation {id}: {e}"),
            }
        }
    }

    /// Check every reference before touching state.
    fn check_references(&self, op: &Operation) -> Result<(), CoreError> {
        let must_exist = matches!(op.kind, OpKind::Insert { .. });
        for target in op.kind.references() {
            if self.index.contains_key(&target) {
                continue;
            }
            // Covered but absent means compacted: fine for deletes and
            // formats (the entry was a tombstone), fatal for anchors.
            let compacted = !target.site.is_initial()
                && self.clock.covers(&target.site, target.counter);
            if must_exist || !compacted {
                return Err(CoreError::UnknownEntry { op: op.id, target });
            }
        }
        Ok(())
    }

    fn apply_ready(&mut self, op: Operation) -> Result<AppliedOp, CoreError> {
        self.check_references(&op)?;

        let effect = match &op.kind {
            OpKind::Insert { anchor, value } => self.integrate(Entry {
                id: op.id,
                origin: *anchor,
                value: *value,
                rank: op.rank(),
                deleted_by: None,
                formatting: Formatting::default(),
            }),
            OpKind::Delete { target } => match self.index.get(target) {
                Some(&slot) => self.tombstone(slot, op.id),
                None => TextEffect::Noop,
            },
            OpKind::Format {
                targets,
                attributes,
            } => self.format(targets, attributes, op.rank(), op.id.site),
            OpKind::Retain { .. } => TextEffect::Noop,
        };

        self.clock.merge(&op.clock);
        Ok(AppliedOp { op, effect })
    }

    // ───────────────────────────────────────────────────────────────
    // Structural mutation
    // ───────────────────────────────────────────────────────────────

    /// Place a new entry and return its visible index.
    fn integrate(&mut self, entry: Entry) -> TextEffect {
        let slot = self.entries.len();
        if let Some(origin) = entry.origin {
            if let Some(&o) = self.index.get(&origin) {
                self.children[o] += 1;
            }
        }
        let deleted = entry.is_deleted();
        self.index.insert(entry.id, slot);
        self.entries.push(entry);
        self.children.push(0);

        let pos = self.find_position(slot);
        self.order.insert(pos, slot);

        if deleted {
            return TextEffect::Noop;
        }
        self.visible += 1;
        TextEffect::Inserted {
            index: self.visible_before(pos),
        }
    }

    /// Scan right from the origin, skipping siblings that sort first and
    /// everything in their subtrees.
    fn find_position(&self, slot: usize) -> usize {
        let entry = &self.entries[slot];
        let (mut pos, mut subtree) = match entry.origin {
            None => (0, None),
            Some(origin) => {
                let start = self
                    .index
                    .get(&origin)
                    .and_then(|o| self.order.iter().position(|s| s == o))
                    .map_or(self.order.len(), |p| p + 1);
                (start, Some(HashSet::from([origin])))
            }
        };

        while pos < self.order.len() {
            let current = &self.entries[self.order[pos]];
            if let Some(seen) = &subtree {
                match current.origin {
                    Some(o) if seen.contains(&o) => {}
                    _ => break,
                }
            }
            if current.origin == entry.origin && !sorts_before(current, entry) {
                break;
            }
            if let Some(seen) = subtree.as_mut() {
                seen.insert(current.id);
            }
            pos += 1;
        }
        pos
    }

    fn visible_before(&self, pos: usize) -> usize {
        self.order[..pos]
            .iter()
            .filter(|&&slot| !self.entries[slot].is_deleted())
            .count()
    }

    fn tombstone(&mut self, slot: usize, by: OpId) -> TextEffect {
        match self.entries[slot].deleted_by {
            Some(existing) => {
                if by < existing {
                    self.entries[slot].deleted_by = Some(by);
                }
                TextEffect::Noop
            }
            None => {
                let pos = self.order.iter().position(|&s| s == slot).unwrap_or(0);
                let index = self.visible_before(pos);
                self.entries[slot].deleted_by = Some(by);
                self.visible -= 1;
                TextEffect::Deleted { index }
            }
        }
    }

    fn format(
        &mut self,
        targets: &[OpId],
        attributes: &BTreeMap<String, String>,
        rank: u64,
        site: SiteId,
    ) -> TextEffect {
        let mut count = 0;
        for target in targets {
            let Some(&slot) = self.index.get(target) else {
                continue;
            };
            let entry = &mut self.entries[slot];
            // Formatting a deleted character is harmless and invisible.
            if entry.is_deleted() {
                continue;
            }
            entry.formatting.apply(attributes, rank, site);
            count += 1;
        }
        match count {
            0 => TextEffect::Noop,
            count => TextEffect::Formatted { count },
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Snapshots and garbage collection
    // ───────────────────────────────────────────────────────────────

    /// Full state in document order.
    pub fn snapshot(&self) -> TextSnapshot {
        TextSnapshot {
            clock: self.clock.clone(),
            entries: self.entries().cloned().collect(),
        }
    }

    /// Join another replica's full state into this one.
    ///
    /// Union of entries, tombstones win, formatting merges per attribute,
    /// clocks merge pointwise. Returns parked operations that became
    /// applicable as a result.
    pub fn merge_snapshot(&mut self, snapshot: &TextSnapshot) -> Vec<AppliedOp> {
        let mut fresh = Vec::new();
        for incoming in &snapshot.entries {
            match self.index.get(&incoming.id) {
                Some(&slot) => {
                    if let Some(by) = incoming.deleted_by {
                        self.tombstone(slot, by);
                    }
                    self.entries[slot].formatting.merge(&incoming.formatting);
                }
                None => fresh.push(incoming.clone()),
            }
        }

        // Origins always rank below their children, so rank order places
        // every origin first; seeded content shares rank 0 and is chained by
        // counter.
        fresh.sort_by(|a, b| {
            (a.rank, a.id.site, a.id.counter).cmp(&(b.rank, b.id.site, b.id.counter))
        });
        let mut pending = fresh;
        loop {
            let before = pending.len();
            let mut blocked = Vec::new();
            for entry in pending {
                let ready = entry.origin.map_or(true, |o| self.index.contains_key(&o));
                if ready {
                    self.integrate(entry);
                } else {
                    blocked.push(entry);
                }
            }
            if blocked.is_empty() || blocked.len() == before {
                for entry in &blocked {
                    log::warn!("snapshot entry {} has no reachable origin, skipped", entry.id);
                }
                break;
            }
            pending = blocked;
        }

        self.clock.merge(&snapshot.clock);
        let mut applied = Vec::new();
        self.drain_deferred(&mut applied);
        applied
    }

    /// Physically drop tombstones whose deletion every replica has seen.
    ///
    /// `safe_point` must be the pointwise minimum of all participants'
    /// clocks. Only leaf tombstones are dropped (entries that still anchor
    /// other entries stay), which keeps the placement of future inserts
    /// identical to replicas that have not compacted yet. Returns the number
    /// of entries dropped.
    pub fn compact(&mut self, safe_point: &VectorClock) -> usize {
        let mut drop = vec![false; self.entries.len()];
        let mut dropped = 0;

        for &slot in self.order.iter().rev() {
            let entry = &self.entries[slot];
            let Some(by) = entry.deleted_by else {
                continue;
            };
            if self.children[slot] > 0 || !safe_point.covers(&by.site, by.counter) {
                continue;
            }
            drop[slot] = true;
            dropped += 1;
            if let Some(origin) = entry.origin {
                if let Some(&o) = self.index.get(&origin) {
                    self.children[o] -= 1;
                }
            }
        }

        if dropped == 0 {
            return 0;
        }

        let mut remap = vec![usize::MAX; self.entries.len()];
        let mut entries = Vec::with_capacity(self.entries.len() - dropped);
        let mut children = Vec::with_capacity(entries.capacity());
        for (slot, entry) in std::mem::take(&mut self.entries).into_iter().enumerate() {
            if drop[slot] {
                continue;
            }
            remap[slot] = entries.len();
            children.push(self.children[slot]);
            entries.push(entry);
        }
        self.order = self
            .order
            .iter()
            .filter(|&&slot| !drop[slot])
            .map(|&slot| remap[slot])
            .collect();
        self.index = entries
            .iter()
            .enumerate()
            .map(|(slot, e)| (e.id, slot))
            .collect();
        self.entries = entries;
        self.children = children;

        log::debug!("compacted {dropped} tombstones below {safe_point}");
        dropped
    }
}

/// Sibling order: higher rank first, then lower site id.
fn sorts_before(a: &Entry, b: &Entry) -> bool {
    match a.rank.cmp(&b.rank) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match a.id.site.cmp(&b.id.site) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a.id.counter > b.id.counter,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(n: u128) -> SiteId {
        SiteId::from_u128(n)
    }

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ops(applied: Vec<AppliedOp>) -> Vec<Operation> {
        applied.into_iter().map(|a| a.op).collect()
    }

    fn apply_all(store: &mut TextStore, ops: &[Operation]) {
        for op in ops {
            store.apply_remote(op.clone()).unwrap();
        }
    }

    #[test]
    fn test_local_insert_and_render() {
        let mut store = TextStore::new(site(1));
        store.insert_at(0, "hello").unwrap();
        assert_eq!(store.render(), "hello");
        assert_eq!(store.len(), 5);

        store.insert_at(5, " world").unwrap();
        store.insert_at(0, ">").unwrap();
        assert_eq!(store.render(), ">hello world");
    }

    #[test]
    fn test_local_insert_reports_index() {
        let mut store = TextStore::with_content(site(1), "abcd");
        let anchor = store.id_at(1);
        let applied = store.local_insert(anchor, 'X').unwrap();
        assert_eq!(applied.effect, TextEffect::Inserted { index: 2 });
        assert_eq!(store.render(), "abXcd");
    }

    #[test]
    fn test_clock_ticks_once_per_local_op() {
        let mut store = TextStore::new(site(1));
        let applied = store.insert_at(0, "abc").unwrap();
        let counters: Vec<u64> = applied.iter().map(|a| a.op.id.counter).collect();
        assert_eq!(counters, vec![1, 2, 3]);
        let del = store.delete_range(0..1).unwrap();
        assert_eq!(del[0].op.id.counter, 4);
        assert_eq!(store.clock().get(&site(1)), 4);
    }

    #[test]
    fn test_delete_tombstones_without_removal() {
        let mut store = TextStore::with_content(site(1), "abc");
        let applied = store.delete_range(1..2).unwrap();
        assert_eq!(applied[0].effect, TextEffect::Deleted { index: 1 });
        assert_eq!(store.render(), "ac");
        assert_eq!(store.entry_count(), 3);
        assert_eq!(store.tombstone_count(), 1);
    }

    #[test]
    fn test_deleted_entry_cannot_anchor() {
        let mut store = TextStore::with_content(site(1), "abc");
        let b = store.id_at(1).unwrap();
        store.local_delete(b).unwrap();

        assert_eq!(store.local_insert(Some(b), 'x'), Err(CoreError::AnchorDeleted(b)));
        assert_eq!(store.local_delete(b), Err(CoreError::AlreadyDeleted(b)));
        assert_eq!(store.render(), "ac");
    }

    #[test]
    fn test_out_of_bounds() {
        let mut store = TextStore::with_content(site(1), "ab");
        assert!(matches!(
            store.insert_at(3, "x"),
            Err(CoreError::OutOfBounds { .. })
        ));
        assert!(store.delete_range(1..3).is_err());
        assert_eq!(store.render(), "ab");
    }

    #[test]
    fn test_concurrent_insert_same_position_site_tiebreak() {
        // "ab|cd": P1 inserts X, P2 inserts Y, concurrently.
        let mut p1 = TextStore::with_content(site(1), "abcd");
        let mut p2 = TextStore::with_content(site(2), "abcd");

        let x = ops(p1.insert_at(2, "X").unwrap());
        let y = ops(p2.insert_at(2, "Y").unwrap());

        apply_all(&mut p1, &y);
        apply_all(&mut p2, &x);

        assert_eq!(p1.render(), "abXYcd");
        assert_eq!(p2.render(), "abXYcd");
    }

    #[test]
    fn test_later_insert_at_same_anchor_goes_first() {
        let mut store = TextStore::with_content(site(1), "ab");
        let a = store.id_at(0);
        store.local_insert(a, 'X').unwrap();
        store.local_insert(a, 'Y').unwrap();
        // Y was typed directly after 'a' after X existed.
        assert_eq!(store.render(), "aYXb");
    }

    #[test]
    fn test_remote_apply_is_idempotent() {
        let mut origin = TextStore::new(site(1));
        let sent = ops(origin.insert_at(0, "hi").unwrap());

        let mut replica = TextStore::new(site(2));
        apply_all(&mut replica, &sent);
        let once = replica.render();

        for op in &sent {
            assert_eq!(
                replica.apply_remote(op.clone()).unwrap(),
                AppliedResult::AlreadyApplied
            );
        }
        assert_eq!(replica.render(), once);
        assert_eq!(once, "hi");
    }

    #[test]
    fn test_out_of_order_delivery_is_buffered() {
        let mut origin = TextStore::new(site(1));
        let sent = ops(origin.insert_at(0, "abc").unwrap());

        let mut replica = TextStore::new(site(2));
        assert_eq!(
            replica.apply_remote(sent[2].clone()).unwrap(),
            AppliedResult::Deferred
        );
        assert_eq!(
            replica.apply_remote(sent[1].clone()).unwrap(),
            AppliedResult::Deferred
        );
        // Duplicate of a parked op stays parked.
        assert_eq!(
            replica.apply_remote(sent[1].clone()).unwrap(),
            AppliedResult::Deferred
        );
        assert_eq!(replica.deferred_len(), 2);

        match replica.apply_remote(sent[0].clone()).unwrap() {
            AppliedResult::Applied(applied) => assert_eq!(applied.len(), 3),
            other => panic!("expected Applied, got {other:?}"),
        }
        assert_eq!(replica.render(), "abc");
        assert_eq!(replica.deferred_len(), 0);
    }

    #[test]
    fn test_remote_merges_sender_clock() {
        let mut origin = TextStore::new(site(1));
        let sent = ops(origin.insert_at(0, "ab").unwrap());

        let mut replica = TextStore::new(site(2));
        apply_all(&mut replica, &sent);
        assert_eq!(replica.clock().get(&site(1)), 2);

        // Replica's own next op is causally after both.
        let mine = replica.insert_at(2, "c").unwrap();
        assert_eq!(mine[0].op.clock.get(&site(1)), 2);
        assert_eq!(mine[0].op.clock.get(&site(2)), 1);
    }

    #[test]
    fn test_malformed_remote_rejected_without_side_effects() {
        let mut replica = TextStore::with_content(site(2), "ab");
        let bad = Operation::new(
            OpId::new(site(1), 2),
            OpKind::Insert { anchor: None, value: 'x' },
            [(site(1), 1)].into_iter().collect(),
        );
        assert!(replica.apply_remote(bad).is_err());
        assert_eq!(replica.render(), "ab");
        assert_eq!(replica.clock().get(&site(1)), 0);
        assert_eq!(replica.deferred_len(), 0);
    }

    #[test]
    fn test_unknown_anchor_rejected() {
        let mut replica = TextStore::new(site(2));
        // Anchors on initial content this replica was never seeded with.
        let op = Operation::new(
            OpId::new(site(1), 1),
            OpKind::Insert {
                anchor: Some(OpId::new(SiteId::INITIAL, 3)),
                value: 'x',
            },
            [(site(1), 1)].into_iter().collect(),
        );
        assert!(matches!(
            replica.apply_remote(op),
            Err(CoreError::UnknownEntry { .. })
        ));
        assert!(replica.is_empty());
        assert_eq!(replica.clock().get(&site(1)), 0);
    }

    #[test]
    fn test_delete_vs_concurrent_format_is_harmless() {
        let mut p1 = TextStore::with_content(site(1), "abc");
        let mut p2 = TextStore::with_content(site(2), "abc");

        let del = ops(p1.delete_range(1..2).unwrap());
        let fmt = p2.format_range(1..2, attrs(&[("bold", "true")])).unwrap();
        assert_eq!(fmt.effect, TextEffect::Formatted { count: 1 });

        match p1.apply_remote(fmt.op.clone()).unwrap() {
            AppliedResult::Applied(applied) => {
                assert_eq!(applied[0].effect, TextEffect::Noop)
            }
            other => panic!("expected Applied, got {other:?}"),
        }
        apply_all(&mut p2, &del);

        assert_eq!(p1.render(), "ac");
        assert_eq!(p2.render(), "ac");
    }

    #[test]
    fn test_formatting_lww_converges() {
        let mut p1 = TextStore::with_content(site(1), "ab");
        let mut p2 = TextStore::with_content(site(2), "ab");

        let f1 = p1.format_range(0..1, attrs(&[("color", "red")])).unwrap().op;
        let f2 = p2.format_range(0..1, attrs(&[("color", "blue")])).unwrap().op;

        p1.apply_remote(f2).unwrap();
        p2.apply_remote(f1).unwrap();

        let id = p1.id_at(0).unwrap();
        let c1 = p1.entry(&id).unwrap().formatting.get("color").map(str::to_owned);
        let c2 = p2.entry(&id).unwrap().formatting.get("color").map(str::to_owned);
        assert_eq!(c1, c2);
        // Equal rank: higher site wins.
        assert_eq!(c1.as_deref(), Some("blue"));
    }

    #[test]
    fn test_concurrent_deletes_converge() {
        let mut p1 = TextStore::with_content(site(1), "abc");
        let mut p2 = TextStore::with_content(site(2), "abc");

        let d1 = ops(p1.delete_range(1..2).unwrap());
        let d2 = ops(p2.delete_range(1..2).unwrap());

        apply_all(&mut p1, &d2);
        apply_all(&mut p2, &d1);

        assert_eq!(p1.render(), "ac");
        assert_eq!(p2.render(), "ac");
        let b = OpId::new(SiteId::INITIAL, 2);
        assert_eq!(
            p1.entry(&b).unwrap().deleted_by,
            p2.entry(&b).unwrap().deleted_by
        );
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_order() {
        let mut store = TextStore::with_content(site(1), "hello");
        store.insert_at(5, "!").unwrap();
        store.delete_range(0..1).unwrap();

        let restored = TextStore::from_snapshot(site(9), store.snapshot());
        assert_eq!(restored.render(), "ello!");
        assert_eq!(restored.clock(), store.clock());
        assert_eq!(restored.tombstone_count(), 1);
        assert_eq!(store.snapshot().render(), "ello!");
    }

    #[test]
    fn test_merge_snapshot_joins_divergent_replicas() {
        let mut p1 = TextStore::with_content(site(1), "ab");
        let mut p2 = TextStore::with_content(site(2), "ab");

        p1.insert_at(1, "X").unwrap();
        p2.insert_at(2, "Y").unwrap();
        p2.delete_range(0..1).unwrap();

        let s1 = p1.snapshot();
        let s2 = p2.snapshot();
        p1.merge_snapshot(&s2);
        p2.merge_snapshot(&s1);

        assert_eq!(p1.render(), p2.render());
        assert_eq!(p1.render(), "XbY");
        assert_eq!(p1.clock(), p2.clock());
    }

    #[test]
    fn test_merge_snapshot_releases_deferred() {
        let mut origin = TextStore::new(site(1));
        let first = ops(origin.insert_at(0, "a").unwrap());
        let second = ops(origin.insert_at(1, "b").unwrap());

        let mut replica = TextStore::new(site(2));
        replica.apply_remote(second[0].clone()).unwrap();
        assert_eq!(replica.deferred_len(), 1);

        let mut donor = TextStore::new(site(3));
        apply_all(&mut donor, &first);
        let released = replica.merge_snapshot(&donor.snapshot());

        assert_eq!(released.len(), 1);
        assert_eq!(replica.render(), "ab");
    }

    #[test]
    fn test_discarded_operation_is_not_released() {
        let mut origin = TextStore::new(site(1));
        let first = ops(origin.insert_at(0, "a").unwrap());
        let second = ops(origin.insert_at(1, "b").unwrap());

        let mut replica = TextStore::new(site(2));
        replica.apply_remote(second[0].clone()).unwrap();
        assert!(replica.discard_deferred(&second[0].id));
        assert!(!replica.discard_deferred(&second[0].id));

        apply_all(&mut replica, &first);
        assert_eq!(replica.render(), "a");
        assert_eq!(replica.deferred_len(), 0);
    }

    #[test]
    fn test_compact_drops_observed_leaf_tombstones() {
        let mut store = TextStore::new(site(1));
        store.insert_at(0, "abc").unwrap();
        store.delete_range(2..3).unwrap(); // 'c' is a leaf
        store.delete_range(0..1).unwrap(); // 'a' still anchors 'b'

        let safe = store.clock().clone();
        assert_eq!(store.compact(&safe), 1);
        assert_eq!(store.render(), "b");
        assert_eq!(store.entry_count(), 2);

        // Ids survive compaction; further edits still work.
        store.insert_at(1, "z").unwrap();
        assert_eq!(store.render(), "bz");
    }

    #[test]
    fn test_compact_respects_safe_point() {
        let mut store = TextStore::new(site(1));
        store.insert_at(0, "ab").unwrap();
        store.delete_range(1..2).unwrap(); // delete is op 3

        let behind: VectorClock = [(site(1), 2)].into_iter().collect();
        assert_eq!(store.compact(&behind), 0);
        assert_eq!(store.entry_count(), 2);

        let safe = store.clock().clone();
        assert_eq!(store.compact(&safe), 1);
    }

    #[test]
    fn test_duplicate_delete_after_compaction_is_ignored() {
        let mut p1 = TextStore::with_content(site(1), "ab");
        let mut p2 = TextStore::with_content(site(2), "ab");

        let d1 = ops(p1.delete_range(1..2).unwrap());
        let d2 = ops(p2.delete_range(1..2).unwrap());

        apply_all(&mut p1, &d2);
        apply_all(&mut p2, &d1);
        let safe = p1.clock().meet(p2.clock());
        p1.compact(&safe);

        // A late duplicate of an already-covered delete is simply ignored.
        assert_eq!(
            p1.apply_remote(d2[0].clone()).unwrap(),
            AppliedResult::AlreadyApplied
        );
        assert_eq!(p1.render(), "a");
    }
}
