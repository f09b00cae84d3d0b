//! Ephemeral awareness: cursors, selections, online status.
//!
//! Presence is last-writer-wins per participant, ordered by a sender-side
//! sequence number, and never enters the operation history. Offsets are
//! valid as of the document clock they were sent with and are rebased with
//! [`tandem_core::transform`] as concurrent edits arrive.
//!
//! ```text
//! local caret move
//!       │
//!       ▼
//! PresenceThrottle::offer()      (coalesced, 33ms)
//!       │
//!       ▼   Payload::Presence
//! server PresenceRoom::apply()   (stale seq rejected)
//!       │
//!       ▼   broadcast
//! remote PresenceRoom::upsert()
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, Instant};
use tandem_core::{transform, Positioned, Shift, SiteId, TextEdit, VectorClock};
use uuid::Uuid;

/// Minimum interval between presence sends from one client.
pub const PRESENCE_INTERVAL: Duration = Duration::from_millis(33);

/// Quiet time before a participant shows as idle.
pub const IDLE_AFTER: Duration = Duration::from_secs(60);

/// Quiet time before a participant shows as away.
pub const AWAY_AFTER: Duration = Duration::from_secs(300);

// ───────────────────────────────────────────────────────────────────
// Color
// ───────────────────────────────────────────────────────────────────

/// RGBA color for remote cursors and selections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color for a participant. Hue comes from the id, saturation
    /// and lightness are fixed so every cursor is equally readable.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Presence records
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Idle,
    Away,
    Offline,
}

/// Caret and selection in rendered-text offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caret {
    pub cursor: Option<usize>,
    pub selection: Option<Range<usize>>,
}

impl Shift for Caret {
    fn shift(&mut self, edit: &TextEdit, edit_first: bool) {
        self.cursor.shift(edit, edit_first);
        self.selection.shift(edit, edit_first);
    }
}

/// One participant's awareness state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub participant: Uuid,
    /// Document the caret belongs to.
    pub document: Option<Uuid>,
    pub status: PresenceStatus,
    pub color: CursorColor,
    /// Sender-side sequence number; higher wins.
    pub seq: u64,
    /// Unix millis of the last accepted update.
    pub updated_at: u64,
    pub caret: Positioned<Caret>,
}

impl Presence {
    pub fn new(participant: Uuid, site: SiteId) -> Self {
        Self {
            participant,
            document: None,
            status: PresenceStatus::Online,
            color: CursorColor::from_uuid(participant),
            seq: 0,
            updated_at: tandem_core::now_millis(),
            caret: Positioned::new(site, VectorClock::new(), Caret::default()),
        }
    }

    pub fn cursor(&self) -> Option<usize> {
        self.caret.value.cursor
    }

    pub fn selection(&self) -> Option<&Range<usize>> {
        self.caret.value.selection.as_ref()
    }
}

/// Partial presence change. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub seq: u64,
    pub document: Option<Uuid>,
    pub cursor: Option<usize>,
    /// `Some(None)` clears the selection.
    pub selection: Option<Option<Range<usize>>>,
    pub status: Option<PresenceStatus>,
    /// Document clock the offsets were taken at.
    pub clock: Option<VectorClock>,
}

impl PresenceUpdate {
    pub fn cursor(document: Uuid, offset: usize, clock: VectorClock) -> Self {
        Self {
            document: Some(document),
            cursor: Some(offset),
            clock: Some(clock),
            ..Self::default()
        }
    }

    pub fn selection(document: Uuid, range: Range<usize>, clock: VectorClock) -> Self {
        Self {
            document: Some(document),
            cursor: Some(range.end),
            selection: Some(Some(range)),
            clock: Some(clock),
            ..Self::default()
        }
    }

    pub fn status(status: PresenceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Fold a newer update into this one.
    pub fn absorb(&mut self, newer: PresenceUpdate) {
        self.seq = self.seq.max(newer.seq);
        if newer.document.is_some() {
            self.document = newer.document;
        }
        if newer.cursor.is_some() {
            self.cursor = newer.cursor;
        }
        if newer.selection.is_some() {
            self.selection = newer.selection;
        }
        if newer.status.is_some() {
            self.status = newer.status;
        }
        if newer.clock.is_some() {
            self.clock = newer.clock;
        }
    }

    fn merge_into(&self, presence: &mut Presence) {
        if let Some(document) = self.document {
            if presence.document != Some(document) {
                presence.caret.value = Caret::default();
            }
            presence.document = Some(document);
        }
        if let Some(cursor) = self.cursor {
            presence.caret.value.cursor = Some(cursor);
        }
        if let Some(selection) = &self.selection {
            presence.caret.value.selection = selection.clone();
        }
        if let Some(status) = self.status {
            presence.status = status;
        }
        if let Some(clock) = &self.clock {
            presence.caret.clock = clock.clone();
        }
        presence.seq = self.seq;
    }
}

// ───────────────────────────────────────────────────────────────────
// Room
// ───────────────────────────────────────────────────────────────────

/// Presence of every participant in a session.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoom {
    members: HashMap<Uuid, Presence>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a participant.
    pub fn join(&mut self, participant: Uuid, site: SiteId) -> &Presence {
        let presence = self
            .members
            .entry(participant)
            .or_insert_with(|| Presence::new(participant, site));
        presence.caret.site = site;
        presence.status = PresenceStatus::Online;
        presence
    }

    pub fn leave(&mut self, participant: &Uuid) -> Option<Presence> {
        self.members.remove(participant)
    }

    /// Merge a partial update. Returns the merged record, or `None` when
    /// the update is stale or the participant is unknown.
    pub fn apply(&mut self, participant: Uuid, update: &PresenceUpdate) -> Option<&Presence> {
        let presence = self.members.get_mut(&participant)?;
        if update.seq <= presence.seq && presence.seq != 0 {
            log::trace!(
                "Dropping stale presence from {participant}: seq {} <= {}",
                update.seq,
                presence.seq
            );
            return None;
        }
        update.merge_into(presence);
        presence.updated_at = tandem_core::now_millis();
        Some(presence)
    }

    /// Replace a record with a full one received from the server, unless
    /// ours is newer.
    pub fn upsert(&mut self, presence: Presence) -> bool {
        match self.members.get(&presence.participant) {
            Some(current) if current.seq > presence.seq => false,
            _ => {
                self.members.insert(presence.participant, presence);
                true
            }
        }
    }

    /// Rebase every caret on `document` over a text edit.
    pub fn shift(&mut self, document: Uuid, edit: &TextEdit) {
        for presence in self.members.values_mut() {
            if presence.document == Some(document) {
                transform(&mut presence.caret, edit);
            }
        }
    }

    /// Demote quiet participants: `Idle` after `idle_after`, `Away` after
    /// `away_after`. Returns the participants whose status changed.
    pub fn sweep(&mut self, now: u64, idle_after: Duration, away_after: Duration) -> Vec<Uuid> {
        let idle_ms = idle_after.as_millis() as u64;
        let away_ms = away_after.as_millis() as u64;
        let mut changed = Vec::new();
        for presence in self.members.values_mut() {
            let quiet = now.saturating_sub(presence.updated_at);
            let next = match presence.status {
                PresenceStatus::Offline => continue,
                _ if quiet >= away_ms => PresenceStatus::Away,
                _ if quiet >= idle_ms => PresenceStatus::Idle,
                current => current,
            };
            if next != presence.status {
                presence.status = next;
                changed.push(presence.participant);
            }
        }
        changed
    }

    pub fn get(&self, participant: &Uuid) -> Option<&Presence> {
        self.members.get(participant)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Presence> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client-side coalescing
// ───────────────────────────────────────────────────────────────────

/// Coalesces outgoing presence so only the latest state is sent, at most
/// once per interval.
#[derive(Debug)]
pub struct PresenceThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<PresenceUpdate>,
    seq: u64,
}

impl PresenceThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
            seq: 0,
        }
    }

    /// Queue an update. Returns what should be sent now, if anything.
    pub fn offer(&mut self, mut update: PresenceUpdate, now: Instant) -> Option<PresenceUpdate> {
        self.seq += 1;
        update.seq = self.seq;
        match self.pending.as_mut() {
            Some(pending) => pending.absorb(update),
            None => self.pending = Some(update),
        }
        self.flush(now)
    }

    /// Release the pending update if the interval has passed.
    pub fn flush(&mut self, now: Instant) -> Option<PresenceUpdate> {
        let due = self
            .last_sent
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        let update = self.pending.take()?;
        self.last_sent = Some(now);
        Some(update)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop anything pending, e.g. while offline.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

impl Default for PresenceThrottle {
    fn default() -> Self {
        Self::new(PRESENCE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::EditKind;

    fn edit(site: u128, clock: &[(u128, u64)], index: usize, kind: EditKind) -> TextEdit {
        TextEdit {
            site: SiteId::from_u128(site),
            clock: clock.iter().map(|(s, c)| (SiteId::from_u128(*s), *c)).collect(),
            index,
            kind,
        }
    }

    #[test]
    fn test_cursor_color_stable() {
        let id = Uuid::new_v4();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
        let c = CursorColor::from_uuid(id);
        assert!(c.r >= 0.0 && c.r <= 1.0);
        assert_eq!(c.a, 1.0);
        assert_eq!(c.to_hex().len(), 7);
    }

    #[test]
    fn test_hsl_gray() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_apply_merges_partial_update() {
        let mut room = PresenceRoom::new();
        let alice = Uuid::new_v4();
        let doc = Uuid::new_v4();
        room.join(alice, SiteId::from_u128(1));

        let mut update = PresenceUpdate::selection(doc, 2..5, VectorClock::new());
        update.seq = 1;
        room.apply(alice, &update).unwrap();

        let mut update = PresenceUpdate::status(PresenceStatus::Idle);
        update.seq = 2;
        let merged = room.apply(alice, &update).unwrap();
        assert_eq!(merged.selection(), Some(&(2..5)));
        assert_eq!(merged.cursor(), Some(5));
        assert_eq!(merged.status, PresenceStatus::Idle);
    }

    #[test]
    fn test_stale_update_rejected() {
        let mut room = PresenceRoom::new();
        let alice = Uuid::new_v4();
        let doc = Uuid::new_v4();
        room.join(alice, SiteId::from_u128(1));

        let mut newer = PresenceUpdate::cursor(doc, 10, VectorClock::new());
        newer.seq = 5;
        room.apply(alice, &newer).unwrap();

        let mut older = PresenceUpdate::cursor(doc, 3, VectorClock::new());
        older.seq = 4;
        assert!(room.apply(alice, &older).is_none());
        assert_eq!(room.get(&alice).unwrap().cursor(), Some(10));
    }

    #[test]
    fn test_unknown_participant_ignored() {
        let mut room = PresenceRoom::new();
        let update = PresenceUpdate { seq: 1, ..Default::default() };
        assert!(room.apply(Uuid::new_v4(), &update).is_none());
    }

    #[test]
    fn test_switching_document_resets_caret() {
        let mut room = PresenceRoom::new();
        let alice = Uuid::new_v4();
        room.join(alice, SiteId::from_u128(1));
        let mut a = PresenceUpdate::selection(Uuid::new_v4(), 1..4, VectorClock::new());
        a.seq = 1;
        room.apply(alice, &a).unwrap();

        let mut b = PresenceUpdate::status(PresenceStatus::Online);
        b.document = Some(Uuid::new_v4());
        b.seq = 2;
        let merged = room.apply(alice, &b).unwrap();
        assert_eq!(merged.cursor(), None);
        assert_eq!(merged.selection(), None);
    }

    #[test]
    fn test_concurrent_insert_shifts_cursor() {
        let mut room = PresenceRoom::new();
        let alice = Uuid::new_v4();
        let doc = Uuid::new_v4();
        room.join(alice, SiteId::from_u128(1));
        let clock: VectorClock = [(SiteId::from_u128(1), 3)].into_iter().collect();
        let mut update = PresenceUpdate::cursor(doc, 4, clock);
        update.seq = 1;
        room.apply(alice, &update).unwrap();

        // Concurrent insert of 2 chars before the cursor.
        room.shift(doc, &edit(2, &[(2, 1)], 1, EditKind::Insert { len: 2 }));
        assert_eq!(room.get(&alice).unwrap().cursor(), Some(6));

        // Edit already seen by the cursor's clock is skipped.
        room.shift(doc, &edit(1, &[(1, 2)], 0, EditKind::Insert { len: 1 }));
        assert_eq!(room.get(&alice).unwrap().cursor(), Some(6));

        // Other documents are untouched.
        room.shift(Uuid::new_v4(), &edit(3, &[(3, 1)], 0, EditKind::Delete { len: 5 }));
        assert_eq!(room.get(&alice).unwrap().cursor(), Some(6));
    }

    #[test]
    fn test_sweep_demotes_quiet_participants() {
        let mut room = PresenceRoom::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        room.join(alice, SiteId::from_u128(1));
        room.join(bob, SiteId::from_u128(2));
        let now = room.get(&alice).unwrap().updated_at;

        let changed = room.sweep(now + 61_000, Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(changed.len(), 2);
        assert_eq!(room.get(&alice).unwrap().status, PresenceStatus::Idle);

        room.sweep(now + 301_000, Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(room.get(&bob).unwrap().status, PresenceStatus::Away);
    }

    #[test]
    fn test_upsert_keeps_newer() {
        let mut room = PresenceRoom::new();
        let alice = Uuid::new_v4();
        let mut p = Presence::new(alice, SiteId::from_u128(1));
        p.seq = 7;
        assert!(room.upsert(p.clone()));
        p.seq = 6;
        assert!(!room.upsert(p));
        assert_eq!(room.get(&alice).unwrap().seq, 7);
    }

    #[test]
    fn test_throttle_coalesces() {
        let mut throttle = PresenceThrottle::new(Duration::from_millis(33));
        let doc = Uuid::new_v4();
        let t0 = Instant::now();

        let first = throttle.offer(PresenceUpdate::cursor(doc, 1, VectorClock::new()), t0);
        assert_eq!(first.unwrap().seq, 1);

        assert!(throttle
            .offer(PresenceUpdate::cursor(doc, 2, VectorClock::new()), t0 + Duration::from_millis(5))
            .is_none());
        assert!(throttle
            .offer(PresenceUpdate::cursor(doc, 3, VectorClock::new()), t0 + Duration::from_millis(10))
            .is_none());
        assert!(throttle.has_pending());

        let flushed = throttle.flush(t0 + Duration::from_millis(40)).unwrap();
        assert_eq!(flushed.cursor, Some(3));
        assert_eq!(flushed.seq, 3);
        assert!(!throttle.has_pending());
    }
}
