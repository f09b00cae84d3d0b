//! Range lock arbitration.
//!
//! ```text
//!  Requested ──► Granted ──► Released(Explicit | Disconnect | Expired)
//!      │
//!      └──────► Denied
//! ```
//!
//! Hard locks are exclusive: at most one participant holds a hard lock over
//! any given offset. Soft locks are advisory ("someone is editing here") and
//! always granted. Every lock carries an expiry so that a client vanishing
//! mid-request cannot leak it.
//!
//! Locks live in an arena keyed by lock id; owners are participant ids.
//! Ranges are character offsets and are shifted with the text by
//! [`LockManager::shift_ranges`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use uuid::Uuid;

use crate::error::CoreError;
use crate::transform::{Shift, TextEdit};

/// Default lock lifetime.
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// Advisory only; may overlap anything.
    Soft,
    /// Exclusive over its range.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    Explicit,
    Disconnect,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Requested,
    Granted,
    Denied,
    Released(ReleaseReason),
}

/// A request for a lock. `range: None` means the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub id: Uuid,
    pub owner: Uuid,
    pub range: Option<Range<usize>>,
    pub kind: LockKind,
    pub ttl_ms: u64,
}

impl LockRequest {
    pub fn new(owner: Uuid, range: Option<Range<usize>>, kind: LockKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            range,
            kind,
            ttl_ms: DEFAULT_LOCK_TTL_MS,
        }
    }

    pub fn hard(owner: Uuid, range: Range<usize>) -> Self {
        Self::new(owner, Some(range), LockKind::Hard)
    }

    pub fn soft(owner: Uuid, range: Range<usize>) -> Self {
        Self::new(owner, Some(range), LockKind::Soft)
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: Uuid,
    pub owner: Uuid,
    pub range: Option<Range<usize>>,
    pub kind: LockKind,
    pub acquired_at: u64,
    pub expires_at: u64,
    pub state: LockState,
}

impl Lock {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Half-open overlap; `None` covers everything.
    pub fn overlaps(&self, range: Option<&Range<usize>>) -> bool {
        match (self.range.as_ref(), range) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a.start < b.end && b.start < a.end,
        }
    }
}

/// Outcome of a lock request. Denial is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockDecision {
    Granted(Lock),
    Denied {
        request: LockRequest,
        /// Participant holding the conflicting lock.
        holder: Uuid,
        conflicting: Uuid,
    },
}

impl LockDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockDecision::Granted(_))
    }

    pub fn state(&self) -> LockState {
        match self {
            LockDecision::Granted(_) => LockState::Granted,
            LockDecision::Denied { .. } => LockState::Denied,
        }
    }
}

/// Active locks of one document.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    locks: HashMap<Uuid, Lock>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arbitrate `request` at time `now` (millis).
    ///
    /// Expired locks are swept first so a stale holder never blocks.
    pub fn request(&mut self, request: LockRequest, now: u64) -> LockDecision {
        self.expire(now);

        if request.kind == LockKind::Hard {
            let conflict = self.locks.values().find(|held| {
                held.kind == LockKind::Hard
                    && held.owner != request.owner
                    && held.overlaps(request.range.as_ref())
            });
            if let Some(held) = conflict {
                log::debug!(
                    "lock {} denied: overlaps {} held by {}",
                    request.id,
                    held.id,
                    held.owner
                );
                return LockDecision::Denied {
                    holder: held.owner,
                    conflicting: held.id,
                    request,
                };
            }
        }

        let lock = Lock {
            id: request.id,
            owner: request.owner,
            range: request.range,
            kind: request.kind,
            acquired_at: now,
            expires_at: now.saturating_add(request.ttl_ms),
            state: LockState::Granted,
        };
        self.locks.insert(lock.id, lock.clone());
        LockDecision::Granted(lock)
    }

    /// Release `lock_id` on behalf of `by`; only the owner may release.
    pub fn release(&mut self, lock_id: Uuid, by: Uuid) -> Result<Lock, CoreError> {
        let held = self
            .locks
            .get(&lock_id)
            .ok_or(CoreError::LockNotFound(lock_id))?;
        if held.owner != by {
            return Err(CoreError::LockNotOwned {
                lock: lock_id,
                owner: held.owner,
            });
        }
        let mut lock = self
            .locks
            .remove(&lock_id)
            .ok_or(CoreError::LockNotFound(lock_id))?;
        lock.state = LockState::Released(ReleaseReason::Explicit);
        Ok(lock)
    }

    /// Extend an owned lock's expiry to `now + ttl_ms`.
    pub fn renew(&mut self, lock_id: Uuid, by: Uuid, ttl_ms: u64, now: u64) -> Result<&Lock, CoreError> {
        let lock = self
            .locks
            .get_mut(&lock_id)
            .ok_or(CoreError::LockNotFound(lock_id))?;
        if lock.owner != by {
            return Err(CoreError::LockNotOwned {
                lock: lock_id,
                owner: lock.owner,
            });
        }
        lock.expires_at = now.saturating_add(ttl_ms);
        Ok(lock)
    }

    /// Release everything `owner` holds (disconnect, kick, leave).
    pub fn release_owner(&mut self, owner: Uuid) -> Vec<Lock> {
        self.drain_where(
            |lock| lock.owner == owner,
            ReleaseReason::Disconnect,
        )
    }

    /// Release every lock whose expiry has passed.
    pub fn expire(&mut self, now: u64) -> Vec<Lock> {
        self.drain_where(|lock| lock.is_expired(now), ReleaseReason::Expired)
    }

    fn drain_where(&mut self, pred: impl Fn(&Lock) -> bool, reason: ReleaseReason) -> Vec<Lock> {
        let ids: Vec<Uuid> = self
            .locks
            .values()
            .filter(|lock| pred(lock))
            .map(|lock| lock.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.locks.remove(&id))
            .map(|mut lock| {
                lock.state = LockState::Released(reason);
                lock
            })
            .collect()
    }

    pub fn get(&self, lock_id: &Uuid) -> Option<&Lock> {
        self.locks.get(lock_id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values()
    }

    pub fn held_by(&self, owner: Uuid) -> impl Iterator<Item = &Lock> {
        self.locks.values().filter(move |lock| lock.owner == owner)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// True if `owner` may edit `range` (no other participant's hard lock
    /// overlaps it).
    pub fn can_edit(&self, owner: Uuid, range: Option<&Range<usize>>) -> bool {
        !self.locks.values().any(|lock| {
            lock.kind == LockKind::Hard && lock.owner != owner && lock.overlaps(range)
        })
    }

    /// Record a lock granted elsewhere.
    pub fn insert(&mut self, lock: Lock) {
        self.locks.insert(lock.id, lock);
    }

    /// Forget a lock released elsewhere.
    pub fn remove(&mut self, lock_id: &Uuid) -> Option<Lock> {
        self.locks.remove(lock_id)
    }

    /// Replace all locks, e.g. from a sync payload.
    pub fn restore(&mut self, locks: impl IntoIterator<Item = Lock>) {
        self.locks = locks.into_iter().map(|lock| (lock.id, lock)).collect();
    }

    /// Keep ranges on the same text as it changes.
    pub fn shift_ranges(&mut self, edit: &TextEdit) {
        for lock in self.locks.values_mut() {
            // Text typed at a lock's start lands outside it.
            lock.range.shift(edit, true);
        }
    }
}
