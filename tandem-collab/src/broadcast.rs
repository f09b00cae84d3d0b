//! Per-session fan-out of encoded frames.
//!
//! Every connection in a session holds a receiver on the session's
//! [`BroadcastGroup`]. Frames are encoded once and shared; each carries its
//! origin so a connection can skip its own traffic. A receiver that falls
//! `capacity` frames behind lags and must resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::CollabError;
use crate::participant::Participant;
use crate::protocol::Envelope;

/// Connections to close once a frame has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evict {
    Member(Uuid),
    Everyone,
}

/// One encoded envelope on its way to every member.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Participant whose connection produced it; skipped on delivery.
    pub origin: Option<Uuid>,
    pub evict: Option<Evict>,
    pub bytes: Arc<Vec<u8>>,
}

impl Frame {
    pub fn new(origin: Option<Uuid>, bytes: Vec<u8>) -> Self {
        Self {
            origin,
            evict: None,
            bytes: Arc::new(bytes),
        }
    }

    pub fn is_from(&self, participant: &Uuid) -> bool {
        self.origin.as_ref() == Some(participant)
    }

    /// Whether `participant`'s connection must close after this frame.
    pub fn evicts(&self, participant: &Uuid) -> bool {
        match self.evict {
            Some(Evict::Everyone) => true,
            Some(Evict::Member(id)) => id == *participant,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    /// Frames lost by lagging receivers.
    pub frames_dropped: u64,
    pub active_members: usize,
}

#[derive(Default)]
struct AtomicStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Broadcast group of a single session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    members: RwLock<HashMap<Uuid, Participant>>,
    capacity: usize,
    stats: AtomicStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicStats::default(),
        }
    }

    /// Register a member and hand back its receiver.
    pub async fn add_member(&self, participant: Participant) -> broadcast::Receiver<Frame> {
        self.insert_member(participant).await;
        self.sender.subscribe()
    }

    /// Register a member that already subscribed.
    pub async fn insert_member(&self, participant: Participant) {
        self.members.write().await.insert(participant.id, participant);
    }

    pub async fn remove_member(&self, participant: &Uuid) -> Option<Participant> {
        self.members.write().await.remove(participant)
    }

    /// Encode once and send to every member. Returns the receiver count.
    pub fn broadcast(&self, origin: Option<Uuid>, envelope: &Envelope) -> Result<usize, CollabError> {
        let bytes = envelope.encode()?;
        log::trace!("Broadcasting {:?} ({} bytes)", envelope.msg_type, bytes.len());
        Ok(self.broadcast_raw(Frame::new(origin, bytes)))
    }

    /// Send to everyone, then close the evicted connections.
    pub fn broadcast_evicting(&self, evict: Evict, envelope: &Envelope) -> Result<usize, CollabError> {
        let mut frame = Frame::new(None, envelope.encode()?);
        frame.evict = Some(evict);
        Ok(self.broadcast_raw(frame))
    }

    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost.
    pub fn record_dropped(&self, missed: u64) {
        self.stats.frames_dropped.fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Participant> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, participant: &Uuid) -> bool {
        self.members.read().await.contains_key(participant)
    }

    /// Keep a member's record current, e.g. after a role change.
    pub async fn update_member(&self, participant: Participant) {
        let mut members = self.members.write().await;
        if let Some(slot) = members.get_mut(&participant.id) {
            *slot = participant;
        }
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

/// Session id → broadcast group.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, session: Uuid) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&session) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it meanwhile.
        if let Some(room) = rooms.get(&session) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(session, room.clone());
        room
    }

    pub async fn get(&self, session: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(session).cloned()
    }

    pub async fn remove_if_empty(&self, session: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session) {
            if room.member_count().await == 0 {
                rooms.remove(session);
                return true;
            }
        }
        false
    }

    pub async fn remove(&self, session: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.write().await.remove(session)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
