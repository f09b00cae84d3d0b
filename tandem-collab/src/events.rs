//! Publish/subscribe contract for session events.
//!
//! Every subscriber owns a bounded queue. Publishing never blocks; a
//! subscriber that falls behind loses the oldest events and is told how
//! many with [`SessionEvent::Lagged`]. There is no ordering guarantee
//! between different subscribers.

use tandem_core::{Lock, LockRequest, Operation, ReleaseReason};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

use crate::chat::ChatMessage;
use crate::document::{Comment, DocumentKind};
use crate::participant::{Participant, Role};
use crate::presence::Presence;

/// Default per-subscriber queue length.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionCreated { session: Uuid, owner: Uuid },
    ParticipantJoined { session: Uuid, participant: Participant },
    ParticipantLeft { session: Uuid, participant: Uuid },
    ParticipantKicked { session: Uuid, participant: Uuid, by: Uuid },
    RoleChanged { session: Uuid, participant: Uuid, role: Role },
    DocumentShared { session: Uuid, document: Uuid, name: String, kind: DocumentKind },
    /// A local edit was applied.
    OperationApplied { session: Uuid, document: Uuid, op: Operation, version: u64 },
    /// A remote operation was accepted.
    OperationReceived { session: Uuid, document: Uuid, op: Operation, version: u64 },
    PresenceChanged { session: Uuid, presence: Presence },
    LockGranted { session: Uuid, document: Uuid, lock: Lock },
    LockDenied { session: Uuid, document: Uuid, request: LockRequest, holder: Uuid },
    LockReleased { session: Uuid, document: Uuid, lock: Lock, reason: ReleaseReason },
    CommentAdded { session: Uuid, document: Uuid, comment: Comment },
    CommentResolved { session: Uuid, document: Uuid, comment: Uuid, by: Uuid },
    ChatMessage { session: Uuid, message: ChatMessage },
    SessionEnded { session: Uuid },
    /// This subscriber missed `missed` events.
    Lagged { missed: u64 },
}

impl SessionEvent {
    pub fn session(&self) -> Option<Uuid> {
        match self {
            Self::SessionCreated { session, .. }
            | Self::ParticipantJoined { session, .. }
            | Self::ParticipantLeft { session, .. }
            | Self::ParticipantKicked { session, .. }
            | Self::RoleChanged { session, .. }
            | Self::DocumentShared { session, .. }
            | Self::OperationApplied { session, .. }
            | Self::OperationReceived { session, .. }
            | Self::PresenceChanged { session, .. }
            | Self::LockGranted { session, .. }
            | Self::LockDenied { session, .. }
            | Self::LockReleased { session, .. }
            | Self::CommentAdded { session, .. }
            | Self::CommentResolved { session, .. }
            | Self::ChatMessage { session, .. }
            | Self::SessionEnded { session } => Some(*session),
            Self::Lagged { .. } => None,
        }
    }
}

/// Fan-out of [`SessionEvent`]s. Cloning shares the same bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: SessionEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                log::trace!("Event dropped: no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// A subscriber's view of the bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl Subscription {
    /// Next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(missed)) => {
                log::warn!("Event subscriber lagged by {missed} events");
                Some(SessionEvent::Lagged { missed })
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(missed)) => Some(SessionEvent::Lagged { missed }),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Everything queued so far.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
