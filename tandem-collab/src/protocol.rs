//! Wire protocol between replicas and the server.
//!
//! Every frame is one bincode-encoded [`Envelope`], optionally LZ4
//! compressed:
//! ```text
//! ┌──────┬──────────────────────────────────────────────────────────┐
//! │ flag │ envelope (bincode)                                       │
//! │ 1 B  │ msg_type │ id │ reply_to? │ session │ document? │ sender │ payload │
//! └──────┴──────────────────────────────────────────────────────────┘
//! flag 0 = raw, 1 = lz4 (size-prepended)
//! ```
//!
//! Frames above [`COMPRESS_THRESHOLD`] bytes are compressed, which in
//! practice means sync responses carrying full document states.

use serde::{Deserialize, Serialize};
use tandem_core::{Lock, LockDecision, LockRequest, OpId, Operation, ReleaseReason, VectorClock};
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatPage, MessageKind};
use crate::document::{Comment, DocumentKind, DocumentSnapshot};
use crate::error::CollabError;
use crate::participant::{Participant, Permissions, Role};
use crate::presence::{Presence, PresenceUpdate};
use crate::session::{JoinRequest, SessionSettings, SyncPayload};

/// Encoded envelopes larger than this are LZ4 compressed.
pub const COMPRESS_THRESHOLD: usize = 1024;

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Operation = 1,
    Cursor = 2,
    Selection = 3,
    Presence = 4,
    SyncRequest = 5,
    SyncResponse = 6,
    Chat = 7,
    Join = 8,
    Leave = 9,
    Create = 10,
    Share = 11,
    Ping = 12,
    Pong = 13,
    LockRequest = 14,
    LockResponse = 15,
    LockRelease = 16,
    Comment = 17,
    Ack = 18,
    Error = 19,
    Admin = 20,
    Frontier = 21,
}

/// How the server took an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Applied,
    /// Seen before; nothing changed.
    Duplicate,
    /// Parked until its dependencies arrive.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatPayload {
    Send { content: String, kind: MessageKind },
    Message(ChatMessage),
    React { message: Uuid, emoji: String },
    Unreact { message: Uuid, emoji: String },
    Edit { message: Uuid, content: String },
    /// A message changed (reactions or content).
    Updated(ChatMessage),
    History { before: Option<Uuid>, limit: usize },
    Page(ChatPage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommentPayload {
    Add(Comment),
    Reply { comment: Uuid, content: String },
    Resolve { comment: Uuid },
    /// Full state of a comment after a reply or resolution.
    Updated(Comment),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdminPayload {
    Kick { participant: Uuid },
    ChangeRole { participant: Uuid, role: Role },
    EndSession,
    Kicked { participant: Uuid, by: Uuid },
    RoleChanged(Participant),
    SessionEnded,
}

/// Error carried back to a client. Mirrors [`CollabError`] in a form that
/// survives serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    Permission { participant: Uuid, required: Permissions },
    Validation(String),
    Capacity { session: Uuid, max: usize },
    Locked { lock: Uuid, holder: Uuid },
    NoText(Uuid),
    NotFound { kind: String, id: Uuid },
    Authentication(String),
    Protocol(String),
    Storage(String),
}

impl From<&CollabError> for WireError {
    fn from(e: &CollabError) -> Self {
        match e {
            CollabError::Permission { participant, required } => Self::Permission {
                participant: *participant,
                required: *required,
            },
            CollabError::Validation(core) => Self::Validation(core.to_string()),
            CollabError::Capacity { session, max } => Self::Capacity {
                session: *session,
                max: *max,
            },
            CollabError::Locked { lock, holder } => Self::Locked {
                lock: *lock,
                holder: *holder,
            },
            CollabError::NoText(id) => Self::NoText(*id),
            CollabError::NotFound { kind, id } => Self::NotFound {
                kind: kind.to_string(),
                id: *id,
            },
            CollabError::Authentication(m) => Self::Authentication(m.clone()),
            CollabError::Storage(m) => Self::Storage(m.clone()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<WireError> for CollabError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Permission { participant, required } => Self::Permission { participant, required },
            WireError::Validation(m) => Self::Protocol(format!("rejected operation: {m}")),
            WireError::Capacity { session, max } => Self::Capacity { session, max },
            WireError::Locked { lock, holder } => Self::Locked { lock, holder },
            WireError::NoText(id) => Self::NoText(id),
            WireError::NotFound { kind, id } => Self::NotFound {
                kind: static_kind(&kind),
                id,
            },
            WireError::Authentication(m) => Self::Authentication(m),
            WireError::Protocol(m) => Self::Protocol(m),
            WireError::Storage(m) => Self::Storage(m),
        }
    }
}

fn static_kind(kind: &str) -> &'static str {
    match kind {
        "session" => "session",
        "document" => "document",
        "participant" => "participant",
        "comment" => "comment",
        "message" => "message",
        "lock" => "lock",
        _ => "entity",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Operation(Operation),
    Cursor(PresenceUpdate),
    Selection(PresenceUpdate),
    Presence(PresenceUpdate),
    /// Merged presence of one participant, sent by the server.
    PresenceState(Presence),
    SyncRequest,
    SyncResponse(Box<SyncPayload>),
    Chat(ChatPayload),
    Join(JoinRequest),
    Joined(Participant),
    Leave,
    Left { participant: Uuid },
    Create { name: String, owner: JoinRequest, settings: SessionSettings },
    Share { name: String, kind: DocumentKind, content: Option<String> },
    Shared(Box<DocumentSnapshot>),
    Ping,
    Pong,
    LockRequest(LockRequest),
    LockResponse(LockDecision),
    ReleaseLock { lock: Uuid },
    LockReleased { lock: Lock, reason: ReleaseReason },
    Comment(CommentPayload),
    Ack { op: OpId, status: AckStatus },
    Error(WireError),
    Admin(AdminPayload),
    /// Per-document clocks a replica has applied up to.
    Frontier(Vec<(Uuid, VectorClock)>),
    /// Per-document points every replica has seen, sent by the server.
    /// Tombstones deleted at or below them may be dropped.
    SafePoints(Vec<(Uuid, VectorClock)>),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Operation(_) => MessageType::Operation,
            Self::Cursor(_) => MessageType::Cursor,
            Self::Selection(_) => MessageType::Selection,
            Self::Presence(_) | Self::PresenceState(_) => MessageType::Presence,
            Self::SyncRequest => MessageType::SyncRequest,
            Self::SyncResponse(_) => MessageType::SyncResponse,
            Self::Chat(_) => MessageType::Chat,
            Self::Join(_) | Self::Joined(_) => MessageType::Join,
            Self::Leave | Self::Left { .. } => MessageType::Leave,
            Self::Create { .. } => MessageType::Create,
            Self::Share { .. } | Self::Shared(_) => MessageType::Share,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::LockRequest(_) => MessageType::LockRequest,
            Self::LockResponse(_) => MessageType::LockResponse,
            Self::ReleaseLock { .. } | Self::LockReleased { .. } => MessageType::LockRelease,
            Self::Comment(_) => MessageType::Comment,
            Self::Ack { .. } => MessageType::Ack,
            Self::Error(_) => MessageType::Error,
            Self::Admin(_) => MessageType::Admin,
            Self::Frontier(_) | Self::SafePoints(_) => MessageType::Frontier,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub id: Uuid,
    /// Id of the request this answers.
    pub reply_to: Option<Uuid>,
    /// `Uuid::nil()` before a session is joined.
    pub session_id: Uuid,
    pub document_id: Option<Uuid>,
    pub sender: Uuid,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(session_id: Uuid, sender: Uuid, payload: Payload) -> Self {
        Self {
            msg_type: payload.message_type(),
            id: Uuid::new_v4(),
            reply_to: None,
            session_id,
            document_id: None,
            sender,
            payload,
        }
    }

    pub fn for_document(mut self, document: Uuid) -> Self {
        self.document_id = Some(document);
        self
    }

    pub fn in_reply_to(mut self, request: Uuid) -> Self {
        self.reply_to = Some(request);
        self
    }

    pub fn operation(session: Uuid, sender: Uuid, document: Uuid, op: Operation) -> Self {
        Self::new(session, sender, Payload::Operation(op)).for_document(document)
    }

    pub fn ack(session: Uuid, document: Uuid, op: OpId, status: AckStatus) -> Self {
        Self::new(session, Uuid::nil(), Payload::Ack { op, status }).for_document(document)
    }

    pub fn error(session: Uuid, error: &CollabError) -> Self {
        Self::new(session, Uuid::nil(), Payload::Error(error.into()))
    }

    pub fn ping(sender: Uuid) -> Self {
        Self::new(Uuid::nil(), sender, Payload::Ping)
    }

    pub fn pong(sender: Uuid) -> Self {
        Self::new(Uuid::nil(), sender, Payload::Pong)
    }

    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Protocol(format!("encode failed: {e}")))?;
        let mut frame = Vec::with_capacity(body.len() + 1);
        if body.len() > COMPRESS_THRESHOLD {
            frame.push(FLAG_LZ4);
            frame.extend_from_slice(&lz4_flex::compress_prepend_size(&body));
        } else {
            frame.push(FLAG_RAW);
            frame.extend_from_slice(&body);
        }
        Ok(frame)
    }

    /// Parse a wire frame. The declared type must match the payload.
    pub fn decode(frame: &[u8]) -> Result<Self, CollabError> {
        let (flag, rest) = frame
            .split_first()
            .ok_or_else(|| CollabError::Protocol("empty frame".into()))?;
        let inflated;
        let body = match *flag {
            FLAG_RAW => rest,
            FLAG_LZ4 => {
                inflated = lz4_flex::decompress_size_prepended(rest)
                    .map_err(|e| CollabError::Protocol(format!("decompress failed: {e}")))?;
                &inflated[..]
            }
            other => return Err(CollabError::Protocol(format!("unknown frame flag {other}"))),
        };
        let (envelope, _): (Self, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| CollabError::Protocol(format!("decode failed: {e}")))?;
        if envelope.msg_type != envelope.payload.message_type() {
            return Err(CollabError::Protocol(format!(
                "declared {:?} but carries {:?}",
                envelope.msg_type,
                envelope.payload.message_type()
            )));
        }
        Ok(envelope)
    }
}
