//! # tandem-collab: sessions, presence and sync for collaborative editing
//!
//! Builds multi-user sessions on top of the replicated text in
//! `tandem-core` and carries them over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (replica)   │   bincode Envelope  │ (authority) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Shared      │                     │ Session     │──► Persistence
//! │ Documents   │                     │ Manager     │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: sessions, roster, permissions; the embedding surface
//! - [`document`]: a document's CRDT text, history, locks and comments
//! - [`presence`]: carets, selections and status, last writer wins
//! - [`chat`]: per-session chat with reactions
//! - [`events`]: subscription to everything a session does
//! - [`protocol`]: binary wire envelope
//! - [`broadcast`]: per-session fan-out with lag detection
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with offline queue and reconnect
//! - [`storage`]: persistence seam

pub mod broadcast;
pub mod chat;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod participant;
pub mod presence;
pub mod protocol;
pub mod request;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Evict, Frame, RoomManager};
pub use chat::{ChatChannel, ChatMessage, ChatPage, MessageKind};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{BackoffPolicy, ClientConfig, ServerConfig};
pub use document::{Comment, CommentAnchor, CommentReply, DocumentKind, DocumentSnapshot, Edit, SharedDocument};
pub use error::CollabError;
pub use events::{EventBus, SessionEvent, Subscription};
pub use participant::{Participant, Permissions, Role};
pub use presence::{CursorColor, Presence, PresenceRoom, PresenceStatus, PresenceThrottle, PresenceUpdate};
pub use protocol::{AckStatus, Envelope, MessageType, Payload, WireError};
pub use request::{PendingRequest, RequestTable};
pub use server::{ServerStats, SyncServer};
pub use session::{JoinRequest, LeaveReason, Session, SessionInfo, SessionManager, SessionSettings, SyncPayload};
pub use storage::{MemoryStore, Persistence};
