//! # tandem-core: replicated data structures for collaborative editing
//!
//! Everything in this crate is synchronous and transport-agnostic. A replica
//! owns one [`TextStore`] per document and feeds it local edits and remote
//! [`Operation`]s in any order; the store converges regardless of delivery
//! order or duplication.
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────┐   ids, ticks    ┌──────────────┐
//! │ VectorClock  │ ◄────────────── │  TextStore   │  tombstoned RGA
//! └──────┬───────┘                 └──────┬───────┘
//!        │ causality                      │ TextEffect
//!        ▼                                ▼
//! ┌──────────────┐                 ┌──────────────┐
//! │ OperationLog │                 │  transform   │  offsets for cursors,
//! └──────────────┘                 └──────────────┘  comments, lock ranges
//!
//! ┌──────────────┐
//! │ LockManager  │  hard/soft range reservations
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: site ids, vector clocks, causal comparison
//! - [`op`]: operation ids, kinds and validation
//! - [`text`]: the CRDT text store
//! - [`oplog`]: append-only causal history
//! - [`transform`]: offset transforms for positional metadata
//! - [`lock`]: range lock arbitration

pub mod clock;
pub mod error;
pub mod lock;
pub mod op;
pub mod oplog;
pub mod text;
pub mod transform;

pub use clock::{Causality, SiteId, VectorClock};
pub use error::CoreError;
pub use lock::{
    Lock, LockDecision, LockKind, LockManager, LockRequest, LockState, ReleaseReason,
    DEFAULT_LOCK_TTL_MS,
};
pub use op::{OpId, OpKind, OpType, Operation};
pub use oplog::{is_concurrent, safe_point, OperationLog};
pub use text::{
    AppliedOp, AppliedResult, Entry, Formatting, TextEffect, TextSnapshot, TextStore,
};
pub use transform::{transform, EditKind, Positioned, Shift, TextEdit};

/// Milliseconds since the Unix epoch.
///
/// Lock expiry and comment/chat timestamps travel over the wire, so they use
/// wall-clock millis rather than `Instant`.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
