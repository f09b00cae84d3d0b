use thiserror::Error;
use uuid::Uuid;

use crate::op::OpId;

/// Errors raised by the replicated data structures.
///
/// Every fallible mutation checks before it writes, so an `Err` always
/// leaves the store exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("malformed operation {id}: {reason}")]
    Malformed { id: OpId, reason: String },

    #[error("operation {op} references unknown entry {target}")]
    UnknownEntry { op: OpId, target: OpId },

    #[error("entry {0} not found")]
    EntryNotFound(OpId),

    #[error("entry {0} is deleted and cannot anchor an insertion")]
    AnchorDeleted(OpId),

    #[error("entry {0} is already deleted")]
    AlreadyDeleted(OpId),

    #[error("index {index} out of bounds (visible length {len})")]
    OutOfBounds { index: usize, len: usize },

    #[error("lock {0} not found")]
    LockNotFound(Uuid),

    #[error("lock {lock} is held by {owner}")]
    LockNotOwned { lock: Uuid, owner: Uuid },
}

impl CoreError {
    /// True for errors caused by a bad remote payload. These are logged and
    /// the operation is dropped.
    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::Malformed { .. } | CoreError::UnknownEntry { .. })
    }
}
