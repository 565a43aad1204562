/// Outbox store of pending mutations.
pub mod outbox;
/// Local record tables.
pub mod records;
/// Shared SQLite connection handle.
pub mod sqlite;

use crate::{
    mutation::MutationError,
    types::{MutationId, Seq},
};

/// Local storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The embedded database reported an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A payload could not be encoded or decoded.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// The mutation was rejected before it was stored.
    #[error("invalid mutation: {0}")]
    Invalid(#[from] MutationError),
    /// A stored outbox row cannot be turned back into a mutation.
    #[error("malformed outbox row seq={seq} id={id}: {reason}")]
    Malformed {
        /// Sequence of the offending row.
        seq: Seq,
        /// Mutation id of the offending row.
        id: MutationId,
        /// Decode or validation failure.
        reason: String,
    },
    /// The id is already pending in the outbox.
    #[error("mutation {0} is already pending")]
    Duplicate(MutationId),
    /// The id was uploaded and acknowledged before.
    #[error("mutation {0} was already completed")]
    AlreadyCompleted(MutationId),
    /// Anything else, e.g. a poisoned connection lock.
    #[error("{0}")]
    Message(String),
}

impl StorageError {
    /// True for the serialization class of failures, which are fatal for one mutation only.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
