//! Shared primitive IDs and the mutation operation enum.

use serde::{Deserialize, Serialize};

/// Monotonic outbox sequence number.
pub type Seq = u64;
/// Client-side transaction marker grouping mutations written together.
pub type TxId = u64;
/// Unique opaque mutation identifier.
pub type MutationId = String;
/// Identifier of the logical record a mutation targets.
pub type RecordId = String;

/// Kind of change a mutation applies to its target record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Create or fully replace the record.
    #[serde(rename = "PUT")]
    Put,
    /// Remove the record.
    #[serde(rename = "DELETE")]
    Delete,
}

impl OpKind {
    /// Wire name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
