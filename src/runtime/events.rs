//! Sync loop event payloads.

use crate::types::Seq;

/// Events emitted from the background sync loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A batch was acknowledged and removed from the outbox.
    Uploaded {
        /// Mutations in the batch.
        count: usize,
        /// Highest uploaded sequence.
        through_seq: Seq,
    },
    /// A retryable failure; the loop tries again after `retry_in_ms`.
    UploadFailed {
        /// Failure description.
        error: String,
        /// Delay before the next automatic attempt.
        retry_in_ms: u64,
    },
    /// Automatic retries are paused until the next trigger or flush.
    Stalled {
        /// Failure description.
        error: String,
    },
}
