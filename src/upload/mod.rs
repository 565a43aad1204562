/// reqwest-backed connector for the backend API.
pub mod http;
/// Bearer token caching and expiry.
pub mod token;
/// Outbox drain loop.
pub mod uploader;

use std::{future::Future, sync::Arc};

use crate::{
    mutation::UploadBatch,
    persist::StorageError,
    types::{MutationId, Seq},
};

/// Failures reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection failure, timeout, or unreadable response.
    #[error("network error: {reason}")]
    Network {
        /// Underlying failure.
        reason: String,
    },
    /// The endpoint answered with a non-2xx status.
    #[error("remote rejected request with HTTP {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// No usable credential could be obtained.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Underlying failure.
        reason: String,
    },
}

/// Delivers one batch to the remote endpoint.
///
/// `Ok` means the endpoint acknowledged the whole batch.
pub trait Transport: Send + Sync + 'static {
    /// Sends `batch`, preserving entry order.
    fn upload(&self, batch: &UploadBatch) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn upload(&self, batch: &UploadBatch) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).upload(batch)
    }
}

/// How the uploader selects the next batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Oldest-first, at most this many mutations.
    Batch(usize),
    /// Every mutation of the transaction holding the oldest row.
    Transaction,
}

impl Default for UploadMode {
    fn default() -> Self {
        Self::Batch(100)
    }
}

/// Failures of [`uploader::Uploader::flush`].
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Local storage failed; the outbox is unchanged.
    #[error("storage error: {0}")]
    Storage(StorageError),
    /// Transient channel failure; always retryable.
    #[error("network error: {reason}")]
    Network {
        /// Underlying failure.
        reason: String,
    },
    /// The endpoint rejected the batch.
    #[error("remote rejected batch with HTTP {status}: {body}")]
    Protocol {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// No credential for the upload.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Underlying failure.
        reason: String,
    },
    /// A pending row cannot be decoded; it blocks the queue until discarded.
    #[error("malformed mutation seq={seq} id={id}: {reason}")]
    Serialization {
        /// Sequence of the offending row.
        seq: Seq,
        /// Mutation id of the offending row.
        id: MutationId,
        /// Decode or validation failure.
        reason: String,
    },
    /// The same batch was rejected too many times in a row.
    #[error("batch starting at seq={seq} rejected {attempts} times, last HTTP {status}")]
    Stalled {
        /// First sequence of the rejected batch.
        seq: Seq,
        /// Last HTTP status received.
        status: u16,
        /// Consecutive rejections.
        attempts: u32,
    },
}

impl UploadError {
    /// True when retrying the same flush later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Protocol { .. } | Self::Auth { .. }
        )
    }
}

impl From<StorageError> for UploadError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Malformed { seq, id, reason } => Self::Serialization { seq, id, reason },
            other => Self::Storage(other),
        }
    }
}

impl From<TransportError> for UploadError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Network { reason } => Self::Network { reason },
            TransportError::Rejected { status, body } => Self::Protocol { status, body },
            TransportError::Auth { reason } => Self::Auth { reason },
        }
    }
}
