//! Drains the outbox to a [`Transport`] with exactly-once completion.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    mutation::UploadBatch,
    notify::{ChangeNotifier, ChangeOrigin, OUTBOX_TABLE},
    persist::outbox::Outbox,
    types::Seq,
};

use super::{Transport, TransportError, UploadError, UploadMode};

/// Outcome of one successful flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    /// Mutations uploaded and removed.
    pub uploaded: usize,
    /// Highest sequence in the uploaded batch, if any.
    pub through_seq: Option<Seq>,
}

#[derive(Debug, Default)]
struct RejectionTracker {
    head: Option<Seq>,
    count: u32,
}

impl RejectionTracker {
    fn record(&mut self, head: Seq) -> u32 {
        if self.head == Some(head) {
            self.count += 1;
        } else {
            self.head = Some(head);
            self.count = 1;
        }
        self.count
    }

    fn reset(&mut self) {
        self.head = None;
        self.count = 0;
    }
}

/// Single remover of outbox rows.
///
/// Flushes are serialised: the batch is read, sent and completed under one
/// lock, so concurrent flushes never upload the same mutation twice.
#[derive(Debug)]
pub struct Uploader<T> {
    outbox: Outbox,
    transport: T,
    notifier: ChangeNotifier,
    mode: UploadMode,
    max_rejections: u32,
    rejections: Mutex<RejectionTracker>,
}

impl<T: Transport> Uploader<T> {
    /// Creates an uploader; `max_rejections == 0` never escalates.
    pub fn new(
        outbox: Outbox,
        transport: T,
        notifier: ChangeNotifier,
        mode: UploadMode,
        max_rejections: u32,
    ) -> Self {
        Self {
            outbox,
            transport,
            notifier,
            mode,
            max_rejections,
            rejections: Mutex::new(RejectionTracker::default()),
        }
    }

    /// Uploads one batch and returns how many mutations it carried.
    ///
    /// An empty outbox returns `Ok(0)` without touching the transport. On
    /// any error the outbox is left exactly as it was.
    pub async fn flush(&self) -> Result<usize, UploadError> {
        Ok(self.flush_batch().await?.uploaded)
    }

    /// Like [`Uploader::flush`] but also reports the last uploaded sequence.
    pub async fn flush_batch(&self) -> Result<FlushReport, UploadError> {
        let mut rejections = self.rejections.lock().await;

        let pending = match self.mode {
            UploadMode::Batch(max) => self.outbox.peek_batch(max)?,
            UploadMode::Transaction => self.outbox.next_transaction()?,
        };
        let (Some(first), Some(last)) = (pending.first(), pending.last()) else {
            rejections.reset();
            return Ok(FlushReport::default());
        };
        let (head, through) = (first.seq, last.seq);

        let batch = UploadBatch::from_mutations(&pending);
        debug!(head, through, entries = batch.len(), "uploading batch");

        match self.transport.upload(&batch).await {
            Ok(()) => {}
            Err(TransportError::Rejected { status, body }) => {
                let attempts = rejections.record(head);
                warn!(head, status, attempts, "batch rejected");
                if self.max_rejections > 0 && attempts >= self.max_rejections {
                    return Err(UploadError::Stalled {
                        seq: head,
                        status,
                        attempts,
                    });
                }
                return Err(UploadError::Protocol { status, body });
            }
            Err(err) => {
                warn!(head, error = %err, "batch upload failed");
                return Err(err.into());
            }
        }
        rejections.reset();

        // Complete exactly what was sent, never rows enqueued since the read.
        let removed = self.outbox.mark_complete(pending.iter().map(|m| m.id.as_str()))?;
        if removed != pending.len() {
            warn!(expected = pending.len(), removed, "outbox rows vanished during upload");
        }
        info!(uploaded = pending.len(), head, through, "batch uploaded");
        self.notifier.notify(ChangeOrigin::Upload, [OUTBOX_TABLE]);

        Ok(FlushReport {
            uploaded: pending.len(),
            through_seq: Some(through),
        })
    }

    /// Flushes until the outbox holds nothing enqueued before the call.
    pub async fn flush_all(&self) -> Result<usize, UploadError> {
        self.flush_all_with(|_| {}).await
    }

    /// Like [`Uploader::flush_all`], calling `on_batch` after every acknowledged batch.
    ///
    /// Stops once the oldest pending row was enqueued after the call started,
    /// or the outbox is empty.
    pub async fn flush_all_with<F>(&self, mut on_batch: F) -> Result<usize, UploadError>
    where
        F: FnMut(&FlushReport),
    {
        let target = self.outbox.latest_seq()?;
        let mut total = 0usize;
        while self.outbox.head_seq()?.is_some_and(|head| head <= target) {
            let report = self.flush_batch().await?;
            if report.uploaded == 0 {
                break;
            }
            total += report.uploaded;
            on_batch(&report);
        }
        Ok(total)
    }

    /// Outbox this uploader drains.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Transport used for uploads.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}
