use std::sync::Arc;

use tokio::{
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::upload::{Transport, UploadError, uploader::Uploader};

use super::events::SyncEvent;

/// Failures of [`SyncHandle`] calls.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The flush itself failed.
    #[error(transparent)]
    Upload(#[from] UploadError),
    /// The sync loop has stopped.
    #[error("sync runtime channel closed")]
    ChannelClosed,
}

/// Timing of the background sync loop.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Periodic flush interval.
    pub flush_interval_ms: u64,
    /// First retry delay after a retryable failure.
    pub initial_backoff_ms: u64,
    /// Upper bound for the retry delay.
    pub max_backoff_ms: u64,
    /// Capacity of the command channel.
    pub command_queue_bound: usize,
    /// Flush as soon as the loop starts.
    pub flush_on_start: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 30_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            command_queue_bound: 64,
            flush_on_start: true,
        }
    }
}

/// Cloneable handle to a running sync loop.
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl Clone for SyncHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

enum Command {
    Trigger,
    Flush {
        resp: oneshot::Sender<Result<usize, UploadError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), UploadError>>,
    },
}

struct Schedule {
    deadline: Instant,
    paused: bool,
    backoff: Duration,
    interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Schedule {
    fn new(config: &RuntimeConfig) -> Self {
        let interval = Duration::from_millis(config.flush_interval_ms);
        let initial_backoff = Duration::from_millis(config.initial_backoff_ms);
        let deadline = if config.flush_on_start {
            Instant::now()
        } else {
            Instant::now() + interval
        };
        Self {
            deadline,
            paused: false,
            backoff: initial_backoff,
            interval,
            initial_backoff,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    fn trigger(&mut self) {
        self.paused = false;
        self.backoff = self.initial_backoff;
        self.deadline = Instant::now();
    }

    fn after(&mut self, outcome: &Result<usize, UploadError>, events: &broadcast::Sender<SyncEvent>) {
        match outcome {
            Ok(_) => {
                self.paused = false;
                self.backoff = self.initial_backoff;
                self.deadline = Instant::now() + self.interval;
            }
            Err(err) if err.is_retryable() => {
                let delay = self.backoff;
                self.backoff = (self.backoff * 2).min(self.max_backoff);
                self.deadline = Instant::now() + delay;
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "flush failed, will retry");
                let _ = events.send(SyncEvent::UploadFailed {
                    error: err.to_string(),
                    retry_in_ms: delay.as_millis() as u64,
                });
            }
            Err(err) => {
                self.paused = true;
                warn!(error = %err, "flush stalled, waiting for a trigger");
                let _ = events.send(SyncEvent::Stalled {
                    error: err.to_string(),
                });
            }
        }
    }
}

/// Starts the sync loop on the current tokio runtime.
///
/// The loop flushes on [`SyncHandle::trigger`], on [`SyncHandle::flush`],
/// every `flush_interval_ms`, and after a backoff delay following a
/// retryable failure.
pub fn spawn_sync<T: Transport>(uploader: Arc<Uploader<T>>, config: RuntimeConfig) -> SyncHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<SyncEvent>(1024);

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut schedule = Schedule::new(&config);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    match cmd {
                        Command::Trigger => schedule.trigger(),
                        Command::Flush { resp } => {
                            let out = drain(&uploader, &events_tx_loop).await;
                            schedule.after(&out, &events_tx_loop);
                            let _ = resp.send(out);
                        }
                        Command::Shutdown { resp } => {
                            let out = drain(&uploader, &events_tx_loop).await.map(|_| ());
                            if let Err(err) = &out {
                                warn!(error = %err, "final flush before shutdown failed");
                            }
                            let _ = resp.send(out);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(schedule.deadline), if !schedule.paused => {
                    let out = drain(&uploader, &events_tx_loop).await;
                    schedule.after(&out, &events_tx_loop);
                }
            }
        }
        info!("sync loop stopped");
    });

    SyncHandle { cmd_tx, events_tx }
}

impl SyncHandle {
    /// Stream of sync loop events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// Asks for a flush soon without waiting for it.
    ///
    /// Triggers coalesce; a full command queue already holds a pending trigger.
    pub fn trigger(&self) -> Result<(), RuntimeError> {
        match self.cmd_tx.try_send(Command::Trigger) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(RuntimeError::ChannelClosed),
        }
    }

    /// Drains everything enqueued so far and returns the uploaded count.
    pub async fn flush(&self) -> Result<usize, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }

    /// Makes a final flush attempt and stops the loop.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }

    /// True once the loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

async fn drain<T: Transport>(
    uploader: &Uploader<T>,
    events: &broadcast::Sender<SyncEvent>,
) -> Result<usize, UploadError> {
    let total = uploader
        .flush_all_with(|report| {
            if let Some(through_seq) = report.through_seq {
                let _ = events.send(SyncEvent::Uploaded {
                    count: report.uploaded,
                    through_seq,
                });
            }
        })
        .await?;
    debug!(total, "drain finished");
    Ok(total)
}
