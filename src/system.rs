//! Composition root wiring storage, writer, notifier, uploader and sync loop.

use std::{path::Path, sync::Arc};

use serde_json::Value;
use tracing::{info, warn};

use crate::{
    config::SyncConfig,
    mutation::Mutation,
    notify::{ChangeEvent, ChangeNotifier, Subscription, TableFilter},
    persist::{
        StorageError, StorageResult,
        outbox::Outbox,
        records::RecordStore,
        sqlite::SqliteDb,
    },
    runtime::handle::{RuntimeError, SyncHandle, spawn_sync},
    types::OpKind,
    upload::{Transport, TransportError, UploadError, http::HttpConnector, uploader::Uploader},
    writer::{DirectWriter, WriteBatch},
};

/// Failures of [`System`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Local storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The transport could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A flush failed.
    #[error(transparent)]
    Upload(#[from] UploadError),
    /// The sync loop is gone.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// [`System::start`] was called twice.
    #[error("sync loop already started")]
    AlreadyStarted,
}

/// One local database, its outbox, and the machinery that drains it.
#[derive(Debug)]
pub struct System<T: Transport = HttpConnector> {
    config: SyncConfig,
    db: SqliteDb,
    notifier: ChangeNotifier,
    writer: DirectWriter,
    records: RecordStore,
    uploader: Arc<Uploader<T>>,
    sync: Option<SyncHandle>,
}

impl System<HttpConnector> {
    /// Opens the database and builds the HTTP connector from `config`.
    pub fn open(config: SyncConfig) -> Result<Self, SystemError> {
        let transport = HttpConnector::new(&config)?;
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> System<T> {
    /// Opens the database and uses `transport` for uploads.
    pub fn with_transport(config: SyncConfig, transport: T) -> Result<Self, SystemError> {
        let db = if config.db_path == Path::new(":memory:") {
            SqliteDb::open_in_memory()?
        } else {
            SqliteDb::open(&config.db_path)?
        };
        let notifier = ChangeNotifier::new();
        let outbox = Outbox::new(db.clone());
        let pending = outbox.pending_count()?;
        let uploader = Arc::new(Uploader::new(
            outbox,
            transport,
            notifier.clone(),
            config.upload_mode,
            config.max_rejections,
        ));
        info!(
            db = %config.db_path.display(),
            backend = %config.backend_url,
            pending,
            "outbox system opened"
        );
        Ok(Self {
            writer: DirectWriter::new(db.clone(), notifier.clone()),
            records: RecordStore::new(db.clone(), notifier.clone()),
            config,
            db,
            notifier,
            uploader,
            sync: None,
        })
    }

    /// Spawns the background sync loop on the current tokio runtime.
    pub fn start(&mut self) -> Result<SyncHandle, SystemError> {
        if self.sync.is_some() {
            return Err(SystemError::AlreadyStarted);
        }
        let handle = spawn_sync(Arc::clone(&self.uploader), self.config.runtime());
        self.sync = Some(handle.clone());
        Ok(handle)
    }

    /// Writes one mutation and nudges the sync loop.
    pub fn write(
        &self,
        op: OpKind,
        table: &str,
        target_id: &str,
        data: Option<Value>,
    ) -> Result<Mutation, SystemError> {
        let mutation = self.writer.write(op, table, target_id, data)?;
        self.nudge();
        Ok(mutation)
    }

    /// Creates or replaces a record.
    pub fn put(&self, table: &str, target_id: &str, data: Value) -> Result<Mutation, SystemError> {
        self.write(OpKind::Put, table, target_id, Some(data))
    }

    /// Deletes a record.
    pub fn delete(&self, table: &str, target_id: &str) -> Result<Mutation, SystemError> {
        self.write(OpKind::Delete, table, target_id, None)
    }

    /// Writes several mutations atomically under one transaction id.
    pub fn transaction<F>(&self, f: F) -> Result<Vec<Mutation>, SystemError>
    where
        F: FnOnce(&mut WriteBatch<'_>) -> StorageResult<()>,
    {
        let written = self.writer.transaction(f)?;
        if !written.is_empty() {
            self.nudge();
        }
        Ok(written)
    }

    /// Registers `callback` for changes touching any of `filter`'s tables.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_change<F>(&self, filter: TableFilter, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.on_tables(filter, callback)
    }

    /// Drains everything enqueued so far.
    ///
    /// Goes through the sync loop once started, otherwise flushes inline.
    pub async fn flush(&self) -> Result<usize, SystemError> {
        match &self.sync {
            Some(handle) => Ok(handle.flush().await?),
            None => Ok(self.uploader.flush_all().await?),
        }
    }

    /// Number of mutations still waiting for upload.
    pub fn pending_count(&self) -> Result<usize, SystemError> {
        Ok(self.uploader.outbox().pending_count()?)
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shared database handle, also usable for direct SQL.
    pub fn db(&self) -> &SqliteDb {
        &self.db
    }

    /// Change notifier shared by every component.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Direct write path.
    pub fn writer(&self) -> &DirectWriter {
        &self.writer
    }

    /// Local records.
    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Pending outbox.
    pub fn outbox(&self) -> &Outbox {
        self.uploader.outbox()
    }

    /// Uploader draining the outbox.
    pub fn uploader(&self) -> &Arc<Uploader<T>> {
        &self.uploader
    }

    /// Handle of the running sync loop, if started.
    pub fn sync_handle(&self) -> Option<&SyncHandle> {
        self.sync.as_ref()
    }

    /// Makes a final flush attempt and stops the sync loop.
    ///
    /// Pending mutations that could not be uploaded stay in the database.
    pub async fn shutdown(mut self) -> Result<(), SystemError> {
        if let Some(handle) = self.sync.take() {
            handle.shutdown().await?;
        }
        let pending = self.uploader.outbox().pending_count()?;
        info!(pending, "outbox system closed");
        Ok(())
    }

    fn nudge(&self) {
        let Some(handle) = &self.sync else {
            return;
        };
        if let Err(err) = handle.trigger() {
            warn!(error = %err, "could not trigger sync loop");
        }
    }
}
