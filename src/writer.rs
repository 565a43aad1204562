//! Direct write path: local record update plus outbox append in one transaction.

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    mutation::{Mutation, NewMutation},
    notify::{ChangeNotifier, ChangeOrigin, OUTBOX_TABLE},
    persist::{
        StorageError, StorageResult,
        outbox::{allocate_tx_id, insert_mutation},
        records::apply_change,
        sqlite::SqliteDb,
    },
    types::{OpKind, TxId},
};

/// Appends mutations without touching the network.
///
/// Cheap to clone; all clones write through the same connection.
#[derive(Debug, Clone)]
pub struct DirectWriter {
    db: SqliteDb,
    notifier: ChangeNotifier,
}

impl DirectWriter {
    /// Creates a writer over `db` that reports changes to `notifier`.
    pub fn new(db: SqliteDb, notifier: ChangeNotifier) -> Self {
        Self { db, notifier }
    }

    /// Writes one mutation in its own transaction.
    pub fn write(
        &self,
        op: OpKind,
        table: &str,
        target_id: &str,
        data: Option<Value>,
    ) -> StorageResult<Mutation> {
        let mutation = NewMutation {
            id: crate::mutation::new_mutation_id(),
            op,
            table: table.to_string(),
            target_id: target_id.to_string(),
            data,
        };
        self.transaction(|batch| batch.push(mutation).map(|_| ()))?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::Message("write committed no mutation".to_string()))
    }

    /// Creates or replaces a record.
    pub fn put(&self, table: &str, target_id: &str, data: Value) -> StorageResult<Mutation> {
        self.write(OpKind::Put, table, target_id, Some(data))
    }

    /// Deletes a record.
    pub fn delete(&self, table: &str, target_id: &str) -> StorageResult<Mutation> {
        self.write(OpKind::Delete, table, target_id, None)
    }

    /// Runs `f` with a batch whose writes share one transaction id.
    ///
    /// Either every write commits or none does. Observers are notified once
    /// after commit.
    pub fn transaction<F>(&self, f: F) -> StorageResult<Vec<Mutation>>
    where
        F: FnOnce(&mut WriteBatch<'_>) -> StorageResult<()>,
    {
        let written = self.db.with_tx(|tx| {
            let tx_id = allocate_tx_id(tx)?;
            let mut batch = WriteBatch {
                conn: tx,
                tx_id,
                written: Vec::new(),
            };
            f(&mut batch)?;
            Ok(batch.written)
        })?;

        if written.is_empty() {
            return Ok(written);
        }

        debug!(
            tx_id = ?written[0].tx_id,
            count = written.len(),
            first_seq = written[0].seq,
            "direct write committed"
        );
        let tables = written
            .iter()
            .map(|m| m.table.clone())
            .chain(std::iter::once(OUTBOX_TABLE.to_string()));
        self.notifier.notify(ChangeOrigin::Local, tables);
        Ok(written)
    }
}

/// Writes collected inside [`DirectWriter::transaction`].
pub struct WriteBatch<'a> {
    conn: &'a Connection,
    tx_id: TxId,
    written: Vec<Mutation>,
}

impl WriteBatch<'_> {
    /// Applies the mutation locally and appends it to the outbox.
    ///
    /// Each push runs under its own savepoint: on error neither the record nor
    /// the outbox changes, and the batch can go on.
    pub fn push(&mut self, mutation: NewMutation) -> StorageResult<&Mutation> {
        mutation.validate()?;
        self.conn.execute_batch("SAVEPOINT write_batch_push")?;
        match self.apply(&mutation) {
            Ok(stored) => {
                self.conn.execute_batch("RELEASE write_batch_push")?;
                self.written.push(stored);
                Ok(&self.written[self.written.len() - 1])
            }
            Err(err) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO write_batch_push; RELEASE write_batch_push")
                {
                    warn!(error = %rollback, "savepoint rollback failed");
                }
                Err(err)
            }
        }
    }

    fn apply(&self, mutation: &NewMutation) -> StorageResult<Mutation> {
        let stored = insert_mutation(self.conn, mutation, Some(self.tx_id))?;
        apply_change(
            self.conn,
            mutation.op,
            &mutation.table,
            &mutation.target_id,
            mutation.data.as_ref(),
        )?;
        Ok(stored)
    }

    /// Creates or replaces a record.
    pub fn put(&mut self, table: &str, target_id: &str, data: Value) -> StorageResult<&Mutation> {
        self.push(NewMutation::put(table, target_id, data))
    }

    /// Deletes a record.
    pub fn delete(&mut self, table: &str, target_id: &str) -> StorageResult<&Mutation> {
        self.push(NewMutation::delete(table, target_id))
    }

    /// Transaction id shared by every write in this batch.
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }
}
