//! Local record tables shared by the direct write path and remote application.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    mutation::{CrudEntry, MutationError},
    notify::{ChangeNotifier, ChangeOrigin},
    types::{OpKind, RecordId},
};

use super::{StorageError, StorageResult, now_ms, sqlite::SqliteDb};

/// A logical record as currently held locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Logical table.
    pub table: String,
    /// Record id, unique within its table.
    pub id: RecordId,
    /// Record fields.
    pub data: Value,
}

/// A change received from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Operation kind.
    pub op: OpKind,
    /// Logical table.
    pub table: String,
    /// Target record id.
    pub id: RecordId,
    /// Record fields for PUT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Read access to records plus the remote-apply path.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: SqliteDb,
    notifier: ChangeNotifier,
}

impl RecordStore {
    /// Wraps an open database; changes are published through `notifier`.
    pub fn new(db: SqliteDb, notifier: ChangeNotifier) -> Self {
        Self { db, notifier }
    }

    /// Current local copy of one record.
    pub fn get(&self, table: &str, id: &str) -> StorageResult<Option<Record>> {
        self.db.with_conn(|conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM records WHERE kind = ?1 AND id = ?2",
                    params![table, id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(data) = data else {
                return Ok(None);
            };
            Ok(Some(Record {
                table: table.to_string(),
                id: id.to_string(),
                data: serde_json::from_str(&data)?,
            }))
        })
    }

    /// All records of `table`, ordered by id.
    pub fn list(&self, table: &str) -> StorageResult<Vec<Record>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, data FROM records WHERE kind = ?1 ORDER BY id ASC")?;
            let rows = stmt.query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, data) = row?;
                out.push(Record {
                    table: table.to_string(),
                    id,
                    data: serde_json::from_str(&data)?,
                });
            }
            Ok(out)
        })
    }

    /// Applies remote changes atomically and notifies the affected tables.
    pub fn apply_remote(&self, changes: &[RemoteChange]) -> StorageResult<usize> {
        if changes.is_empty() {
            return Ok(0);
        }
        for change in changes {
            entry_of(change).validate()?;
        }

        self.db.with_tx(|tx| {
            for change in changes {
                apply_change(tx, change.op, &change.table, &change.id, change.data.as_ref())?;
            }
            Ok(())
        })?;

        debug!(count = changes.len(), "applied remote changes");
        self.notifier
            .notify(ChangeOrigin::Remote, changes.iter().map(|c| c.table.clone()));
        Ok(changes.len())
    }
}

/// Writes one change into the record tables on an open connection or transaction.
pub(crate) fn apply_change(
    conn: &Connection,
    op: OpKind,
    table: &str,
    id: &str,
    data: Option<&Value>,
) -> StorageResult<()> {
    match op {
        OpKind::Put => {
            let data = data.ok_or_else(|| {
                StorageError::Invalid(MutationError::MissingPayload {
                    table: table.to_string(),
                    target_id: id.to_string(),
                })
            })?;
            conn.execute(
                "INSERT INTO records(kind, id, data, updated_ms) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, id) DO UPDATE SET data = excluded.data, updated_ms = excluded.updated_ms",
                params![table, id, serde_json::to_string(data)?, now_ms()],
            )?;
        }
        OpKind::Delete => {
            conn.execute(
                "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                params![table, id],
            )?;
        }
    }
    Ok(())
}

fn entry_of(change: &RemoteChange) -> CrudEntry {
    CrudEntry {
        op: change.op,
        table: change.table.clone(),
        id: change.id.clone(),
        data: change.data.clone(),
    }
}
