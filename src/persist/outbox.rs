//! Durable, ordered outbox of pending mutations.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::{
    mutation::{CrudEnvelope, Mutation, NewMutation, decode_entry_payload, new_mutation_id},
    types::{MutationId, Seq, TxId},
};

use super::{StorageError, StorageResult, now_ms, sqlite::SqliteDb};

/// Outbox table operations over the shared [`SqliteDb`].
///
/// Any number of clones may append concurrently; removal is meant for a
/// single owner (the uploader).
#[derive(Debug, Clone)]
pub struct Outbox {
    db: SqliteDb,
}

struct RawRow {
    seq: Seq,
    id: MutationId,
    tx_id: Option<TxId>,
    payload: String,
}

impl Outbox {
    /// Wraps an open database.
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }

    /// Underlying database handle.
    pub fn db(&self) -> &SqliteDb {
        &self.db
    }

    /// Appends one mutation under a fresh transaction id.
    pub fn enqueue(&self, mutation: NewMutation) -> StorageResult<Mutation> {
        let stored = self.db.with_tx(|tx| {
            let tx_id = allocate_tx_id(tx)?;
            insert_mutation(tx, &mutation, Some(tx_id))
        })?;
        debug!(seq = stored.seq, id = %stored.id, op = %stored.op, table = %stored.table, "enqueued mutation");
        Ok(stored)
    }

    /// Appends a raw row payload exactly as a direct SQL writer would.
    ///
    /// The payload is stored verbatim and only decoded when the row is read,
    /// so malformed payloads surface from [`Outbox::peek_batch`].
    pub fn enqueue_raw(&self, payload: &str, tx_id: Option<TxId>) -> StorageResult<Seq> {
        let id = new_mutation_id();
        let seq = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO outbox(id, tx_id, payload) VALUES (?1, ?2, ?3)",
                params![id, tx_id.map(|v| v as i64), payload],
            )?;
            Ok(conn.last_insert_rowid() as Seq)
        })?;
        debug!(seq, id = %id, "enqueued raw outbox row");
        Ok(seq)
    }

    /// Returns up to `max` pending mutations in ascending sequence order.
    ///
    /// Has no side effects. A row that fails to decode ends the batch before
    /// it; only a malformed head row is reported, as [`StorageError::Malformed`].
    pub fn peek_batch(&self, max: usize) -> StorageResult<Vec<Mutation>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let rows = self.db.with_conn(|conn| {
            load_rows(
                conn,
                "SELECT seq, id, tx_id, payload FROM outbox ORDER BY seq ASC LIMIT ?1",
                params![max.min(i64::MAX as usize) as i64],
            )
        })?;
        decode_prefix(rows)
    }

    /// Returns the contiguous run of pending rows that share the oldest row's transaction id.
    ///
    /// The run stops at the first row with another transaction id, so rows are
    /// never taken out of sequence order. Rows written without a transaction id
    /// form a transaction of their own. A malformed row inside the run fails the
    /// whole transaction.
    pub fn next_transaction(&self) -> StorageResult<Vec<Mutation>> {
        let rows = self.db.with_conn(|conn| {
            let head: Option<(i64, Option<i64>)> = conn
                .query_row(
                    "SELECT seq, tx_id FROM outbox ORDER BY seq ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match head {
                None => Ok(Vec::new()),
                Some((seq, None)) => load_rows(
                    conn,
                    "SELECT seq, id, tx_id, payload FROM outbox WHERE seq = ?1",
                    params![seq],
                ),
                Some((seq, Some(tx_id))) => load_rows(
                    conn,
                    "SELECT seq, id, tx_id, payload FROM outbox
                     WHERE seq >= ?1
                       AND seq < COALESCE(
                           (SELECT MIN(seq) FROM outbox WHERE seq > ?1 AND tx_id IS NOT ?2),
                           9223372036854775807)
                     ORDER BY seq ASC",
                    params![seq, tx_id],
                ),
            }
        })?;
        decode_rows(rows)
    }

    /// Sequence of the oldest pending row.
    pub fn head_seq(&self) -> StorageResult<Option<Seq>> {
        self.db.with_conn(|conn| {
            let seq: Option<i64> = conn.query_row("SELECT MIN(seq) FROM outbox", [], |row| row.get(0))?;
            Ok(seq.map(|v| v as Seq))
        })
    }

    /// Deletes exactly the given ids and returns how many were pending.
    ///
    /// Ids that are not pending are ignored. Deleted ids are remembered so
    /// they can never be enqueued again.
    pub fn mark_complete<I, S>(&self, ids: I) -> StorageResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<S> = ids.into_iter().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self.db.with_tx(|tx| {
            let completed_ms = now_ms();
            let mut removed = 0usize;
            let mut find = tx.prepare("SELECT seq FROM outbox WHERE id = ?1")?;
            let mut delete = tx.prepare("DELETE FROM outbox WHERE seq = ?1")?;
            let mut tombstone = tx.prepare(
                "INSERT OR IGNORE INTO outbox_completed(id, seq, completed_ms) VALUES (?1, ?2, ?3)",
            )?;
            for id in &ids {
                let id = id.as_ref();
                let seq: Option<i64> = find.query_row(params![id], |row| row.get(0)).optional()?;
                let Some(seq) = seq else {
                    continue;
                };
                removed += delete.execute(params![seq])?;
                tombstone.execute(params![id, seq, completed_ms])?;
            }
            Ok(removed)
        })?;

        debug!(requested = ids.len(), removed, "marked mutations complete");
        Ok(removed)
    }

    /// Drops one row without uploading it. Returns false if it was not pending.
    pub fn discard(&self, seq: Seq) -> StorageResult<bool> {
        let count = self
            .db
            .execute("DELETE FROM outbox WHERE seq = ?1", params![seq as i64])?;
        if count > 0 {
            warn!(seq, "discarded outbox row without upload");
        }
        Ok(count > 0)
    }

    /// Number of pending rows.
    pub fn pending_count(&self) -> StorageResult<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Highest sequence ever assigned, including rows already completed.
    pub fn latest_seq(&self) -> StorageResult<Seq> {
        self.db.with_conn(|conn| {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM sqlite_sequence WHERE name = 'outbox'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.unwrap_or(0) as Seq)
        })
    }

    /// Forgets completion records up to and including `seq`.
    pub fn prune_completed(&self, through_seq: Seq) -> StorageResult<usize> {
        self.db.execute(
            "DELETE FROM outbox_completed WHERE seq <= ?1",
            params![through_seq as i64],
        )
    }
}

/// Takes the next client transaction id from the meta counter.
pub(crate) fn allocate_tx_id(conn: &Connection) -> StorageResult<TxId> {
    let next: i64 = conn.query_row(
        "SELECT value FROM outbox_meta WHERE key = 'next_tx_id'",
        [],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE outbox_meta SET value = ?1 WHERE key = 'next_tx_id'",
        params![next + 1],
    )?;
    Ok(next as TxId)
}

/// Validates and inserts one mutation on an open connection or transaction.
pub(crate) fn insert_mutation(
    conn: &Connection,
    mutation: &NewMutation,
    tx_id: Option<TxId>,
) -> StorageResult<Mutation> {
    mutation.validate()?;

    let completed: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM outbox_completed WHERE id = ?1",
            params![mutation.id],
            |row| row.get(0),
        )
        .optional()?;
    if completed.is_some() {
        return Err(StorageError::AlreadyCompleted(mutation.id.clone()));
    }

    let pending: Option<i64> = conn
        .query_row(
            "SELECT seq FROM outbox WHERE id = ?1",
            params![mutation.id],
            |row| row.get(0),
        )
        .optional()?;
    if pending.is_some() {
        return Err(StorageError::Duplicate(mutation.id.clone()));
    }

    let entry = mutation.to_entry();
    let payload = serde_json::to_string(&CrudEnvelope::new(entry.clone()))?;
    conn.execute(
        "INSERT INTO outbox(id, tx_id, payload) VALUES (?1, ?2, ?3)",
        params![mutation.id, tx_id.map(|v| v as i64), payload],
    )?;
    let seq = conn.last_insert_rowid() as Seq;

    Ok(Mutation::from_entry(seq, mutation.id.clone(), tx_id, entry))
}

fn load_rows<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> StorageResult<Vec<RawRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        let seq: i64 = row.get(0)?;
        let tx_id: Option<i64> = row.get(2)?;
        Ok(RawRow {
            seq: seq as Seq,
            id: row.get(1)?,
            tx_id: tx_id.map(|v| v as TxId),
            payload: row.get(3)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn decode_prefix(rows: Vec<RawRow>) -> StorageResult<Vec<Mutation>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match decode_entry_payload(&row.payload) {
            Ok(entry) => out.push(Mutation::from_entry(row.seq, row.id, row.tx_id, entry)),
            Err(reason) if out.is_empty() => {
                return Err(StorageError::Malformed {
                    seq: row.seq,
                    id: row.id,
                    reason,
                });
            }
            Err(reason) => {
                debug!(seq = row.seq, %reason, "batch cut before malformed row");
                break;
            }
        }
    }
    Ok(out)
}

fn decode_rows(rows: Vec<RawRow>) -> StorageResult<Vec<Mutation>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let entry = decode_entry_payload(&row.payload).map_err(|reason| StorageError::Malformed {
            seq: row.seq,
            id: row.id.clone(),
            reason,
        })?;
        out.push(Mutation::from_entry(row.seq, row.id, row.tx_id, entry));
    }
    Ok(out)
}
