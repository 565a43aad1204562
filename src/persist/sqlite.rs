//! Shared SQLite handle backing both the record tables and the outbox.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use rusqlite::{Connection, Params, Transaction, types::ValueRef};
use serde_json::{Map, Value};

use super::{StorageError, StorageResult};

/// One row returned by [`SqliteDb::query`], keyed by column name.
pub type Row = Map<String, Value>;

/// Cloneable handle to the single local database file.
///
/// Every clone shares one connection, so a transaction opened through any
/// clone is atomic with respect to all other writers.
#[derive(Clone)]
pub struct SqliteDb {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDb").finish_non_exhaustive()
    }
}

impl SqliteDb {
    /// Opens or creates the database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> StorageResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Executes one statement and returns the number of changed rows.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> StorageResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(sql, params)?)
    }

    /// Runs a query and returns every row as a column-name map.
    pub fn query<P: Params>(&self, sql: &str, params: P) -> StorageResult<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Map::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                map.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
            }
            out.push(map);
        }
        Ok(out)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` inside one transaction; any error rolls everything back.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Message("database lock poisoned".to_string()))
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::from(v),
        ValueRef::Real(v) => Value::from(v),
        ValueRef::Text(v) => Value::String(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Array(v.iter().map(|b| Value::from(*b)).collect()),
    }
}
