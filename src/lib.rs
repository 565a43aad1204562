//! Offline-first mutation outbox with exactly-once upload.
//!
//! Local writes land in SQLite together with an ordered outbox entry. An
//! uploader drains the outbox oldest-first to a remote endpoint and removes
//! exactly the entries the endpoint acknowledged.
//!
//! # Examples
//!
//! Direct writes against an in-memory database:
//! ```
//! use outbox::{
//!     notify::ChangeNotifier,
//!     persist::{outbox::Outbox, sqlite::SqliteDb},
//!     writer::DirectWriter,
//! };
//! use serde_json::json;
//!
//! let db = SqliteDb::open_in_memory().expect("open sqlite");
//! let writer = DirectWriter::new(db.clone(), ChangeNotifier::new());
//! writer.put("customers", "1", json!({"name": "Ada"})).expect("put");
//! writer.delete("customers", "1").expect("delete");
//!
//! let pending = Outbox::new(db).peek_batch(10).expect("peek");
//! assert_eq!(pending.len(), 2);
//! assert!(pending[0].seq < pending[1].seq);
//! ```
//!
//! Full system with the HTTP connector and background sync:
//! ```no_run
//! use outbox::{config::SyncConfig, system::System};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut system = System::open(SyncConfig::from_env()).expect("open");
//! system.start().expect("start sync");
//! system.put("customers", "42", json!({"name": "Grace"})).expect("put");
//! system.flush().await.expect("flush");
//! system.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Runtime configuration and environment overrides.
pub mod config;
/// Tracing subscriber setup.
pub mod logging;
/// Mutation model and wire envelopes.
pub mod mutation;
/// Table change notifications.
pub mod notify;
/// SQLite persistence: outbox and records.
pub mod persist;
/// Background sync loop handle and events.
pub mod runtime;
/// Composition root.
pub mod system;
/// Shared primitive types and enums.
pub mod types;
/// Transport abstraction, HTTP connector and uploader.
pub mod upload;
/// Direct local write path.
pub mod writer;
