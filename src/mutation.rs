//! Mutation model, outbox row payloads and the upload wire format.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::{MutationId, OpKind, RecordId, Seq, TxId};

/// Version number for serialized [`CrudEnvelope`] payloads.
pub const MUTATION_FORMAT_VERSION: u16 = 1;

/// Reasons a mutation is rejected before it reaches (or after it leaves) the outbox.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    /// A PUT without data.
    #[error("PUT on {table}/{target_id} requires a data payload")]
    MissingPayload {
        /// Target table.
        table: String,
        /// Target record id.
        target_id: RecordId,
    },
    /// A DELETE carrying data.
    #[error("DELETE on {table}/{target_id} must not carry a data payload")]
    UnexpectedPayload {
        /// Target table.
        table: String,
        /// Target record id.
        target_id: RecordId,
    },
    /// PUT data that is not a JSON object.
    #[error("data payload for {table}/{target_id} must be a JSON object")]
    NonObjectPayload {
        /// Target table.
        table: String,
        /// Target record id.
        target_id: RecordId,
    },
    /// Empty table name.
    #[error("mutation target table is empty")]
    EmptyTable,
    /// Empty target id.
    #[error("mutation target id is empty")]
    EmptyTargetId,
}

/// A mutation that has not been assigned an outbox sequence yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMutation {
    /// Unique mutation id.
    pub id: MutationId,
    /// Operation kind.
    pub op: OpKind,
    /// Logical table the target record lives in.
    pub table: String,
    /// Target record id.
    pub target_id: RecordId,
    /// Record data; present for PUT only.
    pub data: Option<Value>,
}

impl NewMutation {
    /// Builds a PUT with a fresh UUID v4 mutation id.
    pub fn put(table: impl Into<String>, target_id: impl Into<RecordId>, data: Value) -> Self {
        Self {
            id: new_mutation_id(),
            op: OpKind::Put,
            table: table.into(),
            target_id: target_id.into(),
            data: Some(data),
        }
    }

    /// Builds a DELETE with a fresh UUID v4 mutation id.
    pub fn delete(table: impl Into<String>, target_id: impl Into<RecordId>) -> Self {
        Self {
            id: new_mutation_id(),
            op: OpKind::Delete,
            table: table.into(),
            target_id: target_id.into(),
            data: None,
        }
    }

    /// Checks the payload rules for the operation kind.
    pub fn validate(&self) -> Result<(), MutationError> {
        validate_parts(self.op, &self.table, &self.target_id, self.data.as_ref())
    }

    /// Row payload written to the outbox table.
    pub fn to_entry(&self) -> CrudEntry {
        CrudEntry {
            op: self.op,
            table: self.table.clone(),
            id: self.target_id.clone(),
            data: self.data.clone(),
        }
    }
}

/// A pending mutation as stored in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Outbox sequence; strictly increasing in insertion order.
    pub seq: Seq,
    /// Unique mutation id.
    pub id: MutationId,
    /// Transaction the mutation was written in; raw rows may have none.
    pub tx_id: Option<TxId>,
    /// Operation kind.
    pub op: OpKind,
    /// Logical table.
    pub table: String,
    /// Target record id.
    pub target_id: RecordId,
    /// Record data; present for PUT only.
    pub data: Option<Value>,
}

impl Mutation {
    pub(crate) fn from_entry(
        seq: Seq,
        id: MutationId,
        tx_id: Option<TxId>,
        entry: CrudEntry,
    ) -> Self {
        Self {
            seq,
            id,
            tx_id,
            op: entry.op,
            table: entry.table,
            target_id: entry.id,
            data: entry.data,
        }
    }
}

/// Row payload of the outbox table.
///
/// This is also the shape raw SQL writers insert directly, so the record id
/// may arrive as a JSON number and the table is keyed as `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrudEntry {
    /// Operation kind.
    pub op: OpKind,
    /// Logical table.
    #[serde(rename = "type")]
    pub table: String,
    /// Target record id.
    #[serde(deserialize_with = "record_id_from_json")]
    pub id: RecordId,
    /// Record data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CrudEntry {
    /// Checks the payload rules for the operation kind.
    pub fn validate(&self) -> Result<(), MutationError> {
        validate_parts(self.op, &self.table, &self.id, self.data.as_ref())
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrudEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped row payload.
    pub entry: CrudEntry,
}

impl CrudEnvelope {
    /// Constructs an envelope using [`MUTATION_FORMAT_VERSION`].
    pub fn new(entry: CrudEntry) -> Self {
        Self {
            format_version: MUTATION_FORMAT_VERSION,
            entry,
        }
    }
}

/// Decodes an outbox row payload, accepting both enveloped and bare entries.
pub fn decode_entry_payload(payload: &str) -> Result<CrudEntry, String> {
    let entry = if let Ok(envelope) = serde_json::from_str::<CrudEnvelope>(payload) {
        if envelope.format_version != MUTATION_FORMAT_VERSION {
            return Err(format!(
                "unsupported mutation format version: {}",
                envelope.format_version
            ));
        }
        envelope.entry
    } else {
        // Bare entries come from raw SQL writers.
        serde_json::from_str::<CrudEntry>(payload)
            .map_err(|e| format!("mutation payload decode failed: {e}"))?
    };
    entry.validate().map_err(|e| e.to_string())?;
    Ok(entry)
}

/// One entry of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEntry {
    /// Operation kind.
    pub op: OpKind,
    /// Logical table.
    pub table: String,
    /// Target record id.
    pub id: RecordId,
    /// Record data, omitted for DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request body POSTed to the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatch {
    /// Entries in ascending sequence order.
    pub batch: Vec<UploadEntry>,
}

impl UploadBatch {
    /// Builds the wire batch, preserving the order of `mutations`.
    pub fn from_mutations(mutations: &[Mutation]) -> Self {
        Self {
            batch: mutations
                .iter()
                .map(|m| UploadEntry {
                    op: m.op,
                    table: m.table.clone(),
                    id: m.target_id.clone(),
                    data: m.data.clone(),
                })
                .collect(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// True when the batch carries nothing.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Fresh UUID v4 mutation id.
pub fn new_mutation_id() -> MutationId {
    uuid::Uuid::new_v4().to_string()
}

fn validate_parts(
    op: OpKind,
    table: &str,
    target_id: &str,
    data: Option<&Value>,
) -> Result<(), MutationError> {
    if table.trim().is_empty() {
        return Err(MutationError::EmptyTable);
    }
    if target_id.trim().is_empty() {
        return Err(MutationError::EmptyTargetId);
    }
    match (op, data) {
        (OpKind::Put, None) => Err(MutationError::MissingPayload {
            table: table.to_string(),
            target_id: target_id.to_string(),
        }),
        (OpKind::Put, Some(value)) if !value.is_object() => Err(MutationError::NonObjectPayload {
            table: table.to_string(),
            target_id: target_id.to_string(),
        }),
        (OpKind::Delete, Some(_)) => Err(MutationError::UnexpectedPayload {
            table: table.to_string(),
            target_id: target_id.to_string(),
        }),
        _ => Ok(()),
    }
}

fn record_id_from_json<'de, D>(deserializer: D) -> Result<RecordId, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "record id must be a string or number, got {other}"
        ))),
    }
}
