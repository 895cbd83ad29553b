pub mod postgres;
mod values;

pub use postgres::RecordStore;

use crate::data_types::ColumnType;
use crate::model::{CollectionId, NameKind};
use crate::relations::RELATION_SCHEME;

/// Engine-level error taxonomy. Backing-store error codes are translated
/// into these at the store boundary and never leak raw.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("schema conflict: {reason}")]
    SchemaConflict { reason: String },

    #[error("record references a record that does not exist")]
    ReferentialIntegrity(#[source] sqlx::Error),

    #[error(
        "{record_id}.{attribute} is a {actual} in the request \
         but is defined as a {expected} in the record type"
    )]
    TypeMismatch {
        record_id: String,
        attribute: String,
        expected: ColumnType,
        actual: ColumnType,
    },

    #[error("cannot change {column:?} from {existing} to {incoming}: relation attribute types are immutable")]
    ImmutableColumn {
        column: String,
        existing: ColumnType,
        incoming: ColumnType,
    },

    #[error("record type {record_type:?} referenced by a relation does not exist")]
    MissingReferencedTable { record_type: String },

    #[error("collection {collection} already contains record types")]
    CloneTargetNotEmpty { collection: CollectionId },

    #[error("relation cycle among record types {tables:?}")]
    CycleDetected { tables: Vec<String> },

    #[error("expected {RELATION_SCHEME}://<recordType>/<recordId>, got {value:?}")]
    InvalidRelation { value: String },

    #[error("{name:?} is not a valid {kind} name")]
    InvalidName { kind: NameKind, name: String },

    #[error("record type {record_type:?} does not exist in collection {collection}")]
    TableDoesNotExist {
        collection: CollectionId,
        record_type: String,
    },

    #[error("records do not exist in {record_type}: {ids:?}")]
    MissingRecords {
        record_type: String,
        ids: Vec<String>,
    },

    #[error("cannot delete: another record or record type has a relation to it")]
    ReferencedByRelation(#[source] sqlx::Error),

    #[error("duplicate definition in backing store")]
    DuplicateDefinition(#[source] sqlx::Error),

    #[error("invalid record stream: {reason}")]
    InvalidRecordStream { reason: String },

    #[error("internal SQL error: {0:?}")]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
