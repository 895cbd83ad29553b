use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreError;

/// Fixed name of the system primary-key column. Always `text`, always the
/// primary key, never part of user-supplied schema inference.
pub const RECORD_ID_COLUMN: &str = "sys_id";

/// User-supplied attribute and record-type names must not start with this.
pub const RESERVED_PREFIX: &str = "sys_";

/// Join tables backing relation-array attributes are named
/// `sys_join_<record type>_<attribute>`.
pub const JOIN_TABLE_PREFIX: &str = "sys_join_";

lazy_static! {
    // Everything ends up double-quoted in generated SQL, but only names that
    // can't smuggle a quote or exceed Postgres's identifier length get there.
    static ref SQL_IDENTIFIER: Regex = Regex::new(r"^[a-zA-Z0-9_\-]{1,63}$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameKind {
    RecordType,
    Attribute,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameKind::RecordType => f.write_str("record type"),
            NameKind::Attribute => f.write_str("attribute"),
        }
    }
}

/// Validate a user-supplied name for use as a SQL identifier, rejecting the
/// reserved `sys_` prefix.
pub fn validate_name(name: &str, kind: NameKind) -> Result<(), StoreError> {
    if !SQL_IDENTIFIER.is_match(name) || name.starts_with(RESERVED_PREFIX) {
        return Err(StoreError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Identifier of a collection: an isolated tenant namespace, physically a
/// Postgres schema named by this UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(pub Uuid);

impl CollectionId {
    pub fn random() -> Self {
        CollectionId(Uuid::new_v4())
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CollectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CollectionId(Uuid::parse_str(s)?))
    }
}

/// A named table within a collection, created dynamically on first write.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordType(String);

impl RecordType {
    pub fn new(name: &str) -> Result<Self, StoreError> {
        validate_name(name, NameKind::RecordType)?;
        Ok(RecordType(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RecordType {
    type Err = StoreError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        RecordType::new(name)
    }
}

impl TryFrom<String> for RecordType {
    type Error = StoreError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        RecordType::new(&name)
    }
}

impl From<RecordType> for String {
    fn from(record_type: RecordType) -> String {
        record_type.0
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the join table backing a relation-array attribute.
pub fn join_table_name(record_type: &RecordType, attribute: &str) -> String {
    format!("{JOIN_TABLE_PREFIX}{record_type}_{attribute}")
}

pub type RecordAttributes = BTreeMap<String, serde_json::Value>;

/// One row: an id, a record type and an untyped attribute map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    #[serde(default)]
    pub attributes: RecordAttributes,
}

impl Record {
    pub fn new(id: &str, record_type: RecordType, attributes: RecordAttributes) -> Self {
        Record {
            id: id.to_string(),
            record_type,
            attributes,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Upsert,
    Delete,
}

/// A batch pulled from a record source: one operation tag and a list of
/// records, possibly of several record types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    pub operation: OperationType,
    pub records: Vec<Record>,
}

impl WriteBatch {
    pub fn empty() -> Self {
        WriteBatch {
            operation: OperationType::Upsert,
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-record-type counts of records written by one pipeline invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchWriteResult(BTreeMap<RecordType, u64>);

impl BatchWriteResult {
    pub fn add(&mut self, record_type: &RecordType, count: u64) {
        *self.0.entry(record_type.clone()).or_insert(0) += count;
    }

    pub fn count_for(&self, record_type: &RecordType) -> u64 {
        self.0.get(record_type).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordType, &u64)> {
        self.0.iter()
    }
}
