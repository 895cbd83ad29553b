use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::data_types::ColumnType;
use crate::model::{Record, RecordType};
use crate::schema::TableSchema;
use crate::store::{Result, StoreError};

/// Scheme token of the relation string grammar
/// `rookery://<recordType>/<recordId>`. This prefix is the sole signal
/// distinguishing a relation attribute from a plain string attribute.
pub const RELATION_SCHEME: &str = "rookery";

const RELATION_PREFIX: &str = "rookery://";

/// A relation-typed column: its name and the one record type it targets.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Relation {
    pub column: String,
    pub target: RecordType,
}

/// Relation columns found in a batch, split into single-valued and
/// array-valued groups. A column never appears in both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationCollection {
    pub relations: BTreeSet<Relation>,
    pub relation_arrays: BTreeSet<Relation>,
}

pub fn encode(target: &RecordType, record_id: &str) -> String {
    format!("{RELATION_SCHEME}://{target}/{record_id}")
}

pub fn is_relation(value: &str) -> bool {
    value.starts_with(RELATION_PREFIX)
}

/// Classify a JSON value as a single relation string.
pub fn is_relation_value(value: &Value) -> bool {
    matches!(value, Value::String(s) if is_relation(s))
}

/// Decode a relation string into its target record type and record id,
/// failing when the scheme token or segment count is wrong.
pub fn decode(value: &str) -> Result<(RecordType, String)> {
    let invalid = || StoreError::InvalidRelation {
        value: value.to_string(),
    };

    let rest = value.strip_prefix(RELATION_PREFIX).ok_or_else(invalid)?;

    match rest.split('/').collect::<Vec<_>>().as_slice() {
        [record_type, record_id] if !record_id.is_empty() => Ok((
            RecordType::new(record_type).map_err(|_| invalid())?,
            record_id.to_string(),
        )),
        _ => Err(invalid()),
    }
}

/// Scan a batch for relation columns, grouping them into single-valued and
/// array-valued relations using the batch's inferred schema. Binding one
/// column to two different target types is a schema conflict.
pub fn find_relations(records: &[Record], schema: &TableSchema) -> Result<RelationCollection> {
    let mut result = RelationCollection::default();

    for (column, column_type) in schema {
        let target = match column_type {
            ColumnType::Relation => column_target(records, column, false)?,
            ColumnType::RelationArray => column_target(records, column, true)?,
            _ => continue,
        };
        if let Some(target) = target {
            let relation = Relation {
                column: column.clone(),
                target,
            };
            match column_type {
                ColumnType::Relation => result.relations.insert(relation),
                _ => result.relation_arrays.insert(relation),
            };
        }
    }

    Ok(result)
}

/// The single target record type of a relation column across the batch, or
/// `None` when every value is null/absent (or every array is empty).
fn column_target(records: &[Record], column: &str, array: bool) -> Result<Option<RecordType>> {
    let mut target: Option<RecordType> = None;

    for record in records {
        let value = match record.attributes.get(column) {
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };
        let decoded = if array {
            match array_target(value)? {
                None => continue,
                Some(target) => target,
            }
        } else {
            let encoded = value.as_str().ok_or_else(|| StoreError::InvalidRelation {
                value: value.to_string(),
            })?;
            decode(encoded)?.0
        };

        match &target {
            None => target = Some(decoded),
            Some(existing) if *existing != decoded => {
                return Err(StoreError::SchemaConflict {
                    reason: format!(
                        "relation attribute {column:?} can only be assigned to one record type \
                         (found both {existing} and {decoded})"
                    ),
                });
            }
            _ => {}
        }
    }

    Ok(target)
}

/// The single target record type named by one relation-array value; all
/// elements must relate to the same record type.
fn array_target(value: &Value) -> Result<Option<RecordType>> {
    let mut target: Option<RecordType> = None;
    for (decoded, _) in decode_relation_array(value)? {
        match &target {
            None => target = Some(decoded),
            Some(existing) if *existing != decoded => {
                return Err(StoreError::SchemaConflict {
                    reason: "all relations in an array must relate to the same record type"
                        .to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(target)
}

/// Decode a relation-array value into (target type, target id) pairs. The
/// value is either a JSON array of relation strings or a string holding the
/// JSON text of one, depending on the record source.
pub fn decode_relation_array(value: &Value) -> Result<Vec<(RecordType, String)>> {
    let parsed;
    let items = match value {
        Value::Array(items) => items,
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text).map_err(|_| {
                StoreError::InvalidRelation {
                    value: text.clone(),
                }
            })?;
            match &parsed {
                Value::Array(items) => items,
                _ => {
                    return Err(StoreError::InvalidRelation {
                        value: text.clone(),
                    })
                }
            }
        }
        _ => {
            return Err(StoreError::InvalidRelation {
                value: value.to_string(),
            })
        }
    };

    items
        .iter()
        .map(|item| {
            let encoded = item.as_str().ok_or_else(|| StoreError::InvalidRelation {
                value: item.to_string(),
            })?;
            decode(encoded)
        })
        .collect()
}

/// Collect every relation-array edge carried by a batch, keyed by column:
/// for each record with a present relation-array attribute, its (from-id,
/// to-id) pairs. Records where the attribute is null or absent do not
/// participate; an empty array yields the record id with no edges, which
/// replaces its existing edge set with nothing.
pub fn relation_array_edges(
    records: &[&Record],
    schema: &TableSchema,
) -> Result<BTreeMap<String, RelationArrayEdges>> {
    let mut result: BTreeMap<String, RelationArrayEdges> = BTreeMap::new();

    for (column, column_type) in schema {
        if *column_type != ColumnType::RelationArray {
            continue;
        }
        for record in records {
            let value = match record.attributes.get(column) {
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };
            let entry = result.entry(column.clone()).or_default();
            entry.from_ids.push(record.id.clone());
            for (_, to_id) in decode_relation_array(value)? {
                entry.edges.push((record.id.clone(), to_id));
            }
        }
    }

    Ok(result)
}

/// Edge replacement set for one relation-array column: the source ids whose
/// join rows are to be replaced, and the new edges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationArrayEdges {
    pub from_ids: Vec<String>,
    pub edges: Vec<(String, String)>,
}
