use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::data_types::ColumnType;
use crate::inference::infer_types;
use crate::model::{
    BatchWriteResult, CollectionId, OperationType, Record, RecordType, RECORD_ID_COLUMN,
};
use crate::relations::{find_relations, Relation};
use crate::schema::{committed_schema, plan_evolution, TableSchema};
use crate::store::{RecordStore, Result, StoreError};
use crate::source::RecordSource;

/// The schema a record type's writes are bound against once its first
/// upsert batch has been seen.
#[derive(Clone, Debug)]
pub struct CommittedSchema {
    pub schema: TableSchema,
    pub primary_key: String,
}

/// The streaming write pipeline: pulls batches from a record source one at
/// a time, infers and evolves schemas incrementally, and drives the record
/// store. Strictly synchronous and single-pass; one batch in memory.
pub struct BatchWriter<'a> {
    store: &'a RecordStore,
    batch_size: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a RecordStore, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    /// Consume a record source to exhaustion inside one write transaction.
    /// Returns per-record-type counts of records written. Any failure rolls
    /// back every batch of this invocation.
    ///
    /// With `fixed_type` set, every record is written as that type;
    /// otherwise records are grouped by their declared type.
    /// `primary_key_hint` only applies when a record type is first created;
    /// for existing types it must match the committed primary key.
    pub async fn write_stream(
        &self,
        source: &mut dyn RecordSource,
        collection: CollectionId,
        fixed_type: Option<RecordType>,
        primary_key_hint: Option<&str>,
    ) -> Result<BatchWriteResult> {
        let mut tx = self.store.begin_write().await?;
        let result = self
            .consume(&mut tx, source, collection, fixed_type, primary_key_hint)
            .await?;
        tx.commit().await?;

        info!(%collection, records = result.total(), "batch write complete");
        Ok(result)
    }

    async fn consume(
        &self,
        conn: &mut PgConnection,
        source: &mut dyn RecordSource,
        collection: CollectionId,
        fixed_type: Option<RecordType>,
        primary_key_hint: Option<&str>,
    ) -> Result<BatchWriteResult> {
        let mut committed: HashMap<RecordType, CommittedSchema> = HashMap::new();
        let mut result = BatchWriteResult::default();

        loop {
            let batch = source.next_batch(self.batch_size)?;
            if batch.is_empty() {
                break;
            }

            let subsets: BTreeMap<RecordType, Vec<Record>> = match &fixed_type {
                Some(record_type) => BTreeMap::from([(record_type.clone(), batch.records)]),
                None => batch
                    .records
                    .into_iter()
                    .map(|record| (record.record_type.clone(), record))
                    .into_group_map()
                    .into_iter()
                    .collect(),
            };

            for (record_type, records) in subsets {
                debug!(
                    %collection, %record_type, operation = ?batch.operation,
                    records = records.len(), "processing batch subset"
                );
                match batch.operation {
                    OperationType::Upsert => {
                        if !committed.contains_key(&record_type) {
                            let state = self
                                .create_or_evolve_schema(
                                    conn,
                                    collection,
                                    &record_type,
                                    &records,
                                    primary_key_hint,
                                )
                                .await?;
                            committed.insert(record_type.clone(), state);
                        }
                        let state = &committed[&record_type];
                        self.store
                            .batch_upsert(
                                conn,
                                collection,
                                &record_type,
                                &records,
                                &state.schema,
                                &state.primary_key,
                            )
                            .await?;
                    }
                    OperationType::Delete => {
                        self.store
                            .batch_delete(conn, collection, &record_type, &records)
                            .await?;
                    }
                }
                result.add(&record_type, records.len() as u64);
            }
        }

        Ok(result)
    }

    /// Infer a schema from a batch and make the record type's table match
    /// it: create the table (with its relations and join tables) when it
    /// does not exist, evolve it otherwise. Creating the same record type
    /// twice with an identical schema is a no-op on the second call.
    pub async fn create_or_evolve_schema(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        records: &[Record],
        primary_key_hint: Option<&str>,
    ) -> Result<CommittedSchema> {
        if !self
            .store
            .record_type_exists(conn, collection, record_type)
            .await?
        {
            let primary_key = primary_key_hint.unwrap_or(RECORD_ID_COLUMN);
            let inferred = infer_types(records, primary_key);
            let relations = find_relations(records, &inferred)?;

            info!(%collection, %record_type, columns = inferred.len(), "creating record type");
            self.store
                .create_record_type(conn, collection, record_type, &inferred, &relations, primary_key)
                .await?;

            return Ok(CommittedSchema {
                schema: inferred,
                primary_key: primary_key.to_string(),
            });
        }

        let primary_key = self
            .store
            .primary_key_column(conn, collection, record_type)
            .await?
            .unwrap_or_else(|| RECORD_ID_COLUMN.to_string());
        if let Some(hint) = primary_key_hint {
            if hint != primary_key {
                return Err(StoreError::SchemaConflict {
                    reason: format!(
                        "record type {record_type} is already keyed by {primary_key:?}, \
                         cannot key it by {hint:?}"
                    ),
                });
            }
        }

        let existing = self.store.table_schema(conn, collection, record_type).await?;
        let inferred = infer_types(records, &primary_key);
        let incoming_relations = find_relations(records, &inferred)?;

        let existing_relations = self
            .store
            .relation_cols(conn, collection, record_type)
            .await?;
        let existing_arrays = self
            .store
            .relation_array_cols(conn, collection, record_type)
            .await?;
        validate_relations(&existing, &existing_relations, &incoming_relations.relations)?;
        validate_relations(&existing, &existing_arrays, &incoming_relations.relation_arrays)?;

        let plan = plan_evolution(&existing, &inferred)?;
        for (column, column_type) in &plan.additions {
            match column_type {
                ColumnType::Relation => {
                    let target =
                        relation_target(&incoming_relations.relations, column)?;
                    self.store
                        .add_column(conn, collection, record_type, column, *column_type, Some(target))
                        .await?;
                }
                ColumnType::RelationArray => {
                    let target =
                        relation_target(&incoming_relations.relation_arrays, column)?;
                    self.store
                        .create_join_table(conn, collection, record_type, column, target)
                        .await?;
                }
                _ => {
                    self.store
                        .add_column(conn, collection, record_type, column, *column_type, None)
                        .await?;
                }
            }
        }
        for (column, (_, widened)) in &plan.widenings {
            self.store
                .change_column_type(conn, collection, record_type, column, *widened)
                .await?;
        }

        Ok(CommittedSchema {
            schema: committed_schema(&plan, &existing, &inferred),
            primary_key,
        })
    }
}

/// A relation column in an incoming batch must not collide with an existing
/// non-relation column, and must keep pointing at the record type it was
/// bound to.
fn validate_relations<'a>(
    existing_schema: &TableSchema,
    existing_relations: &[Relation],
    incoming: impl IntoIterator<Item = &'a Relation>,
) -> Result<()> {
    for relation in incoming {
        match existing_relations
            .iter()
            .find(|existing| existing.column == relation.column)
        {
            Some(existing) if existing.target != relation.target => {
                return Err(StoreError::SchemaConflict {
                    reason: format!(
                        "relation attribute {:?} is bound to record type {} \
                         and cannot also relate to {}",
                        relation.column, existing.target, relation.target
                    ),
                });
            }
            Some(_) => {}
            None if existing_schema.contains_key(&relation.column)
                && !existing_schema[&relation.column].is_relation_kind() =>
            {
                return Err(StoreError::SchemaConflict {
                    reason: format!(
                        "attribute {:?} already exists and was not configured for relations",
                        relation.column
                    ),
                });
            }
            None => {}
        }
    }
    Ok(())
}

fn relation_target<'a>(
    relations: &'a std::collections::BTreeSet<Relation>,
    column: &str,
) -> Result<&'a RecordType> {
    relations
        .iter()
        .find(|relation| relation.column == column)
        .map(|relation| &relation.target)
        .ok_or_else(|| StoreError::SchemaConflict {
            reason: format!("relation attribute {column:?} has no resolvable target type"),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn relation(column: &str, target: &str) -> Relation {
        Relation {
            column: column.to_string(),
            target: RecordType::new(target).unwrap(),
        }
    }

    #[test]
    fn test_validate_relations_rejects_scalar_reuse() {
        let existing_schema =
            TableSchema::from([("donor".to_string(), ColumnType::String)]);
        let incoming = BTreeSet::from([relation("donor", "donor")]);

        assert!(matches!(
            validate_relations(&existing_schema, &[], &incoming),
            Err(StoreError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn test_validate_relations_rejects_rebinding() {
        let existing = vec![relation("donor", "donor")];
        let incoming = BTreeSet::from([relation("donor", "cohort")]);

        assert!(matches!(
            validate_relations(&TableSchema::new(), &existing, &incoming),
            Err(StoreError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn test_validate_relations_accepts_consistent_batch() {
        let existing_schema =
            TableSchema::from([("donor".to_string(), ColumnType::Relation)]);
        let existing = vec![relation("donor", "donor")];
        let incoming = BTreeSet::from([relation("donor", "donor"), relation("cohort", "cohort")]);

        assert!(validate_relations(&existing_schema, &existing, &incoming).is_ok());
    }
}
