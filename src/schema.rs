use std::collections::BTreeMap;

use crate::data_types::ColumnType;
use crate::inference::select_best_type;
use crate::model::{validate_name, NameKind};
use crate::store::{Result, StoreError};

/// Attribute name → inferred column type for one record type. The primary
/// key column is never part of it.
pub type TableSchema = BTreeMap<String, ColumnType>;

/// The DDL needed to evolve an existing table to accept an incoming batch
/// schema: columns to add, and columns to widen in place. Computed without
/// touching the store so the rules are testable on their own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvolutionPlan {
    pub additions: BTreeMap<String, ColumnType>,
    /// column → (existing type, widened type)
    pub widenings: BTreeMap<String, (ColumnType, ColumnType)>,
}

impl EvolutionPlan {
    pub fn is_noop(&self) -> bool {
        self.additions.is_empty() && self.widenings.is_empty()
    }
}

/// Diff an existing table schema against an incoming batch schema.
///
/// Columns only on the incoming side are additions (validated against the
/// reserved prefix). Columns on both sides with differing types are widened
/// via `select_best_type`, unless either side is a relation kind: relation
/// and relation-array columns are immutable, and rebinding a plain scalar
/// column as a relation is a schema conflict. Schemas only ever get wider;
/// nothing is dropped or narrowed.
pub fn plan_evolution(existing: &TableSchema, incoming: &TableSchema) -> Result<EvolutionPlan> {
    let mut plan = EvolutionPlan::default();

    for (column, incoming_type) in incoming {
        match existing.get(column) {
            None => {
                validate_name(column, NameKind::Attribute)?;
                plan.additions.insert(column.clone(), *incoming_type);
            }
            Some(existing_type) if existing_type != incoming_type => {
                if existing_type.is_relation_kind() {
                    return Err(StoreError::ImmutableColumn {
                        column: column.clone(),
                        existing: *existing_type,
                        incoming: *incoming_type,
                    });
                }
                if incoming_type.is_relation_kind() {
                    return Err(StoreError::SchemaConflict {
                        reason: format!(
                            "attribute {column:?} is a {existing_type} and cannot be \
                             reused as a {incoming_type}"
                        ),
                    });
                }
                let widened = select_best_type(*existing_type, *incoming_type);
                if widened != *existing_type {
                    plan.widenings
                        .insert(column.clone(), (*existing_type, widened));
                }
            }
            Some(_) => {}
        }
    }

    Ok(plan)
}

/// The schema the store should write the incoming batch with: every incoming
/// column resolved to its committed (possibly widened) type.
pub fn committed_schema(plan: &EvolutionPlan, existing: &TableSchema, incoming: &TableSchema) -> TableSchema {
    incoming
        .keys()
        .map(|column| {
            let committed = plan
                .widenings
                .get(column)
                .map(|(_, widened)| *widened)
                .or_else(|| existing.get(column).copied())
                .or_else(|| plan.additions.get(column).copied())
                .unwrap_or(incoming[column]);
            (column.clone(), committed)
        })
        .collect()
}
