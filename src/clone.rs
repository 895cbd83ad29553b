use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use sqlx::{PgConnection, Row};
use tracing::info;

use crate::model::{CollectionId, JOIN_TABLE_PREFIX};
use crate::store::postgres::{qualified, quote};
use crate::store::{RecordStore, Result, StoreError};

/// Per-table copied row counts of a successful clone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloneResult {
    pub tables: BTreeMap<String, u64>,
}

impl CloneResult {
    pub fn total_rows(&self) -> u64 {
        self.tables.values().sum()
    }
}

/// Dependency-ordered, whole-collection cloning: full schema + data copy of
/// one collection into a second, previously empty one. Referenced tables
/// are created and populated before the tables that reference them; join
/// tables go last. Both passes run in one write transaction, so a partially
/// cloned collection is never observably visible.
pub struct CloneEngine<'a> {
    store: &'a RecordStore,
}

impl<'a> CloneEngine<'a> {
    pub fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    pub async fn clone_collection(
        &self,
        source: CollectionId,
        target: CollectionId,
    ) -> Result<CloneResult> {
        info!(%source, %target, "starting collection clone");

        let mut tx = self.store.begin_write().await?;
        let result = self.run(&mut tx, source, target).await?;
        tx.commit().await?;

        info!(
            %source, %target,
            tables = result.tables.len(), rows = result.total_rows(),
            "collection clone complete"
        );
        Ok(result)
    }

    async fn run(
        &self,
        conn: &mut PgConnection,
        source: CollectionId,
        target: CollectionId,
    ) -> Result<CloneResult> {
        self.store.create_collection(conn, target).await?;
        if !self.store.list_tables(conn, target).await?.is_empty() {
            return Err(StoreError::CloneTargetNotEmpty { collection: target });
        }

        let tables = self.store.list_tables(conn, source).await?;
        let foreign_keys = self.store.fetch_foreign_keys(conn, source).await?;
        let edges: Vec<(String, String)> = foreign_keys
            .iter()
            .map(|fk| (fk.table_name.clone(), fk.target_table.clone()))
            .collect();

        let order = table_order(&tables, &edges)?;

        // Pass 1: recreate every table's schema in dependency order. LIKE
        // copies columns, defaults and indexes (the primary key included)
        // but not foreign keys, which are re-created from their catalog
        // definitions with the schema qualifier rewritten.
        let constraint_defs = fetch_fk_definitions(conn, source).await?;
        for table in &order {
            info!(%source, %target, table, "cloning schema");
            sqlx::query(&format!(
                "create table {} (like {} including all)",
                qualified(target, table),
                qualified(source, table),
            ))
            .execute(&mut *conn)
            .await?;

            for (name, definition) in constraint_defs.get(table).into_iter().flatten() {
                let rewritten = definition.replace(
                    &format!("{}.", quote(&source.to_string())),
                    &format!("{}.", quote(&target.to_string())),
                );
                sqlx::query(&format!(
                    "alter table {} add constraint {} {}",
                    qualified(target, table),
                    quote(name),
                    rewritten
                ))
                .execute(&mut *conn)
                .await?;
            }
        }

        // Pass 2: bulk-copy every table's rows, never materializing them in
        // this process.
        let mut result = CloneResult::default();
        for table in &order {
            let copied = sqlx::query(&format!(
                "insert into {} select * from {}",
                qualified(target, table),
                qualified(source, table),
            ))
            .execute(&mut *conn)
            .await?
            .rows_affected();
            info!(%source, %target, table, rows = copied, "cloned data");
            result.tables.insert(table.clone(), copied);
        }

        Ok(result)
    }
}

/// Compute the order tables are created and copied in: a topological order
/// of the foreign-key graph over non-join tables (an edge A→B means "A has
/// a foreign key into B"), reversed so referenced tables come first, with
/// every join table appended at the very end. A cycle among non-join tables
/// cannot be ordered and fails fast.
pub fn table_order(tables: &[String], edges: &[(String, String)]) -> Result<Vec<String>> {
    let (join_tables, record_tables): (Vec<&String>, Vec<&String>) = tables
        .iter()
        .partition(|table| table.starts_with(JOIN_TABLE_PREFIX));

    let index_of: HashMap<&str, usize> = record_tables
        .iter()
        .enumerate()
        .map(|(index, table)| (table.as_str(), index))
        .collect();

    // Kahn's algorithm; in-degree counts inbound references, so tables
    // nobody references drain first and reversing the result puts
    // referenced tables before their referrers.
    let mut in_degree = vec![0usize; record_tables.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); record_tables.len()];
    for (from, to) in edges {
        let (Some(&from), Some(&to)) = (index_of.get(from.as_str()), index_of.get(to.as_str()))
        else {
            // edges from join tables are implied by their owning table
            continue;
        };
        in_degree[to] += 1;
        dependents[from].push(to);
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(index, _)| index)
        .collect();

    let mut ordered = Vec::with_capacity(record_tables.len());
    while let Some(index) = queue.pop_front() {
        ordered.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if ordered.len() < record_tables.len() {
        let ordered_set: BTreeSet<usize> = ordered.iter().copied().collect();
        return Err(StoreError::CycleDetected {
            tables: record_tables
                .iter()
                .enumerate()
                .filter(|(index, _)| !ordered_set.contains(index))
                .map(|(_, table)| table.to_string())
                .collect(),
        });
    }

    Ok(ordered
        .into_iter()
        .rev()
        .map(|index| record_tables[index].clone())
        .chain(join_tables.into_iter().cloned())
        .collect())
}

/// Foreign-key constraint definitions per table, as re-runnable DDL text.
async fn fetch_fk_definitions(
    conn: &mut PgConnection,
    collection: CollectionId,
) -> Result<BTreeMap<String, Vec<(String, String)>>> {
    let rows = sqlx::query(
        r#"
    select cl.relname as table_name, con.conname as name,
           pg_get_constraintdef(con.oid) as definition
    from pg_constraint con
    join pg_class cl on cl.oid = con.conrelid
    join pg_namespace ns on ns.oid = cl.relnamespace
    where con.contype = 'f' and ns.nspname = $1
    order by cl.relname, con.conname
    "#,
    )
    .bind(collection.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let mut result: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for row in rows {
        result
            .entry(row.try_get("table_name")?)
            .or_default()
            .push((row.try_get("name")?, row.try_get("definition")?));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn edges(edges: &[(&str, &str)]) -> Vec<(String, String)> {
        edges
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect()
    }

    #[test]
    fn test_chain_orders_referenced_tables_first() {
        // a → b → c: c must be created before b before a
        let order = table_order(
            &names(&["a", "b", "c"]),
            &edges(&[("a", "b"), ("b", "c")]),
        )
        .unwrap();
        assert_eq!(order, names(&["c", "b", "a"]));
    }

    #[test]
    fn test_join_tables_go_last() {
        let order = table_order(
            &names(&["a", "b", "sys_join_a_refs"]),
            &edges(&[
                ("a", "b"),
                ("sys_join_a_refs", "a"),
                ("sys_join_a_refs", "b"),
            ]),
        )
        .unwrap();
        assert_eq!(order, names(&["b", "a", "sys_join_a_refs"]));
    }

    #[test]
    fn test_unrelated_tables_are_all_present() {
        let order = table_order(&names(&["x", "y", "z"]), &[]).unwrap();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, names(&["x", "y", "z"]));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_cycle_is_detected() {
        let result = table_order(
            &names(&["a", "b", "standalone"]),
            &edges(&[("a", "b"), ("b", "a")]),
        );
        match result {
            Err(StoreError::CycleDetected { tables }) => {
                assert_eq!(tables, names(&["a", "b"]));
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        assert!(matches!(
            table_order(&names(&["a"]), &edges(&[("a", "a")])),
            Err(StoreError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_diamond_dependencies() {
        // a references b and c; both reference d
        let order = table_order(
            &names(&["a", "b", "c", "d"]),
            &edges(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]),
        )
        .unwrap();

        let position = |table: &str| order.iter().position(|t| t == table).unwrap();
        assert!(position("d") < position("b"));
        assert!(position("d") < position("c"));
        assert!(position("b") < position("a"));
        assert!(position("c") < position("a"));
    }
}
