use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use futures::TryStreamExt;
use itertools::Itertools;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::data_types::ColumnType;
use crate::model::{
    join_table_name, validate_name, CollectionId, NameKind, Record, RecordType,
    JOIN_TABLE_PREFIX, RECORD_ID_COLUMN, RESERVED_PREFIX,
};
use crate::relations::{self, relation_array_edges, Relation, RelationCollection};
use crate::schema::TableSchema;
use crate::store::values::{to_sql_value, SqlValue};
use crate::store::{Result, StoreError};

/// Postgres's hard cap on bind parameters per statement; multi-row writes
/// are chunked to stay under it.
const MAX_BIND_PARAMS: usize = 65535;

/// A foreign-key edge read from the collection's catalog: `table.column`
/// references `target_table`.
#[derive(sqlx::FromRow, Clone, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub table_name: String,
    pub column_name: String,
    pub target_table: String,
}

/// Record store for one Postgres database holding any number of collection
/// namespaces (one Postgres schema per collection).
///
/// Every mutating method takes a `&mut PgConnection` so that one
/// caller-owned transaction can span a whole logical operation; `begin_write`
/// hands one out. Catalog reads go through the same connection so they see
/// DDL that is still uncommitted inside the transaction.
#[derive(Debug)]
pub struct RecordStore {
    pool: PgPool,
}

impl RecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .idle_timeout(Duration::from_millis(30000))
            .test_before_acquire(true)
            .connect(dsn)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin_write(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // Collections

    pub async fn create_collection(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
    ) -> Result<()> {
        sqlx::query(&format!("create schema if not exists {}", quote(&collection.to_string())))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn collection_exists(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar(
            "select exists(select from information_schema.schemata where schema_name = $1)",
        )
        .bind(collection.to_string())
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }

    pub async fn drop_collection(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
    ) -> Result<()> {
        sqlx::query(&format!(
            "drop schema {} cascade",
            quote(&collection.to_string())
        ))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn list_collections(&self, conn: &mut PgConnection) -> Result<Vec<CollectionId>> {
        let names: Vec<String> = sqlx::query_scalar(
            "select schema_name from information_schema.schemata order by schema_name",
        )
        .fetch(&mut *conn)
        .try_collect()
        .await?;

        Ok(names
            .iter()
            .filter_map(|name| Uuid::parse_str(name).ok())
            .map(CollectionId)
            .collect())
    }

    // Catalog reads

    pub async fn record_type_exists(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar(
            "select exists(select from pg_tables where schemaname = $1 and tablename = $2)",
        )
        .bind(collection.to_string())
        .bind(record_type.as_str())
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }

    /// All tables in the collection, join tables included.
    pub async fn list_tables(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
    ) -> Result<Vec<String>> {
        let tables = sqlx::query_scalar(
            "select tablename from pg_tables where schemaname = $1 order by tablename",
        )
        .bind(collection.to_string())
        .fetch(&mut *conn)
        .try_collect()
        .await?;
        Ok(tables)
    }

    pub async fn list_record_types(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
    ) -> Result<Vec<RecordType>> {
        Ok(self
            .list_tables(conn, collection)
            .await?
            .iter()
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .filter_map(|name| RecordType::new(name).ok())
            .collect())
    }

    /// The primary-key column of a record type, or `None` when the table
    /// does not exist.
    pub async fn primary_key_column(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<Option<String>> {
        let column = sqlx::query_scalar(
            r#"
        select kcu.column_name
        from information_schema.table_constraints tc
        join information_schema.key_column_usage kcu
          on kcu.constraint_name = tc.constraint_name and kcu.table_schema = tc.table_schema
        where tc.constraint_type = 'PRIMARY KEY'
          and tc.table_schema = $1 and tc.table_name = $2
        "#,
        )
        .bind(collection.to_string())
        .bind(record_type.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        Ok(column)
    }

    /// Every foreign-key edge in the collection, for record-type tables and
    /// join tables alike. Relation metadata and the clone engine's
    /// dependency graph are both derived from this.
    pub async fn fetch_foreign_keys(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
    ) -> Result<Vec<ForeignKey>> {
        let foreign_keys = sqlx::query_as(
            r#"
        select tc.table_name, kcu.column_name, ccu.table_name as target_table
        from information_schema.table_constraints tc
        join information_schema.key_column_usage kcu
          on kcu.constraint_name = tc.constraint_name and kcu.table_schema = tc.table_schema
        join information_schema.constraint_column_usage ccu
          on ccu.constraint_name = tc.constraint_name and ccu.table_schema = tc.table_schema
        where tc.constraint_type = 'FOREIGN KEY' and tc.table_schema = $1
        order by tc.table_name, kcu.column_name
        "#,
        )
        .bind(collection.to_string())
        .fetch(&mut *conn)
        .try_collect()
        .await?;
        Ok(foreign_keys)
    }

    /// Single-valued relation columns of a record type.
    pub async fn relation_cols(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<Vec<Relation>> {
        Ok(self
            .fetch_foreign_keys(conn, collection)
            .await?
            .into_iter()
            .filter(|fk| fk.table_name == record_type.as_str())
            .filter_map(|fk| {
                Some(Relation {
                    column: fk.column_name,
                    target: RecordType::new(&fk.target_table).ok()?,
                })
            })
            .collect())
    }

    /// Relation-array columns of a record type, resolved from the join
    /// tables whose `from_id` references it.
    pub async fn relation_array_cols(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<Vec<Relation>> {
        let foreign_keys = self.fetch_foreign_keys(conn, collection).await?;
        let prefix = format!("{JOIN_TABLE_PREFIX}{record_type}_");

        let mut result = Vec::new();
        for fk in &foreign_keys {
            if fk.column_name != "from_id"
                || fk.target_table != record_type.as_str()
                || !fk.table_name.starts_with(&prefix)
            {
                continue;
            }
            let attribute = &fk.table_name[prefix.len()..];
            let target = foreign_keys
                .iter()
                .find(|other| other.table_name == fk.table_name && other.column_name == "to_id")
                .map(|other| &other.target_table);
            if let Some(target) = target {
                if let Ok(target) = RecordType::new(target) {
                    result.push(Relation {
                        column: attribute.to_string(),
                        target,
                    });
                }
            }
        }
        Ok(result)
    }

    /// The committed schema of a record type, primary key excluded:
    /// inline columns with foreign-key columns marked RELATION, plus one
    /// RELATION_ARRAY entry per join table owned by this type.
    pub async fn table_schema(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<TableSchema> {
        let columns: Vec<(String, String)> = sqlx::query_as(
            r#"
        select column_name, udt_name::regtype::text as data_type
        from information_schema.columns
        where table_schema = $1 and table_name = $2
        "#,
        )
        .bind(collection.to_string())
        .bind(record_type.as_str())
        .fetch_all(&mut *conn)
        .await?;

        if columns.is_empty() {
            return Err(StoreError::TableDoesNotExist {
                collection,
                record_type: record_type.to_string(),
            });
        }

        let primary_key = self
            .primary_key_column(conn, collection, record_type)
            .await?
            .unwrap_or_else(|| RECORD_ID_COLUMN.to_string());

        let mut schema: TableSchema = columns
            .into_iter()
            .filter(|(name, _)| *name != primary_key)
            .map(|(name, pg_type)| {
                let column_type =
                    ColumnType::from_postgres_type(&pg_type).unwrap_or(ColumnType::String);
                (name, column_type)
            })
            .collect();

        for relation in self.relation_cols(conn, collection, record_type).await? {
            schema.insert(relation.column, ColumnType::Relation);
        }
        for relation in self
            .relation_array_cols(conn, collection, record_type)
            .await?
        {
            schema.insert(relation.column, ColumnType::RelationArray);
        }

        Ok(schema)
    }

    // DDL

    /// Create the table for a record type: the primary-key column plus one
    /// column per scalar/relation attribute (relation columns carry their
    /// foreign-key constraint inline), and one join table per
    /// relation-array attribute.
    pub async fn create_record_type(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        schema: &TableSchema,
        relations: &RelationCollection,
        primary_key: &str,
    ) -> Result<()> {
        if primary_key != RECORD_ID_COLUMN {
            validate_name(primary_key, NameKind::Attribute)?;
        }

        let mut column_defs = vec![format!("{} text primary key", quote(primary_key))];
        for (column, column_type) in schema {
            // the caller may have included the primary-key data in the attributes
            if column == primary_key {
                continue;
            }
            validate_name(column, NameKind::Attribute)?;
            if let Some(pg_type) = column_type.postgres_type() {
                column_defs.push(format!("{} {}", quote(column), pg_type));
            }
        }

        for relation in &relations.relations {
            let target_pk = self
                .referenced_primary_key(conn, collection, &relation.target)
                .await?;
            column_defs.push(format!(
                "constraint {} foreign key ({}) references {}({})",
                quote(&format!("fk_{}", relation.column)),
                quote(&relation.column),
                qualified(collection, relation.target.as_str()),
                quote(&target_pk)
            ));
        }

        let ddl = format!(
            "create table {} ({})",
            qualified(collection, record_type.as_str()),
            column_defs.iter().join(", ")
        );
        debug!(%collection, %record_type, "creating record type");
        sqlx::query(&ddl)
            .execute(&mut *conn)
            .await
            .map_err(interpret_ddl_error)?;

        for relation in &relations.relation_arrays {
            self.create_join_table(conn, collection, record_type, &relation.column, &relation.target)
                .await?;
        }

        Ok(())
    }

    /// Add one column, with a foreign-key constraint when it is a relation.
    pub async fn add_column(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        column: &str,
        column_type: ColumnType,
        referenced: Option<&RecordType>,
    ) -> Result<()> {
        validate_name(column, NameKind::Attribute)?;
        let pg_type = match column_type.postgres_type() {
            Some(pg_type) => pg_type,
            // relation arrays have no inline column
            None => return Ok(()),
        };

        let references = match referenced {
            Some(target) => {
                let target_pk = self.referenced_primary_key(conn, collection, target).await?;
                format!(
                    " references {}({})",
                    qualified(collection, target.as_str()),
                    quote(&target_pk)
                )
            }
            None => String::new(),
        };

        debug!(%collection, %record_type, column, %column_type, "adding column");
        sqlx::query(&format!(
            "alter table {} add column {} {}{}",
            qualified(collection, record_type.as_str()),
            quote(column),
            pg_type,
            references
        ))
        .execute(&mut *conn)
        .await
        .map_err(interpret_ddl_error)?;
        Ok(())
    }

    /// Widen a column in place.
    pub async fn change_column_type(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        column: &str,
        column_type: ColumnType,
    ) -> Result<()> {
        let pg_type = column_type
            .postgres_type()
            .expect("relation kinds are rejected by the evolution planner");

        debug!(%collection, %record_type, column, %column_type, "widening column");
        sqlx::query(&format!(
            "alter table {table} alter column {column} type {pg_type} using {column}::{pg_type}",
            table = qualified(collection, record_type.as_str()),
            column = quote(column),
        ))
        .execute(&mut *conn)
        .await
        .map_err(interpret_ddl_error)?;
        Ok(())
    }

    /// Create the join table backing a relation-array attribute: one row
    /// per (from-id, to-id) edge, dying with its owning record.
    pub async fn create_join_table(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        attribute: &str,
        target: &RecordType,
    ) -> Result<()> {
        validate_name(attribute, NameKind::Attribute)?;
        let join_table = join_table_name(record_type, attribute);
        if join_table.len() > 63 {
            return Err(StoreError::InvalidName {
                kind: NameKind::Attribute,
                name: attribute.to_string(),
            });
        }

        let owning_pk = self.referenced_primary_key(conn, collection, record_type).await?;
        let target_pk = self.referenced_primary_key(conn, collection, target).await?;

        debug!(%collection, %record_type, attribute, %target, "creating join table");
        sqlx::query(&format!(
            r#"
        create table {join_table} (
            from_id text not null references {owning}({owning_pk}) on delete cascade,
            to_id text not null references {target}({target_pk}),
            primary key (from_id, to_id)
        )
        "#,
            join_table = qualified(collection, &join_table),
            owning = qualified(collection, record_type.as_str()),
            owning_pk = quote(&owning_pk),
            target = qualified(collection, target.as_str()),
            target_pk = quote(&target_pk),
        ))
        .execute(&mut *conn)
        .await
        .map_err(interpret_ddl_error)?;
        Ok(())
    }

    /// Drop a record type's table along with the join tables it owns.
    pub async fn delete_record_type(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<()> {
        for relation in self
            .relation_array_cols(conn, collection, record_type)
            .await?
        {
            sqlx::query(&format!(
                "drop table {}",
                qualified(collection, &join_table_name(record_type, &relation.column))
            ))
            .execute(&mut *conn)
            .await?;
        }

        sqlx::query(&format!(
            "drop table {}",
            qualified(collection, record_type.as_str())
        ))
        .execute(&mut *conn)
        .await
        .map_err(|e| interpret_delete_error(e, collection, record_type))?;
        Ok(())
    }

    // DML

    /// Insert-or-replace a batch of records keyed by the primary key, as
    /// chunked multi-row statements. For every relation-array attribute
    /// present in the batch, the affected records' join rows are replaced
    /// wholesale with the new edge set.
    pub async fn batch_upsert(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        records: &[Record],
        schema: &TableSchema,
        primary_key: &str,
    ) -> Result<()> {
        let columns: Vec<(&str, ColumnType)> =
            std::iter::once((primary_key, ColumnType::String))
                .chain(schema.iter().filter_map(|(name, column_type)| {
                    if name == primary_key || *column_type == ColumnType::RelationArray {
                        None
                    } else {
                        Some((name.as_str(), *column_type))
                    }
                }))
                .collect();

        // "ON CONFLICT DO UPDATE cannot affect row a second time": when a
        // batch carries the same id twice, the last occurrence wins, as it
        // would with per-row statements
        let records = dedup_by_id(records);

        let mut rows: Vec<Vec<SqlValue>> = Vec::with_capacity(records.len());
        for record in &records {
            let mut row = Vec::with_capacity(columns.len());
            for (column, column_type) in &columns {
                let value = if *column == primary_key {
                    SqlValue::Text(Some(record.id.clone()))
                } else {
                    to_sql_value(
                        record.attributes.get(*column),
                        *column_type,
                        &record.id,
                        column,
                    )?
                };
                row.push(value);
            }
            rows.push(row);
        }

        let statement_prefix = format!(
            "insert into {} ({}) ",
            qualified(collection, record_type.as_str()),
            columns.iter().map(|(name, _)| quote(name)).join(", ")
        );
        let conflict_clause = if columns.len() == 1 {
            format!("on conflict ({}) do nothing", quote(primary_key))
        } else {
            format!(
                "on conflict ({}) do update set {}",
                quote(primary_key),
                columns
                    .iter()
                    .skip(1)
                    .map(|(name, _)| format!("{col} = excluded.{col}", col = quote(name)))
                    .join(", ")
            )
        };

        for chunk in rows.chunks((MAX_BIND_PARAMS / columns.len()).max(1)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&statement_prefix);
            builder.push_values(chunk, |mut b, row| {
                for value in row {
                    match value {
                        SqlValue::Text(v) => b.push_bind(v.clone()),
                        SqlValue::Long(v) => b.push_bind(*v),
                        SqlValue::Double(v) => b.push_bind(*v),
                        SqlValue::Bool(v) => b.push_bind(*v),
                        SqlValue::Date(v) => b.push_bind(*v),
                        SqlValue::DateTime(v) => b.push_bind(*v),
                        SqlValue::Json(v) => b.push_bind(v.clone()),
                    };
                }
            });
            builder.push(" ");
            builder.push(&conflict_clause);

            builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(|e| interpret_write_error(e, collection, record_type))?;
        }

        self.replace_join_rows(conn, collection, record_type, &records, schema)
            .await
    }

    /// Replace the join rows of every relation-array attribute touched by
    /// the batch: delete the affected source ids' existing edges, insert
    /// the new set. A pure replace, never a merge.
    async fn replace_join_rows(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        records: &[&Record],
        schema: &TableSchema,
    ) -> Result<()> {
        for (attribute, edge_set) in relation_array_edges(records, schema)? {
            let join_table = qualified(collection, &join_table_name(record_type, &attribute));

            sqlx::query(&format!("delete from {join_table} where from_id = any($1)"))
                .bind(&edge_set.from_ids)
                .execute(&mut *conn)
                .await
                .map_err(|e| interpret_write_error(e, collection, record_type))?;

            let edges: Vec<(String, String)> =
                edge_set.edges.into_iter().unique().collect();
            for chunk in edges.chunks(MAX_BIND_PARAMS / 2) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    "insert into {join_table} (from_id, to_id) "
                ));
                builder.push_values(chunk, |mut b, (from_id, to_id)| {
                    b.push_bind(from_id.clone()).push_bind(to_id.clone());
                });
                builder
                    .build()
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| interpret_write_error(e, collection, record_type))?;
            }
        }
        Ok(())
    }

    /// Delete records by primary key. Ids with no matching row are reported
    /// back; join rows cascade via the backing store's own rules.
    pub async fn batch_delete(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        records: &[Record],
    ) -> Result<()> {
        let primary_key = self
            .primary_key_column(conn, collection, record_type)
            .await?
            .ok_or_else(|| StoreError::TableDoesNotExist {
                collection,
                record_type: record_type.to_string(),
            })?;

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let deleted: Vec<String> = sqlx::query_scalar(&format!(
            "delete from {} where {pk} = any($1) returning {pk}",
            qualified(collection, record_type.as_str()),
            pk = quote(&primary_key),
        ))
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| interpret_delete_error(e, collection, record_type))?;

        let deleted: BTreeSet<String> = deleted.into_iter().collect();
        let missing: Vec<String> = ids
            .into_iter()
            .filter(|id| !deleted.contains(id))
            .unique()
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingRecords {
                record_type: record_type.to_string(),
                ids: missing,
            });
        }
        Ok(())
    }

    // Reads

    pub async fn get_record(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        record_id: &str,
    ) -> Result<Option<Record>> {
        let decoder = self.row_decoder(conn, collection, record_type).await?;

        let row = sqlx::query(&format!(
            "select {} from {} where {} = $1",
            decoder.select_list(),
            qualified(collection, record_type.as_str()),
            quote(&decoder.primary_key),
        ))
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|row| decoder.decode(&row, record_type)).transpose()
    }

    /// Page through a record type's rows in primary-key order.
    pub async fn query_records(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Record>> {
        let decoder = self.row_decoder(conn, collection, record_type).await?;

        let rows: Vec<sqlx::postgres::PgRow> = sqlx::query(&format!(
            "select {} from {} order by {} limit $1 offset $2",
            decoder.select_list(),
            qualified(collection, record_type.as_str()),
            quote(&decoder.primary_key),
        ))
        .bind(limit)
        .bind(offset)
        .fetch(&mut *conn)
        .try_collect()
        .await?;

        rows.iter()
            .map(|row| decoder.decode(row, record_type))
            .collect()
    }

    pub async fn count_records(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<i64> {
        let count = sqlx::query_scalar(&format!(
            "select count(*) from {}",
            qualified(collection, record_type.as_str())
        ))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| interpret_delete_error(e, collection, record_type))?;
        Ok(count)
    }

    /// The (from-id, to-id) edges of one relation-array attribute.
    pub async fn join_edges(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
        attribute: &str,
    ) -> Result<Vec<(String, String)>> {
        let edges: Vec<(String, String)> = sqlx::query_as(&format!(
            "select from_id, to_id from {} order by from_id, to_id",
            qualified(collection, &join_table_name(record_type, attribute))
        ))
        .fetch_all(&mut *conn)
        .await?;
        Ok(edges)
    }

    /// Column metadata fetched once per query, from which each row is
    /// decoded by an explicit per-type match.
    async fn row_decoder(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        record_type: &RecordType,
    ) -> Result<RowDecoder> {
        let schema = self.table_schema(conn, collection, record_type).await?;
        let primary_key = self
            .primary_key_column(conn, collection, record_type)
            .await?
            .unwrap_or_else(|| RECORD_ID_COLUMN.to_string());
        let relation_targets: BTreeMap<String, RecordType> = self
            .relation_cols(conn, collection, record_type)
            .await?
            .into_iter()
            .map(|relation| (relation.column, relation.target))
            .collect();

        Ok(RowDecoder {
            columns: schema
                .into_iter()
                .filter(|(_, column_type)| *column_type != ColumnType::RelationArray)
                .collect(),
            primary_key,
            relation_targets,
        })
    }

    /// Resolve the primary key of a relation target, failing with
    /// `MissingReferencedTable` when the target has not been created yet.
    async fn referenced_primary_key(
        &self,
        conn: &mut PgConnection,
        collection: CollectionId,
        target: &RecordType,
    ) -> Result<String> {
        self.primary_key_column(conn, collection, target)
            .await?
            .ok_or_else(|| StoreError::MissingReferencedTable {
                record_type: target.to_string(),
            })
    }
}

/// Decodes rows into records: the primary key becomes the record id, every
/// other column is decoded by its committed type, and relation columns are
/// re-encoded into relation strings on the way out.
struct RowDecoder {
    columns: Vec<(String, ColumnType)>,
    primary_key: String,
    relation_targets: BTreeMap<String, RecordType>,
}

impl RowDecoder {
    fn select_list(&self) -> String {
        std::iter::once(quote(&self.primary_key))
            .chain(self.columns.iter().map(|(name, _)| quote(name)))
            .join(", ")
    }

    fn decode(&self, row: &sqlx::postgres::PgRow, record_type: &RecordType) -> Result<Record> {
        let id: String = row.try_get(0)?;
        let mut attributes = BTreeMap::new();

        for (index, (name, column_type)) in self.columns.iter().enumerate() {
            let index = index + 1;
            let value = match column_type {
                ColumnType::Long => row
                    .try_get::<Option<i64>, _>(index)?
                    .map_or(Value::Null, Value::from),
                ColumnType::Double => row
                    .try_get::<Option<f64>, _>(index)?
                    .map_or(Value::Null, Value::from),
                ColumnType::Boolean => row
                    .try_get::<Option<bool>, _>(index)?
                    .map_or(Value::Null, Value::from),
                ColumnType::Date => row
                    .try_get::<Option<chrono::NaiveDate>, _>(index)?
                    .map_or(Value::Null, |date| Value::from(date.to_string())),
                ColumnType::DateTime => row
                    .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
                    .map_or(Value::Null, |ts| {
                        Value::from(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
                    }),
                ColumnType::Json => row
                    .try_get::<Option<Value>, _>(index)?
                    .unwrap_or(Value::Null),
                ColumnType::Relation => {
                    let target_id = row.try_get::<Option<String>, _>(index)?;
                    match (self.relation_targets.get(name), target_id) {
                        (Some(target), Some(target_id)) => {
                            Value::from(relations::encode(target, &target_id))
                        }
                        (None, Some(target_id)) => Value::from(target_id),
                        (_, None) => Value::Null,
                    }
                }
                ColumnType::String => row
                    .try_get::<Option<String>, _>(index)?
                    .map_or(Value::Null, Value::from),
                ColumnType::RelationArray => continue,
            };
            attributes.insert(name.clone(), value);
        }

        Ok(Record::new(&id, record_type.clone(), attributes))
    }
}

/// Deduplicate a batch by record id, the last occurrence winning.
fn dedup_by_id(records: &[Record]) -> Vec<&Record> {
    let mut index_by_id: HashMap<&str, usize> = HashMap::new();
    let mut deduped: Vec<&Record> = Vec::with_capacity(records.len());
    for record in records {
        match index_by_id.entry(record.id.as_str()) {
            Entry::Occupied(entry) => deduped[*entry.get()] = record,
            Entry::Vacant(entry) => {
                entry.insert(deduped.len());
                deduped.push(record);
            }
        }
    }
    deduped
}

/// Quote an already-validated identifier for interpolation into DDL/DML.
pub(crate) fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

/// Schema-qualified, quoted table reference.
pub(crate) fn qualified(collection: CollectionId, table: &str) -> String {
    format!("{}.{}", quote(&collection.to_string()), quote(table))
}

fn sqlstate(error: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db_error) = error {
        db_error.code().map(|code| code.to_string())
    } else {
        None
    }
}

// Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html

fn interpret_write_error(
    error: sqlx::Error,
    collection: CollectionId,
    record_type: &RecordType,
) -> StoreError {
    match sqlstate(&error).as_deref() {
        Some("23503") => StoreError::ReferentialIntegrity(error),
        Some("42P01") => StoreError::TableDoesNotExist {
            collection,
            record_type: record_type.to_string(),
        },
        Some("23505") => StoreError::DuplicateDefinition(error),
        _ => StoreError::Sqlx(error),
    }
}

fn interpret_delete_error(
    error: sqlx::Error,
    collection: CollectionId,
    record_type: &RecordType,
) -> StoreError {
    match sqlstate(&error).as_deref() {
        // deleting a record (or dropping a table) something else relates to
        Some("23503") | Some("2BP01") => StoreError::ReferencedByRelation(error),
        Some("42P01") => StoreError::TableDoesNotExist {
            collection,
            record_type: record_type.to_string(),
        },
        _ => StoreError::Sqlx(error),
    }
}

fn interpret_ddl_error(error: sqlx::Error) -> StoreError {
    match sqlstate(&error).as_deref() {
        // uncoordinated concurrent writers both creating a table or column
        Some("42P07") | Some("42701") | Some("23505") => StoreError::DuplicateDefinition(error),
        _ => StoreError::Sqlx(error),
    }
}
