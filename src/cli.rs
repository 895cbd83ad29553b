use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::clone::CloneEngine;
use crate::config::RookeryConfig;
use crate::model::{CollectionId, RecordType};
use crate::pipeline::BatchWriter;
use crate::source::JsonLinesSource;
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Parser)]
#[clap(name = "rookery", about = "Multi-tenant schema-on-write record store")]
pub struct Cli {
    /// Path to the configuration file
    #[clap(short, long, default_value = "rookery.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a collection namespace
    CreateCollection {
        /// Collection id; a random one is generated when omitted
        id: Option<CollectionId>,
    },
    /// Drop a collection namespace and everything in it
    DropCollection { id: CollectionId },
    /// List collection namespaces
    ListCollections,
    /// Show a record type's schema, primary key and relations, or list the
    /// collection's record types when no type is given
    Describe {
        collection: CollectionId,
        record_type: Option<RecordType>,
    },
    /// Drop a record type's table and the join tables it owns
    DropRecordType {
        collection: CollectionId,
        record_type: RecordType,
    },
    /// Print the first records of a record type in primary-key order
    Head {
        collection: CollectionId,
        record_type: RecordType,
        #[clap(long, default_value_t = 10)]
        limit: i64,
    },
    /// Batch-write a line-delimited JSON stream into a collection
    Import {
        collection: CollectionId,
        /// Line-delimited JSON file, one record per line
        file: PathBuf,
        /// Write every record as this type instead of its declared type
        #[clap(long)]
        record_type: Option<RecordType>,
        /// Primary-key column to use when a record type is first created
        #[clap(long)]
        primary_key: Option<String>,
    },
    /// Clone a collection's full schema and data into an empty collection
    Clone {
        source: CollectionId,
        target: CollectionId,
    },
}

pub async fn run(command: Command, config: &RookeryConfig) -> Result<(), StoreError> {
    let store = RecordStore::connect(&config.database.dsn, config.database.max_connections).await?;

    match command {
        Command::CreateCollection { id } => {
            let id = id.unwrap_or_else(CollectionId::random);
            let mut tx = store.begin_write().await?;
            store.create_collection(&mut tx, id).await?;
            tx.commit().await?;
            println!("{id}");
        }
        Command::DropCollection { id } => {
            let mut tx = store.begin_write().await?;
            store.drop_collection(&mut tx, id).await?;
            tx.commit().await?;
        }
        Command::ListCollections => {
            let mut conn = store.pool().acquire().await?;
            for collection in store.list_collections(&mut conn).await? {
                println!("{collection}");
            }
        }
        Command::Describe {
            collection,
            record_type: None,
        } => {
            let mut conn = store.pool().acquire().await?;
            for record_type in store.list_record_types(&mut conn, collection).await? {
                let count = store.count_records(&mut conn, collection, &record_type).await?;
                println!("{record_type}\t{count}");
            }
        }
        Command::Describe {
            collection,
            record_type: Some(record_type),
        } => {
            let mut conn = store.pool().acquire().await?;
            let schema = store.table_schema(&mut conn, collection, &record_type).await?;
            let primary_key = store
                .primary_key_column(&mut conn, collection, &record_type)
                .await?;
            let relations = store.relation_cols(&mut conn, collection, &record_type).await?;
            let relation_arrays = store
                .relation_array_cols(&mut conn, collection, &record_type)
                .await?;

            if let Some(primary_key) = primary_key {
                println!("{primary_key}\tSTRING (primary key)");
            }
            for (column, column_type) in &schema {
                let target = relations
                    .iter()
                    .chain(relation_arrays.iter())
                    .find(|relation| relation.column == *column)
                    .map(|relation| format!(" -> {}", relation.target))
                    .unwrap_or_default();
                println!("{column}\t{column_type}{target}");
            }
        }
        Command::DropRecordType {
            collection,
            record_type,
        } => {
            let mut tx = store.begin_write().await?;
            store.delete_record_type(&mut tx, collection, &record_type).await?;
            tx.commit().await?;
        }
        Command::Head {
            collection,
            record_type,
            limit,
        } => {
            let mut conn = store.pool().acquire().await?;
            for record in store
                .query_records(&mut conn, collection, &record_type, limit, 0)
                .await?
            {
                let attributes = serde_json::Value::Object(record.attributes.into_iter().collect());
                println!("{}\t{attributes}", record.id);
            }
        }
        Command::Import {
            collection,
            file,
            record_type,
            primary_key,
        } => {
            let reader =
                BufReader::new(File::open(&file).map_err(|e| StoreError::InvalidRecordStream {
                    reason: format!("{}: {e}", file.display()),
                })?);
            let mut source = JsonLinesSource::new(reader, record_type.clone());

            let writer = BatchWriter::new(&store, config.write.batch_size);
            let result = writer
                .write_stream(&mut source, collection, record_type, primary_key.as_deref())
                .await?;

            for (record_type, count) in result.iter() {
                println!("{record_type}\t{count}");
            }
        }
        Command::Clone { source, target } => {
            let result = CloneEngine::new(&store).clone_collection(source, target).await?;
            for (table, rows) in &result.tables {
                println!("{table}\t{rows}");
            }
        }
    }

    Ok(())
}
