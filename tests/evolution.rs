use serde_json::json;

use rookery::data_types::ColumnType;
use rookery::pipeline::BatchWriter;
use rookery::source::VecSource;
use rookery::store::StoreError;

use crate::{record, record_type, test_collection, BATCH_SIZE};

#[tokio::test]
async fn test_long_widens_to_double_across_batches() {
    let Some(test) = test_collection().await else { return };
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    let mut source = VecSource::upserts(vec![record(&sample, "s1", json!({"x": 10}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    let mut source = VecSource::upserts(vec![record(&sample, "s2", json!({"x": 10.5}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    let mut conn = test.store.pool().acquire().await.unwrap();
    let schema = test
        .store
        .table_schema(&mut conn, test.collection, &sample)
        .await
        .unwrap();
    assert_eq!(schema["x"], ColumnType::Double);

    // the previously written LONG value survives the widening
    let fetched = test
        .store
        .get_record(&mut conn, test.collection, &sample, "s1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.attributes["x"], json!(10.0));

    drop(conn);
    test.drop().await;
}

#[tokio::test]
async fn test_conflicting_scalars_demote_to_string() {
    let Some(test) = test_collection().await else { return };
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    let mut source = VecSource::upserts(vec![record(&sample, "s1", json!({"flag": true}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    let mut source =
        VecSource::upserts(vec![record(&sample, "s2", json!({"flag": "2024-01-01"}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    let mut conn = test.store.pool().acquire().await.unwrap();
    let schema = test
        .store
        .table_schema(&mut conn, test.collection, &sample)
        .await
        .unwrap();
    assert_eq!(schema["flag"], ColumnType::String);

    drop(conn);
    test.drop().await;
}

#[tokio::test]
async fn test_new_columns_are_added_on_later_writes() {
    let Some(test) = test_collection().await else { return };
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    let mut source = VecSource::upserts(vec![record(&sample, "s1", json!({"x": 1}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    let mut source =
        VecSource::upserts(vec![record(&sample, "s2", json!({"x": 2, "extra": "hi"}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    let mut conn = test.store.pool().acquire().await.unwrap();
    let schema = test
        .store
        .table_schema(&mut conn, test.collection, &sample)
        .await
        .unwrap();
    assert_eq!(schema["extra"], ColumnType::String);

    // rows written before the column existed read back as null
    let fetched = test
        .store
        .get_record(&mut conn, test.collection, &sample, "s1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.attributes["extra"], json!(null));

    drop(conn);
    test.drop().await;
}

#[tokio::test]
async fn test_identical_schema_recreate_is_a_noop() {
    let Some(test) = test_collection().await else { return };
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    for id in ["s1", "s1"] {
        let mut source =
            VecSource::upserts(vec![record(&sample, id, json!({"x": 1, "name": "n"}))]);
        writer
            .write_stream(&mut source, test.collection, None, None)
            .await
            .unwrap();
    }

    let mut conn = test.store.pool().acquire().await.unwrap();
    let schema = test
        .store
        .table_schema(&mut conn, test.collection, &sample)
        .await
        .unwrap();
    assert_eq!(schema.len(), 2);
    assert_eq!(
        test.store
            .count_records(&mut conn, test.collection, &sample)
            .await
            .unwrap(),
        1
    );

    drop(conn);
    test.drop().await;
}

#[tokio::test]
async fn test_widening_a_relation_column_fails_and_leaves_schema_unchanged() {
    let Some(test) = test_collection().await else { return };
    let donor = record_type("donor");
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    let mut source = VecSource::upserts(vec![record(&donor, "d1", json!({}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();
    let mut source = VecSource::upserts(vec![record(
        &sample,
        "s1",
        json!({"donor": "rookery://donor/d1"}),
    )]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    // a non-relation value for the relation column would retype it
    let mut source =
        VecSource::upserts(vec![record(&sample, "s2", json!({"donor": "plain text"}))]);
    let error = writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::ImmutableColumn { .. }));

    let mut conn = test.store.pool().acquire().await.unwrap();
    let schema = test
        .store
        .table_schema(&mut conn, test.collection, &sample)
        .await
        .unwrap();
    assert_eq!(schema["donor"], ColumnType::Relation);

    drop(conn);
    test.drop().await;
}

#[tokio::test]
async fn test_scalar_column_cannot_become_a_relation() {
    let Some(test) = test_collection().await else { return };
    let donor = record_type("donor");
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    let mut source = VecSource::upserts(vec![record(&donor, "d1", json!({}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();
    let mut source =
        VecSource::upserts(vec![record(&sample, "s1", json!({"donor": "free text"}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    let mut source = VecSource::upserts(vec![record(
        &sample,
        "s2",
        json!({"donor": "rookery://donor/d1"}),
    )]);
    let error = writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::SchemaConflict { .. }));

    test.drop().await;
}

#[tokio::test]
async fn test_drop_record_type_honors_inbound_relations() {
    let Some(test) = test_collection().await else { return };
    let donor = record_type("donor");
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    let mut source = VecSource::upserts(vec![record(&donor, "d1", json!({}))]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();
    let mut source = VecSource::upserts(vec![record(
        &sample,
        "s1",
        json!({"donor": "rookery://donor/d1", "donors": ["rookery://donor/d1"]}),
    )]);
    writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap();

    // donor is a relation target: it cannot be dropped first
    let mut tx = test.store.begin_write().await.unwrap();
    let error = test
        .store
        .delete_record_type(&mut tx, test.collection, &donor)
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::ReferencedByRelation(_)));
    drop(tx);

    // dropping the referencing type takes its join table with it
    let mut tx = test.store.begin_write().await.unwrap();
    test.store
        .delete_record_type(&mut tx, test.collection, &sample)
        .await
        .unwrap();
    test.store
        .delete_record_type(&mut tx, test.collection, &donor)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut conn = test.store.pool().acquire().await.unwrap();
    assert!(test
        .store
        .list_tables(&mut conn, test.collection)
        .await
        .unwrap()
        .is_empty());

    drop(conn);
    test.drop().await;
}

#[tokio::test]
async fn test_reserved_attribute_names_are_rejected() {
    let Some(test) = test_collection().await else { return };
    let sample = record_type("sample");
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);

    let mut source =
        VecSource::upserts(vec![record(&sample, "s1", json!({"sys_hidden": 1}))]);
    let error = writer
        .write_stream(&mut source, test.collection, None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::InvalidName { .. }));

    test.drop().await;
}
