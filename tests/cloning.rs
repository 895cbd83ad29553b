use serial_test::serial;
use serde_json::json;

use rookery::clone::CloneEngine;
use rookery::pipeline::BatchWriter;
use rookery::source::VecSource;
use rookery::store::{RecordStore, StoreError};
use rookery::model::CollectionId;

use crate::{random_collection, record, record_type, test_collection, BATCH_SIZE};

/// Populate a collection with a relation chain a → b → c plus a relation
/// array, exercising every part of the clone ordering.
async fn populate_chain(store: &RecordStore, collection: CollectionId) {
    let writer = BatchWriter::new(store, BATCH_SIZE);
    let c = record_type("c");
    let b = record_type("b");
    let a = record_type("a");

    let mut source = VecSource::upserts(vec![
        record(&c, "c1", json!({"x": 1})),
        record(&c, "c2", json!({"x": 2})),
    ]);
    writer.write_stream(&mut source, collection, None, None).await.unwrap();

    let mut source = VecSource::upserts(vec![record(&b, "b1", json!({"c": "rookery://c/c1"}))]);
    writer.write_stream(&mut source, collection, None, None).await.unwrap();

    let mut source = VecSource::upserts(vec![record(
        &a,
        "a1",
        json!({
            "b": "rookery://b/b1",
            "cs": ["rookery://c/c1", "rookery://c/c2"]
        }),
    )]);
    writer.write_stream(&mut source, collection, None, None).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_clone_copies_schema_and_data_in_dependency_order() {
    let Some(test) = test_collection().await else { return };
    populate_chain(&test.store, test.collection).await;
    let target = CollectionId::random();

    let result = CloneEngine::new(&test.store)
        .clone_collection(test.collection, target)
        .await
        .unwrap();

    // all four tables arrived: a, b, c and a's join table
    assert_eq!(result.tables.len(), 4);

    let mut conn = test.store.pool().acquire().await.unwrap();
    for name in ["a", "b", "c"] {
        let table = record_type(name);

        let source_schema = test
            .store
            .table_schema(&mut conn, test.collection, &table)
            .await
            .unwrap();
        let target_schema = test
            .store
            .table_schema(&mut conn, target, &table)
            .await
            .unwrap();
        assert_eq!(source_schema, target_schema, "schema mismatch for {name}");

        let source_count = test
            .store
            .count_records(&mut conn, test.collection, &table)
            .await
            .unwrap();
        let target_count = test
            .store
            .count_records(&mut conn, target, &table)
            .await
            .unwrap();
        assert_eq!(source_count, target_count, "row count mismatch for {name}");
        assert_eq!(result.tables[name], source_count as u64);

        // relation and foreign-key definitions came along
        let source_relations = test
            .store
            .relation_cols(&mut conn, test.collection, &table)
            .await
            .unwrap();
        let target_relations = test
            .store
            .relation_cols(&mut conn, target, &table)
            .await
            .unwrap();
        assert_eq!(source_relations, target_relations);
    }

    // the join table came over with its edges
    let a = record_type("a");
    assert_eq!(
        test.store
            .join_edges(&mut conn, target, &a, "cs")
            .await
            .unwrap(),
        vec![
            ("a1".to_string(), "c1".to_string()),
            ("a1".to_string(), "c2".to_string()),
        ]
    );
    let target_arrays = test
        .store
        .relation_array_cols(&mut conn, target, &a)
        .await
        .unwrap();
    assert_eq!(target_arrays.len(), 1);
    assert_eq!(target_arrays[0].column, "cs");
    assert_eq!(target_arrays[0].target, record_type("c"));

    // target foreign keys enforce: a clone is a fully working collection
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);
    let mut source = VecSource::upserts(vec![record(
        &record_type("b"),
        "b2",
        json!({"c": "rookery://c/no-such-c"}),
    )]);
    let error = writer
        .write_stream(&mut source, target, None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::ReferentialIntegrity(_)));

    drop(conn);

    let mut tx = test.store.begin_write().await.unwrap();
    test.store.drop_collection(&mut tx, target).await.unwrap();
    tx.commit().await.unwrap();
    test.drop().await;
}

#[tokio::test]
#[serial]
async fn test_clone_into_non_empty_target_fails_without_changes() {
    let Some(test) = test_collection().await else { return };
    populate_chain(&test.store, test.collection).await;

    // the target already has a record type with one row
    let target = random_collection(&test.store).await;
    let writer = BatchWriter::new(&test.store, BATCH_SIZE);
    let existing = record_type("existing");
    let mut source = VecSource::upserts(vec![record(&existing, "e1", json!({"x": 1}))]);
    writer.write_stream(&mut source, target, None, None).await.unwrap();

    let error = CloneEngine::new(&test.store)
        .clone_collection(test.collection, target)
        .await
        .unwrap_err();
    assert!(
        matches!(error, StoreError::CloneTargetNotEmpty { collection } if collection == target)
    );

    // prior contents are untouched
    let mut conn = test.store.pool().acquire().await.unwrap();
    assert_eq!(
        test.store.list_tables(&mut conn, target).await.unwrap(),
        vec!["existing".to_string()]
    );
    assert_eq!(
        test.store
            .count_records(&mut conn, target, &existing)
            .await
            .unwrap(),
        1
    );

    drop(conn);

    let mut tx = test.store.begin_write().await.unwrap();
    test.store.drop_collection(&mut tx, target).await.unwrap();
    tx.commit().await.unwrap();
    test.drop().await;
}

#[tokio::test]
#[serial]
async fn test_clone_of_empty_collection() {
    let Some(test) = test_collection().await else { return };
    let target = CollectionId::random();

    let result = CloneEngine::new(&test.store)
        .clone_collection(test.collection, target)
        .await
        .unwrap();
    assert!(result.tables.is_empty());

    let mut conn = test.store.pool().acquire().await.unwrap();
    assert!(test
        .store
        .collection_exists(&mut conn, target)
        .await
        .unwrap());
    drop(conn);

    let mut tx = test.store.begin_write().await.unwrap();
    test.store.drop_collection(&mut tx, target).await.unwrap();
    tx.commit().await.unwrap();
    test.drop().await;
}
