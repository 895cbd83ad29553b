use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::data_types::ColumnType;
use crate::model::Record;
use crate::relations;
use crate::schema::TableSchema;

/// Infer the column type for a single attribute value.
///
/// Order matters: we want the most specific type. "1234" is valid JSON but
/// is inferred as a LONG; "true" is both a string and valid JSON but is
/// inferred as a BOOLEAN. A null tells us nothing, so it gets the widest
/// type and lets non-null values in the batch decide.
pub fn infer_type(value: &Value) -> ColumnType {
    match value {
        Value::Null => ColumnType::String,
        Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Long,
        Value::Number(_) => ColumnType::Double,
        Value::Bool(_) => ColumnType::Boolean,
        Value::String(s) if relations::is_relation(s) => ColumnType::Relation,
        Value::String(s) => infer_string_type(s),
        Value::Array(items)
            if !items.is_empty() && items.iter().all(relations::is_relation_value) =>
        {
            ColumnType::RelationArray
        }
        Value::Array(_) | Value::Object(_) => ColumnType::Json,
    }
}

fn infer_string_type(s: &str) -> ColumnType {
    if s.parse::<i64>().is_ok() {
        return ColumnType::Long;
    }
    if s.parse::<f64>().is_ok() {
        return ColumnType::Double;
    }
    if is_valid_date(s) {
        return ColumnType::Date;
    }
    if is_valid_date_time(s) {
        return ColumnType::DateTime;
    }
    if is_valid_boolean(s) {
        return ColumnType::Boolean;
    }
    if is_json_container(s) {
        return ColumnType::Json;
    }
    ColumnType::String
}

pub fn is_valid_boolean(s: &str) -> bool {
    s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false")
}

pub fn is_valid_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

pub fn is_valid_date_time(s: &str) -> bool {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

fn is_json_container(s: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(s),
        Ok(Value::Array(_)) | Ok(Value::Object(_))
    )
}

/// Widen `existing` to also represent `incoming`. Identical types are
/// unchanged; LONG and DOUBLE widen to DOUBLE; any other differing pair
/// demotes to STRING. Commutative and idempotent.
pub fn select_best_type(existing: ColumnType, incoming: ColumnType) -> ColumnType {
    if existing == incoming {
        return existing;
    }
    match (existing, incoming) {
        (ColumnType::Long, ColumnType::Double) | (ColumnType::Double, ColumnType::Long) => {
            ColumnType::Double
        }
        _ => ColumnType::String,
    }
}

/// Infer one schema for a batch of records of a single record type:
/// per-attribute `infer_type`, folded with `select_best_type` across the
/// batch. A null carries no type information, so it never participates in
/// the fold; an attribute that is null in every record gets STRING. The
/// primary-key attribute is excluded; it is system-typed.
pub fn infer_types(records: &[Record], primary_key: &str) -> TableSchema {
    let mut result = TableSchema::new();
    let mut null_only = std::collections::BTreeSet::new();

    for record in records {
        for (attribute, value) in &record.attributes {
            if attribute == primary_key {
                continue;
            }
            if value.is_null() {
                null_only.insert(attribute.clone());
                continue;
            }
            let inferred = infer_type(value);
            result
                .entry(attribute.clone())
                .and_modify(|existing| *existing = select_best_type(*existing, inferred))
                .or_insert(inferred);
        }
    }
    for attribute in null_only {
        result.entry(attribute).or_insert(ColumnType::String);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::model::RecordType;

    const ALL_TYPES: [ColumnType; 9] = [
        ColumnType::Long,
        ColumnType::Double,
        ColumnType::Boolean,
        ColumnType::Date,
        ColumnType::DateTime,
        ColumnType::Json,
        ColumnType::String,
        ColumnType::Relation,
        ColumnType::RelationArray,
    ];

    #[rstest]
    #[case(json!(null), ColumnType::String)]
    #[case(json!(1234), ColumnType::Long)]
    #[case(json!(-7), ColumnType::Long)]
    #[case(json!(12.5), ColumnType::Double)]
    #[case(json!(true), ColumnType::Boolean)]
    #[case(json!("1234"), ColumnType::Long)]
    #[case(json!("12.5"), ColumnType::Double)]
    #[case(json!("true"), ColumnType::Boolean)]
    #[case(json!("FALSE"), ColumnType::Boolean)]
    #[case(json!("2024-01-01"), ColumnType::Date)]
    #[case(json!("2024-01-01T10:30:00"), ColumnType::DateTime)]
    #[case(json!("2024-01-01T10:30:00.123"), ColumnType::DateTime)]
    #[case(json!("hello"), ColumnType::String)]
    #[case(json!("2024-13-01"), ColumnType::String)]
    #[case(json!(r#"{"a": 1}"#), ColumnType::Json)]
    #[case(json!("[1, 2, 3]"), ColumnType::Json)]
    #[case(json!({"a": 1}), ColumnType::Json)]
    #[case(json!([1, 2, 3]), ColumnType::Json)]
    #[case(json!("rookery://sample/s-1"), ColumnType::Relation)]
    #[case(json!(["rookery://sample/s-1"]), ColumnType::RelationArray)]
    #[case(json!(["rookery://sample/s-1", "plain"]), ColumnType::Json)]
    #[case(json!([]), ColumnType::Json)]
    fn test_infer_type(#[case] value: Value, #[case] expected: ColumnType) {
        assert_eq!(infer_type(&value), expected, "value {value}");
    }

    #[test]
    fn test_select_best_type_commutative_and_idempotent() {
        for a in ALL_TYPES {
            assert_eq!(select_best_type(a, a), a);
            for b in ALL_TYPES {
                assert_eq!(select_best_type(a, b), select_best_type(b, a));
            }
        }
    }

    #[rstest]
    #[case(ColumnType::Long, ColumnType::Double, ColumnType::Double)]
    #[case(ColumnType::Double, ColumnType::Long, ColumnType::Double)]
    #[case(ColumnType::Boolean, ColumnType::Date, ColumnType::String)]
    #[case(ColumnType::Long, ColumnType::Boolean, ColumnType::String)]
    #[case(ColumnType::Json, ColumnType::DateTime, ColumnType::String)]
    fn test_select_best_type_widening(
        #[case] existing: ColumnType,
        #[case] incoming: ColumnType,
        #[case] expected: ColumnType,
    ) {
        assert_eq!(select_best_type(existing, incoming), expected);
    }

    #[test]
    fn test_infer_types_folds_across_batch() {
        let sample = RecordType::new("sample").unwrap();
        let records = vec![
            Record::new(
                "r1",
                sample.clone(),
                BTreeMap::from([
                    ("x".to_string(), json!(10)),
                    ("flag".to_string(), json!(true)),
                    ("note".to_string(), json!(null)),
                    ("sys_id".to_string(), json!("r1")),
                ]),
            ),
            Record::new(
                "r2",
                sample,
                BTreeMap::from([
                    ("x".to_string(), json!(10.5)),
                    ("flag".to_string(), json!("2024-01-01")),
                    ("note".to_string(), json!("text")),
                ]),
            ),
        ];

        let schema = infer_types(&records, "sys_id");
        assert_eq!(schema["x"], ColumnType::Double);
        // BOOLEAN vs DATE has no safe widening: demoted to STRING
        assert_eq!(schema["flag"], ColumnType::String);
        // a first-seen null guesses STRING, which the non-null value confirms
        assert_eq!(schema["note"], ColumnType::String);
        // the primary key attribute is never inferred
        assert!(!schema.contains_key("sys_id"));
    }

    #[test]
    fn test_nulls_do_not_demote_the_batch_type() {
        let sample = RecordType::new("sample").unwrap();
        let records = vec![
            Record::new(
                "r1",
                sample.clone(),
                BTreeMap::from([
                    ("x".to_string(), json!(null)),
                    ("donor".to_string(), json!(null)),
                    ("empty".to_string(), json!(null)),
                ]),
            ),
            Record::new(
                "r2",
                sample,
                BTreeMap::from([
                    ("x".to_string(), json!(10)),
                    ("donor".to_string(), json!("rookery://donor/d1")),
                ]),
            ),
        ];

        let schema = infer_types(&records, "sys_id");
        assert_eq!(schema["x"], ColumnType::Long);
        assert_eq!(schema["donor"], ColumnType::Relation);
        // null in every record: the widest guess
        assert_eq!(schema["empty"], ColumnType::String);
    }
}
