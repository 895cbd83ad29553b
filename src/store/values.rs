use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::data_types::ColumnType;
use crate::inference::{infer_type, is_valid_boolean, is_valid_date, is_valid_date_time};
use crate::relations;
use crate::store::{Result, StoreError};

/// A record attribute value coerced to the bind type of its committed
/// column. Nulls stay typed so Postgres can infer the parameter type.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SqlValue {
    Text(Option<String>),
    Long(Option<i64>),
    Double(Option<f64>),
    Bool(Option<bool>),
    Date(Option<NaiveDate>),
    DateTime(Option<NaiveDateTime>),
    Json(Option<Value>),
}

/// Coerce one attribute value to its committed column type, or fail with a
/// `TypeMismatch` naming the record, the attribute and both types.
pub(crate) fn to_sql_value(
    value: Option<&Value>,
    column_type: ColumnType,
    record_id: &str,
    attribute: &str,
) -> Result<SqlValue> {
    let mismatch = |value: &Value| StoreError::TypeMismatch {
        record_id: record_id.to_string(),
        attribute: attribute.to_string(),
        expected: column_type,
        actual: infer_type(value),
    };

    let value = match value {
        None | Some(Value::Null) => return Ok(null_of(column_type)),
        Some(value) => value,
    };

    let coerced = match column_type {
        ColumnType::Long => match value {
            Value::Number(n) if n.is_i64() => n.as_i64().map(SqlValue::long),
            Value::String(s) => s.parse::<i64>().ok().map(SqlValue::long),
            _ => None,
        },
        ColumnType::Double => match value {
            Value::Number(n) => n.as_f64().map(SqlValue::double),
            Value::String(s) => s.parse::<f64>().ok().map(SqlValue::double),
            _ => None,
        },
        ColumnType::Boolean => match value {
            Value::Bool(b) => Some(SqlValue::Bool(Some(*b))),
            Value::String(s) if is_valid_boolean(s) => {
                Some(SqlValue::Bool(Some(s.eq_ignore_ascii_case("true"))))
            }
            _ => None,
        },
        ColumnType::Date => match value {
            Value::String(s) if is_valid_date(s) => {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(|d| SqlValue::Date(Some(d)))
            }
            _ => None,
        },
        ColumnType::DateTime => match value {
            Value::String(s) if is_valid_date_time(s) => {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|ts| SqlValue::DateTime(Some(ts)))
            }
            _ => None,
        },
        ColumnType::Json => Some(SqlValue::Json(Some(value.clone()))),
        ColumnType::Relation => match value {
            Value::String(s) => relations::decode(s)
                .ok()
                .map(|(_, record_id)| SqlValue::Text(Some(record_id))),
            _ => None,
        },
        ColumnType::String => Some(SqlValue::Text(Some(match value {
            Value::String(s) => s.clone(),
            // numbers, booleans, containers: store their JSON text
            other => other.to_string(),
        }))),
        // relation arrays have no inline column; handled via join tables
        ColumnType::RelationArray => {
            return Err(mismatch(value));
        }
    };

    coerced.ok_or_else(|| mismatch(value))
}

fn null_of(column_type: ColumnType) -> SqlValue {
    match column_type {
        ColumnType::Long => SqlValue::Long(None),
        ColumnType::Double => SqlValue::Double(None),
        ColumnType::Boolean => SqlValue::Bool(None),
        ColumnType::Date => SqlValue::Date(None),
        ColumnType::DateTime => SqlValue::DateTime(None),
        ColumnType::Json => SqlValue::Json(None),
        ColumnType::String | ColumnType::Relation | ColumnType::RelationArray => {
            SqlValue::Text(None)
        }
    }
}

impl SqlValue {
    fn long(v: i64) -> Self {
        SqlValue::Long(Some(v))
    }

    fn double(v: f64) -> Self {
        SqlValue::Double(Some(v))
    }
}
