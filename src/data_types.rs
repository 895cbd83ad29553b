use std::fmt;

/// Inferred type of a record-type column.
///
/// The scalar part of the lattice maps 1:1 onto a Postgres column type;
/// `Relation` is stored as a `text` column carrying a foreign key, and
/// `RelationArray` has no inline column at all (its values live in a join
/// table keyed by `(from_id, to_id)`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnType {
    Long,
    Double,
    Boolean,
    Date,
    DateTime,
    Json,
    String,
    Relation,
    RelationArray,
}

impl ColumnType {
    /// The Postgres type used for the inline column, or `None` for types
    /// that are not stored inline.
    pub fn postgres_type(&self) -> Option<&'static str> {
        match self {
            ColumnType::Long => Some("bigint"),
            ColumnType::Double => Some("double precision"),
            ColumnType::Boolean => Some("boolean"),
            ColumnType::Date => Some("date"),
            ColumnType::DateTime => Some("timestamp"),
            ColumnType::Json => Some("jsonb"),
            ColumnType::String | ColumnType::Relation => Some("text"),
            ColumnType::RelationArray => None,
        }
    }

    /// Map a type name as reported by `udt_name::regtype` back onto the
    /// lattice. Foreign-key metadata is needed to tell a `Relation` column
    /// apart from a plain `String` one, so this only ever returns the
    /// scalar types.
    pub fn from_postgres_type(pg_type: &str) -> Option<Self> {
        match pg_type {
            "bigint" => Some(ColumnType::Long),
            "double precision" => Some(ColumnType::Double),
            "boolean" => Some(ColumnType::Boolean),
            "date" => Some(ColumnType::Date),
            "timestamp without time zone" | "timestamp" => Some(ColumnType::DateTime),
            "jsonb" => Some(ColumnType::Json),
            "text" => Some(ColumnType::String),
            _ => None,
        }
    }

    /// Relation and relation-array columns can never be retyped.
    pub fn is_relation_kind(&self) -> bool {
        matches!(self, ColumnType::Relation | ColumnType::RelationArray)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Long => "LONG",
            ColumnType::Double => "DOUBLE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATE",
            ColumnType::DateTime => "DATETIME",
            ColumnType::Json => "JSON",
            ColumnType::String => "STRING",
            ColumnType::Relation => "RELATION",
            ColumnType::RelationArray => "RELATION_ARRAY",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ColumnType;

    #[test]
    fn test_postgres_type_round_trip() {
        for column_type in [
            ColumnType::Long,
            ColumnType::Double,
            ColumnType::Boolean,
            ColumnType::Date,
            ColumnType::DateTime,
            ColumnType::Json,
            ColumnType::String,
        ] {
            let pg = column_type.postgres_type().unwrap();
            assert_eq!(ColumnType::from_postgres_type(pg), Some(column_type));
        }
    }

    #[test]
    fn test_relation_array_has_no_inline_column() {
        assert_eq!(ColumnType::RelationArray.postgres_type(), None);
    }
}
