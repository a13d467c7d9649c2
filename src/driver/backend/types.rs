//! Column type mapping for the sqlx backend.
//!
//! Decoding is two-phase: [`categorize_type`] classifies the column's type
//! name, then a database-specific decoder extracts a [`Value`] for that
//! category, falling back through wider types when the narrow one does not
//! match.

use super::DatabaseType;
use crate::models::Value;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use tracing::debug;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// DECIMAL/NUMERIC read as its exact textual representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Conversion of a driver row into positional [`Value`]s.
pub trait RowToValues {
    fn column_names(&self) -> Vec<String>;
    fn to_values(&self) -> Vec<Value>;
}

impl RowToValues for MySqlRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_values(&self) -> Vec<Value> {
        (0..self.len())
            .map(|idx| {
                if is_null(self, idx) {
                    return Value::Null;
                }
                let type_name = self.column(idx).type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySql);
                mysql::decode_column(self, idx, category).unwrap_or_else(|| undecodable(idx, type_name))
            })
            .collect()
    }
}

impl RowToValues for PgRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_values(&self) -> Vec<Value> {
        (0..self.len())
            .map(|idx| {
                if is_null(self, idx) {
                    return Value::Null;
                }
                let type_name = self.column(idx).type_info().name();
                let category = categorize_type(type_name, DatabaseType::Postgres);
                postgres::decode_column(self, idx, category)
                    .unwrap_or_else(|| undecodable(idx, type_name))
            })
            .collect()
    }
}

impl RowToValues for SqliteRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_values(&self) -> Vec<Value> {
        (0..self.len())
            .map(|idx| {
                if is_null(self, idx) {
                    return Value::Null;
                }
                let type_name = self.column(idx).type_info().name();
                let category = categorize_type(type_name, DatabaseType::SQLite);
                sqlite::decode_column(self, idx, category).unwrap_or_else(|| undecodable(idx, type_name))
            })
            .collect()
    }
}

fn is_null<R: Row>(row: &R, idx: usize) -> bool
where
    usize: sqlx::ColumnIndex<R>,
{
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

fn undecodable(idx: usize, type_name: &str) -> Value {
    debug!(column = idx, type_name, "No decoder for column type, returning NULL");
    Value::Null
}

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> Option<Value> {
        match category {
            TypeCategory::Decimal => row.try_get::<RawDecimal, _>(idx).ok().map(|d| Value::Text(d.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(Value::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_bytes(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<Value> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(Value::Int(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<u64, _>(idx) {
            // Values above i64::MAX keep their digits as text
            return Some(i64::try_from(v).map(Value::Int).unwrap_or_else(|_| Value::Text(v.to_string())));
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        row.try_get::<u8, _>(idx).ok().map(|v| Value::Int(v.into()))
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Option<Value> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(Value::Float(v));
        }
        row.try_get::<f32, _>(idx).ok().map(|v| Value::Float(v.into()))
    }

    fn decode_bytes(row: &MySqlRow, idx: usize) -> Option<Value> {
        row.try_get::<Vec<u8>, _>(idx).ok().map(Value::Bytes)
    }

    fn decode_text(row: &MySqlRow, idx: usize) -> Option<Value> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Some(Value::Text(v));
        }
        decode_bytes(row, idx)
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> Option<Value> {
        match category {
            TypeCategory::Decimal => row.try_get::<RawDecimal, _>(idx).ok().map(|d| Value::Text(d.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(Value::Bool),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(Value::Bytes),
            _ => row.try_get::<String, _>(idx).ok().map(Value::Text),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<Value> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(Value::Int(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(Value::Int(v.into()));
        }
        row.try_get::<i16, _>(idx).ok().map(|v| Value::Int(v.into()))
    }

    fn decode_float(row: &PgRow, idx: usize) -> Option<Value> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Some(Value::Float(v));
        }
        row.try_get::<f32, _>(idx).ok().map(|v| Value::Float(v.into()))
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> Option<Value> {
        match category {
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(Value::Bool),
            TypeCategory::Float | TypeCategory::Decimal => decode_float(row, idx),
            TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(Value::Bytes),
            TypeCategory::Text => row.try_get::<String, _>(idx).ok().map(Value::Text),
            // Dynamically typed: try each storage class in turn
            TypeCategory::Unknown => decode_integer(row, idx)
                .or_else(|| decode_float(row, idx))
                .or_else(|| row.try_get::<String, _>(idx).ok().map(Value::Text))
                .or_else(|| row.try_get::<Vec<u8>, _>(idx).ok().map(Value::Bytes)),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize) -> Option<Value> {
        row.try_get::<i64, _>(idx).ok().map(Value::Int)
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> Option<Value> {
        row.try_get::<f64, _>(idx).ok().map(Value::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::MySql),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::Postgres),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", DatabaseType::Postgres),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DatabaseType::MySql),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("numeric", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_text_and_unknown() {
        assert_eq!(
            categorize_type("VARCHAR", DatabaseType::MySql),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("NULL", DatabaseType::SQLite),
            TypeCategory::Unknown
        );
        assert_eq!(
            categorize_type("BYTEA", DatabaseType::Postgres),
            TypeCategory::Binary
        );
    }
}
