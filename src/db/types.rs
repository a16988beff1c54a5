//! Row decoding into JSON records.
//!
//! Decoding is two-phase: `categorize_type` classifies the declared column
//! type, then a per-backend decoder extracts the value. Columns whose type
//! the driver cannot name (SQLite expressions, for instance) are decoded
//! with each scalar type in turn.

use crate::models::{BackendKind, Record};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Timestamp,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, kind: BackendKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores floats
        if kind == BackendKind::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if lower.starts_with("timestamp") || lower == "datetime" || lower == "date" {
        return TypeCategory::Timestamp;
    }
    if lower.contains("char") || lower.contains("text") || lower == "uuid" || lower == "name" {
        return TypeCategory::Text;
    }
    TypeCategory::Unknown
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
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

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Trait for converting database rows to records.
pub trait RowToRecord {
    fn to_record(&self) -> Record;
}

/// Try each listed type in order, returning the first that decodes.
macro_rules! first_decoded {
    ($row:expr, $idx:expr, $($ty:ty => $map:expr),+ $(,)?) => {{
        let mut value = None;
        $(
            if value.is_none() {
                if let Ok(v) = $row.try_get::<Option<$ty>, _>($idx) {
                    value = Some(v.map($map).unwrap_or(JsonValue::Null));
                }
            }
        )+
        value.unwrap_or(JsonValue::Null)
    }};
}

impl RowToRecord for PgRow {
    fn to_record(&self) -> Record {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), BackendKind::PostgreSQL);
                let value = match category {
                    TypeCategory::Integer => first_decoded!(self, idx,
                        i64 => JsonValue::from,
                        i32 => JsonValue::from,
                        i16 => JsonValue::from,
                    ),
                    TypeCategory::Float => first_decoded!(self, idx,
                        f64 => float_value,
                        f32 => |v: f32| float_value(v as f64),
                    ),
                    TypeCategory::Decimal => {
                        first_decoded!(self, idx, RawDecimal => |v: RawDecimal| JsonValue::String(v.0))
                    }
                    TypeCategory::Boolean => first_decoded!(self, idx, bool => JsonValue::Bool),
                    TypeCategory::Binary => {
                        first_decoded!(self, idx, Vec<u8> => |v: Vec<u8>| JsonValue::String(STANDARD.encode(v)))
                    }
                    TypeCategory::Json => first_decoded!(self, idx, JsonValue => |v| v),
                    TypeCategory::Timestamp => first_decoded!(self, idx,
                        chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| JsonValue::String(v.to_rfc3339()),
                        chrono::NaiveDateTime => |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()),
                        chrono::NaiveDate => |v: chrono::NaiveDate| JsonValue::String(v.to_string()),
                    ),
                    TypeCategory::Text | TypeCategory::Unknown => {
                        first_decoded!(self, idx, String => JsonValue::String)
                    }
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToRecord for MySqlRow {
    fn to_record(&self) -> Record {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let value = match categorize_type(type_name, BackendKind::MySQL) {
                    TypeCategory::Integer => first_decoded!(self, idx,
                        i64 => JsonValue::from,
                        i32 => JsonValue::from,
                        i16 => JsonValue::from,
                        i8 => JsonValue::from,
                        u64 => JsonValue::from,
                        u32 => JsonValue::from,
                        u16 => JsonValue::from,
                        u8 => JsonValue::from,
                        bool => JsonValue::Bool,
                    ),
                    TypeCategory::Float => first_decoded!(self, idx,
                        f64 => float_value,
                        f32 => |v: f32| float_value(v as f64),
                    ),
                    TypeCategory::Decimal => {
                        first_decoded!(self, idx, RawDecimal => |v: RawDecimal| JsonValue::String(v.0))
                    }
                    TypeCategory::Boolean => first_decoded!(self, idx, bool => JsonValue::Bool),
                    TypeCategory::Binary => first_decoded!(self, idx,
                        String => JsonValue::String,
                        Vec<u8> => |v: Vec<u8>| JsonValue::String(STANDARD.encode(v)),
                    ),
                    TypeCategory::Json => first_decoded!(self, idx, JsonValue => |v| v),
                    TypeCategory::Timestamp => first_decoded!(self, idx,
                        chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| JsonValue::String(v.to_rfc3339()),
                        chrono::NaiveDateTime => |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()),
                        chrono::NaiveDate => |v: chrono::NaiveDate| JsonValue::String(v.to_string()),
                    ),
                    TypeCategory::Text | TypeCategory::Unknown => first_decoded!(self, idx,
                        String => JsonValue::String,
                        Vec<u8> => |v: Vec<u8>| JsonValue::String(String::from_utf8_lossy(&v).into_owned()),
                    ),
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToRecord for SqliteRow {
    fn to_record(&self) -> Record {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let value = match categorize_type(type_name, BackendKind::SQLite) {
                    TypeCategory::Integer => first_decoded!(self, idx, i64 => JsonValue::from),
                    TypeCategory::Float | TypeCategory::Decimal => {
                        first_decoded!(self, idx, f64 => float_value)
                    }
                    TypeCategory::Boolean => first_decoded!(self, idx, bool => JsonValue::Bool),
                    TypeCategory::Binary => {
                        first_decoded!(self, idx, Vec<u8> => |v: Vec<u8>| JsonValue::String(STANDARD.encode(v)))
                    }
                    TypeCategory::Json => first_decoded!(self, idx,
                        String => |v: String| serde_json::from_str(&v).unwrap_or(JsonValue::String(v)),
                    ),
                    // Untyped expression columns: try each storage class
                    TypeCategory::Timestamp | TypeCategory::Text | TypeCategory::Unknown => {
                        first_decoded!(self, idx,
                            String => JsonValue::String,
                            i64 => JsonValue::from,
                            f64 => float_value,
                            Vec<u8> => |v: Vec<u8>| JsonValue::String(STANDARD.encode(v)),
                        )
                    }
                };
                (col.name().to_string(), value)
            })
            .collect()
    }
}
