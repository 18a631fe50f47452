// Engine-neutral values
// One cell/parameter representation shared by both engines, plus the
// uniform query outcome returned through the adapter contract.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::types::{IsNull, ToSql as PgToSql, Type as PgType};

/// Cell value in a result set, also accepted as a bind parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl PgToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &PgType,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => {
                // Narrow to the column's wire width
                if *ty == PgType::INT2 {
                    (*v as i16).to_sql(ty, out)
                } else if *ty == PgType::INT4 {
                    (*v as i32).to_sql(ty, out)
                } else if *ty == PgType::FLOAT8 {
                    (*v as f64).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Float(v) => {
                if *ty == PgType::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        // Dispatch happens per-value at bind time
        true
    }

    fn to_sql_checked(
        &self,
        ty: &PgType,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

impl rusqlite::types::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value, ValueRef};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(*v as i64)),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Float(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl SqlValue {
    /// Convert a tokio-postgres column value to SqlValue
    pub(crate) fn from_pg_row(row: &tokio_postgres::Row, idx: usize) -> Self {
        let ty = row.columns()[idx].type_().clone();

        if ty == PgType::BOOL {
            row.try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Bool)
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::INT2 {
            row.try_get::<_, Option<i16>>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Int(v as i64))
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::INT4 {
            row.try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Int(v as i64))
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::INT8 {
            row.try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Int)
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .map(|v| SqlValue::Float(v as f64))
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Float)
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|dt| SqlValue::Text(dt.to_string()))
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)
                .ok()
                .flatten()
                .map(|dt| SqlValue::Text(dt.to_rfc3339()))
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::DATE {
            row.try_get::<_, Option<NaiveDate>>(idx)
                .ok()
                .flatten()
                .map(|d| SqlValue::Text(d.to_string()))
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::TIME {
            row.try_get::<_, Option<NaiveTime>>(idx)
                .ok()
                .flatten()
                .map(|t| SqlValue::Text(t.to_string()))
                .unwrap_or(SqlValue::Null)
        } else if ty == PgType::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Bytes)
                .unwrap_or(SqlValue::Null)
        } else {
            // Default: try as string
            row.try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null)
        }
    }

    /// Convert a rusqlite cell to SqlValue
    pub(crate) fn from_sqlite_ref(value: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Int(v),
            ValueRef::Real(v) => SqlValue::Float(v),
            ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).to_string()),
            ValueRef::Blob(v) => SqlValue::Bytes(v.to_vec()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Float(v) => Some(*v),
            SqlValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Query result containing columns, rows and a command tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub row_count: u64,
    pub command: String,
}

impl QueryOutcome {
    /// Build the outcome of a row-returning statement.
    pub fn rows(columns: Vec<String>, rows: Vec<Vec<SqlValue>>, keyword: &str) -> Self {
        let count = rows.len() as u64;
        Self {
            columns,
            rows,
            row_count: count,
            command: format!("{} {}", keyword, count),
        }
    }

    /// Build the outcome of a statement that only reports affected rows.
    pub fn affected(rows_affected: u64, keyword: &str) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: rows_affected,
            command: format!("{} {}", keyword, rows_affected),
        }
    }

    /// First cell of the first row, if any.
    pub fn first_value(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|r| r.first())
    }
}

/// Leading keyword of a statement, uppercased, for command tags and routing.
pub(crate) fn leading_keyword(sql: &str) -> String {
    sql.trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}
