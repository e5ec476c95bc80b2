//! Allow-listed INSERT and partial UPDATE construction.
//!
//! Every writable resource declares its columns as a static slice of
//! [`Field`]s. Request bodies are JSON objects; each key must name a field
//! in that slice, and each value is checked against the field's
//! [`ColumnKind`] before it becomes a bound [`SqlValue`]. Table and column
//! names in the generated SQL only ever come from the static slices, never
//! from request keys.
//!
//! Two rules hold for every update:
//!
//! - an empty patch is rejected with [`PatchError::NoFields`] before any
//!   SQL is produced;
//! - the statement always refreshes `updated_at`.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Storage representation of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    /// `YYYY-MM-DD`, stored as text.
    Date,
    /// `HH:MM[:SS]`, stored as `HH:MM:SS` text.
    Time,
    Boolean,
    /// JSON array of strings, stored as JSON text.
    TextList,
    /// Arbitrary JSON document, stored as JSON text.
    Json,
}

/// One allow-listed request key and the column it maps to.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    /// Key accepted in request bodies and emitted in responses.
    pub name: &'static str,
    /// Column written in SQL.
    pub column: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
    /// Inclusive numeric range for integer and real fields.
    pub bounds: Option<(f64, f64)>,
}

impl Field {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            column: name,
            kind,
            required: false,
            bounds: None,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub const fn real(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Real)
    }

    pub const fn text(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub const fn date(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Date)
    }

    pub const fn time(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Time)
    }

    pub const fn boolean(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Boolean)
    }

    pub const fn text_list(name: &'static str) -> Self {
        Self::new(name, ColumnKind::TextList)
    }

    pub const fn json(name: &'static str) -> Self {
        Self::new(name, ColumnKind::Json)
    }

    /// Store under a column name different from the request key.
    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn bounded(mut self, min: f64, max: f64) -> Self {
        self.bounds = Some((min, max));
        self
    }

    pub const fn non_negative(self) -> Self {
        self.bounded(0.0, f64::MAX)
    }
}

/// A value ready to be bound to a positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

/// Reasons a request body cannot become a statement.
#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("no fields to update")]
    NoFields,

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{0}' is required")]
    MissingField(&'static str),

    #[error("field '{field}' {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("request body must be a JSON object")]
    NotAnObject,
}

/// A parameterized statement and its values in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<SqlValue>,
}

/// Identifies the row an update targets.
///
/// When `airport_id` is set the update only matches rows of that airport,
/// so a tenant can never touch another airport's row by id.
#[derive(Debug, Clone, Copy)]
pub struct RowKey {
    pub id: i64,
    pub airport_id: Option<i64>,
}

/// Look up an allow-listed field by request key.
pub fn find_field<'a>(fields: &'a [Field], name: &str) -> Option<&'a Field> {
    fields.iter().find(|f| f.name == name)
}

/// Borrow a request body as a JSON object.
pub fn as_object(body: &Value) -> Result<&Map<String, Value>, PatchError> {
    body.as_object().ok_or(PatchError::NotAnObject)
}

/// Timestamp text written to `created_at` / `updated_at`.
pub fn timestamp_text(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn timestamp(now: DateTime<Utc>) -> SqlValue {
    SqlValue::Text(timestamp_text(now))
}

/// Validate one JSON value against a field and convert it for binding.
pub fn encode_value(field: &Field, value: &Value) -> Result<SqlValue, PatchError> {
    let invalid = |reason: &str| PatchError::InvalidValue {
        field: field.name,
        reason: reason.to_string(),
    };

    if value.is_null() {
        return if field.required {
            Err(PatchError::MissingField(field.name))
        } else {
            Ok(SqlValue::Null)
        };
    }

    let encoded = match field.kind {
        ColumnKind::Integer => {
            let n = value
                .as_i64()
                .or_else(|| {
                    value
                        .as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .ok_or_else(|| invalid("must be an integer"))?;
            check_bounds(field, n as f64)?;
            SqlValue::Integer(n)
        }
        ColumnKind::Real => {
            let n = value
                .as_f64()
                .filter(|f| f.is_finite())
                .ok_or_else(|| invalid("must be a number"))?;
            check_bounds(field, n)?;
            SqlValue::Real(n)
        }
        ColumnKind::Text => {
            let s = value.as_str().ok_or_else(|| invalid("must be a string"))?;
            if field.required && s.trim().is_empty() {
                return Err(invalid("must not be empty"));
            }
            SqlValue::Text(s.to_string())
        }
        ColumnKind::Date => {
            let s = value.as_str().ok_or_else(|| invalid("must be a date"))?;
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| invalid("must be a date in YYYY-MM-DD format"))?;
            SqlValue::Text(date.format("%Y-%m-%d").to_string())
        }
        ColumnKind::Time => {
            let s = value.as_str().ok_or_else(|| invalid("must be a time"))?;
            let time = NaiveTime::parse_from_str(s, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                .map_err(|_| invalid("must be a time in HH:MM format"))?;
            SqlValue::Text(time.format("%H:%M:%S").to_string())
        }
        ColumnKind::Boolean => {
            SqlValue::Bool(value.as_bool().ok_or_else(|| invalid("must be a boolean"))?)
        }
        ColumnKind::TextList => {
            let items = value
                .as_array()
                .ok_or_else(|| invalid("must be a list of strings"))?;
            if !items.iter().all(Value::is_string) {
                return Err(invalid("must be a list of strings"));
            }
            SqlValue::Text(value.to_string())
        }
        ColumnKind::Json => {
            if !(value.is_object() || value.is_array()) {
                return Err(invalid("must be an object or a list"));
            }
            SqlValue::Text(value.to_string())
        }
    };

    Ok(encoded)
}

fn check_bounds(field: &Field, n: f64) -> Result<(), PatchError> {
    match field.bounds {
        Some((min, max)) if n < min || n > max => {
            let reason = if max == f64::MAX {
                format!("must be at least {min}")
            } else {
                format!("must be between {min} and {max}")
            };
            Err(PatchError::InvalidValue {
                field: field.name,
                reason,
            })
        }
        _ => Ok(()),
    }
}

/// Encode every key of `body` in allow-list order, rejecting unknown keys.
fn encode_body(
    fields: &'static [Field],
    body: &Map<String, Value>,
) -> Result<Vec<(&'static Field, SqlValue)>, PatchError> {
    if let Some(unknown) = body.keys().find(|k| find_field(fields, k).is_none()) {
        return Err(PatchError::UnknownField(unknown.clone()));
    }

    fields
        .iter()
        .filter_map(|field| body.get(field.name).map(|v| (field, v)))
        .map(|(field, value)| -> Result<_, PatchError> {
            Ok((field, encode_value(field, value)?))
        })
        .collect()
}

/// Build an INSERT for a new row.
///
/// `extra` carries server-assigned columns (for example `airport_id`) that
/// are not part of the allow-list. `created_at` and `updated_at` are always
/// set to `now`.
pub fn build_insert(
    table: &'static str,
    fields: &'static [Field],
    body: &Map<String, Value>,
    extra: &[(&'static str, SqlValue)],
    now: DateTime<Utc>,
) -> Result<Statement, PatchError> {
    if let Some(missing) = fields
        .iter()
        .find(|f| f.required && body.get(f.name).is_none_or(Value::is_null))
    {
        return Err(PatchError::MissingField(missing.name));
    }

    let encoded = encode_body(fields, body)?;

    let mut columns: Vec<&str> = extra.iter().map(|(c, _)| *c).collect();
    let mut values: Vec<SqlValue> = extra.iter().map(|(_, v)| v.clone()).collect();
    for (field, value) in encoded {
        columns.push(field.column);
        values.push(value);
    }
    columns.extend(["created_at", "updated_at"]);
    values.push(timestamp(now));
    values.push(timestamp(now));

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );

    Ok(Statement { sql, values })
}

/// Build `UPDATE table SET c1 = ?, ..., updated_at = ? WHERE id = ?`.
pub fn build_update(
    table: &'static str,
    fields: &'static [Field],
    patch: &Map<String, Value>,
    key: RowKey,
    now: DateTime<Utc>,
) -> Result<Statement, PatchError> {
    let encoded = encode_body(fields, patch)?;
    if encoded.is_empty() {
        return Err(PatchError::NoFields);
    }

    let mut assignments = Vec::with_capacity(encoded.len() + 1);
    let mut values = Vec::with_capacity(encoded.len() + 3);
    for (field, value) in encoded {
        assignments.push(format!("{} = ?", field.column));
        values.push(value);
    }
    assignments.push("updated_at = ?".to_string());
    values.push(timestamp(now));

    let mut sql = format!(
        "UPDATE {table} SET {} WHERE id = ?",
        assignments.join(", ")
    );
    values.push(SqlValue::Integer(key.id));

    if let Some(airport_id) = key.airport_id {
        sql.push_str(" AND airport_id = ?");
        values.push(SqlValue::Integer(airport_id));
    }

    Ok(Statement { sql, values })
}
