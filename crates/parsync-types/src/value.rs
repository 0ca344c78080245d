//! Dynamically-typed column values, records, and table schemas.
//!
//! The engine never hard-codes per-table row shapes. Column sets are
//! discovered at runtime through driver introspection, and rows are carried
//! as an ordered column → [`TableValue`] mapping. Schemas are cached per
//! table by the drivers and refreshed lazily.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A single dynamically-typed column value.
///
/// The canonical rendering ([`TableValue::canonical_text`]) is type-tagged
/// and locale-independent so that `Text("1")` and `Integer(1)` never collide
/// in a fingerprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum TableValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl TableValue {
    /// Returns `true` for the SQL `NULL` value.
    pub fn is_null(&self) -> bool {
        matches!(self, TableValue::Null)
    }

    /// Deterministic, type-tagged rendering used for fingerprints and for
    /// the textual `record_id` stored in the change log.
    pub fn canonical_text(&self) -> String {
        match self {
            TableValue::Null => "n:".to_string(),
            TableValue::Integer(v) => format!("i:{v}"),
            // `{:?}` keeps full precision and renders -0.0/NaN distinctly.
            TableValue::Real(v) => format!("r:{v:?}"),
            TableValue::Text(v) => format!("t:{v}"),
            TableValue::Bool(v) => format!("b:{}", if *v { 1 } else { 0 }),
            TableValue::Timestamp(v) => {
                format!("d:{}", v.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            TableValue::Blob(v) => format!("x:{}", hex::encode(v)),
        }
    }

    /// Plain rendering without the type tag, for display and primary-key
    /// matching against stores that compare textually.
    pub fn plain_text(&self) -> String {
        match self {
            TableValue::Null => String::new(),
            TableValue::Integer(v) => v.to_string(),
            TableValue::Real(v) => format!("{v:?}"),
            TableValue::Text(v) => v.clone(),
            TableValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            TableValue::Timestamp(v) => v.to_rfc3339_opts(SecondsFormat::Millis, true),
            TableValue::Blob(v) => hex::encode(v),
        }
    }
}

impl fmt::Display for TableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.plain_text())
    }
}

/// One relational row, flowing by value between components.
///
/// `fields` is a `BTreeMap` so iteration order is the deterministic
/// ascending column-name order the fingerprint depends on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Table this row belongs to.
    pub table: String,
    /// Name of the primary-key column.
    pub primary_key: String,
    /// Column name → value, ordered by column name.
    pub fields: BTreeMap<String, TableValue>,
}

impl Record {
    /// Create an empty record for a table.
    pub fn new(table: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: primary_key.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Set a field, builder style.
    pub fn with(mut self, column: impl Into<String>, value: TableValue) -> Self {
        self.fields.insert(column.into(), value);
        self
    }

    /// The primary-key value, if present.
    pub fn key_value(&self) -> Option<&TableValue> {
        self.fields.get(&self.primary_key)
    }

    /// The textual record id stored in the change log.
    pub fn record_id(&self) -> Option<String> {
        self.key_value().map(TableValue::plain_text)
    }

    /// Columns whose values differ from `other`, ascending by name.
    ///
    /// A column missing on either side counts as different.
    pub fn differing_columns(&self, other: &Record) -> Vec<String> {
        let mut names: Vec<&String> = self.fields.keys().chain(other.fields.keys()).collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .filter(|name| self.fields.get(*name) != other.fields.get(*name))
            .cloned()
            .collect()
    }
}

/// Introspected column metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Declared SQL type, as reported by the store (may be empty).
    pub declared_type: String,
    pub not_null: bool,
}

/// Introspected table schema, cached by the drivers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    /// Name of the primary-key column.
    pub primary_key: String,
}

/// Column marking a row as soft-deleted, when the table supports it.
pub const SOFT_DELETE_COLUMN: &str = "deleted";
/// Companion timestamp for soft deletes.
pub const SOFT_DELETE_AT_COLUMN: &str = "deleted_at";

impl TableSchema {
    /// Returns `true` if the table has a column with the given name.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Whether deletes on this table are applied as soft-delete markers.
    pub fn supports_soft_delete(&self) -> bool {
        self.has_column(SOFT_DELETE_COLUMN)
    }
}
