//! Mapping of validated records onto the target table's columns.

use std::fmt;

use crate::record::TypedRecord;

/// Warehouse column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Integer,
    Float,
}

impl ColumnType {
    /// Type name used in DDL.
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Integer => "INTEGER",
            ColumnType::Float => "FLOAT",
        }
    }

    /// Whether a type reported by the warehouse is compatible with this one.
    ///
    /// Snowflake normalises `STRING` to `TEXT`/`VARCHAR`, `INTEGER` to
    /// `NUMBER(38,0)` and `FLOAT` to `FLOAT`/`DOUBLE`.
    pub fn accepts(&self, reported: &str) -> bool {
        let reported = reported.trim().to_ascii_uppercase();
        let base = reported.split('(').next().unwrap_or_default().trim();
        match self {
            ColumnType::String => matches!(base, "TEXT" | "VARCHAR" | "STRING" | "CHAR"),
            ColumnType::Integer => {
                matches!(base, "INTEGER" | "INT" | "BIGINT" | "SMALLINT")
                    || (matches!(base, "NUMBER" | "DECIMAL" | "NUMERIC")
                        && numeric_scale(&reported) == 0)
            }
            ColumnType::Float => matches!(
                base,
                "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" | "REAL"
            ),
        }
    }
}

/// Scale of `NUMBER(p,s)`; a bare `NUMBER` has scale 0.
fn numeric_scale(reported: &str) -> u32 {
    reported
        .split_once(',')
        .and_then(|(_, rest)| rest.trim_end_matches(')').trim().parse().ok())
        .unwrap_or(0)
}

/// One column of the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub column_type: ColumnType,
}

/// Ordered column layout of the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    /// `(id STRING, name STRING, age INTEGER, price FLOAT)`.
    pub fn events() -> Self {
        Self {
            columns: vec![
                Column {
                    name: "id",
                    column_type: ColumnType::String,
                },
                Column {
                    name: "name",
                    column_type: ColumnType::String,
                },
                Column {
                    name: "age",
                    column_type: ColumnType::Integer,
                },
                Column {
                    name: "price",
                    column_type: ColumnType::Float,
                },
            ],
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column list for `CREATE TABLE`.
    pub fn ddl_columns(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.column_type.sql()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Compare against the `(name, type)` pairs the warehouse reports for an
    /// existing table. Returns a description of the first mismatch.
    pub fn check_compatible(&self, existing: &[(String, String)]) -> Result<(), String> {
        if existing.len() != self.columns.len() {
            return Err(format!(
                "expected {} columns, table has {}",
                self.columns.len(),
                existing.len()
            ));
        }
        for (position, (column, (name, reported))) in
            self.columns.iter().zip(existing).enumerate()
        {
            if !column.name.eq_ignore_ascii_case(name) {
                return Err(format!(
                    "column {} is '{}', expected '{}'",
                    position + 1,
                    name,
                    column.name
                ));
            }
            if !column.column_type.accepts(reported) {
                return Err(format!(
                    "column '{}' has type {}, expected {}",
                    column.name,
                    reported,
                    column.column_type.sql()
                ));
            }
        }
        Ok(())
    }
}

/// A single typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    String(String),
    Integer(i64),
    Float(f64),
}

impl ColumnValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnValue::String(_) => ColumnType::String,
            ColumnValue::Integer(_) => ColumnType::Integer,
            ColumnValue::Float(_) => ColumnType::Float,
        }
    }

    /// Parse the text rendering of a value back into its column type.
    pub fn parse(column_type: ColumnType, text: &str) -> Option<Self> {
        match column_type {
            ColumnType::String => Some(ColumnValue::String(text.to_string())),
            ColumnType::Integer => text.parse().ok().map(ColumnValue::Integer),
            ColumnType::Float => text.parse().ok().map(ColumnValue::Float),
        }
    }
}

/// Locale independent; floats use the shortest text that round-trips.
impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::String(s) => f.write_str(s),
            ColumnValue::Integer(i) => write!(f, "{i}"),
            ColumnValue::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Positional row matching [`TableSchema::events`].
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnTuple(pub Vec<ColumnValue>);

impl ColumnTuple {
    pub fn values(&self) -> &[ColumnValue] {
        &self.0
    }
}

/// Convert a validated record into a row.
pub fn map_record(record: &TypedRecord) -> ColumnTuple {
    ColumnTuple(vec![
        ColumnValue::String(record.id.clone()),
        ColumnValue::String(record.name.clone()),
        ColumnValue::Integer(i64::from(record.age)),
        ColumnValue::Float(record.price),
    ])
}
