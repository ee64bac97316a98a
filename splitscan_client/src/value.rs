//! Typed values, column types and result schemas as reported by the database.

use std::{
    collections::{BTreeMap, btree_map},
    fmt::Display,
};

use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("query parameters must be given as a JSON object, got: {0}")]
    ParamsNotAnObject(serde_json::Value),

    #[error("parameter '{name}' holds a JSON number that does not fit INT64 or FLOAT64: {number}")]
    UnrepresentableNumber {
        name: String,
        number: serde_json::Number,
    },
}

/// The type of a column, or of the elements of an `ARRAY` column
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Int64,
    Float64,
    Timestamp,
    Date,
    String,
    Bytes,
    /// Fixed precision decimal with 38 digits, 9 of which follow the decimal point
    Numeric,
    Json,
    Array(Box<ColumnType>),
    /// Reported by the database but not representable as a flat column
    Struct(Vec<Column>),
}

impl ColumnType {
    pub fn array(element: Self) -> Self {
        Self::Array(Box::new(element))
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "BOOL"),
            Self::Int64 => write!(f, "INT64"),
            Self::Float64 => write!(f, "FLOAT64"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::Date => write!(f, "DATE"),
            Self::String => write!(f, "STRING"),
            Self::Bytes => write!(f, "BYTES"),
            Self::Numeric => write!(f, "NUMERIC"),
            Self::Json => write!(f, "JSON"),
            Self::Array(element) => write!(f, "ARRAY<{element}>"),
            Self::Struct(fields) => {
                write!(f, "STRUCT<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} {}", field.name, field.column_type)?;
                }
                write!(f, ">")
            }
        }
    }
}

/// A named, typed column of a result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered list of columns shared by every row of a result
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: impl IntoIterator<Item = Column>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    /// A schema with no columns, as returned for a result with nothing in it
    pub fn empty() -> Self {
        Self::default()
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

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }
}

impl FromIterator<(String, ColumnType)> for Schema {
    fn from_iter<T: IntoIterator<Item = (String, ColumnType)>>(iter: T) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(name, column_type)| Column::new(name, column_type)),
        )
    }
}

impl Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "({}, {})", column.name, column.column_type)?;
        }
        write!(f, "]")
    }
}

/// A single typed cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    String(String),
    Bytes(Vec<u8>),
    /// Unscaled NUMERIC value, i.e. the decimal value multiplied by 10^9
    Numeric(i128),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Name of the variant, used when reporting a value that does not match its column
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOL",
            Self::Int64(_) => "INT64",
            Self::Float64(_) => "FLOAT64",
            Self::Timestamp(_) => "TIMESTAMP",
            Self::Date(_) => "DATE",
            Self::String(_) => "STRING",
            Self::Bytes(_) => "BYTES",
            Self::Numeric(_) => "NUMERIC",
            Self::Json(_) => "JSON",
            Self::Array(_) => "ARRAY",
        }
    }

    fn try_from_json(name: &str, json: serde_json::Value) -> Result<Self, ValueError> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int64(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Float64(f)
                } else {
                    return Err(ValueError::UnrepresentableNumber {
                        name: name.to_string(),
                        number: n,
                    });
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(|item| Self::try_from_json(name, item))
                    .collect::<Result<_, _>>()?,
            ),
            obj @ serde_json::Value::Object(_) => Self::Json(obj),
        })
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int64(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One row of a result, with one value per column of its schema
pub type Row = Vec<Value>;

/// Named parameters bound to a query, referenced in SQL as `@name`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams(BTreeMap<String, Value>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a JSON object of `name: value` pairs into typed parameters
    ///
    /// Integers map to `INT64`, other numbers to `FLOAT64`, arrays to `ARRAY` and nested objects
    /// are passed through as `JSON`.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ValueError> {
        let serde_json::Value::Object(map) = json else {
            return Err(ValueError::ParamsNotAnObject(json));
        };
        map.into_iter()
            .map(|(name, value)| {
                let value = Value::try_from_json(&name, value)?;
                Ok((name, value))
            })
            .collect()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
