//! The combined rows of a partitioned query and their conversion to Arrow.

use std::{collections::HashMap, fmt::Display, sync::Arc};

use arrow::{
    array::{
        ArrayRef, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float64Array,
        Int64Array, ListArray, StringArray, TimestampMicrosecondArray,
    },
    buffer::{NullBuffer, OffsetBuffer},
    datatypes::{DataType, Field, FieldRef, Schema as ArrowSchema, TimeUnit},
    error::ArrowError,
    record_batch::{RecordBatch, RecordBatchOptions},
    util::pretty::pretty_format_batches,
};
use chrono::Datelike;
use splitscan_client::{ColumnType, Row, Schema, Value};

/// Days from 0001-01-01 to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Precision and scale of NUMERIC columns
const NUMERIC_PRECISION: u8 = 38;
const NUMERIC_SCALE: i8 = 9;

/// Metadata key under which each Arrow field records the database column type
pub const COLUMN_TYPE_METADATA_KEY: &str = "column_type";

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("column '{column}' has type {column_type}, which has no Arrow representation")]
    UnsupportedType {
        column: String,
        column_type: ColumnType,
    },

    #[error("column '{column}' expects {expected} values, found {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: &'static str,
    },

    #[error("column '{column}' holds invalid JSON: {source}")]
    InvalidJson {
        column: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("column '{column}' has more array elements than an Arrow list can address")]
    ArrayOverflow { column: String },

    #[error("row {row} has {found} value(s) but the schema has {expected} column(s)")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

/// Rows of a partitioned query in partition order, with the schema they share
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    schema: Schema,
    rows: Vec<Row>,
    failed_partitions: usize,
}

impl ResultSet {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows,
            failed_partitions: 0,
        }
    }

    pub fn with_failed_partitions(mut self, failed_partitions: usize) -> Self {
        self.failed_partitions = failed_partitions;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Partitions whose rows are missing because they failed under a best-effort policy
    pub fn failed_partitions(&self) -> usize {
        self.failed_partitions
    }

    /// Convert into a single Arrow [`RecordBatch`]
    ///
    /// | column type  | Arrow type                    |
    /// |--------------|-------------------------------|
    /// | `BOOL`       | `Boolean`                     |
    /// | `INT64`      | `Int64`                       |
    /// | `FLOAT64`    | `Float64`                     |
    /// | `TIMESTAMP`  | `Timestamp(Microsecond, UTC)` |
    /// | `DATE`       | `Date32`                      |
    /// | `STRING`     | `Utf8`                        |
    /// | `BYTES`      | `Binary`                      |
    /// | `NUMERIC`    | `Decimal128(38, 9)`           |
    /// | `JSON`       | `Utf8`                        |
    /// | `ARRAY<T>`   | `List<T>`                     |
    ///
    /// `STRUCT` columns cannot be converted.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ConversionError> {
        let width = self.schema.len();
        if let Some((row, values)) = self.rows.iter().enumerate().find(|(_, r)| r.len() != width)
        {
            return Err(ConversionError::RowWidth {
                row,
                expected: width,
                found: values.len(),
            });
        }

        let mut fields = Vec::with_capacity(width);
        let mut columns = Vec::with_capacity(width);
        for (i, column) in self.schema.iter().enumerate() {
            let data_type = data_type(&column.name, &column.column_type)?;
            let values: Vec<&Value> = self.rows.iter().map(|row| &row[i]).collect();
            columns.push(build_array(&column.name, &column.column_type, &values)?);
            fields.push(
                Field::new(&column.name, data_type, true).with_metadata(HashMap::from([(
                    COLUMN_TYPE_METADATA_KEY.to_string(),
                    column.column_type.to_string(),
                )])),
            );
        }

        let schema = Arc::new(ArrowSchema::new(fields));
        let options = RecordBatchOptions::new().with_row_count(Some(self.rows.len()));
        Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
    }

    /// Render as a text table
    pub fn pretty_format(&self) -> Result<impl Display, ConversionError> {
        let batch = self.to_record_batch()?;
        Ok(pretty_format_batches(&[batch])?)
    }
}

fn data_type(column: &str, column_type: &ColumnType) -> Result<DataType, ConversionError> {
    Ok(match column_type {
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        ColumnType::Date => DataType::Date32,
        ColumnType::String | ColumnType::Json => DataType::Utf8,
        ColumnType::Bytes => DataType::Binary,
        ColumnType::Numeric => DataType::Decimal128(NUMERIC_PRECISION, NUMERIC_SCALE),
        ColumnType::Array(element) => DataType::List(list_item(column, element)?),
        ColumnType::Struct(_) => {
            return Err(ConversionError::UnsupportedType {
                column: column.to_string(),
                column_type: column_type.clone(),
            });
        }
    })
}

fn list_item(column: &str, element: &ColumnType) -> Result<FieldRef, ConversionError> {
    Ok(Arc::new(Field::new("item", data_type(column, element)?, true)))
}

fn build_array(
    column: &str,
    column_type: &ColumnType,
    values: &[&Value],
) -> Result<ArrayRef, ConversionError> {
    let mismatch = |found: &Value| ConversionError::TypeMismatch {
        column: column.to_string(),
        expected: column_type.to_string(),
        found: found.type_name(),
    };

    Ok(match column_type {
        ColumnType::Bool => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Bool(b) => Ok(Some(*b)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<BooleanArray, _>>()?,
        ),
        ColumnType::Int64 => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Int64(i) => Ok(Some(*i)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Int64Array, _>>()?,
        ),
        ColumnType::Float64 => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Float64(f) => Ok(Some(*f)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Float64Array, _>>()?,
        ),
        ColumnType::Timestamp => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<TimestampMicrosecondArray, _>>()?
                .with_timezone("UTC"),
        ),
        ColumnType::Date => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Date(d) => Ok(Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Date32Array, _>>()?,
        ),
        ColumnType::String => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::String(s) => Ok(Some(s.as_str())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<StringArray, _>>()?,
        ),
        ColumnType::Json => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Json(json) => Ok(Some(json.to_string())),
                    // JSON columns may arrive as their text encoding
                    Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                        .map(|_| Some(s.clone()))
                        .map_err(|source| ConversionError::InvalidJson {
                            column: column.to_string(),
                            source,
                        }),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<StringArray, _>>()?,
        ),
        ColumnType::Bytes => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Bytes(b) => Ok(Some(b.as_slice())),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<BinaryArray, _>>()?,
        ),
        ColumnType::Numeric => Arc::new(
            values
                .iter()
                .map(|&v| match v {
                    Value::Null => Ok(None),
                    Value::Numeric(n) => Ok(Some(*n)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Decimal128Array, _>>()?
                .with_precision_and_scale(NUMERIC_PRECISION, NUMERIC_SCALE)?,
        ),
        ColumnType::Array(element) => {
            let mut lengths = Vec::with_capacity(values.len());
            let mut validity = Vec::with_capacity(values.len());
            let mut items: Vec<&Value> = Vec::new();
            for &v in values {
                match v {
                    Value::Null => {
                        lengths.push(0);
                        validity.push(false);
                    }
                    Value::Array(elements) => {
                        lengths.push(elements.len());
                        validity.push(true);
                        items.extend(elements.iter());
                    }
                    other => return Err(mismatch(other)),
                }
            }
            if i32::try_from(items.len()).is_err() {
                return Err(ConversionError::ArrayOverflow {
                    column: column.to_string(),
                });
            }

            let child = build_array(column, element, &items)?;
            let nulls = validity
                .iter()
                .any(|valid| !valid)
                .then(|| NullBuffer::from(validity));
            Arc::new(ListArray::try_new(
                list_item(column, element)?,
                OffsetBuffer::from_lengths(lengths),
                child,
                nulls,
            )?)
        }
        ColumnType::Struct(_) => {
            return Err(ConversionError::UnsupportedType {
                column: column.to_string(),
                column_type: column_type.clone(),
            });
        }
    })
}
