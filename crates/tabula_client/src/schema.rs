//! Table schemas, cell values and primary-key encoding.
//!
//! Tablet boundaries are expressed over the encoded primary key, so the
//! encoding must sort the same way the typed key tuple does.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, Status};

const SIGN_FLIP_MASK: u64 = 1u64 << 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    UInt32,
    Int64,
    String,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::String => "string",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Ordered column list whose first `num_key_columns` entries form the primary key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> Result<Self> {
        if num_key_columns > columns.len() {
            return Err(Status::invalid_argument(format!(
                "schema declares {num_key_columns} key columns but only has {}",
                columns.len()
            )));
        }
        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(Status::invalid_argument(format!(
                    "duplicate column name {}",
                    column.name
                )));
            }
            if idx < num_key_columns && column.nullable {
                return Err(Status::invalid_argument(format!(
                    "key column {} must not be nullable",
                    column.name
                )));
            }
        }
        Ok(Self {
            columns,
            num_key_columns,
        })
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    /// Encodes a full key tuple (one value per key column, in order).
    pub fn encode_key(&self, key: &[Value]) -> Result<Vec<u8>> {
        if key.len() != self.num_key_columns {
            return Err(Status::invalid_argument(format!(
                "expected {} key values, got {}",
                self.num_key_columns,
                key.len()
            )));
        }
        let mut out = Vec::new();
        for (idx, (column, value)) in self.key_columns().iter().zip(key).enumerate() {
            if value.data_type() != column.data_type {
                return Err(Status::invalid_argument(format!(
                    "key column {} expects {}, got {}",
                    column.name,
                    column.data_type.name(),
                    value.data_type().name()
                )));
            }
            let is_last = idx + 1 == self.num_key_columns;
            encode_key_component(&mut out, value, is_last);
        }
        Ok(out)
    }
}

fn encode_key_component(out: &mut Vec<u8>, value: &Value, is_last: bool) {
    match value {
        Value::UInt32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Int64(v) => out.extend_from_slice(&((*v as u64) ^ SIGN_FLIP_MASK).to_be_bytes()),
        Value::String(s) => {
            if is_last {
                out.extend_from_slice(s.as_bytes());
            } else {
                for byte in s.as_bytes() {
                    out.push(*byte);
                    if *byte == 0 {
                        out.push(1);
                    }
                }
                out.extend_from_slice(&[0, 0]);
            }
        }
    }
}

/// One typed cell value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    UInt32(u32),
    Int64(i64),
    String(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::UInt32(_) => DataType::UInt32,
            Value::Int64(_) => DataType::Int64,
            Value::String(_) => DataType::String,
        }
    }

    /// Approximate in-memory footprint, used for batch and buffer budgets.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Value::UInt32(_) => 4,
            Value::Int64(_) => 8,
            Value::String(s) => s.len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

/// A row under construction: any subset of a schema's columns may be set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialRow {
    schema: Arc<Schema>,
    values: Vec<Option<Value>>,
}

impl PartialRow {
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = vec![None; schema.num_columns()];
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn set(&mut self, column: &str, value: Value) -> Result<()> {
        let idx = self.schema.find_column(column).ok_or_else(|| {
            Status::invalid_argument(format!("unknown column: {column}"))
        })?;
        let expected = self.schema.columns[idx].data_type;
        if value.data_type() != expected {
            return Err(Status::invalid_argument(format!(
                "column {column} expects {}, got {}",
                expected.name(),
                value.data_type().name()
            )));
        }
        self.values[idx] = Some(value);
        Ok(())
    }

    pub fn set_u32(&mut self, column: &str, value: u32) -> Result<()> {
        self.set(column, Value::UInt32(value))
    }

    pub fn set_i64(&mut self, column: &str, value: i64) -> Result<()> {
        self.set(column, Value::Int64(value))
    }

    pub fn set_string(&mut self, column: &str, value: impl Into<String>) -> Result<()> {
        self.set(column, Value::String(value.into()))
    }

    pub fn clear(&mut self, column: &str) -> Result<()> {
        let idx = self.schema.find_column(column).ok_or_else(|| {
            Status::invalid_argument(format!("unknown column: {column}"))
        })?;
        self.values[idx] = None;
        Ok(())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.schema
            .find_column(column)
            .and_then(|idx| self.values[idx].as_ref())
    }

    pub fn is_key_set(&self) -> bool {
        self.values[..self.schema.num_key_columns()]
            .iter()
            .all(Option::is_some)
    }

    /// Encoded primary key, or `None` while any key column is unset.
    pub fn encoded_key(&self) -> Option<Vec<u8>> {
        let key_count = self.schema.num_key_columns();
        let mut out = Vec::new();
        for (idx, value) in self.values[..key_count].iter().enumerate() {
            encode_key_component(&mut out, value.as_ref()?, idx + 1 == key_count);
        }
        Some(out)
    }

    /// Set cells as `(column name, value)` pairs in schema order.
    pub fn cells(&self) -> Vec<(String, Value)> {
        self.schema
            .columns
            .iter()
            .zip(&self.values)
            .filter_map(|(column, value)| value.as_ref().map(|v| (column.name.clone(), v.clone())))
            .collect()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.values
            .iter()
            .flatten()
            .map(Value::size_in_bytes)
            .sum()
    }
}

impl fmt::Display for PartialRow {
    /// Renders set cells as `uint32 key=1, string name=x`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (column, value) in self.schema.columns.iter().zip(&self.values) {
            let Some(value) = value else {
                continue;
            };
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{} {}={}", column.data_type.name(), column.name, value)?;
        }
        Ok(())
    }
}

/// One row returned by a scan, laid out according to the scan projection.
///
/// A count-only scan (empty projection) yields rows with no values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    values: Vec<Option<Value>>,
}

impl Row {
    pub fn new(values: Vec<Option<Value>>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx).and_then(Option::as_ref)
    }

    pub fn get_u32(&self, idx: usize) -> Result<u32> {
        match self.get(idx) {
            Some(Value::UInt32(v)) => Ok(*v),
            other => Err(type_mismatch(idx, "uint32", other)),
        }
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64> {
        match self.get(idx) {
            Some(Value::Int64(v)) => Ok(*v),
            other => Err(type_mismatch(idx, "int64", other)),
        }
    }

    pub fn get_string(&self, idx: usize) -> Result<&str> {
        match self.get(idx) {
            Some(Value::String(s)) => Ok(s.as_str()),
            other => Err(type_mismatch(idx, "string", other)),
        }
    }

    /// Payload size used against scanner batch budgets.
    pub fn size_in_bytes(&self) -> usize {
        self.values
            .iter()
            .flatten()
            .map(Value::size_in_bytes)
            .sum()
    }
}

fn type_mismatch(idx: usize, wanted: &str, found: Option<&Value>) -> Status {
    match found {
        Some(value) => Status::invalid_argument(format!(
            "column {idx} is {}, not {wanted}",
            value.data_type().name()
        )),
        None => Status::invalid_argument(format!("column {idx} is null or not projected")),
    }
}
