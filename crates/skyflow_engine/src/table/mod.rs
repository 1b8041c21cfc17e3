//! Tabular results as Arrow `RecordBatch`es.
//!
//! Catalog services answer in one of two wire formats: row-tagged XML
//! (VOTable TABLEDATA) or fixed-record binary (FITS BINTABLE). Both decode
//! into a single `RecordBatch`; results of several jobs are stacked row-wise.

pub mod fits;
pub mod votable;

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use thiserror::Error;

/// Decoded query result.
pub type Table = RecordBatch;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Malformed {format} document: {message}")]
    Format {
        format: &'static str,
        message: String,
    },

    /// The service embedded an error status in an otherwise valid document
    #[error("Service reported an error: {0}")]
    Service(String),

    #[error("Unsupported content: {0}")]
    Unsupported(String),

    #[error("Schemas differ: expected [{expected}], found [{found}]")]
    SchemaMismatch { expected: String, found: String },

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl TableError {
    pub(crate) fn votable(message: impl Into<String>) -> Self {
        TableError::Format {
            format: "VOTable",
            message: message.into(),
        }
    }

    pub(crate) fn fits(message: impl Into<String>) -> Self {
        TableError::Format {
            format: "FITS",
            message: message.into(),
        }
    }
}

/// Wire format of a result document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    VoTable,
    Fits,
}

impl TableFormat {
    /// Sniff the format from the first bytes of a document.
    pub fn detect(prefix: &[u8]) -> Option<TableFormat> {
        if prefix.starts_with(b"SIMPLE  =") {
            return Some(TableFormat::Fits);
        }
        let start = prefix
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(prefix.len());
        let head = &prefix[start..prefix.len().min(start + 1024)];
        if head.starts_with(b"<?xml") || head.starts_with(b"<VOTABLE") {
            Some(TableFormat::VoTable)
        } else {
            None
        }
    }
}

/// Decode a complete result document.
pub fn decode(bytes: &[u8]) -> Result<Table, TableError> {
    match TableFormat::detect(bytes) {
        Some(TableFormat::VoTable) => votable::decode(bytes),
        Some(TableFormat::Fits) => fits::decode_bintable(bytes),
        None if bytes.iter().all(u8::is_ascii_whitespace) => Err(TableError::Unsupported(
            "empty response".to_string(),
        )),
        None => Err(TableError::Unsupported(
            "response is neither VOTable nor FITS".to_string(),
        )),
    }
}

/// Logical column type of decoded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Float,
    Int,
    Text,
}

impl ColumnKind {
    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

#[derive(Debug)]
enum ColumnData {
    Float(Vec<Option<f64>>),
    Int(Vec<Option<i64>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    fn new(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Float => ColumnData::Float(Vec::new()),
            ColumnKind::Int => ColumnData::Int(Vec::new()),
            ColumnKind::Text => ColumnData::Text(Vec::new()),
        }
    }

    fn into_array(self) -> ArrayRef {
        match self {
            ColumnData::Float(values) => Arc::new(Float64Array::from(values)),
            ColumnData::Int(values) => Arc::new(Int64Array::from(values)),
            ColumnData::Text(values) => Arc::new(StringArray::from(values)),
        }
    }
}

/// Column-wise accumulator shared by the decoders and the local engine.
#[derive(Debug)]
pub struct TableBuilder {
    fields: Vec<(String, ColumnKind)>,
    columns: Vec<ColumnData>,
    metadata: HashMap<String, String>,
    rows: usize,
}

impl TableBuilder {
    pub fn new(fields: Vec<(String, ColumnKind)>) -> Self {
        let columns = fields.iter().map(|(_, kind)| ColumnData::new(*kind)).collect();
        Self {
            fields,
            columns,
            metadata: HashMap::new(),
            rows: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn kind(&self, column: usize) -> Option<ColumnKind> {
        self.fields.get(column).map(|(_, kind)| *kind)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn push_float(&mut self, column: usize, value: Option<f64>) {
        let value = value.filter(|v| !v.is_nan());
        match &mut self.columns[column] {
            ColumnData::Float(values) => values.push(value),
            ColumnData::Int(values) => values.push(value.map(|v| v as i64)),
            ColumnData::Text(values) => values.push(value.map(|v| v.to_string())),
        }
    }

    pub fn push_int(&mut self, column: usize, value: Option<i64>) {
        match &mut self.columns[column] {
            ColumnData::Float(values) => values.push(value.map(|v| v as f64)),
            ColumnData::Int(values) => values.push(value),
            ColumnData::Text(values) => values.push(value.map(|v| v.to_string())),
        }
    }

    pub fn push_text(&mut self, column: usize, value: Option<String>) {
        match &mut self.columns[column] {
            ColumnData::Text(values) => values.push(value),
            ColumnData::Float(values) => values.push(value.and_then(|v| v.trim().parse().ok())),
            ColumnData::Int(values) => values.push(value.and_then(|v| v.trim().parse().ok())),
        }
    }

    /// Parse a textual cell according to the column type. Empty cells are null.
    pub fn push_cell(&mut self, column: usize, raw: Option<&str>) -> Result<(), TableError> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        let kind = self
            .kind(column)
            .ok_or_else(|| TableError::votable(format!("cell outside of {} columns", self.width())))?;
        match (kind, raw) {
            (ColumnKind::Float, Some(text)) => {
                let value = parse_float(text).ok_or_else(|| {
                    TableError::votable(format!("cannot parse '{}' as a number", text))
                })?;
                self.push_float(column, Some(value));
            }
            (ColumnKind::Int, Some(text)) => {
                let value = text.parse::<i64>().map_err(|_| {
                    TableError::votable(format!("cannot parse '{}' as an integer", text))
                })?;
                self.push_int(column, Some(value));
            }
            (ColumnKind::Text, value) => self.push_text(column, value.map(str::to_string)),
            (ColumnKind::Float, None) => self.push_float(column, None),
            (ColumnKind::Int, None) => self.push_int(column, None),
        }
        Ok(())
    }

    /// Mark the end of a row.
    pub fn end_row(&mut self) {
        self.rows += 1;
    }

    pub fn finish(self) -> Result<Table, TableError> {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|(name, kind)| Field::new(name, kind.data_type(), true))
            .collect();
        let schema = Arc::new(Schema::new_with_metadata(fields, self.metadata));
        let columns: Vec<ArrayRef> = self.columns.into_iter().map(ColumnData::into_array).collect();
        if let Some(bad) = columns.iter().find(|c| c.len() != self.rows) {
            return Err(TableError::votable(format!(
                "ragged table: column has {} values for {} rows",
                bad.len(),
                self.rows
            )));
        }
        let options = RecordBatchOptions::new().with_row_count(Some(self.rows));
        Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" | "nan" | "-NaN" => Some(f64::NAN),
        "+Inf" | "Inf" | "inf" => Some(f64::INFINITY),
        "-Inf" | "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

/// Column names and types, e.g. `ra:Float64, dec:Float64`.
pub fn schema_signature(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}:{}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn stackable(a: &Schema, b: &Schema) -> bool {
    a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields().iter())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
}

/// Concatenate tables row-wise. Column names and types must agree in order.
pub fn stack(tables: Vec<Table>) -> Result<Table, TableError> {
    let mut iter = tables.into_iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return Err(TableError::Unsupported("nothing to stack".to_string())),
    };
    let rest: Vec<Table> = iter.collect();
    if rest.is_empty() {
        return Ok(first);
    }

    let reference = first.schema();
    let fields: Vec<Field> = reference
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();
    let unified: SchemaRef = Arc::new(Schema::new_with_metadata(
        fields,
        reference.metadata().clone(),
    ));

    let mut aligned = Vec::with_capacity(rest.len() + 1);
    for table in std::iter::once(first).chain(rest) {
        if !stackable(&reference, &table.schema()) {
            return Err(TableError::SchemaMismatch {
                expected: schema_signature(&reference),
                found: schema_signature(&table.schema()),
            });
        }
        let options = RecordBatchOptions::new().with_row_count(Some(table.num_rows()));
        aligned.push(RecordBatch::try_new_with_options(
            Arc::clone(&unified),
            table.columns().to_vec(),
            &options,
        )?);
    }
    Ok(concat_batches(&unified, &aligned)?)
}

/// Drop schema and field metadata values longer than `max_len` characters.
pub fn strip_long_metadata(table: Table, max_len: usize) -> Result<Table, TableError> {
    let keep = |metadata: &HashMap<String, String>| -> HashMap<String, String> {
        metadata
            .iter()
            .filter(|(_, v)| v.chars().count() <= max_len)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    let schema = table.schema();
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_metadata(keep(f.metadata())))
        .collect();
    let stripped = Arc::new(Schema::new_with_metadata(fields, keep(schema.metadata())));
    let options = RecordBatchOptions::new().with_row_count(Some(table.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        stripped,
        table.columns().to_vec(),
        &options,
    )?)
}
