#![forbid(unsafe_code)]

use std::path::Path;

use csv::ReaderBuilder;
use serde_json::{Map, Value};
use sv_types::{CellValue, ColumnType, Row, infer_column_type, parse_cell};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed CSV document: headers in file order, the per-column types
/// inferred over every record, and one typed `Row` per data record.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    column_types: Vec<ColumnType>,
    rows: Vec<Row>,
}

impl Table {
    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    #[must_use]
    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn read_csv_str(input: &str) -> Result<Table, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());

    let headers = reader
        .headers()
        .map_err(IoError::from)?
        .iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    // Two passes over buffered records: inference wants to see every
    // value of a column before any cell is parsed.
    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record?);
    }

    let column_types = headers
        .iter()
        .enumerate()
        .map(|(idx, _)| {
            infer_column_type(
                records
                    .iter()
                    .map(|record| record.get(idx).unwrap_or_default()),
            )
        })
        .collect::<Vec<_>>();

    let rows = records
        .iter()
        .map(|record| {
            headers
                .iter()
                .zip(&column_types)
                .enumerate()
                .map(|(idx, (header, column_type))| {
                    let field = record.get(idx).unwrap_or_default();
                    (header.clone(), parse_cell(field, *column_type))
                })
                .collect::<Row>()
        })
        .collect();

    Ok(Table {
        headers,
        column_types,
        rows,
    })
}

pub fn read_csv_path(path: impl AsRef<Path>) -> Result<Table, IoError> {
    let input = std::fs::read_to_string(path)?;
    read_csv_str(&input)
}

#[must_use]
pub fn cell_to_json(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Bool(v) => Value::Bool(*v),
        CellValue::Int64(v) => Value::from(*v),
        CellValue::Float64(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
        CellValue::Utf8(v) => Value::String(v.clone()),
    }
}

/// Project a row onto the given columns as a JSON object whose key
/// order follows `columns` (serde_json is built with `preserve_order`).
/// A projected column the row does not carry maps to JSON null.
#[must_use]
pub fn row_to_json(row: &Row, columns: &[String]) -> Value {
    let mut object = Map::new();
    for column in columns {
        let value = row.get(column).map_or(Value::Null, cell_to_json);
        object.insert(column.clone(), value);
    }
    Value::Object(object)
}
