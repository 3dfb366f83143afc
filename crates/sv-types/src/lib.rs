#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Date,
    Datetime,
    String,
}

impl ColumnType {
    /// Parse a config-supplied type tag. Tags are matched case-insensitively.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "BOOLEAN" => Some(Self::Boolean),
            "INTEGER" => Some(Self::Integer),
            "FLOAT" => Some(Self::Float),
            "DATE" => Some(Self::Date),
            "DATETIME" => Some(Self::Datetime),
            "STRING" => Some(Self::String),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "BOOLEAN",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Date => "DATE",
            Self::Datetime => "DATETIME",
            Self::String => "STRING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl CellValue {
    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Canonical text form used by the string-matching operators.
    /// `Null` has no text form and renders to `None`.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(v.to_string()),
            Self::Int64(v) => Some(v.to_string()),
            Self::Float64(v) => {
                if v.is_nan() {
                    None
                } else {
                    Some(v.to_string())
                }
            }
            Self::Utf8(v) => Some(v.clone()),
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsMissing),
            Self::Utf8(v) => v
                .trim()
                .parse::<f64>()
                .map_err(|_| TypeError::NonNumericValue { value: v.clone() }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("value {value:?} is not numeric")]
    NonNumericValue { value: String },
    #[error("value is missing")]
    ValueIsMissing,
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%Y/%m/%d"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

fn is_date(text: &str) -> bool {
    DATE_FORMATS
        .iter()
        .any(|format| NaiveDate::parse_from_str(text, format).is_ok())
}

fn is_datetime(text: &str) -> bool {
    DATETIME_FORMATS
        .iter()
        .any(|format| NaiveDateTime::parse_from_str(text, format).is_ok())
}

fn is_bool_literal(text: &str) -> bool {
    text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false")
}

/// Infer a column type from sampled cell text. Empty cells are skipped;
/// a column with no non-empty samples defaults to `String`.
pub fn infer_column_type<'a>(samples: impl IntoIterator<Item = &'a str>) -> ColumnType {
    let mut seen = false;
    let mut all_bool = true;
    let mut all_int = true;
    let mut all_float = true;
    let mut all_date = true;
    let mut all_datetime = true;

    for sample in samples {
        let trimmed = sample.trim();
        if trimmed.is_empty() {
            continue;
        }
        seen = true;
        all_bool &= is_bool_literal(trimmed);
        all_int &= trimmed.parse::<i64>().is_ok();
        all_float &= trimmed.parse::<f64>().is_ok();
        all_date &= is_date(trimmed);
        all_datetime &= is_datetime(trimmed);
    }

    if !seen {
        return ColumnType::String;
    }
    if all_bool {
        ColumnType::Boolean
    } else if all_int {
        ColumnType::Integer
    } else if all_float {
        ColumnType::Float
    } else if all_date {
        ColumnType::Date
    } else if all_datetime {
        ColumnType::Datetime
    } else {
        ColumnType::String
    }
}

/// Parse one CSV cell under a declared column type. Empty text is `Null`.
/// Cell data is untrusted, so a value that does not fit the declared type
/// falls back to `Utf8` rather than erroring.
#[must_use]
pub fn parse_cell(text: &str, column_type: ColumnType) -> CellValue {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return CellValue::Null;
    }

    match column_type {
        ColumnType::Boolean => {
            if trimmed.eq_ignore_ascii_case("true") {
                CellValue::Bool(true)
            } else if trimmed.eq_ignore_ascii_case("false") {
                CellValue::Bool(false)
            } else {
                CellValue::Utf8(trimmed.to_owned())
            }
        }
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map_or_else(|_| CellValue::Utf8(trimmed.to_owned()), CellValue::Int64),
        ColumnType::Float => trimmed
            .parse::<f64>()
            .map_or_else(|_| CellValue::Utf8(trimmed.to_owned()), CellValue::Float64),
        ColumnType::Date | ColumnType::Datetime | ColumnType::String => {
            CellValue::Utf8(trimmed.to_owned())
        }
    }
}

/// One row of named, typed cells. Built per evaluation call by the
/// ingestion layer; the condition engine only ever borrows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: BTreeMap<String, CellValue>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: CellValue) {
        self.cells.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.cells.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn cells(&self) -> &BTreeMap<String, CellValue> {
        &self.cells
    }
}

impl FromIterator<(String, CellValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CellValue, ColumnType, Row, TypeError, infer_column_type, parse_cell};

    #[test]
    fn inference_prefers_narrowest_type() {
        assert_eq!(
            infer_column_type(["true", "FALSE", "true"]),
            ColumnType::Boolean
        );
        assert_eq!(infer_column_type(["1", "42", ""]), ColumnType::Integer);
        assert_eq!(infer_column_type(["1.5", "2"]), ColumnType::Float);
        assert_eq!(
            infer_column_type(["2024-01-31", "2024-02-01"]),
            ColumnType::Date
        );
        assert_eq!(
            infer_column_type(["2024-01-31 08:30:00"]),
            ColumnType::Datetime
        );
        assert_eq!(infer_column_type(["open", "42"]), ColumnType::String);
    }

    #[test]
    fn empty_samples_default_to_string() {
        assert_eq!(infer_column_type(["", "  ", ""]), ColumnType::String);
    }

    #[test]
    fn parse_cell_maps_empty_text_to_null() {
        assert_eq!(parse_cell("  ", ColumnType::Integer), CellValue::Null);
        assert_eq!(parse_cell("", ColumnType::String), CellValue::Null);
    }

    #[test]
    fn parse_cell_falls_back_to_text_on_type_mismatch() {
        assert_eq!(
            parse_cell("not-a-number", ColumnType::Integer),
            CellValue::Utf8("not-a-number".to_owned())
        );
        assert_eq!(parse_cell("7", ColumnType::Integer), CellValue::Int64(7));
        assert_eq!(
            parse_cell("TRUE", ColumnType::Boolean),
            CellValue::Bool(true)
        );
    }

    #[test]
    fn render_uses_canonical_text_forms() {
        assert_eq!(CellValue::Bool(true).render(), Some("true".to_owned()));
        assert_eq!(CellValue::Int64(3).render(), Some("3".to_owned()));
        assert_eq!(CellValue::Null.render(), None);
    }

    #[test]
    fn to_f64_coerces_bool_and_numeric_text() {
        assert_eq!(CellValue::Bool(true).to_f64().expect("bool"), 1.0);
        assert_eq!(
            CellValue::Utf8("2.5".to_owned()).to_f64().expect("text"),
            2.5
        );
        let err = CellValue::Utf8("open".to_owned())
            .to_f64()
            .expect_err("non-numeric text must fail");
        assert!(matches!(err, TypeError::NonNumericValue { .. }));
    }

    #[test]
    fn column_type_tags_round_trip_case_insensitively() {
        assert_eq!(ColumnType::parse("datetime"), Some(ColumnType::Datetime));
        assert_eq!(ColumnType::parse(" STRING "), Some(ColumnType::String));
        assert_eq!(ColumnType::parse("DECIMAL"), None);
        assert_eq!(ColumnType::Boolean.as_str(), "BOOLEAN");
    }

    #[test]
    fn row_lookup_distinguishes_absent_from_null() {
        let row: Row = [
            ("a".to_owned(), CellValue::Null),
            ("b".to_owned(), CellValue::Bool(false)),
        ]
        .into_iter()
        .collect();

        assert!(row.contains("a"));
        assert_eq!(row.get("a"), Some(&CellValue::Null));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 2);
    }
}
