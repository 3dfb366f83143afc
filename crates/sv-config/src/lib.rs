#![forbid(unsafe_code)]

use std::path::Path;

use serde_json::{Map, Value, json};
use sv_expr::{Condition, ConditionError, Diagnostic, DiagnosticKind, DiagnosticLog};
use sv_types::{CellValue, ColumnType, Row, infer_column_type};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config section {section} is not a JSON object")]
    NotAnObject { section: &'static str },
    #[error("config section {section} is missing required key {key:?}")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("config section {section} key {key:?} has the wrong shape: expected {expected}")]
    InvalidKey {
        section: &'static str,
        key: &'static str,
        expected: &'static str,
    },
    #[error("column {column:?} has unknown type: {type_tag}")]
    UnknownColumnType { column: String, type_tag: String },
    #[error("text field {name:?} has unknown operation: {operation}")]
    UnknownTextOperation { name: String, operation: String },
    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// Path-style text derivation, applied to a source cell's text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOperation {
    StripExtension,
    GetExtension,
    GetPath,
    GetFileRoot,
    GetFileName,
}

impl TextOperation {
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "STRIP_EXTENSION" => Some(Self::StripExtension),
            "GET_EXTENSION" => Some(Self::GetExtension),
            "GET_PATH" => Some(Self::GetPath),
            "GET_FILE_ROOT" => Some(Self::GetFileRoot),
            "GET_FILENAME" => Some(Self::GetFileName),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StripExtension => "STRIP_EXTENSION",
            Self::GetExtension => "GET_EXTENSION",
            Self::GetPath => "GET_PATH",
            Self::GetFileRoot => "GET_FILE_ROOT",
            Self::GetFileName => "GET_FILENAME",
        }
    }

    #[must_use]
    pub fn apply(self, value: &str) -> String {
        match self {
            Self::StripExtension => strip_extension(value).to_owned(),
            Self::GetExtension => get_extension(value).to_owned(),
            Self::GetPath => Path::new(value)
                .parent()
                .map(|parent| parent.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::GetFileRoot => strip_extension(file_name(value)).to_owned(),
            Self::GetFileName => file_name(value).to_owned(),
        }
    }
}

fn strip_extension(filename: &str) -> &str {
    // A leading dot is a hidden-file marker, not an extension separator.
    match filename.rfind('.') {
        Some(idx) if idx > 0 => &filename[..idx],
        _ => filename,
    }
}

fn get_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) if idx + 1 < filename.len() => &filename[idx + 1..],
        _ => "",
    }
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityRule {
    pub column: String,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedField {
    pub name: String,
    pub condition: Condition,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextField {
    pub name: String,
    pub source: String,
    pub operation: TextOperation,
    pub visible: bool,
}

/// The decoded conversion config. Column order is the JSON document's
/// key order and drives output column order downstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionConfig {
    pub columns: Vec<ColumnSpec>,
    pub filter: Option<Condition>,
    pub visibility: Vec<VisibilityRule>,
    pub derived_fields: Vec<DerivedField>,
    pub text_fields: Vec<TextField>,
}

impl ConversionConfig {
    pub fn from_json(document: &Value) -> Result<Self, ConfigError> {
        let root = document
            .as_object()
            .ok_or(ConfigError::NotAnObject { section: "config" })?;

        let mut config = Self::default();

        if let Some(columns) = root.get("columns") {
            let columns = columns
                .as_object()
                .ok_or(ConfigError::NotAnObject { section: "columns" })?;
            for (name, spec) in columns {
                config.columns.push(decode_column(name, spec)?);
            }
        }

        if let Some(filter) = root.get("filter") {
            config.filter = Some(Condition::from_json(filter)?);
        }

        if let Some(rules) = root.get("visibility") {
            let rules = rules.as_array().ok_or(ConfigError::InvalidKey {
                section: "config",
                key: "visibility",
                expected: "array",
            })?;
            for rule in rules {
                config.visibility.push(decode_visibility_rule(rule)?);
            }
        }

        if let Some(fields) = root.get("derivedFields") {
            let fields = fields.as_array().ok_or(ConfigError::InvalidKey {
                section: "config",
                key: "derivedFields",
                expected: "array",
            })?;
            for field in fields {
                config.derived_fields.push(decode_derived_field(field)?);
            }
        }

        if let Some(fields) = root.get("textFields") {
            let fields = fields.as_array().ok_or(ConfigError::InvalidKey {
                section: "config",
                key: "textFields",
                expected: "array",
            })?;
            for field in fields {
                config.text_fields.push(decode_text_field(field)?);
            }
        }

        Ok(config)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut columns = Map::new();
        for spec in &self.columns {
            columns.insert(
                spec.name.clone(),
                json!({"type": spec.column_type.as_str(), "visible": spec.visible}),
            );
        }

        let mut root = Map::new();
        root.insert("columns".to_owned(), Value::Object(columns));
        if let Some(filter) = &self.filter {
            root.insert("filter".to_owned(), filter.to_json());
        }
        if !self.visibility.is_empty() {
            let rules = self
                .visibility
                .iter()
                .map(|rule| json!({"column": rule.column, "condition": rule.condition.to_json()}))
                .collect();
            root.insert("visibility".to_owned(), Value::Array(rules));
        }
        if !self.derived_fields.is_empty() {
            let fields = self
                .derived_fields
                .iter()
                .map(|field| {
                    json!({
                        "name": field.name,
                        "condition": field.condition.to_json(),
                        "visible": field.visible,
                    })
                })
                .collect();
            root.insert("derivedFields".to_owned(), Value::Array(fields));
        }
        if !self.text_fields.is_empty() {
            let fields = self
                .text_fields
                .iter()
                .map(|field| {
                    json!({
                        "name": field.name,
                        "source": field.source,
                        "operation": field.operation.as_str(),
                        "visible": field.visible,
                    })
                })
                .collect();
            root.insert("textFields".to_owned(), Value::Array(fields));
        }

        Value::Object(root)
    }
}

fn decode_column(name: &str, spec: &Value) -> Result<ColumnSpec, ConfigError> {
    let object = spec
        .as_object()
        .ok_or(ConfigError::NotAnObject { section: "columns" })?;
    let type_tag = object
        .get("type")
        .ok_or(ConfigError::MissingKey {
            section: "columns",
            key: "type",
        })?
        .as_str()
        .ok_or(ConfigError::InvalidKey {
            section: "columns",
            key: "type",
            expected: "string",
        })?;
    let column_type = ColumnType::parse(type_tag).ok_or_else(|| ConfigError::UnknownColumnType {
        column: name.to_owned(),
        type_tag: type_tag.to_owned(),
    })?;

    Ok(ColumnSpec {
        name: name.to_owned(),
        column_type,
        visible: decode_visible(object, "columns")?,
    })
}

/// Visibility flags accept a boolean or the textual literals the
/// legacy configs carry ("true"/"false", any case). Absent means visible.
fn decode_visible(
    object: &Map<String, Value>,
    section: &'static str,
) -> Result<bool, ConfigError> {
    match object.get("visible") {
        None => Ok(true),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(Value::String(text)) => Ok(text.eq_ignore_ascii_case("true")),
        Some(_) => Err(ConfigError::InvalidKey {
            section,
            key: "visible",
            expected: "boolean or string",
        }),
    }
}

fn decode_visibility_rule(rule: &Value) -> Result<VisibilityRule, ConfigError> {
    let object = rule.as_object().ok_or(ConfigError::NotAnObject {
        section: "visibility",
    })?;
    let column = require_str(object, "visibility", "column")?;
    let condition = object.get("condition").ok_or(ConfigError::MissingKey {
        section: "visibility",
        key: "condition",
    })?;
    Ok(VisibilityRule {
        column,
        condition: Condition::from_json(condition)?,
    })
}

fn decode_derived_field(field: &Value) -> Result<DerivedField, ConfigError> {
    let object = field.as_object().ok_or(ConfigError::NotAnObject {
        section: "derivedFields",
    })?;
    let name = require_str(object, "derivedFields", "name")?;
    let condition = object.get("condition").ok_or(ConfigError::MissingKey {
        section: "derivedFields",
        key: "condition",
    })?;
    Ok(DerivedField {
        name,
        condition: Condition::from_json(condition)?,
        visible: decode_visible(object, "derivedFields")?,
    })
}

fn decode_text_field(field: &Value) -> Result<TextField, ConfigError> {
    let object = field.as_object().ok_or(ConfigError::NotAnObject {
        section: "textFields",
    })?;
    let name = require_str(object, "textFields", "name")?;
    let source = require_str(object, "textFields", "source")?;
    let operation_tag = require_str(object, "textFields", "operation")?;
    let operation =
        TextOperation::parse(&operation_tag).ok_or_else(|| ConfigError::UnknownTextOperation {
            name: name.clone(),
            operation: operation_tag,
        })?;
    Ok(TextField {
        name,
        source,
        operation,
        visible: decode_visible(object, "textFields")?,
    })
}

fn require_str(
    object: &Map<String, Value>,
    section: &'static str,
    key: &'static str,
) -> Result<String, ConfigError> {
    object
        .get(key)
        .ok_or(ConfigError::MissingKey { section, key })?
        .as_str()
        .map(str::to_owned)
        .ok_or(ConfigError::InvalidKey {
            section,
            key,
            expected: "string",
        })
}

/// Build a default config from headers and sampled cell text: every
/// column visible, types inferred, no rules.
#[must_use]
pub fn generate_default_config(headers: &[String], samples: &[Vec<String>]) -> ConversionConfig {
    let columns = headers
        .iter()
        .enumerate()
        .map(|(idx, header)| ColumnSpec {
            name: header.clone(),
            column_type: infer_column_type(
                samples
                    .iter()
                    .filter_map(|sample| sample.get(idx).map(String::as_str)),
            ),
            visible: true,
        })
        .collect();

    ConversionConfig {
        columns,
        ..ConversionConfig::default()
    }
}

/// Derive text fields into the row. An absent source records a
/// diagnostic; a source with no text form yields `Null`.
pub fn apply_text_fields(config: &ConversionConfig, row: &mut Row, log: &mut DiagnosticLog) {
    for field in &config.text_fields {
        let derived = match row.get(&field.source) {
            None => {
                log.push(Diagnostic {
                    kind: DiagnosticKind::FieldNotFound,
                    field: field.source.clone(),
                    detail: format!("source of text field {:?} not present in row", field.name),
                });
                CellValue::Null
            }
            Some(cell) => cell
                .render()
                .map_or(CellValue::Null, |text| {
                    CellValue::Utf8(field.operation.apply(&text))
                }),
        };
        row.insert(field.name.clone(), derived);
    }
}

/// Evaluate derived boolean fields in declaration order, inserting each
/// result into the row so later fields (and the row filter) can
/// reference earlier ones.
pub fn apply_derived_fields(
    config: &ConversionConfig,
    row: &mut Row,
    log: &mut DiagnosticLog,
) -> Result<(), ConditionError> {
    for field in &config.derived_fields {
        let value = field.condition.evaluate(row, log)?;
        row.insert(field.name.clone(), CellValue::Bool(value));
    }
    Ok(())
}

pub fn row_passes_filter(
    config: &ConversionConfig,
    row: &Row,
    log: &mut DiagnosticLog,
) -> Result<bool, ConditionError> {
    match &config.filter {
        None => Ok(true),
        Some(filter) => filter.evaluate(row, log),
    }
}

/// Resolve the emitted column set for one row: declared columns first,
/// then derived and text fields not shadowed by a declaration. A column
/// is emitted when its spec is visible and every visibility rule naming
/// it passes.
pub fn visible_columns(
    config: &ConversionConfig,
    row: &Row,
    log: &mut DiagnosticLog,
) -> Result<Vec<String>, ConditionError> {
    let mut candidates: Vec<(&str, bool)> = config
        .columns
        .iter()
        .map(|spec| (spec.name.as_str(), spec.visible))
        .collect();
    for field in &config.derived_fields {
        if !candidates.iter().any(|(name, _)| *name == field.name) {
            candidates.push((field.name.as_str(), field.visible));
        }
    }
    for field in &config.text_fields {
        if !candidates.iter().any(|(name, _)| *name == field.name) {
            candidates.push((field.name.as_str(), field.visible));
        }
    }

    let mut visible = Vec::new();
    for (name, base_visible) in candidates {
        if !base_visible {
            continue;
        }
        let mut passes = true;
        for rule in config.visibility.iter().filter(|rule| rule.column == name) {
            if !rule.condition.evaluate(row, log)? {
                passes = false;
                break;
            }
        }
        if passes {
            visible.push(name.to_owned());
        }
    }
    Ok(visible)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sv_expr::DiagnosticLog;
    use sv_types::{CellValue, ColumnType, Row};

    use super::{
        ConfigError, ConversionConfig, TextOperation, apply_derived_fields, apply_text_fields,
        generate_default_config, row_passes_filter, visible_columns,
    };

    fn sample_config() -> ConversionConfig {
        let document = json!({
            "columns": {
                "name": {"type": "STRING"},
                "status": {"type": "STRING"},
                "score": {"type": "INTEGER", "visible": "false"},
                "isActive": {"type": "BOOLEAN"}
            },
            "filter": {"type": "FIELD", "field": "qualified"},
            "visibility": [
                {"column": "name",
                 "condition": {"type": "FIELD", "field": "isActive"}}
            ],
            "derivedFields": [
                {"name": "qualified",
                 "condition": {"type": "AND", "operands": [
                     {"type": "FIELD", "field": "isActive"},
                     {"type": "FIELD", "field": "score",
                      "comparison": ">=", "value": 50}
                 ]}}
            ],
            "textFields": [
                {"name": "ext", "source": "name", "operation": "GET_EXTENSION"}
            ]
        });
        ConversionConfig::from_json(&document).expect("config should decode")
    }

    fn sample_row(active: bool, score: i64) -> Row {
        [
            (
                "name".to_owned(),
                CellValue::Utf8("report.csv".to_owned()),
            ),
            ("status".to_owned(), CellValue::Utf8("open".to_owned())),
            ("score".to_owned(), CellValue::Int64(score)),
            ("isActive".to_owned(), CellValue::Bool(active)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn config_decodes_all_sections_in_order() {
        let config = sample_config();

        let names: Vec<&str> = config
            .columns
            .iter()
            .map(|spec| spec.name.as_str())
            .collect();
        assert_eq!(names, ["name", "status", "score", "isActive"]);
        assert_eq!(config.columns[2].column_type, ColumnType::Integer);
        assert!(!config.columns[2].visible);
        assert!(config.filter.is_some());
        assert_eq!(config.visibility.len(), 1);
        assert_eq!(config.derived_fields.len(), 1);
        assert_eq!(config.text_fields[0].operation, TextOperation::GetExtension);
    }

    #[test]
    fn unknown_column_type_is_rejected() {
        let document = json!({"columns": {"x": {"type": "DECIMAL"}}});
        let err = ConversionConfig::from_json(&document).expect_err("must fail");
        assert!(matches!(
            err,
            ConfigError::UnknownColumnType { column, type_tag }
                if column == "x" && type_tag == "DECIMAL"
        ));
    }

    #[test]
    fn unknown_text_operation_is_rejected() {
        let document = json!({
            "textFields": [{"name": "x", "source": "y", "operation": "REVERSE"}]
        });
        let err = ConversionConfig::from_json(&document).expect_err("must fail");
        assert!(matches!(err, ConfigError::UnknownTextOperation { .. }));
    }

    #[test]
    fn malformed_filter_condition_propagates_as_config_error() {
        let document = json!({"filter": {"type": "XOR", "operands": []}});
        let err = ConversionConfig::from_json(&document).expect_err("must fail");
        assert!(matches!(err, ConfigError::Condition(_)));
    }

    #[test]
    fn default_config_infers_types_and_marks_everything_visible() {
        let headers = vec!["flag".to_owned(), "count".to_owned(), "label".to_owned()];
        let samples = vec![
            vec!["true".to_owned(), "3".to_owned(), "alpha".to_owned()],
            vec!["false".to_owned(), "17".to_owned(), "beta".to_owned()],
        ];

        let config = generate_default_config(&headers, &samples);
        assert_eq!(config.columns[0].column_type, ColumnType::Boolean);
        assert_eq!(config.columns[1].column_type, ColumnType::Integer);
        assert_eq!(config.columns[2].column_type, ColumnType::String);
        assert!(config.columns.iter().all(|spec| spec.visible));
        assert!(config.filter.is_none());
    }

    #[test]
    fn text_operations_follow_path_semantics() {
        assert_eq!(
            TextOperation::StripExtension.apply("document.pdf"),
            "document"
        );
        assert_eq!(TextOperation::StripExtension.apply(".gitignore"), ".gitignore");
        assert_eq!(TextOperation::GetExtension.apply("document.pdf"), "pdf");
        assert_eq!(TextOperation::GetExtension.apply("document"), "");
        assert_eq!(
            TextOperation::GetPath.apply("/users/data/document.pdf"),
            "/users/data"
        );
        assert_eq!(
            TextOperation::GetFileRoot.apply("/users/data/document.pdf"),
            "document"
        );
        assert_eq!(
            TextOperation::GetFileName.apply("/users/data/document.pdf"),
            "document.pdf"
        );
    }

    #[test]
    fn derived_fields_feed_the_row_filter() {
        let config = sample_config();

        let mut row = sample_row(true, 85);
        let mut log = DiagnosticLog::new();
        apply_derived_fields(&config, &mut row, &mut log).expect("derive");
        assert_eq!(row.get("qualified"), Some(&CellValue::Bool(true)));
        assert!(row_passes_filter(&config, &row, &mut log).expect("filter"));

        let mut row = sample_row(true, 20);
        apply_derived_fields(&config, &mut row, &mut log).expect("derive");
        assert!(!row_passes_filter(&config, &row, &mut log).expect("filter"));
    }

    #[test]
    fn text_fields_derive_from_rendered_source_cells() {
        let config = sample_config();
        let mut row = sample_row(true, 85);
        let mut log = DiagnosticLog::new();

        apply_text_fields(&config, &mut row, &mut log);
        assert_eq!(row.get("ext"), Some(&CellValue::Utf8("csv".to_owned())));
        assert!(log.is_empty());

        let mut bare = Row::new();
        apply_text_fields(&config, &mut bare, &mut log);
        assert_eq!(bare.get("ext"), Some(&CellValue::Null));
        assert_eq!(log.records().len(), 1);
    }

    #[test]
    fn visibility_rules_gate_columns_per_row() {
        let config = sample_config();
        let mut log = DiagnosticLog::new();

        // Active row: "name" passes its rule; "score" stays hidden by
        // its spec; derived and text fields are appended.
        let visible = visible_columns(&config, &sample_row(true, 85), &mut log).expect("visible");
        assert_eq!(visible, ["name", "status", "isActive", "qualified", "ext"]);

        // Inactive row: the rule hides "name".
        let visible = visible_columns(&config, &sample_row(false, 85), &mut log).expect("visible");
        assert_eq!(visible, ["status", "isActive", "qualified", "ext"]);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = sample_config();
        let decoded = ConversionConfig::from_json(&config.to_json()).expect("decode");
        assert_eq!(decoded, config);
    }
}
