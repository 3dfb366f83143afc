#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sv_types::{CellValue, Row};
use thiserror::Error;

/// Hard bound on condition nesting, enforced during both JSON decoding
/// and evaluation. Config-authored trees sit far below this; anything
/// deeper is treated as malformed input rather than risking the stack.
pub const MAX_CONDITION_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    FieldNotFound,
    NotBoolean,
    NotComparable,
}

/// A non-fatal observability record. Diagnostics never change the
/// outcome of an evaluation; they only surface config/data mismatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub field: String,
    pub detail: String,
}

impl Diagnostic {
    fn field_not_found(field: &str) -> Self {
        Self {
            kind: DiagnosticKind::FieldNotFound,
            field: field.to_owned(),
            detail: "referenced field not present in row".to_owned(),
        }
    }

    fn not_boolean(field: &str, value: &CellValue) -> Self {
        Self {
            kind: DiagnosticKind::NotBoolean,
            field: field.to_owned(),
            detail: format!("value {value:?} is not a boolean"),
        }
    }

    fn not_comparable(field: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::NotComparable,
            field: field.to_owned(),
            detail: detail.into(),
        }
    }
}

/// Per-call diagnostic ledger, injected into every evaluation. Callers
/// own one per row (or reuse and drain between rows); the engine never
/// holds onto it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLog {
    records: Vec<Diagnostic>,
}

impl DiagnosticLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            kind = ?diagnostic.kind,
            field = %diagnostic.field,
            detail = %diagnostic.detail,
            "condition diagnostic"
        );
        self.records.push(diagnostic);
    }

    /// Append another log's records, e.g. to fold per-row logs into a
    /// whole-run view.
    pub fn merge(&mut self, other: Self) {
        self.records.extend(other.records);
    }

    #[must_use]
    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    fn compare_f64(self, left: f64, right: f64) -> bool {
        match self {
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Eq => left == right,
            Self::Ne => left != right,
        }
    }
}

/// A regex operand compiled once at decode time. Equality is defined on
/// the source pattern, so condition trees stay comparable in tests.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    pattern: String,
    regex: Regex,
}

impl RegexMatcher {
    pub fn new(pattern: impl Into<String>) -> Result<Self, ConditionError> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern).map_err(|source| ConditionError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        Ok(Self { pattern, regex })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for RegexMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

/// One predicate or logical combinator in a condition tree. Trees are
/// decoded once from JSON config and then shared read-only across every
/// row of a dataset; `Condition` owns only immutable data, so a shared
/// reference is safe to evaluate from any number of threads.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Truthiness of a named row value: a boolean cell verbatim, or a
    /// text cell equal to the literal `"true"` ignoring ASCII case.
    /// This is a strict boolean-literal parse, not general truthiness:
    /// `"1"`, `"yes"`, and every other string resolve to `false`.
    Field { field: String },
    /// Numeric comparison of a field against a target, with a string
    /// equality fallback for `==`/`!=` when either side is non-numeric.
    Compare {
        field: String,
        op: CompareOp,
        value: CellValue,
    },
    /// Conjunction. An empty operand list is `true`.
    And { operands: Vec<Condition> },
    /// Disjunction. An empty operand list is `false`.
    Or { operands: Vec<Condition> },
    Not { operand: Box<Condition> },
    StringExactMatch { field: String, value: String },
    StringCaseInsensitiveMatch { field: String, value: String },
    /// Set membership. Members keep their original case; lower-casing
    /// happens per evaluation when `ignore_case` is set, never against
    /// the stored set.
    StringInSet {
        field: String,
        values: BTreeSet<String>,
        ignore_case: bool,
    },
    StringRegexMatch { field: String, pattern: RegexMatcher },
    StringInRegexSet {
        field: String,
        patterns: Vec<RegexMatcher>,
    },
}

/// Fatal configuration errors: a malformed condition document or an
/// over-deep tree. Data-dependent mismatches (absent field, wrong value
/// shape) are never errors; they resolve to `false` with a diagnostic.
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("condition is missing its 'type' tag")]
    MissingTypeTag,
    #[error("condition document is not a JSON object")]
    NotAnObject,
    #[error("unknown condition type: {0}")]
    UnknownType(String),
    #[error("condition type {type_tag} is missing required key {key:?}")]
    MissingKey {
        type_tag: &'static str,
        key: &'static str,
    },
    #[error("condition key {key:?} has the wrong shape: expected {expected}")]
    InvalidKey {
        key: &'static str,
        expected: &'static str,
    },
    #[error("unknown comparison operator: {0}")]
    UnknownComparison(String),
    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("condition tree exceeds maximum depth of {limit}")]
    DepthExceeded { limit: usize },
}

// ── JSON decoding ───────────────────────────────────────────────────────
//
// The wire shape uses upper-snake type tags ("STRING_IN_SET"); the tag is
// matched case-insensitively. Decoding is the only place an unknown tag
// can appear — once a `Condition` exists, the variant set is closed.

impl Condition {
    pub fn from_json(value: &Value) -> Result<Self, ConditionError> {
        decode(value, 0)
    }

    /// Re-encode this condition in the wire shape `from_json` accepts,
    /// for config generators that write rule documents back out.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Field { field } => json!({"type": "FIELD", "field": field}),
            Self::Compare { field, op, value } => json!({
                "type": "FIELD",
                "field": field,
                "comparison": op.as_str(),
                "value": scalar_to_json(value),
            }),
            Self::And { operands } => json!({
                "type": "AND",
                "operands": operands.iter().map(Self::to_json).collect::<Vec<_>>(),
            }),
            Self::Or { operands } => json!({
                "type": "OR",
                "operands": operands.iter().map(Self::to_json).collect::<Vec<_>>(),
            }),
            Self::Not { operand } => json!({"type": "NOT", "operand": operand.to_json()}),
            Self::StringExactMatch { field, value } => json!({
                "type": "STRING_EXACT_MATCH", "field": field, "value": value,
            }),
            Self::StringCaseInsensitiveMatch { field, value } => json!({
                "type": "STRING_CASE_INSENSITIVE_MATCH", "field": field, "value": value,
            }),
            Self::StringInSet {
                field,
                values,
                ignore_case,
            } => json!({
                "type": "STRING_IN_SET",
                "field": field,
                "values": values.iter().collect::<Vec<_>>(),
                "ignoreCase": ignore_case,
            }),
            Self::StringRegexMatch { field, pattern } => json!({
                "type": "STRING_REGEX_MATCH", "field": field, "pattern": pattern.pattern(),
            }),
            Self::StringInRegexSet { field, patterns } => json!({
                "type": "STRING_IN_REGEXSET",
                "field": field,
                "patterns": patterns.iter().map(RegexMatcher::pattern).collect::<Vec<_>>(),
            }),
        }
    }
}

fn scalar_to_json(value: &CellValue) -> Value {
    match value {
        CellValue::Null => Value::Null,
        CellValue::Bool(v) => Value::Bool(*v),
        CellValue::Int64(v) => Value::from(*v),
        CellValue::Float64(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
        CellValue::Utf8(v) => Value::String(v.clone()),
    }
}

fn decode(value: &Value, depth: usize) -> Result<Condition, ConditionError> {
    if depth > MAX_CONDITION_DEPTH {
        return Err(ConditionError::DepthExceeded {
            limit: MAX_CONDITION_DEPTH,
        });
    }

    let object = value.as_object().ok_or(ConditionError::NotAnObject)?;
    let tag = object
        .get("type")
        .ok_or(ConditionError::MissingTypeTag)?
        .as_str()
        .ok_or(ConditionError::InvalidKey {
            key: "type",
            expected: "string",
        })?;

    match tag.to_ascii_uppercase().as_str() {
        "FIELD" => {
            let field = require_str(object, "FIELD", "field")?;
            if object.contains_key("comparison") {
                decode_comparison(object, field)
            } else {
                Ok(Condition::Field { field })
            }
        }
        "AND" => Ok(Condition::And {
            operands: decode_operands(object, "AND", depth)?,
        }),
        "OR" => Ok(Condition::Or {
            operands: decode_operands(object, "OR", depth)?,
        }),
        "NOT" => {
            let operand = object.get("operand").ok_or(ConditionError::MissingKey {
                type_tag: "NOT",
                key: "operand",
            })?;
            Ok(Condition::Not {
                operand: Box::new(decode(operand, depth + 1)?),
            })
        }
        "STRING_EXACT_MATCH" => Ok(Condition::StringExactMatch {
            field: require_str(object, "STRING_EXACT_MATCH", "field")?,
            value: require_str(object, "STRING_EXACT_MATCH", "value")?,
        }),
        "STRING_CASE_INSENSITIVE_MATCH" => Ok(Condition::StringCaseInsensitiveMatch {
            field: require_str(object, "STRING_CASE_INSENSITIVE_MATCH", "field")?,
            value: require_str(object, "STRING_CASE_INSENSITIVE_MATCH", "value")?,
        }),
        "STRING_IN_SET" => {
            let field = require_str(object, "STRING_IN_SET", "field")?;
            let values = require_string_array(object, "STRING_IN_SET", "values")?
                .into_iter()
                .collect::<BTreeSet<_>>();
            let ignore_case = match object.get("ignoreCase") {
                None => false,
                Some(flag) => flag.as_bool().ok_or(ConditionError::InvalidKey {
                    key: "ignoreCase",
                    expected: "boolean",
                })?,
            };
            Ok(Condition::StringInSet {
                field,
                values,
                ignore_case,
            })
        }
        "STRING_REGEX_MATCH" => {
            let field = require_str(object, "STRING_REGEX_MATCH", "field")?;
            let pattern = require_str(object, "STRING_REGEX_MATCH", "pattern")?;
            Ok(Condition::StringRegexMatch {
                field,
                pattern: RegexMatcher::new(pattern)?,
            })
        }
        "STRING_IN_REGEXSET" => {
            let field = require_str(object, "STRING_IN_REGEXSET", "field")?;
            let patterns = require_string_array(object, "STRING_IN_REGEXSET", "patterns")?
                .into_iter()
                .map(RegexMatcher::new)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Condition::StringInRegexSet { field, patterns })
        }
        _ => Err(ConditionError::UnknownType(tag.to_owned())),
    }
}

fn decode_comparison(
    object: &serde_json::Map<String, Value>,
    field: String,
) -> Result<Condition, ConditionError> {
    let tag = object
        .get("comparison")
        .and_then(Value::as_str)
        .ok_or(ConditionError::InvalidKey {
            key: "comparison",
            expected: "string",
        })?;
    let op = CompareOp::parse(tag).ok_or_else(|| ConditionError::UnknownComparison(tag.to_owned()))?;
    let value = object.get("value").ok_or(ConditionError::MissingKey {
        type_tag: "FIELD",
        key: "value",
    })?;
    Ok(Condition::Compare {
        field,
        op,
        value: decode_scalar(value)?,
    })
}

fn decode_scalar(value: &Value) -> Result<CellValue, ConditionError> {
    match value {
        Value::Null => Ok(CellValue::Null),
        Value::Bool(v) => Ok(CellValue::Bool(*v)),
        Value::Number(n) => n.as_i64().map_or_else(
            || {
                n.as_f64()
                    .map(CellValue::Float64)
                    .ok_or(ConditionError::InvalidKey {
                        key: "value",
                        expected: "representable number",
                    })
            },
            |v| Ok(CellValue::Int64(v)),
        ),
        Value::String(v) => Ok(CellValue::Utf8(v.clone())),
        Value::Array(_) | Value::Object(_) => Err(ConditionError::InvalidKey {
            key: "value",
            expected: "number, string, boolean, or null",
        }),
    }
}

fn decode_operands(
    object: &serde_json::Map<String, Value>,
    type_tag: &'static str,
    depth: usize,
) -> Result<Vec<Condition>, ConditionError> {
    let operands = object
        .get("operands")
        .ok_or(ConditionError::MissingKey {
            type_tag,
            key: "operands",
        })?
        .as_array()
        .ok_or(ConditionError::InvalidKey {
            key: "operands",
            expected: "array",
        })?;
    operands
        .iter()
        .map(|operand| decode(operand, depth + 1))
        .collect()
}

fn require_str(
    object: &serde_json::Map<String, Value>,
    type_tag: &'static str,
    key: &'static str,
) -> Result<String, ConditionError> {
    object
        .get(key)
        .ok_or(ConditionError::MissingKey { type_tag, key })?
        .as_str()
        .map(str::to_owned)
        .ok_or(ConditionError::InvalidKey {
            key,
            expected: "string",
        })
}

fn require_string_array(
    object: &serde_json::Map<String, Value>,
    type_tag: &'static str,
    key: &'static str,
) -> Result<Vec<String>, ConditionError> {
    let array = object
        .get(key)
        .ok_or(ConditionError::MissingKey { type_tag, key })?
        .as_array()
        .ok_or(ConditionError::InvalidKey {
            key,
            expected: "array of strings",
        })?;
    array
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(str::to_owned)
                .ok_or(ConditionError::InvalidKey {
                    key,
                    expected: "array of strings",
                })
        })
        .collect()
}

// ── Evaluation ──────────────────────────────────────────────────────────

impl Condition {
    /// Evaluate this condition against one row. Always resolves to
    /// `true` or `false`; the only error is an over-deep tree. A field
    /// the row does not carry, or a value of the wrong shape, resolves
    /// to `false` and records a diagnostic in `log`.
    pub fn evaluate(&self, row: &Row, log: &mut DiagnosticLog) -> Result<bool, ConditionError> {
        self.evaluate_at(row, log, 0)
    }

    fn evaluate_at(
        &self,
        row: &Row,
        log: &mut DiagnosticLog,
        depth: usize,
    ) -> Result<bool, ConditionError> {
        if depth > MAX_CONDITION_DEPTH {
            return Err(ConditionError::DepthExceeded {
                limit: MAX_CONDITION_DEPTH,
            });
        }

        match self {
            Self::Field { field } => Ok(evaluate_field(field, row, log)),
            Self::Compare { field, op, value } => Ok(evaluate_compare(field, *op, value, row, log)),
            Self::And { operands } => {
                for operand in operands {
                    if !operand.evaluate_at(row, log, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or { operands } => {
                for operand in operands {
                    if operand.evaluate_at(row, log, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { operand } => Ok(!operand.evaluate_at(row, log, depth + 1)?),
            Self::StringExactMatch { field, value } => {
                Ok(match_text(field, row, log, |text| text == value))
            }
            Self::StringCaseInsensitiveMatch { field, value } => {
                Ok(match_text(field, row, log, |text| {
                    text.eq_ignore_ascii_case(value)
                }))
            }
            Self::StringInSet {
                field,
                values,
                ignore_case,
            } => Ok(match_text(field, row, log, |text| {
                if *ignore_case {
                    values.iter().any(|member| member.eq_ignore_ascii_case(text))
                } else {
                    values.contains(text)
                }
            })),
            Self::StringRegexMatch { field, pattern } => {
                Ok(match_text(field, row, log, |text| pattern.is_match(text)))
            }
            Self::StringInRegexSet { field, patterns } => Ok(match_text(field, row, log, |text| {
                patterns.iter().any(|pattern| pattern.is_match(text))
            })),
        }
    }
}

fn evaluate_field(field: &str, row: &Row, log: &mut DiagnosticLog) -> bool {
    match row.get(field) {
        None => {
            log.push(Diagnostic::field_not_found(field));
            false
        }
        Some(CellValue::Bool(value)) => *value,
        Some(CellValue::Utf8(text)) => text.eq_ignore_ascii_case("true"),
        Some(other) => {
            log.push(Diagnostic::not_boolean(field, other));
            false
        }
    }
}

fn evaluate_compare(
    field: &str,
    op: CompareOp,
    target: &CellValue,
    row: &Row,
    log: &mut DiagnosticLog,
) -> bool {
    let Some(cell) = row.get(field) else {
        log.push(Diagnostic::field_not_found(field));
        return false;
    };
    if cell.is_missing() {
        return false;
    }

    if let (Ok(left), Ok(right)) = (cell.to_f64(), target.to_f64()) {
        return op.compare_f64(left, right);
    }

    // Non-numeric sides fall back to string equality; ordering operators
    // have no string semantics here.
    match (op, cell.render(), target.render()) {
        (CompareOp::Eq, Some(left), Some(right)) => left == right,
        (CompareOp::Ne, Some(left), Some(right)) => left != right,
        (CompareOp::Eq | CompareOp::Ne, _, _) => false,
        _ => {
            log.push(Diagnostic::not_comparable(
                field,
                format!("cannot apply {:?} {} to non-numeric values", cell, op.as_str()),
            ));
            false
        }
    }
}

/// Shared lookup-and-stringify step for the string-matching operators.
/// An absent field records a diagnostic; a missing value never matches.
fn match_text(
    field: &str,
    row: &Row,
    log: &mut DiagnosticLog,
    predicate: impl FnOnce(&str) -> bool,
) -> bool {
    match row.get(field) {
        None => {
            log.push(Diagnostic::field_not_found(field));
            false
        }
        Some(cell) => cell.render().is_some_and(|text| predicate(&text)),
    }
}
